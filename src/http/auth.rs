use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use md5::{Digest as _, Md5};

/// authentication schemes a listener can demand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// refuse everyone with 403
    None,
    /// let everyone through
    Anonymous,
    /// RFC 2617 Basic
    Basic,
    /// RFC 2617 Digest with MD5
    Digest,
}

/// a username/password pair the credential resolver hands back
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// pair a username with its password
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// resolves a username to its stored credentials
pub type CredentialLookup = Arc<dyn Fn(&str) -> Option<Credentials> + Send + Sync>;

/// outcome of a successful authentication
#[derive(Debug, Clone)]
pub struct Principal {
    pub username: String,
    pub scheme: AuthScheme,
}

/// ordered, case-insensitive parameter map shared by challenges and
/// responses
#[derive(Debug, Clone, Default)]
pub struct ParamBag {
    entries: Vec<(String, String)>,
}

impl ParamBag {
    /// value of a parameter, name compared case-insensitively
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// replace a parameter
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.entries.push((name, value.into()));
    }

    /// entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl fmt::Display for ParamBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // bare tokens where RFC 7616 serializes them unquoted
        let mut first = true;
        for (name, value) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            if matches!(
                name.to_ascii_lowercase().as_str(),
                "algorithm" | "nc" | "stale"
            ) {
                write!(f, "{name}={value}")?;
            } else {
                write!(f, "{name}=\"{value}\"")?;
            }
        }
        Ok(())
    }
}

/// parse an `Authorization` or `WWW-Authenticate` value into its
/// scheme and parameter bag
pub fn parse_auth_header(value: &str) -> Option<(String, ParamBag)> {
    let value = value.trim();
    let (scheme, rest) = match value.split_once(char::is_whitespace) {
        Some((s, r)) => (s, r),
        None => (value, ""),
    };
    if scheme.is_empty() {
        return None;
    }
    let mut bag = ParamBag::default();
    for part in split_outside_quotes(rest, ',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, value) = part.split_once('=')?;
        bag.set(
            name.trim().to_string(),
            value.trim().trim_matches('"').to_string(),
        );
    }
    Some((scheme.to_string(), bag))
}

fn split_outside_quotes(s: &str, sep: char) -> Vec<String> {
    let mut out = vec![];
    let mut current = String::new();
    let mut in_quotes = false;
    for c in s.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c == sep && !in_quotes => {
                out.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn md5_hex(data: &[u8]) -> String {
    Md5::digest(data)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// 16 random bytes, lowercase hex
pub fn generate_nonce() -> String {
    let raw: [u8; 16] = rand::random();
    raw.iter().map(|b| format!("{b:02x}")).collect()
}

/// compare secrets without leaking a length-dependent early exit
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// build the `WWW-Authenticate` value for a Basic challenge
pub fn basic_challenge(realm: &str) -> String {
    format!("Basic realm=\"{realm}\"")
}

/// build the `WWW-Authenticate` value for a Digest challenge
pub fn digest_challenge(realm: &str) -> String {
    let mut params = ParamBag::default();
    params.set("realm", realm);
    params.set("nonce", generate_nonce());
    params.set("algorithm", "MD5");
    params.set("qop", "auth");
    format!("Digest {params}")
}

/// RFC 2617 request-digest computation
///
/// `params` supplies realm/nonce/uri/qop/nc/cnonce/algorithm as sent
/// on the wire; `entity` feeds the auth-int variant
pub fn digest_response(
    params: &ParamBag,
    method: &str,
    username: &str,
    password: &str,
    entity: Option<&[u8]>,
) -> String {
    let realm = params.get("realm").unwrap_or("");
    let nonce = params.get("nonce").unwrap_or("");
    let uri = params.get("uri").unwrap_or("");
    let qop = params.get("qop").unwrap_or("");
    let algorithm = params.get("algorithm").unwrap_or("MD5");

    let a1 = format!("{username}:{realm}:{password}");
    let ha1 = if algorithm.eq_ignore_ascii_case("md5-sess") {
        let cnonce = params.get("cnonce").unwrap_or("");
        md5_hex(format!("{}:{nonce}:{cnonce}", md5_hex(a1.as_bytes())).as_bytes())
    } else {
        md5_hex(a1.as_bytes())
    };
    let ha2 = if qop.eq_ignore_ascii_case("auth-int") {
        let entity_hash = md5_hex(entity.unwrap_or(b""));
        md5_hex(format!("{method}:{uri}:{entity_hash}").as_bytes())
    } else {
        md5_hex(format!("{method}:{uri}").as_bytes())
    };
    if qop.is_empty() {
        md5_hex(format!("{ha1}:{nonce}:{ha2}").as_bytes())
    } else {
        let nc = params.get("nc").unwrap_or("");
        let cnonce = params.get("cnonce").unwrap_or("");
        md5_hex(format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}").as_bytes())
    }
}

/// verify an `Authorization` header against the listener's realm and
/// credential resolver
///
/// `Err` carries the fresh `WWW-Authenticate` value for the 401
pub fn authenticate(
    authorization: Option<&str>,
    method: &str,
    scheme: AuthScheme,
    realm: &str,
    lookup: &CredentialLookup,
) -> Result<Principal, String> {
    let challenge = || match scheme {
        AuthScheme::Basic => basic_challenge(realm),
        _ => digest_challenge(realm),
    };
    let header = match authorization {
        Some(h) => h.trim(),
        None => return Err(challenge()),
    };
    let (presented_scheme, rest) = match header.split_once(char::is_whitespace) {
        Some((s, r)) => (s, r.trim()),
        None => (header, ""),
    };
    match scheme {
        AuthScheme::Basic => {
            if !presented_scheme.eq_ignore_ascii_case("Basic") {
                return Err(challenge());
            }
            // for Basic the "parameters" are one base64 token
            let token = rest;
            let decoded = match STANDARD.decode(token) {
                Ok(d) => d,
                Err(_) => return Err(challenge()),
            };
            let decoded = String::from_utf8_lossy(&decoded).to_string();
            let (username, password) = match decoded.split_once(':') {
                Some(pair) => pair,
                None => return Err(challenge()),
            };
            match lookup(username) {
                Some(creds) if constant_time_eq(&creds.password, password) => Ok(Principal {
                    username: username.to_string(),
                    scheme,
                }),
                _ => Err(challenge()),
            }
        }
        AuthScheme::Digest => {
            if !presented_scheme.eq_ignore_ascii_case("Digest") {
                return Err(challenge());
            }
            let params = match parse_auth_header(header) {
                Some((_, params)) => params,
                None => return Err(challenge()),
            };
            let username = params.get("username").unwrap_or("");
            if params.get("realm").map(|r| r != realm).unwrap_or(true) {
                return Err(challenge());
            }
            let presented = match params.get("response") {
                Some(r) => r,
                None => return Err(challenge()),
            };
            let creds = match lookup(username) {
                Some(c) => c,
                None => return Err(challenge()),
            };
            let expected =
                digest_response(&params, method, username, &creds.password, None);
            if constant_time_eq(&expected, presented) {
                Ok(Principal {
                    username: username.to_string(),
                    scheme,
                })
            } else {
                Err(challenge())
            }
        }
        AuthScheme::Anonymous | AuthScheme::None => Ok(Principal {
            username: String::new(),
            scheme,
        }),
    }
}

/// build an `Authorization` value answering a server challenge
///
/// the connector uses this to retry a 401; `nc` counts attempts per
/// nonce and lands on the wire as eight hex digits
pub fn answer_challenge(
    challenge: &str,
    creds: &Credentials,
    method: &str,
    uri: &str,
    nc: u32,
) -> Option<String> {
    let (scheme, challenge_params) = parse_auth_header(challenge)?;
    if scheme.eq_ignore_ascii_case("Basic") {
        let token = STANDARD.encode(format!("{}:{}", creds.username, creds.password));
        return Some(format!("Basic {token}"));
    }
    if !scheme.eq_ignore_ascii_case("Digest") {
        return None;
    }
    let mut params = ParamBag::default();
    params.set("username", creds.username.clone());
    params.set("realm", challenge_params.get("realm").unwrap_or(""));
    params.set("nonce", challenge_params.get("nonce").unwrap_or(""));
    params.set("uri", uri);
    if let Some(algorithm) = challenge_params.get("algorithm") {
        params.set("algorithm", algorithm);
    }
    let qop = challenge_params.get("qop").map(|q| {
        // a challenge may offer "auth,auth-int"; pick auth
        q.split(',')
            .map(|t| t.trim())
            .find(|t| t.eq_ignore_ascii_case("auth"))
            .unwrap_or("auth")
            .to_string()
    });
    if let Some(qop) = qop {
        params.set("qop", qop);
        params.set("nc", format!("{nc:08x}"));
        params.set("cnonce", generate_nonce());
    }
    let response = digest_response(&params, method, &creds.username, &creds.password, None);
    params.set("response", response);
    if let Some(opaque) = challenge_params.get("opaque") {
        params.set("opaque", opaque);
    }
    Some(format!("Digest {params}"))
}
