use std::net::IpAddr;

use crate::errors::PrefixError;

/// host part of a listener prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefixHost {
    /// `+`, binds all interfaces and matches any request host
    Any,
    /// `*`, matches whatever no specific prefix on the port claimed
    Wildcard,
    /// a DNS name, matches only DNS request hosts
    Dns(String),
    /// an address literal
    Ip(IpAddr),
}

/// a URI prefix a listener serves: scheme, host, port and an absolute
/// path ending in `/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerPrefix {
    raw: String,
    secure: bool,
    host: PrefixHost,
    port: u16,
    path: String,
}

impl ListenerPrefix {
    /// parse and validate an ascii prefix string
    pub fn parse(prefix: &str) -> Result<Self, PrefixError> {
        let invalid = |why: &'static str| PrefixError::InvalidPrefix(prefix.to_string(), why);
        if !prefix.is_ascii() {
            return Err(invalid("must be ascii"));
        }
        let (secure, rest) = if let Some(rest) = prefix.strip_prefix("http://") {
            (false, rest)
        } else if let Some(rest) = prefix.strip_prefix("https://") {
            (true, rest)
        } else {
            return Err(invalid("scheme must be http or https"));
        };
        let path_start = rest.find('/').ok_or(invalid("missing path"))?;
        let (authority, path) = rest.split_at(path_start);
        if authority.is_empty() {
            return Err(invalid("missing host"));
        }
        if !path.ends_with('/') {
            return Err(invalid("path must end with /"));
        }
        if path.contains('%') {
            return Err(invalid("path must not contain %"));
        }
        if path.contains("//") {
            return Err(invalid("path must not contain //"));
        }
        let (host_str, port) = split_authority(authority).ok_or(invalid("bad port"))?;
        if host_str.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = match port {
            Some(p) => p,
            None if secure => 443,
            None => 80,
        };
        let host = match host_str {
            "+" => PrefixHost::Any,
            "*" => PrefixHost::Wildcard,
            h => {
                let bare = h.trim_start_matches('[').trim_end_matches(']');
                match bare.parse::<IpAddr>() {
                    Ok(ip) => PrefixHost::Ip(ip),
                    Err(_) => PrefixHost::Dns(h.to_ascii_lowercase()),
                }
            }
        };
        Ok(Self {
            raw: prefix.to_string(),
            secure,
            host,
            port,
            path: path.to_string(),
        })
    }

    /// original prefix string
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// whether the scheme is https
    pub fn secure(&self) -> bool {
        self.secure
    }

    /// host tier of this prefix
    pub fn host(&self) -> &PrefixHost {
        &self.host
    }

    /// port the prefix listens on
    pub fn port(&self) -> u16 {
        self.port
    }

    /// absolute path, always ends with `/`
    pub fn path(&self) -> &str {
        &self.path
    }

    /// address the accept socket binds to
    pub fn bind_addr(&self) -> IpAddr {
        match &self.host {
            PrefixHost::Ip(ip) => *ip,
            _ => IpAddr::from([0u8, 0, 0, 0]),
        }
    }

    /// whether this prefix claims a specific host (not `*`/`+`)
    pub fn is_host_specific(&self) -> bool {
        matches!(&self.host, PrefixHost::Dns(_) | PrefixHost::Ip(_))
    }

    /// host-aware match against a request host (no port)
    ///
    /// a DNS-named prefix only matches DNS-named request hosts
    pub fn matches_host(&self, request_host: &str) -> bool {
        match &self.host {
            PrefixHost::Any | PrefixHost::Wildcard => true,
            PrefixHost::Dns(name) => {
                let host = request_host.trim_end_matches('.');
                host.parse::<IpAddr>().is_err() && host.eq_ignore_ascii_case(name)
            }
            PrefixHost::Ip(ip) => {
                let bare = request_host.trim_start_matches('[').trim_end_matches(']');
                bare.parse::<IpAddr>().map(|h| h == *ip).unwrap_or(false)
            }
        }
    }
}

/// split `host[:port]`, keeping IPv6 brackets intact
fn split_authority(authority: &str) -> Option<(&str, Option<u16>)> {
    if let Some(end) = authority.rfind(']') {
        // bracketed v6 literal
        match authority[end + 1..].strip_prefix(':') {
            Some(port) => return Some((&authority[..=end], Some(port.parse().ok()?))),
            None if end + 1 == authority.len() => return Some((authority, None)),
            None => return None,
        }
    }
    match authority.split_once(':') {
        Some((host, port)) => Some((host, Some(port.parse().ok()?))),
        None => Some((authority, None)),
    }
}
