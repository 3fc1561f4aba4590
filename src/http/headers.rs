use std::fmt;

use crate::errors::HttpError;

/// ordered header multi-map with case-insensitive name lookup
///
/// insertion order survives serialization, duplicate names are kept
/// as separate entries the way `Set-Cookie` needs them
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// true when no entries exist
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// first value for a name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// every value for a name, in insertion order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// whether any entry carries this name
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// replace every value under this name with one entry
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// append an entry without touching existing ones
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// drop every entry under this name
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// iterate entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// whether a comma separated header value contains a token,
    /// compared case-insensitively
    pub fn value_contains_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name).any(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
    }

    /// pairs from the `Cookie` request header
    pub fn cookies(&self) -> Vec<(String, String)> {
        let mut out = vec![];
        for value in self.get_all("Cookie") {
            for pair in value.split(';') {
                if let Some((name, value)) = pair.split_once('=') {
                    out.push((
                        name.trim().to_string(),
                        value.trim().trim_matches('"').to_string(),
                    ));
                }
            }
        }
        out
    }

    /// append a `Set-Cookie` line
    pub fn set_cookie(&mut self, name: &str, value: &str, attributes: &str) {
        let mut line = format!("{name}={value}");
        if !attributes.is_empty() {
            line.push_str("; ");
            line.push_str(attributes);
        }
        self.append("Set-Cookie", line);
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        Ok(())
    }
}

/// headers the connection machinery owns on a response
///
/// general-purpose callers go through [`ResponseHeaders`], which
/// refuses these names
const RESTRICTED: [&str; 4] = [
    "Content-Length",
    "Transfer-Encoding",
    "Connection",
    "WWW-Authenticate",
];

/// response header view that enforces the restricted set
#[derive(Debug, Clone, Default)]
pub struct ResponseHeaders {
    inner: Headers,
}

impl ResponseHeaders {
    /// empty map
    pub fn new() -> Self {
        Self::default()
    }

    fn check(name: &str) -> Result<(), HttpError> {
        if RESTRICTED.iter().any(|r| r.eq_ignore_ascii_case(name)) {
            return Err(HttpError::RestrictedHeader(name.to_string()));
        }
        Ok(())
    }

    /// replace a header, refusing restricted names
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> Result<(), HttpError> {
        Self::check(name)?;
        self.inner.set(name, value);
        Ok(())
    }

    /// append a header, refusing restricted names
    pub fn append(&mut self, name: &str, value: impl Into<String>) -> Result<(), HttpError> {
        Self::check(name)?;
        self.inner.append(name, value);
        Ok(())
    }

    /// remove a header, refusing restricted names
    pub fn remove(&mut self, name: &str) -> Result<(), HttpError> {
        Self::check(name)?;
        self.inner.remove(name);
        Ok(())
    }

    /// first value for a name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner.get(name)
    }

    /// append a `Set-Cookie` line
    pub fn set_cookie(&mut self, name: &str, value: &str, attributes: &str) {
        self.inner.set_cookie(name, value, attributes);
    }

    pub(crate) fn raw(&self) -> &Headers {
        &self.inner
    }

    /// escape hatch for the connection machinery
    pub(crate) fn raw_mut(&mut self) -> &mut Headers {
        &mut self.inner
    }
}
