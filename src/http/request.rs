use crate::errors::HttpError;

use super::headers::Headers;

/// how the request body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// no body
    None,
    /// `Content-Length` bytes follow the head
    Sized(u64),
    /// chunked transfer coding
    Chunked,
}

/// a parsed and finalized request
#[derive(Debug)]
pub struct HttpRequest {
    method: String,
    target: String,
    version_minor: u8,
    headers: Headers,
    url: String,
    secure: bool,
    body: BodyKind,
}

impl HttpRequest {
    /// parse a complete head (request line + headers + blank line)
    pub(crate) fn parse(head: &[u8], secure: bool) -> Result<Self, HttpError> {
        let mut header_slots = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut header_slots);
        match parsed.parse(head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(HttpError::BadRequest("truncated request head".to_string()))
            }
            Err(e) => return Err(HttpError::BadRequest(format!("malformed request: {e}"))),
        }
        let method = parsed
            .method
            .ok_or_else(|| HttpError::BadRequest("missing method".to_string()))?
            .to_string();
        let target = parsed
            .path
            .ok_or_else(|| HttpError::BadRequest("missing request target".to_string()))?
            .to_string();
        let version_minor = parsed
            .version
            .ok_or_else(|| HttpError::BadRequest("missing version".to_string()))?;
        let mut headers = Headers::new();
        for header in parsed.headers.iter() {
            headers.append(
                header.name.to_string(),
                String::from_utf8_lossy(header.value).trim().to_string(),
            );
        }
        Ok(Self {
            method,
            target,
            version_minor,
            headers,
            url: String::new(),
            secure,
            body: BodyKind::None,
        })
    }

    /// validate the head and settle how the body will be read
    ///
    /// HTTP/1.1 requires `Host`; `Transfer-Encoding` other than
    /// chunked is refused with 501; POST/PUT without a length and
    /// without chunking is refused with 411
    pub(crate) fn finalize(&mut self) -> Result<(), HttpError> {
        if self.version_minor >= 1 && !self.headers.contains("Host") {
            return Err(HttpError::BadRequest("missing Host header".to_string()));
        }
        let scheme = if self.secure { "https" } else { "http" };
        self.url = if self.target.starts_with('/') {
            let host = self.headers.get("Host").unwrap_or("localhost");
            format!("{scheme}://{host}{}", self.target)
        } else {
            self.target.clone()
        };
        if let Some(te) = self.headers.get("Transfer-Encoding") {
            if !te.trim().eq_ignore_ascii_case("chunked") {
                return Err(HttpError::NotImplemented(te.to_string()));
            }
            self.body = BodyKind::Chunked;
        } else if let Some(cl) = self.headers.get("Content-Length") {
            let len: u64 = cl
                .trim()
                .parse()
                .map_err(|_| HttpError::BadRequest(format!("bad Content-Length `{cl}`")))?;
            self.body = BodyKind::Sized(len);
        } else if matches!(self.method.as_str(), "POST" | "PUT") {
            return Err(HttpError::LengthRequired);
        }
        Ok(())
    }

    /// request method, uppercase as sent
    pub fn method(&self) -> &str {
        &self.method
    }

    /// raw request target
    pub fn target(&self) -> &str {
        &self.target
    }

    /// path part of the target, without the query
    pub fn path(&self) -> &str {
        match self.target.split_once('?') {
            Some((path, _)) => path,
            None => &self.target,
        }
    }

    /// query string, if any
    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, q)| q)
    }

    /// full url composed from scheme, host and target
    pub fn url(&self) -> &str {
        &self.url
    }

    /// HTTP minor version (1.x)
    pub fn version_minor(&self) -> u8 {
        self.version_minor
    }

    /// whether the transport is TLS
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// request headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// `Host` header without the port
    pub fn host(&self) -> Option<&str> {
        let raw = self.headers.get("Host")?;
        if raw.starts_with('[') {
            Some(raw.split_once(']').map(|(h, _)| &raw[..h.len() + 1]).unwrap_or(raw))
        } else {
            Some(raw.split_once(':').map(|(h, _)| h).unwrap_or(raw))
        }
    }

    /// cookie pairs sent with the request
    pub fn cookies(&self) -> Vec<(String, String)> {
        self.headers.cookies()
    }

    /// how the body is delimited
    pub fn body_kind(&self) -> BodyKind {
        self.body
    }

    /// whether the client asked for a 100 Continue interim response
    pub fn expects_continue(&self) -> bool {
        self.headers.value_contains_token("Expect", "100-continue")
    }

    /// keep-alive semantics of this request
    pub fn wants_keep_alive(&self) -> bool {
        if self.headers.value_contains_token("Connection", "close") {
            return false;
        }
        if self.version_minor == 0 {
            return self.headers.value_contains_token("Connection", "keep-alive");
        }
        true
    }

    /// whether this request asks for a websocket upgrade
    pub fn is_websocket_upgrade(&self) -> bool {
        self.method == "GET"
            && self.version_minor >= 1
            && self.headers.value_contains_token("Upgrade", "websocket")
            && self.headers.value_contains_token("Connection", "Upgrade")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse_ok(head: &str) -> HttpRequest {
        let mut req = HttpRequest::parse(head.as_bytes(), false).unwrap();
        req.finalize().unwrap();
        req
    }

    #[test]
    fn simple_get() {
        let req = parse_ok("GET /a/b?x=1 HTTP/1.1\r\nHost: example.com:8080\r\n\r\n");
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/a/b");
        assert_eq!(req.query(), Some("x=1"));
        assert_eq!(req.host(), Some("example.com"));
        assert_eq!(req.url(), "http://example.com:8080/a/b?x=1");
        assert_eq!(req.body_kind(), BodyKind::None);
        assert!(req.wants_keep_alive());
    }

    #[test]
    fn host_required_for_http11() {
        let mut req = HttpRequest::parse(b"GET / HTTP/1.1\r\n\r\n", false).unwrap();
        assert!(matches!(req.finalize(), Err(HttpError::BadRequest(_))));
        // HTTP/1.0 gets away without one
        let mut req = HttpRequest::parse(b"GET / HTTP/1.0\r\n\r\n", false).unwrap();
        req.finalize().unwrap();
        assert!(!req.wants_keep_alive());
    }

    #[test]
    fn body_delimitation() {
        let req = parse_ok("POST /u HTTP/1.1\r\nHost: a\r\nContent-Length: 12\r\n\r\n");
        assert_eq!(req.body_kind(), BodyKind::Sized(12));

        let req =
            parse_ok("POST /u HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert_eq!(req.body_kind(), BodyKind::Chunked);

        let mut req =
            HttpRequest::parse(b"POST /u HTTP/1.1\r\nHost: a\r\n\r\n", false).unwrap();
        assert!(matches!(req.finalize(), Err(HttpError::LengthRequired)));

        let mut req = HttpRequest::parse(
            b"POST /u HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: gzip\r\n\r\n",
            false,
        )
        .unwrap();
        assert!(matches!(req.finalize(), Err(HttpError::NotImplemented(_))));
    }

    #[test]
    fn expect_continue_flag() {
        let req = parse_ok(
            "POST /u HTTP/1.1\r\nHost: a\r\nContent-Length: 1\r\nExpect: 100-continue\r\n\r\n",
        );
        assert!(req.expects_continue());
    }

    #[test]
    fn upgrade_detection() {
        let req = parse_ok(
            "GET /ws HTTP/1.1\r\nHost: a\r\nUpgrade: websocket\r\nConnection: keep-alive, Upgrade\r\n\r\n",
        );
        assert!(req.is_websocket_upgrade());
        let req = parse_ok("GET /ws HTTP/1.1\r\nHost: a\r\nUpgrade: websocket\r\n\r\n");
        assert!(!req.is_websocket_upgrade());
    }

    #[test]
    fn garbage_request_line_rejected() {
        assert!(HttpRequest::parse(b"NOT A REQUEST\r\n\r\n", false).is_err());
    }
}
