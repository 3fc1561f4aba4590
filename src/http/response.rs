use bytes::{BufMut, BytesMut};

use super::chunked::{encode_chunk, encode_final_chunk};
use super::headers::ResponseHeaders;
use super::status;

/// a response under construction
///
/// `Content-Length`, `Transfer-Encoding`, `Connection` and
/// `WWW-Authenticate` belong to the connection machinery; everything
/// else goes through [`headers_mut`](Self::headers_mut)
#[derive(Debug)]
pub struct HttpResponse {
    status: u16,
    reason: Option<String>,
    headers: ResponseHeaders,
    body: BytesMut,
    chunked: bool,
    keep_alive: bool,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new(200)
    }
}

impl HttpResponse {
    /// empty response with a status
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: None,
            headers: ResponseHeaders::new(),
            body: BytesMut::new(),
            chunked: false,
            keep_alive: true,
        }
    }

    /// minimal error page the connection sends for refused requests
    pub(crate) fn error(status: u16, message: &str) -> Self {
        let mut resp = Self::new(status);
        resp.headers
            .set("Content-Type", "text/html; charset=utf-8")
            .ok();
        let text = status::description(status);
        resp.write(
            format!("<html><body><h1>{status} {text}</h1><p>{message}</p></body></html>")
                .as_bytes(),
        );
        resp
    }

    /// current status code
    pub fn status(&self) -> u16 {
        self.status
    }

    /// change the status code
    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// override the reason phrase
    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = Some(reason.into());
    }

    /// response headers
    pub fn headers(&self) -> &ResponseHeaders {
        &self.headers
    }

    /// mutable response headers
    pub fn headers_mut(&mut self) -> &mut ResponseHeaders {
        &mut self.headers
    }

    /// append body bytes
    pub fn write(&mut self, data: &[u8]) {
        self.body.put_slice(data);
    }

    /// switch the body to chunked transfer coding
    pub fn set_chunked(&mut self, chunked: bool) {
        self.chunked = chunked;
    }

    /// allow or forbid connection reuse after this response
    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    pub(crate) fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// serialize head and body; `close_connection` is decided by the
    /// connection (reuse budget, status set, request semantics)
    pub(crate) fn serialize(&self, close_connection: bool) -> BytesMut {
        let mut out = BytesMut::with_capacity(256 + self.body.len());
        let reason = self
            .reason
            .as_deref()
            .unwrap_or_else(|| status::description(self.status));
        out.put_slice(format!("HTTP/1.1 {} {}\r\n", self.status, reason).as_bytes());
        out.put_slice(self.headers.raw().to_string().as_bytes());
        if self.chunked {
            out.put_slice(b"Transfer-Encoding: chunked\r\n");
        } else {
            out.put_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        if close_connection {
            out.put_slice(b"Connection: close\r\n");
        } else {
            out.put_slice(b"Connection: keep-alive\r\n");
        }
        out.put_slice(b"\r\n");
        if self.chunked {
            if !self.body.is_empty() {
                out.put_slice(&encode_chunk(&self.body));
            }
            out.put_slice(encode_final_chunk());
        } else {
            out.put_slice(&self.body);
        }
        out
    }
}
