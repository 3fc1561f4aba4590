use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha1::{Digest as _, Sha1};

use crate::codec::DeflateConfig;
use crate::errors::WsError;
use crate::http::request::HttpRequest;

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// fresh random Sec-WebSocket-Key
pub fn gen_key() -> String {
    let raw: [u8; 16] = rand::random();
    STANDARD.encode(raw)
}

/// Sec-WebSocket-Accept for a key
pub fn cal_accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(GUID);
    STANDARD.encode(sha1.finalize())
}

/// what the server is willing to accept
#[derive(Debug, Clone, Default)]
pub struct AcceptOptions {
    /// subprotocols the server understands; the first one the client
    /// offered wins, an unknown set leaves the header out
    pub protocols: Vec<String>,
    /// negotiate permessage-deflate when offered
    pub enable_deflate: bool,
}

/// outcome of a successful server-side negotiation
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// the client's key
    pub key: String,
    /// computed accept value
    pub accept: String,
    /// agreed subprotocol, if any
    pub protocol: Option<String>,
    /// agreed extension parameters, if any
    pub deflate: Option<DeflateConfig>,
}

/// check that a request is a well-formed websocket handshake and
/// extract its key
pub fn validate_upgrade(req: &HttpRequest) -> Result<String, WsError> {
    if !req.is_websocket_upgrade() {
        return Err(WsError::HandShakeFailed(
            "not a websocket upgrade request".to_string(),
        ));
    }
    if req.headers().get("Host").is_none() {
        return Err(WsError::HandShakeFailed("missing Host header".to_string()));
    }
    match req.headers().get("Sec-WebSocket-Version") {
        Some("13") => {}
        Some(v) => {
            return Err(WsError::HandShakeFailed(format!(
                "unsupported websocket version {v}"
            )))
        }
        None => {
            return Err(WsError::HandShakeFailed(
                "missing Sec-WebSocket-Version".to_string(),
            ))
        }
    }
    let key = req
        .headers()
        .get("Sec-WebSocket-Key")
        .ok_or_else(|| WsError::HandShakeFailed("missing Sec-WebSocket-Key".to_string()))?
        .trim();
    match STANDARD.decode(key) {
        Ok(raw) if raw.len() == 16 => Ok(key.to_string()),
        _ => Err(WsError::HandShakeFailed(format!(
            "Sec-WebSocket-Key `{key}` is not a 16 byte base64 value"
        ))),
    }
}

/// negotiate subprotocol and extensions for a validated request
pub fn negotiate(req: &HttpRequest, options: &AcceptOptions) -> Result<Negotiated, WsError> {
    let key = validate_upgrade(req)?;
    let accept = cal_accept_key(&key);

    let protocol = req.headers().get("Sec-WebSocket-Protocol").and_then(|offered| {
        offered
            .split(',')
            .map(|p| p.trim())
            .find(|p| options.protocols.iter().any(|s| s == p))
            .map(|p| p.to_string())
    });

    let deflate = if options.enable_deflate {
        req.headers()
            .get_all("Sec-WebSocket-Extensions")
            .find_map(DeflateConfig::negotiate)
    } else {
        None
    };
    tracing::debug!(?protocol, ?deflate, "handshake negotiated");
    Ok(Negotiated {
        key,
        accept,
        protocol,
        deflate,
    })
}

/// serialize the 101 response for a negotiation outcome
pub fn accept_response(negotiated: &Negotiated) -> String {
    let mut lines = vec![
        "HTTP/1.1 101 Switching Protocols".to_string(),
        "Upgrade: websocket".to_string(),
        "Connection: Upgrade".to_string(),
        format!("Sec-WebSocket-Accept: {}", negotiated.accept),
    ];
    if let Some(protocol) = &negotiated.protocol {
        lines.push(format!("Sec-WebSocket-Protocol: {protocol}"));
    }
    if let Some(deflate) = &negotiated.deflate {
        lines.push(format!(
            "Sec-WebSocket-Extensions: {}",
            deflate.to_header_value()
        ));
    }
    lines.push("\r\n".to_string());
    lines.join("\r\n")
}

/// serialize a client handshake request
#[allow(clippy::too_many_arguments)]
pub fn client_request(
    uri: &http::Uri,
    key: &str,
    protocols: &[String],
    extensions: &[String],
    version: u8,
    extra_headers: &HashMap<String, String>,
    authorization: Option<&str>,
) -> String {
    let default_port = match uri.scheme_str() {
        Some("wss") | Some("https") => 443,
        _ => 80,
    };
    let host = format!(
        "{}:{}",
        uri.host().unwrap_or_default(),
        uri.port_u16().unwrap_or(default_port)
    );
    let path = uri
        .path_and_query()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "/".to_string());
    let mut lines = vec![
        format!("GET {path} HTTP/1.1"),
        format!("Host: {host}"),
        "Upgrade: websocket".to_string(),
        "Connection: Upgrade".to_string(),
        format!("Sec-WebSocket-Key: {key}"),
        format!("Sec-WebSocket-Version: {version}"),
    ];
    if !protocols.is_empty() {
        lines.push(format!("Sec-WebSocket-Protocol: {}", protocols.join(", ")));
    }
    if !extensions.is_empty() {
        lines.push(format!(
            "Sec-WebSocket-Extensions: {}",
            extensions.join(", ")
        ));
    }
    if let Some(authorization) = authorization {
        lines.push(format!("Authorization: {authorization}"));
    }
    for (name, value) in extra_headers {
        lines.push(format!("{name}: {value}"));
    }
    lines.push("\r\n".to_string());
    lines.join("\r\n")
}

/// check a server handshake response against the key we sent
pub fn standard_handshake_resp_check(
    key: &str,
    resp: &http::Response<()>,
) -> Result<(), WsError> {
    if resp.status() != http::StatusCode::SWITCHING_PROTOCOLS {
        return Err(WsError::HandShakeFailed(format!(
            "expect 101 response, got {}",
            resp.status()
        )));
    }
    let expected = cal_accept_key(key);
    match resp.headers().get("Sec-WebSocket-Accept") {
        Some(value) if value.to_str().map(|v| v.trim() == expected).unwrap_or(false) => Ok(()),
        Some(value) => Err(WsError::HandShakeFailed(format!(
            "mismatch accept key, expect {expected}, got {value:?}"
        ))),
        None => Err(WsError::HandShakeFailed(
            "missing Sec-WebSocket-Accept".to_string(),
        )),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::http::request::HttpRequest;

    fn upgrade_request(extra: &str) -> HttpRequest {
        let head = format!(
            "GET /ws HTTP/1.1\r\nHost: server.example.com\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n{extra}\r\n"
        );
        let mut req = HttpRequest::parse(head.as_bytes(), false).unwrap();
        req.finalize().unwrap();
        req
    }

    #[test]
    fn rfc6455_sample_accept_key() {
        assert_eq!(
            cal_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn plain_handshake_accepted() {
        let req = upgrade_request("");
        let negotiated = negotiate(&req, &AcceptOptions::default()).unwrap();
        assert_eq!(negotiated.accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert!(negotiated.protocol.is_none());
        assert!(negotiated.deflate.is_none());
        let resp = accept_response(&negotiated);
        assert!(resp.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(resp.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(resp.ends_with("\r\n\r\n"));
    }

    #[test]
    fn subprotocol_first_supported_offer_wins() {
        let req = upgrade_request("Sec-WebSocket-Protocol: chat, superchat\r\n");
        let options = AcceptOptions {
            protocols: vec!["superchat".to_string(), "chat".to_string()],
            enable_deflate: false,
        };
        let negotiated = negotiate(&req, &options).unwrap();
        assert_eq!(negotiated.protocol.as_deref(), Some("chat"));

        let options = AcceptOptions {
            protocols: vec!["other".to_string()],
            enable_deflate: false,
        };
        let negotiated = negotiate(&req, &options).unwrap();
        assert!(negotiated.protocol.is_none(), "unknown offers leave the header out");
    }

    #[test]
    fn deflate_negotiated_when_enabled() {
        let req = upgrade_request(
            "Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits\r\n",
        );
        let negotiated = negotiate(
            &req,
            &AcceptOptions {
                protocols: vec![],
                enable_deflate: true,
            },
        )
        .unwrap();
        assert!(negotiated.deflate.is_some());
        let negotiated = negotiate(&req, &AcceptOptions::default()).unwrap();
        assert!(negotiated.deflate.is_none());
    }

    #[test]
    fn bad_handshakes_rejected() {
        let head = "POST /ws HTTP/1.1\r\nHost: a\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\
                    Content-Length: 0\r\n\r\n";
        let mut req = HttpRequest::parse(head.as_bytes(), false).unwrap();
        req.finalize().unwrap();
        assert!(validate_upgrade(&req).is_err(), "POST is not an upgrade");

        let req = upgrade_request("");
        // tamper the version through a rebuilt request
        let head = "GET /ws HTTP/1.1\r\nHost: a\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 8\r\n\r\n";
        let mut bad = HttpRequest::parse(head.as_bytes(), false).unwrap();
        bad.finalize().unwrap();
        assert!(validate_upgrade(&bad).is_err());
        assert!(validate_upgrade(&req).is_ok());

        let head = "GET /ws HTTP/1.1\r\nHost: a\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                    Sec-WebSocket-Key: c2hvcnQ=\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let mut bad = HttpRequest::parse(head.as_bytes(), false).unwrap();
        bad.finalize().unwrap();
        assert!(validate_upgrade(&bad).is_err(), "key must decode to 16 bytes");
    }

    #[test]
    fn client_request_layout() {
        let uri: http::Uri = "ws://example.com/chat".parse().unwrap();
        let text = client_request(
            &uri,
            "dGhlIHNhbXBsZSBub25jZQ==",
            &["chat".to_string()],
            &[],
            13,
            &HashMap::new(),
            None,
        );
        assert!(text.starts_with("GET /chat HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com:80\r\n"));
        assert!(text.contains("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
