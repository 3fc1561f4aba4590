use std::collections::HashMap;
use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::codec::DeflateConfig;
use crate::errors::WsError;
use crate::handshake::{client_request, gen_key, standard_handshake_resp_check};
use crate::http::auth::{answer_challenge, Credentials};
use crate::http::buffer::HeadBuffer;
use crate::session::{SessionConfig, WsSession};
use crate::tls::{wrap_client, MaybeTlsStream};

fn check_uri(uri: &http::Uri) -> Result<(), WsError> {
    if let Some(scheme) = uri.scheme_str() {
        match scheme.to_lowercase().as_str() {
            "ws" | "wss" => Ok(()),
            s => Err(WsError::InvalidUri(format!("unknown scheme {s}"))),
        }
    } else {
        Err(WsError::InvalidUri("missing scheme".into()))
    }
}

/// helper builder to construct a websocket client session
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    protocols: Vec<String>,
    extensions: Vec<String>,
    version: u8,
    headers: HashMap<String, String>,
    credentials: Option<Credentials>,
    extra_root_certs: Vec<PathBuf>,
    offer_deflate: bool,
    require_deflate: bool,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            protocols: vec![],
            extensions: vec![],
            headers: HashMap::new(),
            version: 13,
            credentials: None,
            extra_root_certs: vec![],
            offer_deflate: false,
            require_deflate: false,
        }
    }
}

impl ClientBuilder {
    /// create a builder with defaults
    pub fn new() -> Self {
        Default::default()
    }

    /// add a subprotocol offer
    pub fn protocol(mut self, protocol: String) -> Self {
        self.protocols.push(protocol);
        self
    }

    /// set every subprotocol offer at once
    ///
    /// **NOTE** it will clear protocols set by the `protocol` method
    pub fn protocols(self, protocols: Vec<String>) -> Self {
        Self { protocols, ..self }
    }

    /// add a raw extension offer
    pub fn extension(mut self, extension: String) -> Self {
        self.extensions.push(extension);
        self
    }

    /// offer permessage-deflate
    pub fn deflate(mut self, offer: bool) -> Self {
        self.offer_deflate = offer;
        self
    }

    /// fail the connect when the server refuses permessage-deflate
    pub fn deflate_required(mut self, required: bool) -> Self {
        self.require_deflate = required;
        self
    }

    /// set websocket version
    pub fn version(self, version: u8) -> Self {
        Self { version, ..self }
    }

    /// add an initial request header
    pub fn header<K: ToString, V: ToString>(mut self, name: K, value: V) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    /// credentials for answering a 401 challenge
    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    /// trust an extra DER certificate when connecting with wss
    pub fn extra_root_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.extra_root_certs.push(path.into());
        self
    }

    /// connect, perform the handshake and spawn the session
    pub async fn connect(&self, uri: &str) -> Result<WsSession, WsError> {
        let uri: http::Uri = uri
            .parse()
            .map_err(|_| WsError::InvalidUri(uri.to_string()))?;
        check_uri(&uri)?;

        let mut authorization: Option<String> = None;
        for attempt in 0..2 {
            match self.connect_once(&uri, authorization.as_deref()).await {
                Ok(session) => return Ok(session),
                Err(HandshakeAttempt::Unauthorized(challenge)) if attempt == 0 => {
                    let creds = self.credentials.as_ref().ok_or_else(|| {
                        WsError::HandShakeFailed("server requires authentication".to_string())
                    })?;
                    let path = uri
                        .path_and_query()
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "/".to_string());
                    authorization = answer_challenge(&challenge, creds, "GET", &path, 1);
                    if authorization.is_none() {
                        return Err(WsError::HandShakeFailed(format!(
                            "unsupported challenge `{challenge}`"
                        )));
                    }
                    tracing::debug!("retrying handshake with credentials");
                }
                Err(HandshakeAttempt::Unauthorized(_)) => {
                    return Err(WsError::HandShakeFailed(
                        "authentication rejected".to_string(),
                    ))
                }
                Err(HandshakeAttempt::Failed(e)) => return Err(e),
            }
        }
        unreachable!("two attempts always return")
    }

    async fn connect_once(
        &self,
        uri: &http::Uri,
        authorization: Option<&str>,
    ) -> Result<WsSession, HandshakeAttempt> {
        let secure = uri.scheme_str() == Some("wss");
        let host = uri.host().unwrap_or_default().to_string();
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });
        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| HandshakeAttempt::Failed(WsError::ConnectionFailed(e.to_string())))?;
        let mut stream = if secure {
            MaybeTlsStream::ClientTls(
                wrap_client(tcp, &host, &self.extra_root_certs)
                    .await
                    .map_err(HandshakeAttempt::Failed)?,
            )
        } else {
            MaybeTlsStream::Plain(tcp)
        };

        let mut extensions = self.extensions.clone();
        if self.offer_deflate {
            extensions.push("permessage-deflate; client_max_window_bits".to_string());
        }
        let key = gen_key();
        let request = client_request(
            uri,
            &key,
            &self.protocols,
            &extensions,
            self.version,
            &self.headers,
            authorization,
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| HandshakeAttempt::Failed(e.into()))?;
        stream
            .flush()
            .await
            .map_err(|e| HandshakeAttempt::Failed(e.into()))?;

        let mut head_buf = HeadBuffer::new();
        let head = head_buf
            .read_head(&mut stream)
            .await
            .map_err(|e| HandshakeAttempt::Failed(WsError::HandShakeFailed(e.to_string())))?;
        let remain = head_buf.take_leftover();
        let response = parse_response(&head).map_err(HandshakeAttempt::Failed)?;

        if response.status() == http::StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get("WWW-Authenticate")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            return Err(HandshakeAttempt::Unauthorized(challenge));
        }
        standard_handshake_resp_check(&key, &response).map_err(HandshakeAttempt::Failed)?;

        let deflate = response
            .headers()
            .get("Sec-WebSocket-Extensions")
            .and_then(|v| v.to_str().ok())
            .and_then(DeflateConfig::negotiate);
        if self.require_deflate && deflate.is_none() {
            return Err(HandshakeAttempt::Failed(WsError::ExtensionRequired(
                "permessage-deflate".to_string(),
            )));
        }
        let subprotocol = response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let mut config = SessionConfig::client();
        config.deflate = deflate;
        config.subprotocol = subprotocol;
        tracing::debug!(deflate = config.deflate.is_some(), "client handshake complete");
        Ok(WsSession::spawn(stream, remain, config))
    }
}

enum HandshakeAttempt {
    Unauthorized(String),
    Failed(WsError),
}

fn parse_response(head: &[u8]) -> Result<http::Response<()>, WsError> {
    let mut header_slots = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut header_slots);
    match parsed.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(WsError::HandShakeFailed("invalid response".to_string())),
    }
    let mut builder = http::Response::builder().status(parsed.code.unwrap_or_default());
    for header in parsed.headers.iter() {
        builder = builder.header(header.name, header.value);
    }
    builder
        .body(())
        .map_err(|e| WsError::HandShakeFailed(e.to_string()))
}
