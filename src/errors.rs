use thiserror::Error;

use crate::frame::OpCode;
use crate::session::SessionState;

/// errors during handshake, read/write frame or session control
#[derive(Debug, Error)]
pub enum WsError {
    #[error("invalid uri `{0}`")]
    InvalidUri(String),
    #[error("cert {0} not found")]
    CertFileNotFound(String),
    #[error("load cert {0} failed")]
    LoadCertFailed(String),
    #[error("connection failed `{0}`")]
    ConnectionFailed(String),
    #[error("tls dns lookup failed `{0}`")]
    TlsDnsFailed(String),
    #[error("io error {0:?}")]
    IOError(#[from] std::io::Error),
    #[error("{0}")]
    HandShakeFailed(String),
    #[error("{error}")]
    Protocol {
        close_code: u16,
        error: ProtocolError,
    },
    #[error("message too big, limit {limit}")]
    MessageTooBig { limit: usize },
    #[error("required extension not negotiated by server: {0}")]
    ExtensionRequired(String),
    #[error("compress failed {0}")]
    CompressFailed(String),
    #[error("decompress failed {0}")]
    DeCompressFailed(String),
    #[error("io on invalid session state {0:?}")]
    InvalidConnState(SessionState),
    #[error("unsupported frame {0:?}")]
    UnsupportedFrame(OpCode),
    #[error("operation canceled")]
    Canceled,
    #[error("operation timed out")]
    Timeout,
    #[error("transport closed")]
    TransportClosed,
}

impl WsError {
    /// close code to put on the wire for this error, if any
    ///
    /// local-only failures (`Canceled`, `Timeout`, `TransportClosed`, plain
    /// I/O errors) never generate a Close frame
    pub fn close_code(&self) -> Option<u16> {
        match self {
            WsError::Protocol { close_code, .. } => Some(*close_code),
            WsError::MessageTooBig { .. } => Some(1009),
            WsError::UnsupportedFrame(_) => Some(1003),
            WsError::CompressFailed(_) | WsError::DeCompressFailed(_) => Some(1011),
            _ => None,
        }
    }

    pub(crate) fn protocol(error: ProtocolError) -> Self {
        let close_code = error.close_code();
        WsError::Protocol { close_code, error }
    }
}

/// errors while decoding a frame from bytes
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid leading bits {0:b}")]
    InvalidLeadingBits(u8),
    #[error("invalid opcode {0}")]
    InvalidOpcode(u8),
    #[error("payload length not encoded in shortest form")]
    NotMinimalLengthEncoding,
    #[error("payload length {0} out of range")]
    PayloadLengthOutOfRange(u64),
    #[error("unmasked frame from client")]
    UnmaskedFrameFromClient,
    #[error("masked frame from server")]
    MaskedFrameFromServer,
    #[error("missing init fragmented frame")]
    MissInitialFragmentedFrame,
    #[error("not continue frame after init fragmented frame")]
    NotContinueFrameAfterFragmented,
    #[error("fragmented control frame")]
    FragmentedControlFrame,
    #[error("control frame is too big {0}")]
    ControlFrameTooBig(usize),
    #[error("compressed control frame")]
    CompressedControlFrame,
    #[error("invalid close frame payload len, expect 0 or >= 2")]
    InvalidCloseFramePayload,
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),
    #[error("invalid utf-8 text")]
    InvalidUtf8,
    #[error("compressed frame while deflate not negotiated")]
    CompressedFrameWithoutExtension,
}

impl ProtocolError {
    /// close code mandated by RFC 6455 for this violation
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::InvalidUtf8 => 1007,
            _ => 1002,
        }
    }
}

/// listener prefix configuration errors, surfaced synchronously
#[derive(Debug, Error)]
pub enum PrefixError {
    #[error("invalid prefix `{0}`: {1}")]
    InvalidPrefix(String, &'static str),
    #[error("prefix `{0}` already in use")]
    PrefixInUse(String),
}

/// HTTP-level errors, mapped to a status code and sent to the peer
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("headers too long")]
    HeaderTooLarge,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("length required")]
    LengthRequired,
    #[error("request body too large")]
    PayloadTooLarge,
    #[error("transfer encoding not implemented: {0}")]
    NotImplemented(String),
    #[error("authentication required")]
    AuthRequired,
    #[error("forbidden")]
    Forbidden,
    #[error("no listener for request uri")]
    NotFound,
    #[error("listener unavailable")]
    ServiceUnavailable,
    #[error("header `{0}` cannot be set through this api")]
    RestrictedHeader(String),
    #[error("listener closed")]
    ListenerClosed,
    #[error("request timed out")]
    Timeout,
    #[error("io error {0:?}")]
    Io(#[from] std::io::Error),
}

impl HttpError {
    /// status code reported to the peer for this error
    pub fn status(&self) -> u16 {
        match self {
            HttpError::HeaderTooLarge => 400,
            HttpError::BadRequest(_) => 400,
            HttpError::LengthRequired => 411,
            HttpError::PayloadTooLarge => 413,
            HttpError::NotImplemented(_) => 501,
            HttpError::AuthRequired => 401,
            HttpError::Forbidden => 403,
            HttpError::NotFound => 404,
            HttpError::ServiceUnavailable => 503,
            HttpError::RestrictedHeader(_) => 500,
            HttpError::ListenerClosed => 503,
            HttpError::Timeout => 408,
            HttpError::Io(_) => 500,
        }
    }
}
