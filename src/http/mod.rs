//! embedded HTTP/1.1 listener that serves the websocket handshake
//!
//! the listener is a first-class part of the crate: prefix routing,
//! Basic/Digest authentication, chunked transfer and keep-alive reuse
//! all live here, and [`context::HttpContext`] is where a connection
//! crosses over into a websocket session

/// Basic/Digest challenges, verification and the digest math
pub mod auth;
/// buffered head reading with the 32 KiB cap
pub mod buffer;
/// RFC 7230 chunked transfer decoder and encoder
pub mod chunked;
pub(crate) mod connection;
/// one HTTP exchange, and the websocket upgrade point
pub mod context;
pub(crate) mod endpoint;
/// case-insensitive ordered header multi-map
pub mod headers;
/// listener lifecycle and the context queue
pub mod listener;
/// URI prefix grammar and host matching
pub mod prefix;
/// parsed requests
pub mod request;
/// responses under construction
pub mod response;
/// status code reason phrases
pub mod status;
