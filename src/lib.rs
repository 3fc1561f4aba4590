//! websocket toolkit with an embedded HTTP/1.1 listener
//!
//! The server side starts at [`HttpListener`]: register URI prefixes,
//! pull [`HttpContext`]s off the queue and either answer them or
//! upgrade them into [`WsSession`]s. The client side starts at
//! [`ClientBuilder`]. Frame codec, permessage-deflate and the session
//! state machine are usable on their own through [`codec`] and
//! [`session`] for callers that bring their own transport.
//!
//! ```no_run
//! use ws_gate::{AcceptOptions, HttpListener, WsEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener = HttpListener::new();
//!     listener.add_prefix("http://127.0.0.1:9001/ws/")?;
//!     listener.start()?;
//!     loop {
//!         let context = listener.get_context().await?;
//!         tokio::spawn(async move {
//!             let options = AcceptOptions::default();
//!             let Ok(mut session) = context.accept_websocket(&options).await else {
//!                 return;
//!             };
//!             while let Some(event) = session.next_event().await {
//!                 if let WsEvent::Message { data, is_text: true } = event {
//!                     let _ = session.send_text(String::from_utf8_lossy(&data)).await;
//!                 }
//!             }
//!         });
//!     }
//! }
//! ```

#![warn(missing_docs)]

/// client connector
pub mod client;
/// frame and permessage-deflate codecs
pub mod codec;
/// error definitions
pub mod errors;
/// websocket transport unit
pub mod frame;
/// opening handshake, accept key, negotiation
pub mod handshake;
/// embedded HTTP listener
pub mod http;
mod payload;
/// session state machine and events
pub mod session;
/// TLS bootstrap and the plain/TLS transport enum
pub mod tls;

pub use client::ClientBuilder;
pub use errors::{HttpError, PrefixError, ProtocolError, WsError};
pub use handshake::AcceptOptions;
pub use http::auth::AuthScheme;
pub use http::context::HttpContext;
pub use http::listener::HttpListener;
pub use session::{SessionConfig, SessionState, WsEvent, WsSender, WsSession};
