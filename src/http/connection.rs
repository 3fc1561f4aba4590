use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::errors::HttpError;
use crate::tls::MaybeTlsStream;

use super::buffer::HeadBuffer;
use super::chunked::ChunkedDecoder;
use super::context::HttpContext;
use super::endpoint::EndpointBinding;
use super::listener::AuthDecision;
use super::request::{BodyKind, HttpRequest};
use super::response::HttpResponse;
use super::status;

pub(crate) type Transport = MaybeTlsStream<TcpStream>;

/// watchdog for the first request on a connection
const FIRST_READ_TIMEOUT: Duration = Duration::from_secs(90);
/// watchdog once the connection is being reused
const REUSE_READ_TIMEOUT: Duration = Duration::from_secs(15);
/// reuse budget per connection
const MAX_REUSES: u32 = 100;

/// total body a caller may buffer through `read_body`
const MAX_BODY: usize = 32 << 20;
/// leftover body a reuse is willing to silently drain
const DRAIN_MAX: usize = 64 << 10;

/// the request transport with everything read past the head
///
/// ownership travels with the context; after a websocket upgrade the
/// session takes the stream and the connection never touches it again
pub(crate) struct ConnTransport {
    pub(crate) stream: Transport,
    pub(crate) leftover: BytesMut,
    body: BodyState,
}

enum BodyState {
    Unread(BodyKind),
    Consumed,
}

impl ConnTransport {
    pub(crate) fn new(stream: Transport, leftover: BytesMut, body: BodyKind) -> Self {
        Self {
            stream,
            leftover,
            body: BodyState::Unread(body),
        }
    }

    async fn fill(&mut self) -> Result<(), HttpError> {
        let read = self.stream.read_buf(&mut self.leftover).await?;
        if read == 0 {
            return Err(HttpError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed inside body",
            )));
        }
        Ok(())
    }

    /// read the whole request body
    pub(crate) async fn read_body(&mut self) -> Result<Bytes, HttpError> {
        let kind = match std::mem::replace(&mut self.body, BodyState::Consumed) {
            BodyState::Unread(kind) => kind,
            BodyState::Consumed => return Ok(Bytes::new()),
        };
        self.read_body_inner(kind, MAX_BODY).await
    }

    async fn read_body_inner(
        &mut self,
        kind: BodyKind,
        limit: usize,
    ) -> Result<Bytes, HttpError> {
        match kind {
            BodyKind::None => Ok(Bytes::new()),
            BodyKind::Sized(len) => {
                let len = usize::try_from(len).map_err(|_| HttpError::PayloadTooLarge)?;
                if len > limit {
                    return Err(HttpError::PayloadTooLarge);
                }
                let mut out = BytesMut::with_capacity(len.min(64 << 10));
                while out.len() < len {
                    if self.leftover.is_empty() {
                        self.fill().await?;
                    }
                    let take = (len - out.len()).min(self.leftover.len());
                    out.extend_from_slice(&self.leftover.split_to(take));
                }
                Ok(out.freeze())
            }
            BodyKind::Chunked => {
                let mut decoder = ChunkedDecoder::new();
                let mut out = BytesMut::new();
                while decoder.wants_more() {
                    if self.leftover.is_empty() {
                        self.fill().await?;
                    }
                    let consumed = decoder.write(&self.leftover)?;
                    self.leftover.advance(consumed);
                    out.extend_from_slice(&decoder.read_all());
                    if out.len() > limit {
                        return Err(HttpError::PayloadTooLarge);
                    }
                }
                Ok(out.freeze())
            }
        }
    }

    /// drop an unread body so the connection can be reused; refuses to
    /// drain more than a small bound
    pub(crate) async fn drain_body(&mut self) -> Result<(), HttpError> {
        let kind = match std::mem::replace(&mut self.body, BodyState::Consumed) {
            BodyState::Unread(kind) => kind,
            BodyState::Consumed => return Ok(()),
        };
        self.read_body_inner(kind, DRAIN_MAX).await.map(|_| ())
    }
}

/// entry point from the accept loop
pub(crate) async fn handle(binding: Arc<EndpointBinding>, transport: Transport, peer: SocketAddr) {
    serve(binding, transport, peer, 0, BytesMut::new()).await;
}

/// re-enter the read loop after a keep-alive response
pub(crate) fn resume(
    binding: Arc<EndpointBinding>,
    transport: Transport,
    peer: SocketAddr,
    reuses: u32,
    leftover: BytesMut,
) {
    tokio::spawn(serve(binding, transport, peer, reuses, leftover));
}

async fn send_simple(
    transport: &mut Transport,
    response: HttpResponse,
    close: bool,
) -> Result<(), HttpError> {
    let bytes = response.serialize(close);
    transport.write_all(&bytes).await?;
    transport.flush().await?;
    Ok(())
}

/// whether a connection-answered response leaves the transport fit for
/// the next request
fn may_reuse(request: &HttpRequest, response_status: u16, reuses: u32) -> bool {
    request.wants_keep_alive()
        && !status::forces_close(response_status)
        && reuses < MAX_REUSES
        && matches!(request.body_kind(), BodyKind::None)
}

/// one connection's read loop: parse, authenticate, route, hand off
async fn serve(
    binding: Arc<EndpointBinding>,
    mut transport: Transport,
    peer: SocketAddr,
    mut reuses: u32,
    leftover: BytesMut,
) {
    let mut head_buf = HeadBuffer::with_leftover(leftover);
    loop {
        let watchdog = if reuses == 0 {
            FIRST_READ_TIMEOUT
        } else {
            REUSE_READ_TIMEOUT
        };
        let head = match tokio::time::timeout(watchdog, head_buf.read_head(&mut transport)).await
        {
            Err(_) => {
                tracing::debug!(%peer, "request watchdog fired");
                if head_buf.has_pending() {
                    let e = HttpError::Timeout;
                    let _ = send_simple(
                        &mut transport,
                        HttpResponse::error(e.status(), &e.to_string()),
                        true,
                    )
                    .await;
                }
                let _ = transport.shutdown().await;
                return;
            }
            Ok(Err(e)) => {
                let silent = matches!(
                    &e,
                    HttpError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof
                ) && !head_buf.has_pending();
                if !silent {
                    tracing::debug!(%peer, %e, "request head refused");
                    let _ = send_simple(
                        &mut transport,
                        HttpResponse::error(e.status(), &e.to_string()),
                        true,
                    )
                    .await;
                }
                let _ = transport.shutdown().await;
                return;
            }
            Ok(Ok(head)) => head,
        };

        let mut request = match HttpRequest::parse(&head, binding.secure) {
            Ok(request) => request,
            Err(e) => {
                let _ = send_simple(
                    &mut transport,
                    HttpResponse::error(e.status(), &e.to_string()),
                    true,
                )
                .await;
                let _ = transport.shutdown().await;
                return;
            }
        };
        if let Err(e) = request.finalize() {
            let _ = send_simple(
                &mut transport,
                HttpResponse::error(e.status(), &e.to_string()),
                true,
            )
            .await;
            let _ = transport.shutdown().await;
            return;
        }
        tracing::debug!(%peer, method = request.method(), target = request.target(), reuses, "request");

        if request.expects_continue() {
            if transport
                .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
                .await
                .is_err()
            {
                return;
            }
            let _ = transport.flush().await;
        }

        let listener = match binding.search(request.host(), request.path()) {
            Some(listener) => listener,
            None => {
                let e = HttpError::NotFound;
                let reuse = may_reuse(&request, e.status(), reuses);
                let _ = send_simple(
                    &mut transport,
                    HttpResponse::error(e.status(), &e.to_string()),
                    !reuse,
                )
                .await;
                if reuse {
                    reuses += 1;
                    continue;
                }
                let _ = transport.shutdown().await;
                return;
            }
        };

        let principal = match listener.check_auth(&request) {
            AuthDecision::Allow(principal) => principal,
            AuthDecision::Forbid => {
                let e = HttpError::Forbidden;
                let reuse = may_reuse(&request, e.status(), reuses);
                let _ = send_simple(
                    &mut transport,
                    HttpResponse::error(e.status(), &e.to_string()),
                    !reuse,
                )
                .await;
                if reuse {
                    reuses += 1;
                    continue;
                }
                let _ = transport.shutdown().await;
                return;
            }
            AuthDecision::Challenge(challenge) => {
                let e = HttpError::AuthRequired;
                let mut response = HttpResponse::error(e.status(), &e.to_string());
                response
                    .headers_mut()
                    .raw_mut()
                    .set("WWW-Authenticate", challenge);
                let reuse = may_reuse(&request, e.status(), reuses);
                let _ = send_simple(&mut transport, response, !reuse).await;
                if reuse {
                    reuses += 1;
                    continue;
                }
                let _ = transport.shutdown().await;
                return;
            }
        };

        let body_kind = request.body_kind();
        let conn = ConnTransport::new(transport, head_buf.take_leftover(), body_kind);
        let context = HttpContext::new(
            request,
            principal,
            conn,
            binding.clone(),
            listener.clone(),
            peer,
            reuses,
        );
        match listener.enqueue(context) {
            Ok(()) => return,
            Err(mut context) => {
                // listener went away between routing and handoff
                let mut conn = context.take_transport();
                let e = HttpError::ServiceUnavailable;
                let _ = send_simple(
                    &mut conn.stream,
                    HttpResponse::error(e.status(), &e.to_string()),
                    true,
                )
                .await;
                let _ = conn.stream.shutdown().await;
                return;
            }
        }
    }
}

/// write the caller's response and either resume the read loop or
/// close the transport
pub(crate) async fn finish_response(
    binding: Arc<EndpointBinding>,
    mut conn: ConnTransport,
    request: &HttpRequest,
    response: &HttpResponse,
    peer: SocketAddr,
    reuses: u32,
) -> Result<(), HttpError> {
    let close = !response.keep_alive()
        || !request.wants_keep_alive()
        || reuses >= MAX_REUSES
        || status::forces_close(response.status());
    let bytes = response.serialize(close);
    conn.stream.write_all(&bytes).await?;
    conn.stream.flush().await?;
    if close {
        let _ = conn.stream.shutdown().await;
        return Ok(());
    }
    match conn.drain_body().await {
        Ok(()) => {
            resume(binding, conn.stream, peer, reuses + 1, conn.leftover);
            Ok(())
        }
        Err(e) => {
            tracing::debug!(%e, "input flush failed, closing instead of reusing");
            let _ = conn.stream.shutdown().await;
            Ok(())
        }
    }
}
