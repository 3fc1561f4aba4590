use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use crate::errors::{HttpError, WsError};
use crate::handshake::{self, AcceptOptions};
use crate::session::{SessionConfig, WsSession};

use super::auth::Principal;
use super::connection::{self, ConnTransport};
use super::endpoint::EndpointBinding;
use super::listener::HttpListener;
use super::request::HttpRequest;
use super::response::HttpResponse;

/// one HTTP exchange: the parsed request, the response under
/// construction, and the transport they ride on
///
/// a context ends in exactly one of two ways: [`respond`](Self::respond)
/// closes the HTTP side, or [`accept_websocket`](Self::accept_websocket)
/// hands the transport to a session
pub struct HttpContext {
    request: HttpRequest,
    response: HttpResponse,
    principal: Option<Principal>,
    conn: ConnTransport,
    binding: Arc<EndpointBinding>,
    listener: HttpListener,
    peer: SocketAddr,
    reuses: u32,
}

impl HttpContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        request: HttpRequest,
        principal: Option<Principal>,
        conn: ConnTransport,
        binding: Arc<EndpointBinding>,
        listener: HttpListener,
        peer: SocketAddr,
        reuses: u32,
    ) -> Self {
        Self {
            request,
            response: HttpResponse::new(200),
            principal,
            conn,
            binding,
            listener,
            peer,
            reuses,
        }
    }

    /// the parsed request
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    /// the response under construction
    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    /// mutable access to the response under construction
    pub fn response_mut(&mut self) -> &mut HttpResponse {
        &mut self.response
    }

    /// the authenticated principal, if the listener required one
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// the listener this request was routed to
    pub fn listener(&self) -> &HttpListener {
        &self.listener
    }

    /// peer address of the transport
    pub fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    /// whether the transport is TLS
    pub fn is_secure(&self) -> bool {
        self.request.is_secure()
    }

    /// how many requests this connection served before this one
    pub fn reuses(&self) -> u32 {
        self.reuses
    }

    /// read the whole request body
    pub async fn read_body(&mut self) -> Result<Bytes, HttpError> {
        self.conn.read_body().await
    }

    /// write the built response and finish the exchange
    ///
    /// the connection is reused for the next request when the
    /// response and the reuse budget allow it
    pub async fn respond(self) -> Result<(), HttpError> {
        connection::finish_response(
            self.binding,
            self.conn,
            &self.request,
            &self.response,
            self.peer,
            self.reuses,
        )
        .await
    }

    /// replace the response wholesale and finish the exchange
    pub async fn respond_with(mut self, response: HttpResponse) -> Result<(), HttpError> {
        self.response = response;
        self.respond().await
    }

    /// 503 used when a listener goes away with contexts still queued
    pub(crate) async fn reject_unavailable(self) {
        let _ = self
            .respond_with(HttpResponse::error(503, "listener unavailable"))
            .await;
    }

    pub(crate) fn take_transport(self) -> ConnTransport {
        self.conn
    }

    /// perform the websocket handshake and transfer the transport to a
    /// new session
    ///
    /// on a rejected handshake a 400 is written, the socket is closed
    /// and the error is returned
    pub async fn accept_websocket(self, options: &AcceptOptions) -> Result<WsSession, WsError> {
        self.accept_websocket_with(options, SessionConfig::server())
            .await
    }

    /// like [`accept_websocket`](Self::accept_websocket) with explicit
    /// session tuning (keepalive, limits, fragment size)
    pub async fn accept_websocket_with(
        self,
        options: &AcceptOptions,
        mut config: SessionConfig,
    ) -> Result<WsSession, WsError> {
        let negotiated = match handshake::negotiate(&self.request, options) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                let mut conn = self.conn;
                let _ = conn
                    .stream
                    .write_all(
                        HttpResponse::error(400, "websocket handshake rejected")
                            .serialize(true)
                            .as_ref(),
                    )
                    .await;
                let _ = conn.stream.shutdown().await;
                return Err(e);
            }
        };
        let mut conn = self.conn;
        let response = handshake::accept_response(&negotiated);
        conn.stream.write_all(response.as_bytes()).await?;
        conn.stream.flush().await?;
        tracing::debug!(peer = %self.peer, "connection upgraded to websocket");

        config.deflate = negotiated.deflate.clone();
        config.subprotocol = negotiated.protocol.clone();
        Ok(WsSession::spawn(conn.stream, conn.leftover, config))
    }
}
