use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::codec::{
    deflate_frame_config, AsyncFrameCodec, DeflateCodec, DeflateConfig, DeflateRead,
    DeflateWrite, FrameConfig, Role, Split,
};
use crate::errors::{ProtocolError, WsError};
use crate::frame::{close_code, OpCode};

/// object-safe transport bound for a running session
pub trait AsyncTransport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncTransport for T {}

type BoxTransport = Box<dyn AsyncTransport>;

/// session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// handshake still in flight
    Connecting,
    /// data phase
    Open,
    /// a close frame went out or came in, waiting for the other one
    Closing,
    /// both close frames seen, or the transport died
    Closed,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Connecting,
            1 => SessionState::Open,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SessionState::Connecting => 0,
            SessionState::Open => 1,
            SessionState::Closing => 2,
            SessionState::Closed => 3,
        }
    }
}

/// events delivered to the session consumer
///
/// `Error` shows up at most once per session, `Close` exactly once and
/// always after `Error` when both apply
#[derive(Debug)]
pub enum WsEvent {
    /// session reached the data phase
    Open,
    /// a complete data message
    Message {
        /// reassembled payload
        data: Bytes,
        /// true for text messages (payload is valid utf-8)
        is_text: bool,
    },
    /// peer ping, a pong has already been queued
    Ping(Bytes),
    /// peer pong
    Pong(Bytes),
    /// the session ended
    Close {
        /// close code from the wire, 1005 when absent, 1006 when
        /// the transport died without a close frame
        code: u16,
        /// close reason text
        reason: String,
        /// true when both close frames were exchanged
        clean: bool,
    },
    /// a protocol, payload or transport failure
    Error(WsError),
}

/// tuning knobs for a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// frame codec behavior
    pub frame: FrameConfig,
    /// negotiated permessage-deflate parameters, if any
    pub deflate: Option<DeflateConfig>,
    /// agreed subprotocol, if any
    pub subprotocol: Option<String>,
    /// run a periodic pinger at this interval
    pub keepalive_interval: Option<Duration>,
    /// a ping unanswered for this long fails the session
    pub pong_timeout: Duration,
    /// how long to wait for the peer close frame after sending ours
    pub close_grace: Duration,
}

impl SessionConfig {
    /// server side defaults
    pub fn server() -> Self {
        Self {
            frame: FrameConfig::server(),
            deflate: None,
            subprotocol: None,
            keepalive_interval: None,
            pong_timeout: Duration::from_secs(10),
            close_grace: Duration::from_secs(1),
        }
    }

    /// client side defaults
    pub fn client() -> Self {
        Self {
            frame: FrameConfig::client(),
            ..Self::server()
        }
    }
}

struct SessionCore {
    writer: Mutex<DeflateWrite<WriteHalf<BoxTransport>>>,
    state: AtomicU8,
    sent_close: AtomicBool,
    received_close: AtomicBool,
    pending_ping: parking_lot::Mutex<Option<(Bytes, tokio::time::Instant)>>,
    closed: Notify,
    // wakes the receive pump out of its blocked read when the close
    // grace expires, so the whole transport goes down, not just the
    // write half
    force_close: Notify,
    role: Role,
    close_grace: Duration,
}

impl SessionCore {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    async fn send_data(&self, code: OpCode, payload: &[u8]) -> Result<(), WsError> {
        let mut writer = self.writer.lock().await;
        if self.sent_close.load(Ordering::Acquire) {
            return Err(WsError::InvalidConnState(self.state()));
        }
        match self.state() {
            SessionState::Open => writer.send(code, payload).await,
            other => Err(WsError::InvalidConnState(other)),
        }
    }

    async fn send_control(&self, code: OpCode, payload: &[u8]) -> Result<(), WsError> {
        if payload.len() > 125 {
            return Err(WsError::protocol(ProtocolError::ControlFrameTooBig(
                payload.len(),
            )));
        }
        let mut writer = self.writer.lock().await;
        if self.sent_close.load(Ordering::Acquire) {
            return Err(WsError::InvalidConnState(self.state()));
        }
        writer.send(code, payload).await
    }

    /// send our close frame once; every later attempt is a no-op
    async fn send_close(
        self: &Arc<Self>,
        code: impl Into<Option<u16>>,
        reason: &str,
    ) -> Result<(), WsError> {
        let code = code.into();
        if let Some(code) = code {
            if !close_code::is_sendable(code) {
                return Err(WsError::protocol(ProtocolError::InvalidCloseCode(code)));
            }
        }
        let mut writer = self.writer.lock().await;
        if self.sent_close.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.state() == SessionState::Open {
            self.set_state(SessionState::Closing);
        }
        tracing::debug!(?code, reason, "sending close frame");
        let result = writer.send_close(code, reason.as_bytes()).await;
        drop(writer);
        self.spawn_close_grace();
        result
    }

    /// force the transport shut if the peer close does not arrive in
    /// time
    fn spawn_close_grace(self: &Arc<Self>) {
        let core = self.clone();
        tokio::spawn(async move {
            let finished =
                tokio::time::timeout(core.close_grace, core.closed.notified()).await;
            if finished.is_err() && core.state() != SessionState::Closed {
                tracing::debug!("close grace expired, dropping transport");
                {
                    let mut writer = core.writer.lock().await;
                    let _ = writer.shutdown().await;
                }
                // the pump owns the read half; kick it out of its read
                core.force_close.notify_one();
            }
        });
    }

    async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// cloneable sending handle detached from the event stream
pub struct WsSender {
    core: Arc<SessionCore>,
}

impl Clone for WsSender {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl WsSender {
    /// current session state
    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    /// send a binary message
    pub async fn send(&self, data: impl AsRef<[u8]>) -> Result<(), WsError> {
        self.core.send_data(OpCode::Binary, data.as_ref()).await
    }

    /// send a text message
    pub async fn send_text(&self, text: impl AsRef<str>) -> Result<(), WsError> {
        self.core
            .send_data(OpCode::Text, text.as_ref().as_bytes())
            .await
    }

    /// send a ping, payload capped at 125 bytes
    pub async fn send_ping(&self, payload: impl AsRef<[u8]>) -> Result<(), WsError> {
        let payload = payload.as_ref();
        self.core
            .pending_ping
            .lock()
            .replace((Bytes::copy_from_slice(payload), tokio::time::Instant::now()));
        self.core.send_control(OpCode::Ping, payload).await
    }

    /// send an unsolicited pong
    pub async fn send_pong(&self, payload: impl AsRef<[u8]>) -> Result<(), WsError> {
        self.core.send_control(OpCode::Pong, payload.as_ref()).await
    }

    /// start the close handshake
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), WsError> {
        self.core.send_close(code, reason).await
    }
}

/// a websocket session over an owned transport
///
/// the transport belongs to the session for its whole lifetime; the
/// receive pump runs as its own task and feeds the event stream
pub struct WsSession {
    sender: WsSender,
    events: mpsc::UnboundedReceiver<WsEvent>,
    subprotocol: Option<String>,
}

impl WsSession {
    /// take ownership of a handshaken transport and start the pumps
    ///
    /// `remain` carries bytes that were read past the handshake
    pub fn spawn<S>(stream: S, remain: BytesMut, config: SessionConfig) -> WsSession
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let SessionConfig {
            mut frame,
            deflate,
            subprotocol,
            keepalive_interval,
            pong_timeout,
            close_grace,
        } = config;
        if deflate.is_some() {
            frame = deflate_frame_config(frame);
        }
        let role = frame.role;
        let boxed: BoxTransport = Box::new(stream);
        let codec = AsyncFrameCodec::new_with(boxed, frame, remain);
        let codec = DeflateCodec::new(codec, deflate);
        let (read, write) = codec.split();

        let core = Arc::new(SessionCore {
            writer: Mutex::new(write),
            state: AtomicU8::new(SessionState::Open.as_u8()),
            sent_close: AtomicBool::new(false),
            received_close: AtomicBool::new(false),
            pending_ping: parking_lot::Mutex::new(None),
            closed: Notify::new(),
            force_close: Notify::new(),
            role,
            close_grace,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(WsEvent::Open);

        tokio::spawn(receive_pump(read, core.clone(), tx.clone()));
        if let Some(interval) = keepalive_interval {
            tokio::spawn(keepalive(core.clone(), interval, pong_timeout));
        }

        WsSession {
            sender: WsSender { core },
            events: rx,
            subprotocol,
        }
    }

    /// current session state
    pub fn state(&self) -> SessionState {
        self.sender.state()
    }

    /// subprotocol agreed during the handshake
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// cloneable sending handle
    pub fn sender(&self) -> WsSender {
        self.sender.clone()
    }

    /// send a binary message
    pub async fn send(&self, data: impl AsRef<[u8]>) -> Result<(), WsError> {
        self.sender.send(data).await
    }

    /// send a text message
    pub async fn send_text(&self, text: impl AsRef<str>) -> Result<(), WsError> {
        self.sender.send_text(text).await
    }

    /// send a ping, payload capped at 125 bytes
    pub async fn send_ping(&self, payload: impl AsRef<[u8]>) -> Result<(), WsError> {
        self.sender.send_ping(payload).await
    }

    /// start the close handshake
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), WsError> {
        self.sender.close(code, reason).await
    }

    /// next event, `None` after `Close` has been delivered and the
    /// pump is gone
    pub async fn next_event(&mut self) -> Option<WsEvent> {
        self.events.recv().await
    }
}

async fn receive_pump(
    mut read: DeflateRead<ReadHalf<BoxTransport>>,
    core: Arc<SessionCore>,
    tx: mpsc::UnboundedSender<WsEvent>,
) {
    loop {
        let received = tokio::select! {
            received = read.receive() => received,
            _ = core.force_close.notified() => {
                // our close went unanswered and the grace ran out
                core.set_state(SessionState::Closed);
                core.closed.notify_waiters();
                core.shutdown().await;
                let _ = tx.send(WsEvent::Close {
                    code: close_code::ABNORMAL,
                    reason: String::new(),
                    clean: false,
                });
                tracing::debug!("session force-closed after grace");
                return;
            }
        };
        match received {
            Ok(frame) => {
                let opcode = frame.header().opcode();
                match opcode {
                    OpCode::Ping => {
                        let payload = Bytes::copy_from_slice(frame.payload());
                        let _ = tx.send(WsEvent::Ping(payload.clone()));
                        if !core.sent_close.load(Ordering::Acquire) {
                            let mut writer = core.writer.lock().await;
                            if !core.sent_close.load(Ordering::Acquire) {
                                if let Err(e) = writer.send(OpCode::Pong, &payload).await {
                                    drop(writer);
                                    finish_with_error(&core, &tx, e).await;
                                    return;
                                }
                            }
                        }
                    }
                    OpCode::Pong => {
                        core.pending_ping.lock().take();
                        let _ = tx.send(WsEvent::Pong(Bytes::copy_from_slice(
                            frame.payload(),
                        )));
                    }
                    OpCode::Close => {
                        core.received_close.store(true, Ordering::Release);
                        let code = frame.close_code();
                        let reason = frame.close_reason().unwrap_or_default();
                        let _ = core.send_close(code, &reason).await;
                        core.set_state(SessionState::Closed);
                        core.closed.notify_waiters();
                        core.shutdown().await;
                        let _ = tx.send(WsEvent::Close {
                            code: code.unwrap_or(1005),
                            reason,
                            clean: true,
                        });
                        tracing::debug!(?code, "close handshake complete");
                        return;
                    }
                    OpCode::Text | OpCode::Binary => {
                        let _ = tx.send(WsEvent::Message {
                            data: Bytes::copy_from_slice(frame.payload()),
                            is_text: opcode == OpCode::Text,
                        });
                    }
                    OpCode::Continue => {
                        // merged away by the codec
                    }
                }
            }
            Err(e) => {
                finish_with_error(&core, &tx, e).await;
                return;
            }
        }
    }
}

/// failure exit shared by the pump arms
///
/// protocol and payload errors answer with the matching close code,
/// local-only failures never put a close frame on the wire
async fn finish_with_error(
    core: &Arc<SessionCore>,
    tx: &mpsc::UnboundedSender<WsEvent>,
    error: WsError,
) {
    let wire_code = error.close_code();
    if let Some(code) = wire_code {
        let _ = core.send_close(code, "").await;
    }
    let quiet_eof = matches!(error, WsError::TransportClosed)
        && (core.sent_close.load(Ordering::Acquire)
            || core.received_close.load(Ordering::Acquire));
    let report_code = wire_code.unwrap_or(close_code::ABNORMAL);
    if !quiet_eof {
        tracing::debug!(%error, report_code, "session failed");
        let _ = tx.send(WsEvent::Error(error));
    }
    core.set_state(SessionState::Closed);
    core.closed.notify_waiters();
    core.shutdown().await;
    let _ = tx.send(WsEvent::Close {
        code: report_code,
        reason: String::new(),
        clean: false,
    });
}

async fn keepalive(core: Arc<SessionCore>, interval: Duration, pong_timeout: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        if core.state() != SessionState::Open {
            return;
        }
        {
            let mut writer = core.writer.lock().await;
            if core.sent_close.load(Ordering::Acquire) {
                return;
            }
            if writer.send(OpCode::Ping, b"").await.is_err() {
                return;
            }
        }
        core.pending_ping
            .lock()
            .replace((Bytes::new(), tokio::time::Instant::now()));
        tokio::time::sleep(pong_timeout.min(interval)).await;
        if core.pending_ping.lock().is_some() && core.state() == SessionState::Open {
            tracing::debug!("keepalive pong missing, failing session");
            if core.role == Role::Server {
                let _ = core.send_close(close_code::INTERNAL_ERROR, "keepalive timeout").await;
            }
            core.shutdown().await;
            return;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn pair(
        server_config: SessionConfig,
        client_config: SessionConfig,
    ) -> (WsSession, WsSession) {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let server = WsSession::spawn(server_io, BytesMut::new(), server_config);
        let client = WsSession::spawn(client_io, BytesMut::new(), client_config);
        (server, client)
    }

    async fn expect_open(session: &mut WsSession) {
        match session.next_event().await {
            Some(WsEvent::Open) => {}
            other => panic!("expected Open, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn echo_text_roundtrip() {
        let (mut server, mut client) =
            pair(SessionConfig::server(), SessionConfig::client()).await;
        expect_open(&mut server).await;
        expect_open(&mut client).await;

        client.send_text("Hello").await.unwrap();
        match server.next_event().await {
            Some(WsEvent::Message { data, is_text }) => {
                assert!(is_text);
                assert_eq!(&data[..], b"Hello");
                server.send_text("Hello").await.unwrap();
            }
            other => panic!("expected message, got {other:?}"),
        }
        match client.next_event().await {
            Some(WsEvent::Message { data, is_text }) => {
                assert!(is_text);
                assert_eq!(&data[..], b"Hello");
            }
            other => panic!("expected echo, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_is_answered_with_same_payload() {
        let (mut server, mut client) =
            pair(SessionConfig::server(), SessionConfig::client()).await;
        expect_open(&mut server).await;
        expect_open(&mut client).await;

        server.send_ping(&[1u8, 2, 3]).await.unwrap();
        match client.next_event().await {
            Some(WsEvent::Ping(payload)) => assert_eq!(&payload[..], &[1, 2, 3]),
            other => panic!("expected ping, got {other:?}"),
        }
        match server.next_event().await {
            Some(WsEvent::Pong(payload)) => assert_eq!(&payload[..], &[1, 2, 3]),
            other => panic!("expected pong, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_handshake_is_clean_on_both_sides() {
        let (mut server, mut client) =
            pair(SessionConfig::server(), SessionConfig::client()).await;
        expect_open(&mut server).await;
        expect_open(&mut client).await;

        client.close(1000, "bye").await.unwrap();
        match server.next_event().await {
            Some(WsEvent::Close {
                code,
                reason,
                clean,
            }) => {
                assert_eq!(code, 1000);
                assert_eq!(reason, "bye");
                assert!(clean);
            }
            other => panic!("expected close, got {other:?}"),
        }
        match client.next_event().await {
            Some(WsEvent::Close { code, clean, .. }) => {
                assert_eq!(code, 1000);
                assert!(clean);
            }
            other => panic!("expected close echo, got {other:?}"),
        }
        assert_eq!(server.state(), SessionState::Closed);
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn sends_refused_after_local_close() {
        let (_server, mut client) =
            pair(SessionConfig::server(), SessionConfig::client()).await;
        expect_open(&mut client).await;

        client.close(1001, "going away").await.unwrap();
        let err = client.send_text("late").await.unwrap_err();
        assert!(matches!(err, WsError::InvalidConnState(_)));
        // a second close is a silent no-op, not a second frame
        client.close(1000, "again").await.unwrap();
    }

    #[tokio::test]
    async fn unanswered_close_forces_shutdown_after_grace() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let mut config = SessionConfig::client();
        config.close_grace = Duration::from_millis(100);
        let mut session = WsSession::spawn(client_io, BytesMut::new(), config);
        expect_open(&mut session).await;

        // the peer end stays open but never reads and never echoes
        session.close(1000, "bye").await.unwrap();
        let (code, clean) = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match session.next_event().await {
                    Some(WsEvent::Close { code, clean, .. }) => break (code, clean),
                    Some(_) => continue,
                    None => panic!("event stream ended without a close event"),
                }
            }
        })
        .await
        .expect("grace timer never fired");
        assert_eq!(code, 1006);
        assert!(!clean);
        assert_eq!(session.state(), SessionState::Closed);
        drop(server_io);
    }

    #[tokio::test]
    async fn forbidden_close_codes_rejected_locally() {
        let (_server, client) =
            pair(SessionConfig::server(), SessionConfig::client()).await;
        for code in [1004u16, 1005, 1006, 1015, 999, 5000] {
            let err = client.close(code, "").await.unwrap_err();
            assert!(
                matches!(
                    err,
                    WsError::Protocol {
                        error: ProtocolError::InvalidCloseCode(_),
                        ..
                    }
                ),
                "{code}"
            );
        }
    }
}
