use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::errors::{ProtocolError, WsError};
use crate::frame::{close_code, parse_opcode, Header, OpCode, OwnedFrame};
use crate::payload::MessageAssembler;

use super::{apply_mask, FrameConfig, Role, Split, Utf8Checker};

/// read side state of the frame codec
///
/// tracks the fragmentation state machine and owns the reassembly
/// buffer, so a split codec can move it independently of the writer
pub struct FrameReadState {
    config: FrameConfig,
    read_buf: BytesMut,
    fragmented: bool,
    fragmented_type: OpCode,
    fragmented_rsv1: bool,
    assembler: MessageAssembler,
    utf8: Utf8Checker,
}

impl FrameReadState {
    /// fresh state for a config
    pub fn new(config: FrameConfig) -> Self {
        Self {
            assembler: MessageAssembler::new(config.spill_size, config.max_message_size),
            config,
            read_buf: BytesMut::with_capacity(8 * 1024),
            fragmented: false,
            fragmented_type: OpCode::Binary,
            fragmented_rsv1: false,
            utf8: Utf8Checker::default(),
        }
    }

    /// seed the read buffer with bytes that arrived with the handshake
    pub fn with_remain(config: FrameConfig, remain: BytesMut) -> Self {
        let mut state = Self::new(config);
        state.read_buf = remain;
        state
    }

    /// behavior config this state runs with
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    /// true while a fragmented message is being reassembled
    pub fn is_fragmented(&self) -> bool {
        self.fragmented
    }

    async fn fill_to<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
        size: usize,
    ) -> Result<(), WsError> {
        if self.read_buf.len() < size {
            self.read_buf.reserve(size - self.read_buf.len());
        }
        while self.read_buf.len() < size {
            let count = stream.read_buf(&mut self.read_buf).await?;
            if count == 0 {
                return Err(WsError::TransportClosed);
            }
        }
        Ok(())
    }

    fn check_leading_bits(&self, leading: u8) -> Result<(), WsError> {
        let rsv = leading & 0b01110000;
        let reject = if self.config.check_rsv {
            rsv != 0
        } else {
            // rsv1 was negotiated away by an extension, rsv2/rsv3 were not
            leading & 0b00110000 != 0
        };
        if reject {
            return Err(WsError::protocol(ProtocolError::InvalidLeadingBits(
                leading >> 4,
            )));
        }
        Ok(())
    }

    /// read one frame, validate it against the negotiated role and the
    /// control frame constraints, and unmask the payload
    pub async fn receive_frame<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
    ) -> Result<OwnedFrame, WsError> {
        self.fill_to(stream, 2).await?;
        self.check_leading_bits(self.read_buf[0])?;
        let opcode = parse_opcode(self.read_buf[0])
            .map_err(|code| WsError::protocol(ProtocolError::InvalidOpcode(code)))?;
        let fin = self.read_buf[0] & 0b1000_0000 != 0;
        let masked = self.read_buf[1] & 0b1000_0000 != 0;
        match (self.config.role, masked) {
            (Role::Server, false) => {
                return Err(WsError::protocol(ProtocolError::UnmaskedFrameFromClient))
            }
            (Role::Client, true) => {
                return Err(WsError::protocol(ProtocolError::MaskedFrameFromServer))
            }
            _ => {}
        }
        let leading_len = self.read_buf[1] & 0b01111111;
        let len_extra = match leading_len {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        self.fill_to(stream, 2 + len_extra).await?;
        let payload_len = match len_extra {
            0 => leading_len as u64,
            2 => {
                let mut arr = [0u8; 2];
                arr.copy_from_slice(&self.read_buf[2..4]);
                let len = u16::from_be_bytes(arr) as u64;
                if len <= 125 {
                    return Err(WsError::protocol(ProtocolError::NotMinimalLengthEncoding));
                }
                len
            }
            _ => {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&self.read_buf[2..10]);
                let len = u64::from_be_bytes(arr);
                if len <= 65535 {
                    return Err(WsError::protocol(ProtocolError::NotMinimalLengthEncoding));
                }
                if len > i64::MAX as u64 {
                    return Err(WsError::protocol(ProtocolError::PayloadLengthOutOfRange(
                        len,
                    )));
                }
                len
            }
        };
        if opcode.is_control() {
            if !fin {
                return Err(WsError::protocol(ProtocolError::FragmentedControlFrame));
            }
            if payload_len > 125 {
                return Err(WsError::protocol(ProtocolError::ControlFrameTooBig(
                    payload_len as usize,
                )));
            }
        }
        if payload_len as usize > self.config.max_message_size {
            return Err(WsError::MessageTooBig {
                limit: self.config.max_message_size,
            });
        }
        let header_len = 2 + len_extra + if masked { 4 } else { 0 };
        let total = header_len + payload_len as usize;
        self.fill_to(stream, total).await?;

        let mut whole = self.read_buf.split_to(total);
        let payload = whole.split_off(header_len);
        let mut frame = OwnedFrame::with_raw(Header::raw(whole), payload);
        frame.unmask();
        tracing::trace!(
            opcode = ?opcode,
            fin,
            payload_len,
            "frame received"
        );
        if opcode == OpCode::Close {
            self.check_close_payload(&frame)?;
        }
        Ok(frame)
    }

    fn check_close_payload(&self, frame: &OwnedFrame) -> Result<(), WsError> {
        let payload = frame.payload();
        if payload.len() == 1 {
            return Err(WsError::protocol(ProtocolError::InvalidCloseFramePayload));
        }
        if payload.len() >= 2 {
            let mut arr = [0u8; 2];
            arr.copy_from_slice(&payload[..2]);
            let code = u16::from_be_bytes(arr);
            if !close_code::is_allowed(code) {
                return Err(WsError::protocol(ProtocolError::InvalidCloseCode(code)));
            }
            if std::str::from_utf8(&payload[2..]).is_err() {
                return Err(WsError::protocol(ProtocolError::InvalidUtf8));
            }
        }
        Ok(())
    }

    fn should_validate_text(&self, rsv1: bool) -> bool {
        // compressed text is validated after inflate by the deflate layer
        self.config.validate_utf8.should_check() && !rsv1
    }

    /// read frames until a complete message or a control frame is
    /// available
    ///
    /// control frames arriving between fragments are surfaced
    /// immediately without disturbing the reassembly state
    pub async fn receive<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
    ) -> Result<OwnedFrame, WsError> {
        loop {
            let frame = self.receive_frame(stream).await?;
            let header = frame.header();
            let opcode = header.opcode();
            match opcode {
                OpCode::Close | OpCode::Ping | OpCode::Pong => return Ok(frame),
                OpCode::Text | OpCode::Binary => {
                    if self.fragmented {
                        return Err(WsError::protocol(
                            ProtocolError::NotContinueFrameAfterFragmented,
                        ));
                    }
                    if header.fin() {
                        if opcode == OpCode::Text
                            && self.should_validate_text(header.rsv1())
                            && std::str::from_utf8(frame.payload()).is_err()
                        {
                            return Err(WsError::protocol(ProtocolError::InvalidUtf8));
                        }
                        return Ok(frame);
                    }
                    if !self.config.merge_frame {
                        return Ok(frame);
                    }
                    self.fragmented = true;
                    self.fragmented_type = opcode;
                    self.fragmented_rsv1 = header.rsv1();
                    self.push_fragment(&frame)?;
                }
                OpCode::Continue => {
                    if !self.fragmented {
                        return Err(WsError::protocol(
                            ProtocolError::MissInitialFragmentedFrame,
                        ));
                    }
                    if !self.config.merge_frame {
                        return Ok(frame);
                    }
                    let fin = frame.header().fin();
                    self.push_fragment(&frame)?;
                    if fin {
                        return self.complete_message();
                    }
                }
            }
        }
    }

    fn push_fragment(&mut self, frame: &OwnedFrame) -> Result<(), WsError> {
        if self.fragmented_type == OpCode::Text && self.should_validate_text(self.fragmented_rsv1)
        {
            if self.utf8.push(frame.payload()).is_err() {
                self.fail_reassembly();
                return Err(WsError::protocol(ProtocolError::InvalidUtf8));
            }
        }
        if let Err(e) = self.assembler.push(frame.payload()) {
            self.fail_reassembly();
            return Err(e);
        }
        Ok(())
    }

    fn complete_message(&mut self) -> Result<OwnedFrame, WsError> {
        self.fragmented = false;
        if self.fragmented_type == OpCode::Text
            && self.should_validate_text(self.fragmented_rsv1)
            && self.utf8.finish().is_err()
        {
            self.assembler.reset();
            return Err(WsError::protocol(ProtocolError::InvalidUtf8));
        }
        let payload = self.assembler.take()?;
        let header = Header::build(
            true,
            self.fragmented_rsv1,
            None,
            self.fragmented_type,
            payload.len() as u64,
        );
        Ok(OwnedFrame::with_raw(header, payload))
    }

    fn fail_reassembly(&mut self) {
        self.fragmented = false;
        self.assembler.reset();
        let _ = self.utf8.finish();
    }
}

/// write side state of the frame codec
pub struct FrameWriteState {
    config: FrameConfig,
    buf: BytesMut,
}

impl FrameWriteState {
    /// fresh state for a config
    pub fn new(config: FrameConfig) -> Self {
        Self {
            config,
            buf: BytesMut::with_capacity(1024),
        }
    }

    /// behavior config this state runs with
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    fn mask_key(&self) -> Option<[u8; 4]> {
        if self.config.mask_send_frame {
            Some(rand::random())
        } else {
            None
        }
    }

    fn queue_one(&mut self, fin: bool, rsv1: bool, code: OpCode, payload: &[u8]) {
        let mask = self.mask_key();
        let header = Header::build(fin, rsv1, mask, code, payload.len() as u64);
        self.buf.extend_from_slice(header.as_slice());
        let start = self.buf.len();
        self.buf.extend_from_slice(payload);
        if let Some(mask) = mask {
            apply_mask(&mut self.buf[start..], mask);
        }
    }

    async fn flush_to<S: AsyncWrite + Unpin>(&mut self, stream: &mut S) -> Result<(), WsError> {
        while !self.buf.is_empty() {
            let written = stream.write_buf(&mut self.buf).await?;
            if written == 0 {
                return Err(WsError::TransportClosed);
            }
        }
        stream.flush().await?;
        Ok(())
    }

    /// send one message, fragmenting above `auto_fragment_size`
    ///
    /// the first frame carries the message opcode (and rsv1 for a
    /// compressed message), the rest are continuations, the last one
    /// has fin set
    pub async fn send<S: AsyncWrite + Unpin>(
        &mut self,
        stream: &mut S,
        code: OpCode,
        payload: &[u8],
    ) -> Result<(), WsError> {
        self.send_with_rsv1(stream, code, payload, false).await
    }

    pub(crate) async fn send_with_rsv1<S: AsyncWrite + Unpin>(
        &mut self,
        stream: &mut S,
        code: OpCode,
        payload: &[u8],
        rsv1: bool,
    ) -> Result<(), WsError> {
        let chunk = self.config.auto_fragment_size;
        if chunk > 0 && payload.len() > chunk && code.is_data() && code != OpCode::Continue {
            let parts: Vec<&[u8]> = payload.chunks(chunk).collect();
            let last = parts.len() - 1;
            for (idx, part) in parts.into_iter().enumerate() {
                let opcode = if idx == 0 { code } else { OpCode::Continue };
                self.queue_one(idx == last, rsv1 && idx == 0, opcode, part);
            }
        } else {
            self.queue_one(true, rsv1, code, payload);
        }
        self.flush_to(stream).await
    }

    /// send a close frame; an empty reason with no code makes an empty
    /// payload
    pub async fn send_close<S: AsyncWrite + Unpin>(
        &mut self,
        stream: &mut S,
        code: impl Into<Option<u16>>,
        reason: &[u8],
    ) -> Result<(), WsError> {
        let mut payload = Vec::with_capacity(2 + reason.len());
        if let Some(code) = code.into() {
            payload.extend_from_slice(&code.to_be_bytes());
            payload.extend_from_slice(&reason[..reason.len().min(123)]);
        }
        self.queue_one(true, false, OpCode::Close, &payload);
        self.flush_to(stream).await
    }

    /// send a constructed frame verbatim, re-masking to match the role
    pub async fn send_owned_frame<S: AsyncWrite + Unpin>(
        &mut self,
        stream: &mut S,
        mut frame: OwnedFrame,
    ) -> Result<(), WsError> {
        frame.unmask();
        if let Some(mask) = self.mask_key() {
            frame.mask(mask);
        }
        self.buf.extend_from_slice(frame.header().as_slice());
        self.buf.extend_from_slice(frame.payload());
        self.flush_to(stream).await
    }
}

/// frame codec that owns its transport
pub struct AsyncFrameCodec<S> {
    stream: S,
    read_state: FrameReadState,
    write_state: FrameWriteState,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncFrameCodec<S> {
    /// construct with the default (client) config
    pub fn new(stream: S) -> Self {
        Self::new_with(stream, FrameConfig::default(), BytesMut::new())
    }

    /// construct with config and bytes left over from the handshake
    pub fn new_with(stream: S, config: FrameConfig, remain: BytesMut) -> Self {
        Self {
            stream,
            read_state: FrameReadState::with_remain(config.clone(), remain),
            write_state: FrameWriteState::new(config),
        }
    }

    /// get mutable underlying stream
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// behavior config this codec runs with
    pub fn config(&self) -> &FrameConfig {
        self.read_state.config()
    }

    /// receive the next complete message or control frame
    pub async fn receive(&mut self) -> Result<OwnedFrame, WsError> {
        self.read_state.receive(&mut self.stream).await
    }

    pub(crate) async fn send_with_rsv1(
        &mut self,
        code: OpCode,
        payload: &[u8],
        rsv1: bool,
    ) -> Result<(), WsError> {
        self.write_state
            .send_with_rsv1(&mut self.stream, code, payload, rsv1)
            .await
    }

    /// send one message
    pub async fn send(&mut self, code: OpCode, payload: &[u8]) -> Result<(), WsError> {
        self.write_state.send(&mut self.stream, code, payload).await
    }

    /// send a close frame
    pub async fn send_close(
        &mut self,
        code: impl Into<Option<u16>>,
        reason: &[u8],
    ) -> Result<(), WsError> {
        self.write_state
            .send_close(&mut self.stream, code, reason)
            .await
    }

    /// send a constructed frame
    pub async fn send_owned_frame(&mut self, frame: OwnedFrame) -> Result<(), WsError> {
        self.write_state
            .send_owned_frame(&mut self.stream, frame)
            .await
    }

    /// consume the codec, returning its parts
    pub fn into_parts(self) -> (S, FrameReadState, FrameWriteState) {
        (self.stream, self.read_state, self.write_state)
    }
}

/// read half of a split frame codec
pub struct AsyncFrameRead<R> {
    stream: R,
    state: FrameReadState,
}

impl<R: AsyncRead + Unpin> AsyncFrameRead<R> {
    /// pair a read half with its state
    pub fn new(stream: R, state: FrameReadState) -> Self {
        Self { stream, state }
    }

    /// behavior config this half runs with
    pub fn config(&self) -> &FrameConfig {
        self.state.config()
    }

    /// receive the next complete message or control frame
    pub async fn receive(&mut self) -> Result<OwnedFrame, WsError> {
        self.state.receive(&mut self.stream).await
    }
}

/// write half of a split frame codec
pub struct AsyncFrameWrite<W> {
    stream: W,
    state: FrameWriteState,
}

impl<W: AsyncWrite + Unpin> AsyncFrameWrite<W> {
    /// pair a write half with its state
    pub fn new(stream: W, state: FrameWriteState) -> Self {
        Self { stream, state }
    }

    /// send one message
    pub async fn send(&mut self, code: OpCode, payload: &[u8]) -> Result<(), WsError> {
        self.state.send(&mut self.stream, code, payload).await
    }

    pub(crate) async fn send_with_rsv1(
        &mut self,
        code: OpCode,
        payload: &[u8],
        rsv1: bool,
    ) -> Result<(), WsError> {
        self.state
            .send_with_rsv1(&mut self.stream, code, payload, rsv1)
            .await
    }

    /// send a close frame
    pub async fn send_close(
        &mut self,
        code: impl Into<Option<u16>>,
        reason: &[u8],
    ) -> Result<(), WsError> {
        self.state.send_close(&mut self.stream, code, reason).await
    }

    /// send a constructed frame
    pub async fn send_owned_frame(&mut self, frame: OwnedFrame) -> Result<(), WsError> {
        self.state.send_owned_frame(&mut self.stream, frame).await
    }

    /// shut the transport down
    pub async fn shutdown(&mut self) -> Result<(), WsError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Split for AsyncFrameCodec<S> {
    type R = AsyncFrameRead<ReadHalf<S>>;
    type W = AsyncFrameWrite<WriteHalf<S>>;

    fn split(self) -> (Self::R, Self::W) {
        let (read_io, write_io) = tokio::io::split(self.stream);
        (
            AsyncFrameRead::new(read_io, self.read_state),
            AsyncFrameWrite::new(write_io, self.write_state),
        )
    }
}
