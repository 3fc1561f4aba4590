use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

use crate::errors::{ProtocolError, WsError};
use crate::frame::{OpCode, OwnedFrame};

use super::{
    AsyncFrameCodec, AsyncFrameRead, AsyncFrameWrite, FrameConfig, Role, Split,
    ValidateUtf8Policy,
};

const EXT_ID: &str = "permessage-deflate";

/// the trailer every flushed deflate block ends with; stripped before
/// framing and re-appended before inflating, per RFC 7692
const TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// lz77 sliding window exponent, clamped to what the extension allows
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WindowBit(u8);

impl Default for WindowBit {
    fn default() -> Self {
        Self(15)
    }
}

impl WindowBit {
    /// parse a negotiated value, valid range is [8, 15]
    pub fn new(value: u8) -> Result<Self, u8> {
        if (8..=15).contains(&value) {
            Ok(Self(value))
        } else {
            Err(value)
        }
    }

    /// clamp an out of range offer instead of rejecting it
    pub fn clamped(value: u8) -> Self {
        Self(value.clamp(8, 15))
    }

    /// raw exponent value
    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// negotiated permessage-deflate parameters
///
/// one value describes one offer (client side) or the accepted set
/// (server side)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeflateConfig {
    /// server resets its compressor after every message
    pub server_no_context_takeover: bool,
    /// client resets its compressor after every message
    pub client_no_context_takeover: bool,
    /// cap on the server compressor window
    pub server_max_window_bits: WindowBit,
    /// cap on the client compressor window
    pub client_max_window_bits: WindowBit,
}

impl DeflateConfig {
    /// parse a `Sec-WebSocket-Extensions` header value into the
    /// permessage-deflate offers it carries, in order
    ///
    /// offers with unknown parameters, repeated parameters or invalid
    /// window values are unacceptable and reported as `Err` entries so
    /// negotiation can skip them
    pub fn parse_offers(header: &str) -> Vec<Result<DeflateConfig, String>> {
        header
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .filter(|s| {
                s.split(';')
                    .next()
                    .map(|name| name.trim().eq_ignore_ascii_case(EXT_ID))
                    .unwrap_or(false)
            })
            .map(Self::parse_single)
            .collect()
    }

    fn parse_single(offer: &str) -> Result<DeflateConfig, String> {
        let mut config = DeflateConfig::default();
        let mut seen: Vec<String> = vec![];
        for param in offer.split(';').skip(1) {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            let (name, value) = match param.split_once('=') {
                Some((n, v)) => (
                    n.trim().to_ascii_lowercase(),
                    Some(v.trim().trim_matches('"')),
                ),
                None => (param.to_ascii_lowercase(), None),
            };
            if seen.contains(&name) {
                return Err(format!("duplicate parameter {name}"));
            }
            seen.push(name.clone());
            match name.as_str() {
                "server_no_context_takeover" => {
                    if value.is_some() {
                        return Err("server_no_context_takeover takes no value".into());
                    }
                    config.server_no_context_takeover = true;
                }
                "client_no_context_takeover" => {
                    if value.is_some() {
                        return Err("client_no_context_takeover takes no value".into());
                    }
                    config.client_no_context_takeover = true;
                }
                "server_max_window_bits" => {
                    let value = value.ok_or("server_max_window_bits needs a value")?;
                    let bits: u8 = value
                        .parse()
                        .map_err(|_| format!("bad window bits {value}"))?;
                    config.server_max_window_bits = WindowBit::clamped(bits);
                }
                "client_max_window_bits" => {
                    // valueless form just signals client support, the
                    // default of 15 stands
                    if let Some(value) = value {
                        let bits: u8 = value
                            .parse()
                            .map_err(|_| format!("bad window bits {value}"))?;
                        config.client_max_window_bits = WindowBit::clamped(bits);
                    }
                }
                other => return Err(format!("unknown parameter {other}")),
            }
        }
        Ok(config)
    }

    /// serialize for the response (or offer) header
    pub fn to_header_value(&self) -> String {
        let mut out = vec![EXT_ID.to_string()];
        if self.server_no_context_takeover {
            out.push("server_no_context_takeover".to_string());
        }
        if self.client_no_context_takeover {
            out.push("client_no_context_takeover".to_string());
        }
        if self.server_max_window_bits.bits() != 15 {
            out.push(format!(
                "server_max_window_bits={}",
                self.server_max_window_bits.bits()
            ));
        }
        if self.client_max_window_bits.bits() != 15 {
            out.push(format!(
                "client_max_window_bits={}",
                self.client_max_window_bits.bits()
            ));
        }
        out.join("; ")
    }

    /// pick the first acceptable offer from a header value
    pub fn negotiate(header: &str) -> Option<DeflateConfig> {
        for offer in Self::parse_offers(header) {
            match offer {
                Ok(config) => return Some(config),
                Err(reason) => {
                    tracing::debug!("skipping permessage-deflate offer: {reason}");
                }
            }
        }
        None
    }
}

/// per-message raw deflate stream
pub struct Compressor {
    inner: Compress,
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor").finish()
    }
}

impl Compressor {
    /// fast-level raw deflate stream
    pub fn new() -> Self {
        Self {
            inner: Compress::new(Compression::fast(), false),
        }
    }

    /// compress a whole message, leaving the flush trailer in place
    pub fn compress(&mut self, data: &[u8], output: &mut Vec<u8>) -> Result<(), WsError> {
        let mut consumed = 0usize;
        loop {
            if output.capacity() == output.len() {
                output.reserve((data.len() / 2).max(512));
            }
            let before_in = self.inner.total_in();
            self.inner
                .compress_vec(&data[consumed..], output, FlushCompress::Sync)
                .map_err(|e| WsError::CompressFailed(e.to_string()))?;
            consumed += (self.inner.total_in() - before_in) as usize;
            if consumed == data.len() && output.len() < output.capacity() {
                return Ok(());
            }
        }
    }

    /// drop the dictionary, used with no_context_takeover
    pub fn reset(&mut self) {
        self.inner.reset();
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

/// per-message raw inflate stream
pub struct Decompressor {
    inner: Decompress,
}

impl std::fmt::Debug for Decompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decompressor").finish()
    }
}

impl Decompressor {
    /// raw inflate stream
    pub fn new() -> Self {
        Self {
            inner: Decompress::new(false),
        }
    }

    /// inflate a whole message (trailer already re-appended)
    pub fn decompress(&mut self, data: &[u8], output: &mut Vec<u8>) -> Result<(), WsError> {
        let mut consumed = 0usize;
        loop {
            if output.capacity() == output.len() {
                output.reserve((data.len() * 2).max(4096));
            }
            let before_in = self.inner.total_in();
            self.inner
                .decompress_vec(&data[consumed..], output, FlushDecompress::Sync)
                .map_err(|e| WsError::DeCompressFailed(e.to_string()))?;
            consumed += (self.inner.total_in() - before_in) as usize;
            if consumed == data.len() && output.len() < output.capacity() {
                return Ok(());
            }
        }
    }

    /// drop the dictionary, used with no_context_takeover
    pub fn reset(&mut self) {
        self.inner.reset(false);
    }
}

impl Default for Decompressor {
    fn default() -> Self {
        Self::new()
    }
}

/// compression half of a negotiated extension, lives with the writer
#[derive(Debug)]
pub struct DeflateEncoder {
    config: DeflateConfig,
    role: Role,
    compressor: Compressor,
}

impl DeflateEncoder {
    /// encoder for the negotiated parameters on this side
    pub fn new(config: DeflateConfig, role: Role) -> Self {
        Self {
            config,
            role,
            compressor: Compressor::new(),
        }
    }

    /// whether the outgoing direction resets after each message
    fn resets(&self) -> bool {
        match self.role {
            Role::Server => self.config.server_no_context_takeover,
            Role::Client => self.config.client_no_context_takeover,
        }
    }

    /// compress one message payload, stripping the flush trailer
    pub fn encode(&mut self, payload: &[u8]) -> Result<Vec<u8>, WsError> {
        let mut compressed = Vec::with_capacity(payload.len().min(8192));
        self.compressor.compress(payload, &mut compressed)?;
        debug_assert!(compressed.ends_with(&TAIL));
        compressed.truncate(compressed.len().saturating_sub(TAIL.len()));
        if self.resets() {
            self.compressor.reset();
            tracing::trace!("reset compressor state");
        }
        Ok(compressed)
    }
}

/// decompression half of a negotiated extension, lives with the reader
#[derive(Debug)]
pub struct DeflateDecoder {
    config: DeflateConfig,
    role: Role,
    decompressor: Decompressor,
}

impl DeflateDecoder {
    /// decoder for the negotiated parameters on this side
    pub fn new(config: DeflateConfig, role: Role) -> Self {
        Self {
            config,
            role,
            decompressor: Decompressor::new(),
        }
    }

    /// whether the incoming direction resets after each message
    fn resets(&self) -> bool {
        match self.role {
            Role::Server => self.config.client_no_context_takeover,
            Role::Client => self.config.server_no_context_takeover,
        }
    }

    /// inflate one message payload, re-appending the flush trailer
    pub fn decode(&mut self, payload: &[u8]) -> Result<Vec<u8>, WsError> {
        let mut input = Vec::with_capacity(payload.len() + TAIL.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&TAIL);
        let mut output = Vec::with_capacity(payload.len() * 2);
        self.decompressor.decompress(&input, &mut output)?;
        if self.resets() {
            self.decompressor.reset();
            tracing::trace!("reset decompressor state");
        }
        Ok(output)
    }
}

fn decode_frame(
    decoder: Option<&mut DeflateDecoder>,
    validate_utf8: ValidateUtf8Policy,
    frame: OwnedFrame,
) -> Result<OwnedFrame, WsError> {
    let header = frame.header();
    let compressed = header.rsv1();
    let opcode = header.opcode();
    if compressed && opcode.is_control() {
        return Err(WsError::protocol(ProtocolError::CompressedControlFrame));
    }
    if !opcode.is_data() || !compressed {
        return Ok(frame);
    }
    let decoder = decoder.ok_or_else(|| {
        WsError::protocol(ProtocolError::CompressedFrameWithoutExtension)
    })?;
    let plain = decoder.decode(frame.payload())?;
    if opcode == OpCode::Text
        && validate_utf8.should_check()
        && std::str::from_utf8(&plain).is_err()
    {
        return Err(WsError::protocol(ProtocolError::InvalidUtf8));
    }
    Ok(OwnedFrame::new(opcode, None, &plain))
}

/// frame codec with the permessage-deflate envelope applied to data
/// messages
pub struct DeflateCodec<S> {
    frame_codec: AsyncFrameCodec<S>,
    encoder: Option<DeflateEncoder>,
    decoder: Option<DeflateDecoder>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> DeflateCodec<S> {
    /// wrap a frame codec; `config` of `None` falls back to plain
    /// frames (extension not negotiated)
    pub fn new(frame_codec: AsyncFrameCodec<S>, config: Option<DeflateConfig>) -> Self {
        let role = frame_codec.config().role;
        let (encoder, decoder) = match config {
            Some(config) => (
                Some(DeflateEncoder::new(config.clone(), role)),
                Some(DeflateDecoder::new(config, role)),
            ),
            None => (None, None),
        };
        Self {
            frame_codec,
            encoder,
            decoder,
        }
    }

    /// get mutable underlying stream
    pub fn stream_mut(&mut self) -> &mut S {
        self.frame_codec.stream_mut()
    }

    /// receive the next message or control frame, inflating as needed
    pub async fn receive(&mut self) -> Result<OwnedFrame, WsError> {
        let frame = self.frame_codec.receive().await?;
        let validate = self.frame_codec.config().validate_utf8;
        decode_frame(self.decoder.as_mut(), validate, frame)
    }

    /// send one message, compressing data frames when negotiated
    pub async fn send(&mut self, code: OpCode, payload: &[u8]) -> Result<(), WsError> {
        match (&mut self.encoder, code.is_data()) {
            (Some(encoder), true) => {
                let compressed = encoder.encode(payload)?;
                self.frame_codec
                    .send_with_rsv1(code, &compressed, true)
                    .await
            }
            _ => self.frame_codec.send(code, payload).await,
        }
    }

    /// send a close frame
    pub async fn send_close(
        &mut self,
        code: impl Into<Option<u16>>,
        reason: &[u8],
    ) -> Result<(), WsError> {
        self.frame_codec.send_close(code, reason).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Split for DeflateCodec<S> {
    type R = DeflateRead<ReadHalf<S>>;
    type W = DeflateWrite<WriteHalf<S>>;

    fn split(self) -> (Self::R, Self::W) {
        let (read, write) = self.frame_codec.split();
        (
            DeflateRead {
                inner: read,
                decoder: self.decoder,
            },
            DeflateWrite {
                inner: write,
                encoder: self.encoder,
            },
        )
    }
}

/// read half of a split deflate codec
pub struct DeflateRead<R> {
    inner: AsyncFrameRead<R>,
    decoder: Option<DeflateDecoder>,
}

impl<R: AsyncRead + Unpin> DeflateRead<R> {
    /// wrap a frame read half
    pub fn new(inner: AsyncFrameRead<R>, decoder: Option<DeflateDecoder>) -> Self {
        Self { inner, decoder }
    }

    /// receive the next message or control frame, inflating as needed
    pub async fn receive(&mut self) -> Result<OwnedFrame, WsError> {
        let frame = self.inner.receive().await?;
        let validate = self.inner.config().validate_utf8;
        decode_frame(self.decoder.as_mut(), validate, frame)
    }
}

/// write half of a split deflate codec
pub struct DeflateWrite<W> {
    inner: AsyncFrameWrite<W>,
    encoder: Option<DeflateEncoder>,
}

impl<W: AsyncWrite + Unpin> DeflateWrite<W> {
    /// wrap a frame write half
    pub fn new(inner: AsyncFrameWrite<W>, encoder: Option<DeflateEncoder>) -> Self {
        Self { inner, encoder }
    }

    /// send one message, compressing data frames when negotiated
    pub async fn send(&mut self, code: OpCode, payload: &[u8]) -> Result<(), WsError> {
        match (&mut self.encoder, code.is_data()) {
            (Some(encoder), true) => {
                let compressed = encoder.encode(payload)?;
                self.inner.send_with_rsv1(code, &compressed, true).await
            }
            _ => self.inner.send(code, payload).await,
        }
    }

    /// send a close frame
    pub async fn send_close(
        &mut self,
        code: impl Into<Option<u16>>,
        reason: &[u8],
    ) -> Result<(), WsError> {
        self.inner.send_close(code, reason).await
    }

    /// send a constructed frame without touching the envelope
    pub async fn send_owned_frame(&mut self, frame: OwnedFrame) -> Result<(), WsError> {
        self.inner.send_owned_frame(frame).await
    }

    /// shut the transport down
    pub async fn shutdown(&mut self) -> Result<(), WsError> {
        self.inner.shutdown().await
    }
}

/// frame config suited to a negotiated deflate session: rsv1 is owned
/// by the extension, utf-8 validation moves past the inflater
pub fn deflate_frame_config(mut base: FrameConfig) -> FrameConfig {
    base.check_rsv = false;
    base
}
