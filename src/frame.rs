use bytes::{BufMut, BytesMut};

use crate::codec::{apply_mask, apply_mask_fast32};

// first header byte
const FIN_BIT: u8 = 0b1000_0000;
const RSV1_BIT: u8 = 0b0100_0000;
const RSV2_BIT: u8 = 0b0010_0000;
const RSV3_BIT: u8 = 0b0001_0000;
const OPCODE_BITS: u8 = 0b0000_1111;
// second header byte
const MASK_BIT: u8 = 0b1000_0000;
const LEN_BITS: u8 = 0b0111_1111;

/// frame type carried in the low nibble of the first header byte
///
/// the reserved ranges (3-7 and 11-15) fail decoding, so they never
/// reach a constructed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// continuation of a fragmented message
    Continue,
    /// utf-8 text payload
    Text,
    /// binary payload
    Binary,
    /// connection close
    Close,
    /// ping
    Ping,
    /// pong
    Pong,
}

impl Default for OpCode {
    fn default() -> Self {
        Self::Text
    }
}

impl OpCode {
    /// get corresponding u8 value
    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0,
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10,
        }
    }

    /// check is close type frame
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close)
    }

    /// check is text/binary/continue
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Text | Self::Binary | Self::Continue)
    }

    /// check is close/ping/pong
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

#[inline]
pub(crate) fn parse_opcode(val: u8) -> Result<OpCode, u8> {
    match val & OPCODE_BITS {
        0 => Ok(OpCode::Continue),
        1 => Ok(OpCode::Text),
        2 => Ok(OpCode::Binary),
        8 => Ok(OpCode::Close),
        9 => Ok(OpCode::Ping),
        10 => Ok(OpCode::Pong),
        v => Err(v),
    }
}

/// close status codes, RFC 6455 section 7.4 plus registry rules
pub mod close_code {
    /// normal closure
    pub const NORMAL: u16 = 1000;
    /// endpoint going away
    pub const AWAY: u16 = 1001;
    /// protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// unacceptable data type
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// payload inconsistent with message type
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// policy violation
    pub const POLICY_VIOLATION: u16 = 1008;
    /// message too big to process
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    /// client required an extension the server refused
    pub const MANDATORY_EXTENSION: u16 = 1010;
    /// server hit an unexpected condition
    pub const INTERNAL_ERROR: u16 = 1011;
    /// service is restarting
    pub const SERVICE_RESTART: u16 = 1012;
    /// try again later
    pub const TRY_AGAIN_LATER: u16 = 1013;
    /// abnormal closure, local reporting only
    pub const ABNORMAL: u16 = 1006;

    /// whether a code may appear in a Close frame on the wire
    ///
    /// 1004..=1006 and 1015 are reserved, 1016..=2999 are unassigned
    /// protocol range, below 1000 and >= 5000 are out of range
    pub fn is_allowed(code: u16) -> bool {
        !(code < 1000
            || (1004..=1006).contains(&code)
            || (1015..=2999).contains(&code)
            || code >= 5000)
    }

    /// whether this endpoint may actively emit the code
    pub fn is_sendable(code: u16) -> bool {
        is_allowed(code) && !matches!(code, 1004 | 1005 | 1006 | 1015)
    }
}

/// serialized frame header, 2 to 14 bytes of wire layout
///
/// the buffer always holds a complete header: the two fixed bytes, the
/// extended length when the 7-bit field is 126 or 127, and the mask
/// key when the mask bit is set
#[derive(Debug, Clone)]
pub struct Header(pub(crate) BytesMut);

impl Header {
    /// assemble a header from its parts, using the shortest length
    /// form the payload allows
    pub fn build(
        fin: bool,
        rsv1: bool,
        mask: Option<[u8; 4]>,
        opcode: OpCode,
        payload_len: u64,
    ) -> Self {
        let mut raw = BytesMut::with_capacity(14);
        let mut first = opcode.as_u8();
        if fin {
            first |= FIN_BIT;
        }
        if rsv1 {
            first |= RSV1_BIT;
        }
        raw.put_u8(first);
        let mask_flag = if mask.is_some() { MASK_BIT } else { 0 };
        match payload_len {
            0..=125 => raw.put_u8(mask_flag | payload_len as u8),
            126..=65535 => {
                raw.put_u8(mask_flag | 126);
                raw.put_u16(payload_len as u16);
            }
            _ => {
                raw.put_u8(mask_flag | 127);
                raw.put_u64(payload_len);
            }
        }
        if let Some(key) = mask {
            raw.put_slice(&key);
        }
        Self(raw)
    }

    pub(crate) fn raw(data: BytesMut) -> Self {
        Self(data)
    }

    /// wire bytes of this header
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// fin flag
    pub fn fin(&self) -> bool {
        self.0[0] & FIN_BIT != 0
    }

    /// flip the fin flag, used when hand-building fragments
    pub fn set_fin(&mut self, fin: bool) {
        if fin {
            self.0[0] |= FIN_BIT;
        } else {
            self.0[0] &= !FIN_BIT;
        }
    }

    /// rsv1 flag (compression envelope)
    pub fn rsv1(&self) -> bool {
        self.0[0] & RSV1_BIT != 0
    }

    /// either reserved flag no extension of ours ever negotiates
    pub fn rsv2_or_rsv3(&self) -> bool {
        self.0[0] & (RSV2_BIT | RSV3_BIT) != 0
    }

    /// frame type; headers only exist for validated or constructed
    /// frames, so reserved nibbles cannot occur here
    pub fn opcode(&self) -> OpCode {
        parse_opcode(self.0[0]).unwrap_or(OpCode::Binary)
    }

    /// mask flag
    pub fn masked(&self) -> bool {
        self.0[1] & MASK_BIT != 0
    }

    /// bytes the length field occupies after the two fixed bytes
    fn length_extent(&self) -> usize {
        match self.0[1] & LEN_BITS {
            126 => 2,
            127 => 8,
            _ => 0,
        }
    }

    /// announced payload length
    pub fn payload_len(&self) -> u64 {
        match self.0[1] & LEN_BITS {
            126 => u16::from_be_bytes([self.0[2], self.0[3]]) as u64,
            127 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.0[2..10]);
                u64::from_be_bytes(raw)
            }
            short => short as u64,
        }
    }

    /// mask key, present iff the mask flag is set
    pub fn masking_key(&self) -> Option<[u8; 4]> {
        if !self.masked() {
            return None;
        }
        let at = 2 + self.length_extent();
        let mut key = [0u8; 4];
        key.copy_from_slice(&self.0[at..at + 4]);
        Some(key)
    }

    fn strip_mask(&mut self) {
        self.0[1] &= !MASK_BIT;
        let keep = self.0.len() - 4;
        self.0.truncate(keep);
    }

    fn attach_mask(&mut self, key: [u8; 4]) {
        self.0[1] |= MASK_BIT;
        self.0.put_slice(&key);
    }
}

/// a complete frame: header plus payload, both owned
///
/// the payload buffer is stored exactly as it would sit on the wire,
/// so a masked frame holds masked bytes until [`unmask`](Self::unmask)
#[derive(Debug, Clone)]
pub struct OwnedFrame {
    header: Header,
    payload: BytesMut,
}

impl OwnedFrame {
    /// single unfragmented frame; a mask key masks the stored payload
    pub fn new(code: OpCode, mask: impl Into<Option<[u8; 4]>>, data: &[u8]) -> Self {
        let mask = mask.into();
        let header = Header::build(true, false, mask, code, data.len() as u64);
        let mut payload = BytesMut::from(data);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }
        Self { header, payload }
    }

    /// pair a parsed header with its payload without rechecking either
    pub fn with_raw(header: Header, payload: BytesMut) -> Self {
        Self { header, payload }
    }

    /// close frame; the reason rides behind the two code bytes and is
    /// dropped entirely when no code is given
    pub fn close(mask: impl Into<Option<[u8; 4]>>, code: Option<u16>, reason: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        if let Some(code) = code {
            payload.put_u16(code);
            payload.put_slice(&reason[..reason.len().min(123)]);
        }
        Self::new(OpCode::Close, mask, &payload)
    }

    /// undo masking, returning the key that was removed
    pub fn unmask(&mut self) -> Option<[u8; 4]> {
        let key = self.header.masking_key()?;
        apply_mask_fast32(&mut self.payload, key);
        self.header.strip_mask();
        Some(key)
    }

    /// mask with a fresh key, replacing any previous one
    pub fn mask(&mut self, key: [u8; 4]) {
        self.unmask();
        apply_mask_fast32(&mut self.payload, key);
        self.header.attach_mask(key);
    }

    /// close code carried by a close frame payload
    pub fn close_code(&self) -> Option<u16> {
        if self.header.opcode() != OpCode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    /// close reason carried after the code, lossy decoded
    pub fn close_reason(&self) -> Option<String> {
        if self.header.opcode() != OpCode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(String::from_utf8_lossy(&self.payload[2..]).to_string())
    }

    /// frame header
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// mutable frame header
    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    /// payload as stored (masked frames hold masked bytes)
    pub fn payload(&self) -> &BytesMut {
        &self.payload
    }

    /// split into header and payload, unmasking on the way out
    pub fn parts(mut self) -> (Header, BytesMut) {
        self.unmask();
        (self.header, self.payload)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shortest_length_form_chosen() {
        for (len, header_len) in [(0u64, 2usize), (125, 2), (126, 4), (65535, 4), (65536, 10)] {
            let header = Header::build(true, false, None, OpCode::Binary, len);
            assert_eq!(header.as_slice().len(), header_len, "payload len {len}");
            assert_eq!(header.payload_len(), len);
        }
    }

    #[test]
    fn header_bits_roundtrip() {
        let header = Header::build(true, true, Some([1, 2, 3, 4]), OpCode::Text, 300);
        assert!(header.fin());
        assert!(header.rsv1());
        assert!(!header.rsv2_or_rsv3());
        assert!(header.masked());
        assert_eq!(header.masking_key(), Some([1, 2, 3, 4]));
        assert_eq!(header.payload_len(), 300);
        assert_eq!(header.opcode(), OpCode::Text);

        let mut header = Header::build(false, false, None, OpCode::Continue, 5);
        assert!(!header.fin());
        header.set_fin(true);
        assert!(header.fin());
        assert_eq!(header.opcode(), OpCode::Continue);
    }

    #[test]
    fn mask_unmask_roundtrip() {
        let data = b"hello masked frame";
        let mut frame = OwnedFrame::new(OpCode::Binary, [9, 8, 7, 6], data);
        assert_ne!(frame.payload()[..], data[..]);
        assert_eq!(frame.unmask(), Some([9, 8, 7, 6]));
        assert_eq!(frame.payload()[..], data[..]);
        assert!(!frame.header().masked());

        frame.mask([5, 5, 5, 5]);
        assert!(frame.header().masked());
        let (header, payload) = frame.parts();
        assert!(!header.masked());
        assert_eq!(&payload[..], data);
    }

    #[test]
    fn close_frame_payload() {
        let frame = OwnedFrame::close(None, Some(1000), b"bye");
        assert_eq!(frame.close_code(), Some(1000));
        assert_eq!(frame.close_reason().unwrap(), "bye");

        let empty = OwnedFrame::close(None, None, b"ignored without a code");
        assert!(empty.payload().is_empty());
        assert_eq!(empty.close_code(), None);
    }

    #[test]
    fn close_code_policy() {
        for code in [1000, 1001, 1002, 1003, 1007, 1011, 3000, 4999] {
            assert!(close_code::is_allowed(code), "{code}");
        }
        for code in [0, 999, 1004, 1005, 1006, 1015, 1016, 2999, 5000] {
            assert!(!close_code::is_allowed(code), "{code}");
        }
        assert!(!close_code::is_sendable(1006));
        assert!(close_code::is_sendable(1012));
    }

    #[test]
    fn reserved_opcodes_rejected() {
        for raw in [3u8, 4, 5, 6, 7, 11, 12, 13, 14, 15] {
            assert!(parse_opcode(raw).is_err(), "{raw}");
        }
    }
}
