mod deflate;
mod frame;

pub use deflate::*;
pub use frame::*;

/// which side of the connection a codec is driving
///
/// a server must receive masked frames and send unmasked ones,
/// a client the reverse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// accepted side
    Server,
    /// connecting side
    Client,
}

/// policy for utf-8 validation of text messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidateUtf8Policy {
    /// skip validation
    Off,
    /// fail the connection as soon as an invalid sequence shows up
    FastFail,
}

impl ValidateUtf8Policy {
    /// should validate
    pub fn should_check(&self) -> bool {
        matches!(self, Self::FastFail)
    }
}

/// frame codec behavior config
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// side this codec runs on, drives masking rules
    pub role: Role,
    /// reject frames with any reserved bit set; disabled when an
    /// extension negotiated rsv1, rsv2/rsv3 stay rejected
    pub check_rsv: bool,
    /// mask outgoing frames with a fresh random key each
    pub mask_send_frame: bool,
    /// reassemble fragmented messages before returning them
    pub merge_frame: bool,
    /// split outgoing messages above this size, 0 disables
    pub auto_fragment_size: usize,
    /// refuse messages above this size with close code 1009
    pub max_message_size: usize,
    /// reassembly spills to a temp file beyond this size
    pub spill_size: usize,
    /// utf-8 handling for text messages
    pub validate_utf8: ValidateUtf8Policy,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self::client()
    }
}

impl FrameConfig {
    /// config for the accepted side, outgoing frames unmasked
    pub fn server() -> Self {
        Self {
            role: Role::Server,
            check_rsv: true,
            mask_send_frame: false,
            merge_frame: true,
            auto_fragment_size: 0,
            max_message_size: 64 << 20,
            spill_size: 1 << 20,
            validate_utf8: ValidateUtf8Policy::FastFail,
        }
    }

    /// config for the connecting side, outgoing frames masked
    pub fn client() -> Self {
        Self {
            role: Role::Client,
            mask_send_frame: true,
            ..Self::server()
        }
    }
}

/// xor the payload with the mask key byte by byte
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// xor the payload with the mask key a word at a time,
/// falling back to the byte loop for the unaligned tail
#[inline]
pub fn apply_mask_fast32(buf: &mut [u8], mask: [u8; 4]) {
    let (prefix, words, suffix) = unsafe { buf.align_to_mut::<u32>() };
    apply_mask_shifted(prefix, mask, 0);
    let offset = prefix.len() & 3;
    let rotated = [
        mask[offset],
        mask[(offset + 1) & 3],
        mask[(offset + 2) & 3],
        mask[(offset + 3) & 3],
    ];
    let word = u32::from_ne_bytes(rotated);
    for w in words.iter_mut() {
        *w ^= word;
    }
    apply_mask_shifted(suffix, mask, (prefix.len() + words.len() * 4) & 3);
}

#[inline]
fn apply_mask_shifted(buf: &mut [u8], mask: [u8; 4], offset: usize) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[(i + offset) & 3];
    }
}

/// split something into two owned halves
pub trait Split {
    /// read half type
    type R;
    /// write half type
    type W;
    /// consume and return parts
    fn split(self) -> (Self::R, Self::W);
}

impl Split for tokio::net::TcpStream {
    type R = tokio::net::tcp::OwnedReadHalf;
    type W = tokio::net::tcp::OwnedWriteHalf;

    fn split(self) -> (Self::R, Self::W) {
        self.into_split()
    }
}

/// incremental utf-8 validation across message fragments
///
/// at most three bytes of an incomplete scalar are carried between
/// chunks, so arbitrarily large fragments are validated without copying
#[derive(Debug, Default)]
pub(crate) struct Utf8Checker {
    pending: Vec<u8>,
}

impl Utf8Checker {
    /// validate the next chunk; Err means the stream can never
    /// become valid utf-8
    pub fn push(&mut self, data: &[u8]) -> Result<(), ()> {
        let mut rest = data;
        if !self.pending.is_empty() {
            let need = 4 - self.pending.len();
            let take = need.min(data.len());
            let mut buf = std::mem::take(&mut self.pending);
            buf.extend_from_slice(&data[..take]);
            match std::str::from_utf8(&buf) {
                Ok(_) => {
                    rest = &data[take..];
                }
                Err(e) => {
                    if e.error_len().is_some() {
                        return Err(());
                    }
                    if take < need {
                        // chunk exhausted, still waiting for the scalar tail
                        self.pending = buf;
                        return Ok(());
                    }
                    // first scalar completed somewhere inside buf, resume
                    // validation in the original chunk past its end
                    let consumed_from_data = e.valid_up_to() + take - buf.len();
                    debug_assert!(e.valid_up_to() + take >= buf.len());
                    rest = &data[consumed_from_data..];
                }
            }
        }
        match std::str::from_utf8(rest) {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.error_len().is_some() {
                    return Err(());
                }
                self.pending.clear();
                self.pending.extend_from_slice(&rest[e.valid_up_to()..]);
                Ok(())
            }
        }
    }

    /// the message ended; a dangling partial scalar is invalid
    pub fn finish(&mut self) -> Result<(), ()> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            self.pending.clear();
            Err(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mask_roundtrip() {
        let mask = [0xa1, 0x5c, 0x03, 0xff];
        for len in [0usize, 1, 3, 4, 5, 17, 64, 1027] {
            let data: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let mut slow = data.clone();
            apply_mask(&mut slow, mask);
            let mut fast = data.clone();
            apply_mask_fast32(&mut fast, mask);
            assert_eq!(slow, fast, "len {len}");
            apply_mask_fast32(&mut fast, mask);
            assert_eq!(fast, data, "len {len}");
        }
    }

    #[test]
    fn utf8_checker_whole() {
        let mut checker = Utf8Checker::default();
        assert!(checker.push("hello, 世界".as_bytes()).is_ok());
        assert!(checker.finish().is_ok());
    }

    #[test]
    fn utf8_checker_split_scalar() {
        // é = 0xC3 0xA9 split across fragments
        let mut checker = Utf8Checker::default();
        assert!(checker.push(&[b'a', 0xC3]).is_ok());
        assert!(checker.push(&[0xA9, b'b']).is_ok());
        assert!(checker.finish().is_ok());
    }

    #[test]
    fn utf8_checker_split_four_byte_scalar() {
        // 😀 = F0 9F 98 80, one byte per fragment
        let mut checker = Utf8Checker::default();
        for b in [0xF0u8, 0x9F, 0x98] {
            assert!(checker.push(&[b]).is_ok());
        }
        assert!(checker.push(&[0x80, b'!']).is_ok());
        assert!(checker.finish().is_ok());
    }

    #[test]
    fn utf8_checker_invalid() {
        let mut checker = Utf8Checker::default();
        assert!(checker.push(&[0xC3, 0x28]).is_err());
    }

    #[test]
    fn utf8_checker_dangling_tail() {
        let mut checker = Utf8Checker::default();
        assert!(checker.push(&[b'x', 0xE2, 0x82]).is_ok());
        assert!(checker.finish().is_err());
    }

    #[test]
    fn utf8_checker_pending_then_long_rest() {
        let mut checker = Utf8Checker::default();
        assert!(checker.push(&[0xC3]).is_ok());
        let mut chunk = vec![0xA9u8];
        chunk.extend_from_slice("plain ascii tail that keeps going".as_bytes());
        assert!(checker.push(&chunk).is_ok());
        assert!(checker.finish().is_ok());
    }
}
