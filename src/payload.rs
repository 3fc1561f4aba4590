use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use bytes::BytesMut;

use crate::errors::WsError;

/// reassembly buffer for fragmented messages
///
/// fragments accumulate in memory until `spill_size`, after which the
/// whole accumulator moves to an anonymous temp file so a large message
/// cannot pin its full size in memory twice; `max_size` bounds the
/// total and maps to close code 1009
#[derive(Debug)]
pub(crate) struct MessageAssembler {
    mem: BytesMut,
    spill: Option<File>,
    len: usize,
    spill_size: usize,
    max_size: usize,
}

impl MessageAssembler {
    /// fresh accumulator with its spill and total limits
    pub fn new(spill_size: usize, max_size: usize) -> Self {
        Self {
            mem: BytesMut::new(),
            spill: None,
            len: 0,
            spill_size,
            max_size,
        }
    }

    /// total bytes accumulated so far
    pub fn len(&self) -> usize {
        self.len
    }

    /// true when nothing has accumulated
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// append one fragment
    pub fn push(&mut self, data: &[u8]) -> Result<(), WsError> {
        if self.len + data.len() > self.max_size {
            return Err(WsError::MessageTooBig {
                limit: self.max_size,
            });
        }
        self.len += data.len();
        match self.spill.as_mut() {
            Some(file) => {
                file.write_all(data)?;
            }
            None => {
                self.mem.extend_from_slice(data);
                if self.mem.len() > self.spill_size {
                    let mut file = tempfile::tempfile()?;
                    file.write_all(&self.mem)?;
                    self.mem = BytesMut::new();
                    self.spill = Some(file);
                }
            }
        }
        Ok(())
    }

    /// take the reassembled message, resetting the accumulator
    pub fn take(&mut self) -> Result<BytesMut, WsError> {
        let len = self.len;
        self.len = 0;
        match self.spill.take() {
            Some(mut file) => {
                file.seek(SeekFrom::Start(0))?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf)?;
                Ok(BytesMut::from(&buf[..]))
            }
            None => Ok(std::mem::take(&mut self.mem)),
        }
    }

    /// drop any partial state, used when the connection fails mid-message
    pub fn reset(&mut self) {
        self.mem.clear();
        self.spill = None;
        self.len = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn small_message_stays_in_memory() {
        let mut asm = MessageAssembler::new(1 << 20, 64 << 20);
        asm.push(b"hello ").unwrap();
        asm.push(b"world").unwrap();
        assert!(asm.spill.is_none());
        assert_eq!(&asm.take().unwrap()[..], b"hello world");
        assert!(asm.is_empty());
    }

    #[test]
    fn large_message_spills_and_reads_back() {
        let mut asm = MessageAssembler::new(64, 64 << 20);
        let chunk = vec![0xabu8; 48];
        asm.push(&chunk).unwrap();
        assert!(asm.spill.is_none());
        asm.push(&chunk).unwrap();
        assert!(asm.spill.is_some());
        asm.push(b"tail").unwrap();
        let out = asm.take().unwrap();
        assert_eq!(out.len(), 100);
        assert_eq!(&out[..48], &chunk[..]);
        assert_eq!(&out[96..], b"tail");
        // accumulator is reusable after take
        asm.push(b"next").unwrap();
        assert_eq!(&asm.take().unwrap()[..], b"next");
    }

    #[test]
    fn over_limit_rejected() {
        let mut asm = MessageAssembler::new(16, 32);
        asm.push(&[0u8; 30]).unwrap();
        let err = asm.push(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, WsError::MessageTooBig { limit: 32 }));
    }
}
