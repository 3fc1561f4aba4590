use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::HttpError;

/// longest accepted chunk-size line, including extensions
const MAX_SIZE_LINE: usize = 20;

/// cap on bytes a decoder will hold before the consumer drains them
const MAX_BUFFERED: usize = 32_768;

/// decoder phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// between chunks, scanning a size line
    None,
    /// inside chunk payload
    Body,
    /// final chunk and trailer consumed
    BodyFinished,
    /// zero chunk seen, consuming trailer lines
    Trailer,
}

/// byte-level decoder for RFC 7230 chunked transfer coding
///
/// feed wire bytes with [`write`](Self::write), drain decoded payload
/// with [`read`](Self::read); trailer headers are accepted and
/// discarded
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    line: String,
    line_pending: bool,
    chunk_left: usize,
    // CRLF still owed after a chunk payload
    pending_crlf: u8,
    decoded: BytesMut,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    /// decoder at the start of a body
    pub fn new() -> Self {
        Self {
            state: ChunkState::None,
            line: String::new(),
            line_pending: false,
            chunk_left: 0,
            pending_crlf: 0,
            decoded: BytesMut::new(),
        }
    }

    /// current phase
    pub fn state(&self) -> ChunkState {
        self.state
    }

    /// whether more wire bytes are needed to finish the body
    pub fn wants_more(&self) -> bool {
        self.state != ChunkState::BodyFinished
    }

    /// decoded bytes waiting to be read
    pub fn buffered(&self) -> usize {
        self.decoded.len()
    }

    /// push wire bytes through the state machine, returning how many
    /// were consumed
    ///
    /// consumption stops at the end of the body, bytes past it belong
    /// to the next request on the connection
    pub fn write(&mut self, data: &[u8]) -> Result<usize, HttpError> {
        let total = data.len();
        let mut data = data;
        while !data.is_empty() {
            match self.state {
                ChunkState::BodyFinished => break,
                ChunkState::Body => {
                    if self.pending_crlf > 0 {
                        data = self.eat_crlf(data)?;
                        continue;
                    }
                    let take = self.chunk_left.min(data.len());
                    if self.decoded.len() + take > MAX_BUFFERED {
                        return Err(HttpError::BadRequest(
                            "chunked body buffer overflow".to_string(),
                        ));
                    }
                    self.decoded.put_slice(&data[..take]);
                    self.chunk_left -= take;
                    data = &data[take..];
                    if self.chunk_left == 0 {
                        self.pending_crlf = 2;
                        self.state = ChunkState::None;
                    }
                }
                ChunkState::None => {
                    if self.pending_crlf > 0 {
                        data = self.eat_crlf(data)?;
                        continue;
                    }
                    data = self.take_line(data)?;
                    if self.line_pending {
                        continue;
                    }
                    let line = std::mem::take(&mut self.line);
                    let size = parse_size_line(&line)?;
                    if size == 0 {
                        self.state = ChunkState::Trailer;
                    } else {
                        self.chunk_left = size;
                        self.state = ChunkState::Body;
                    }
                }
                ChunkState::Trailer => {
                    data = self.take_line(data)?;
                    if self.line_pending {
                        continue;
                    }
                    let line = std::mem::take(&mut self.line);
                    if line.is_empty() {
                        self.state = ChunkState::BodyFinished;
                    }
                    // trailer headers are ignored
                }
            }
        }
        Ok(total - data.len())
    }

    /// copy decoded payload out, returning how many bytes were written
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let take = out.len().min(self.decoded.len());
        out[..take].copy_from_slice(&self.decoded.split_to(take));
        take
    }

    /// take every decoded byte at once
    pub fn read_all(&mut self) -> Bytes {
        self.decoded.split().freeze()
    }

    fn eat_crlf<'a>(&mut self, data: &'a [u8]) -> Result<&'a [u8], HttpError> {
        let mut rest = data;
        while self.pending_crlf > 0 && !rest.is_empty() {
            let expected = if self.pending_crlf == 2 { b'\r' } else { b'\n' };
            if rest[0] != expected {
                return Err(HttpError::BadRequest(
                    "missing CRLF after chunk".to_string(),
                ));
            }
            self.pending_crlf -= 1;
            rest = &rest[1..];
        }
        Ok(rest)
    }

    /// accumulate one CRLF terminated line across calls
    fn take_line<'a>(&mut self, data: &'a [u8]) -> Result<&'a [u8], HttpError> {
        self.line_pending = true;
        for (idx, &byte) in data.iter().enumerate() {
            if byte == b'\n' {
                if !self.line.ends_with('\r') {
                    return Err(HttpError::BadRequest("bare LF in chunk line".to_string()));
                }
                self.line.pop();
                self.line_pending = false;
                return Ok(&data[idx + 1..]);
            }
            self.line.push(byte as char);
            if self.state == ChunkState::None && self.line.len() > MAX_SIZE_LINE {
                return Err(HttpError::BadRequest(
                    "chunk size line too long".to_string(),
                ));
            }
        }
        Ok(&data[data.len()..])
    }
}

fn parse_size_line(line: &str) -> Result<usize, HttpError> {
    let digits = line.split(';').next().unwrap_or("").trim();
    if digits.is_empty() {
        return Err(HttpError::BadRequest("empty chunk size".to_string()));
    }
    usize::from_str_radix(digits, 16)
        .map_err(|_| HttpError::BadRequest(format!("bad chunk size `{digits}`")))
}

/// frame one write as a chunk
pub fn encode_chunk(data: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(data.len() + 16);
    out.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
    out
}

/// terminator emitted when the stream closes
pub fn encode_final_chunk() -> &'static [u8] {
    b"0\r\n\r\n"
}
