use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::errors::HttpError;

/// hard cap on a request head, exceeding it is a 400
pub const MAX_HEAD_SIZE: usize = 32_768;

/// buffered reader for CRLF-delimited request heads
///
/// bytes read past the blank line stay buffered and are handed to
/// whoever owns the transport next (body reader or websocket codec)
#[derive(Debug, Default)]
pub struct HeadBuffer {
    buf: BytesMut,
    scanned: usize,
}

impl HeadBuffer {
    /// empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// resume with bytes left over from a previous request
    pub fn with_leftover(leftover: BytesMut) -> Self {
        Self {
            buf: leftover,
            scanned: 0,
        }
    }

    /// true once any byte of the next request has arrived
    pub fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }

    /// read until the head terminator, returning the head including
    /// its final blank line
    pub async fn read_head<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
    ) -> Result<BytesMut, HttpError> {
        loop {
            if let Some(end) = self.find_head_end() {
                self.scanned = 0;
                return Ok(self.buf.split_to(end));
            }
            if self.buf.len() > MAX_HEAD_SIZE {
                return Err(HttpError::HeaderTooLarge);
            }
            let read = stream.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(HttpError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before head",
                )));
            }
        }
    }

    fn find_head_end(&mut self) -> Option<usize> {
        const TERM: &[u8] = b"\r\n\r\n";
        let start = self.scanned.saturating_sub(TERM.len() - 1);
        let hay = &self.buf[..];
        for i in start..hay.len().saturating_sub(TERM.len() - 1) {
            if &hay[i..i + TERM.len()] == TERM {
                return Some(i + TERM.len());
            }
        }
        self.scanned = hay.len();
        None
    }

    /// take everything buffered beyond the head
    pub fn take_leftover(&mut self) -> BytesMut {
        self.scanned = 0;
        self.buf.split()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn head_split_from_body() {
        let (mut w, mut r) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(
            &mut w,
            b"GET / HTTP/1.1\r\nHost: a\r\n\r\nBODYBYTES",
        )
        .await
        .unwrap();
        let mut head_buf = HeadBuffer::new();
        let head = head_buf.read_head(&mut r).await.unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert!(head.starts_with(b"GET / HTTP/1.1"));
        assert_eq!(&head_buf.take_leftover()[..], b"BODYBYTES");
    }

    #[tokio::test]
    async fn head_arriving_in_pieces() {
        let (mut w, mut r) = tokio::io::duplex(4096);
        let writer = tokio::spawn(async move {
            for piece in [&b"GET / HT"[..], b"TP/1.1\r\nHost:", b" a\r", b"\n\r\n"] {
                tokio::io::AsyncWriteExt::write_all(&mut w, piece)
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
            w
        });
        let mut head_buf = HeadBuffer::new();
        let head = head_buf.read_head(&mut r).await.unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn oversized_head_rejected() {
        let (mut w, mut r) = tokio::io::duplex(128 * 1024);
        let mut big = Vec::from(&b"GET / HTTP/1.1\r\n"[..]);
        for i in 0..4000 {
            big.extend_from_slice(format!("X-Fill-{i}: padding-padding\r\n").as_bytes());
        }
        tokio::io::AsyncWriteExt::write_all(&mut w, &big)
            .await
            .unwrap();
        let mut head_buf = HeadBuffer::new();
        let err = head_buf.read_head(&mut r).await.unwrap_err();
        assert!(matches!(err, HttpError::HeaderTooLarge));
    }
}
