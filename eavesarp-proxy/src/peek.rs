//! An explicit buffered-reader adapter exposing `peek(n)` without
//! consuming, reused by TLS detection (DESIGN NOTES §9: "byte-peeking
//! wrapper over a stream"). Unlike a raw `MSG_PEEK` socket peek, this
//! buffers the bytes it reads and replays them to the first callers of
//! `poll_read`, so it works over any `AsyncRead` (plain or TLS-wrapped)
//! and the peeked bytes are never lost to the later bidirectional copy.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub struct PeekStream<S> {
    inner: S,
    peeked: Vec<u8>,
    replay_pos: usize,
}

impl<S: AsyncRead + Unpin> PeekStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            peeked: Vec::new(),
            replay_pos: 0,
        }
    }

    /// Reads until at least `n` bytes are buffered (or the stream ends)
    /// and returns a view of the available bytes. Does not discard
    /// anything: a subsequent `AsyncRead` still yields all buffered and
    /// future bytes, in order.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.peeked.len() < n {
            let mut chunk = vec![0u8; n - self.peeked.len()];
            let read = tokio::io::AsyncReadExt::read(&mut self.inner, &mut chunk).await?;
            if read == 0 {
                break;
            }
            self.peeked.extend_from_slice(&chunk[..read]);
        }
        Ok(&self.peeked[..self.peeked.len().min(n)])
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekStream<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.replay_pos < self.peeked.len() {
            let remaining = self.peeked.len() - self.replay_pos;
            let n = remaining.min(buf.remaining());
            let start = self.replay_pos;
            buf.put_slice(&self.peeked[start..start + n]);
            self.replay_pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn peeked_bytes_are_replayed_on_subsequent_read() {
        let data = b"\x16\x03\x03hello world".to_vec();
        let (mut writer, reader) = tokio::io::duplex(64);
        writer.write_all(&data).await.unwrap();
        drop(writer);

        let mut stream = PeekStream::new(reader);
        let head = stream.peek(3).await.unwrap().to_vec();
        assert_eq!(head, vec![0x16, 0x03, 0x03]);

        let mut all = Vec::new();
        stream.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, data);
    }
}
