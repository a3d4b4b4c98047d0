use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::rc4::Rc4;

// Encrypted-but-unsent bytes are capped; past this poll_write exerts
// backpressure instead of buffering more.
const WRITE_BUF_HIGH_WATER: usize = 128 * 1024;

/// A byte stream with optional symmetric RC4 applied on both directions.
///
/// With no ciphers this is a transparent pass-through, so the peer loop
/// works with one stream type whether or not MSE was negotiated.
#[derive(Debug)]
pub struct MseStream<S> {
    inner: S,
    read_cipher: Option<Rc4>,
    write_cipher: Option<Rc4>,
    /// Plaintext left over from the handshake, served before socket reads.
    pending: BytesMut,
    /// Ciphertext accepted by poll_write but not yet written through.
    write_buf: BytesMut,
}

impl<S> MseStream<S> {
    pub fn plain(inner: S) -> Self {
        Self::new(inner, None, None, BytesMut::new())
    }

    pub(crate) fn new(
        inner: S,
        read_cipher: Option<Rc4>,
        write_cipher: Option<Rc4>,
        pending: BytesMut,
    ) -> Self {
        Self {
            inner,
            read_cipher,
            write_cipher,
            pending,
            write_buf: BytesMut::new(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.read_cipher.is_some()
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>
    where
        S: AsyncWrite + Unpin,
    {
        while !self.write_buf.is_empty() {
            let n = match Pin::new(&mut self.inner).poll_write(cx, &self.write_buf) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MseStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            let n = this.pending.len().min(buf.remaining());
            buf.put_slice(&this.pending[..n]);
            this.pending.advance(n);
            return Poll::Ready(Ok(()));
        }
        let filled_before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if let Some(rc4) = &mut this.read_cipher {
                    rc4.apply(&mut buf.filled_mut()[filled_before..]);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MseStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        // Drain what we already hold; the inner stream registers the waker
        // if it cannot take more.
        match this.poll_drain(cx) {
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
            Poll::Pending => {
                if this.write_buf.len() >= WRITE_BUF_HIGH_WATER {
                    return Poll::Pending;
                }
            }
        }
        let start = this.write_buf.len();
        this.write_buf.extend_from_slice(buf);
        if let Some(rc4) = &mut this.write_cipher {
            rc4.apply(&mut this.write_buf[start..]);
        }
        // Opportunistic flush; buffered bytes are owed to the inner stream
        // by poll_flush either way.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_plain_passthrough() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = MseStream::plain(a);
        let mut right = MseStream::plain(b);
        left.write_all(b"hello").await.unwrap();
        left.flush().await.unwrap();
        let mut out = [0u8; 5];
        right.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello");
    }

    #[tokio::test]
    async fn test_encrypted_pair() {
        let key = b"shared secret";
        let (a, b) = tokio::io::duplex(1024);
        let mut left = MseStream::new(
            a,
            Some(Rc4::new_dropped(key)),
            Some(Rc4::new_dropped(key)),
            BytesMut::new(),
        );
        let mut right = MseStream::new(
            b,
            Some(Rc4::new_dropped(key)),
            Some(Rc4::new_dropped(key)),
            BytesMut::new(),
        );
        let payload = vec![0x5au8; 10_000];
        left.write_all(&payload).await.unwrap();
        left.flush().await.unwrap();
        let mut out = vec![0u8; payload.len()];
        right.read_exact(&mut out).await.unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn test_pending_served_first() {
        let (a, _b) = tokio::io::duplex(16);
        let mut s = MseStream::new(a, None, None, BytesMut::from(&b"leftover"[..]));
        let mut out = [0u8; 8];
        s.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"leftover");
    }
}
