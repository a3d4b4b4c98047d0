use std::time::Duration;

use anyhow::{bail, Context};
use bytes::{Buf, BytesMut};
use peer_protocol::{Handshake, Message, MessageError, HANDSHAKE_LEN, MAX_MSG_LEN};
use tokio::io::{AsyncRead, AsyncReadExt};

// Big enough that one full PIECE frame plus the next preamble usually fits
// without reallocating.
const READ_CHUNK: usize = 64 * 1024;

/// Accumulates socket bytes and yields whole protocol frames. Block
/// payloads come out as refcounted slices of the frame, so a received
/// block is never copied on its way to the piece assembler.
pub struct ReadBuf {
    buf: BytesMut,
}

impl Default for ReadBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadBuf {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Carry over bytes that arrived before this buffer took over the
    /// stream (MSE leftover, listener peeks).
    pub fn with_prefix(prefix: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(READ_CHUNK.max(prefix.len()));
        buf.extend_from_slice(prefix);
        Self { buf }
    }

    async fn fill<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        self.buf.reserve(READ_CHUNK);
        let n = tokio::time::timeout(timeout, stream.read_buf(&mut self.buf))
            .await
            .context("timeout reading from peer")?
            .context("error reading from peer")?;
        if n == 0 {
            bail!("peer closed the connection");
        }
        Ok(())
    }

    /// Must be the first read on an incoming/outgoing stream.
    pub async fn read_handshake<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
        timeout: Duration,
    ) -> anyhow::Result<Handshake> {
        while self.buf.len() < HANDSHAKE_LEN {
            self.fill(stream, timeout).await?;
        }
        let (h, consumed) = Handshake::deserialize(&self.buf)?;
        self.buf.advance(consumed);
        Ok(h)
    }

    /// Read one message, pulling more bytes from the stream as needed.
    pub async fn read_message<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
        timeout: Duration,
    ) -> anyhow::Result<Message> {
        loop {
            if self.buf.len() >= 4 {
                let len_prefix = u32::from_be_bytes(self.buf[0..4].try_into().unwrap());
                if len_prefix > MAX_MSG_LEN {
                    bail!(MessageError::MessageTooLarge(len_prefix));
                }
                let total_len = 4 + len_prefix as usize;
                if self.buf.len() >= total_len {
                    let frame = self.buf.split_to(total_len).freeze();
                    let (msg, consumed) = Message::deserialize(&frame)?;
                    debug_assert_eq!(consumed, total_len);
                    return Ok(msg);
                }
            }
            self.fill(stream, timeout).await?;
        }
    }
}
