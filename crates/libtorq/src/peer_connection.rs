// One task pair per peer: a reader dispatching parsed messages into the
// torrent, and a writer draining a request channel. The torrent talks to
// the writer through `WriterRequest`s; it never touches the socket.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::Bytes;
use parking_lot::RwLock;
use peer_protocol::extended::{ExtendedHandshake, ExtendedMessage};
use peer_protocol::{Handshake, Message, Piece, Request};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;
use tracing::{debug, trace};

use torq_core::{InfoHash, PeerId};
use torq_mse::{MseMode, MseStream};

use crate::read_buf::ReadBuf;

#[derive(Debug)]
pub enum WriterRequest {
    Message(Message),
    /// Read the requested block from storage and send it as a PIECE.
    SendBlock(Request),
    Disconnect,
}

pub type PeerTx = UnboundedSender<WriterRequest>;
pub type PeerRx = UnboundedReceiver<WriterRequest>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PeerConnectionOptions {
    pub connect_timeout: Duration,
    /// Peers silent for this long are dropped. Keep-alives reset it.
    pub read_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub handshake_timeout: Duration,
}

impl Default for PeerConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(150),
            keep_alive_interval: Duration::from_secs(120),
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

/// What the torrent implements to drive a peer.
pub trait PeerConnectionHandler: Send + Sync {
    /// Called with the remote handshake before any messages flow. Errors
    /// close the connection.
    fn on_handshake(&self, handshake: &Handshake) -> anyhow::Result<()>;
    fn on_extended_handshake(&self, eh: &ExtendedHandshake) -> anyhow::Result<()>;
    fn on_message(
        &self,
        msg: Message,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
    /// Messages sent right after the handshakes: bitfield/have_all/
    /// have_none and our extended handshake.
    fn initial_messages(&self) -> Vec<Message>;
    /// Upload path: fetch the block, or None if it was cancelled in the
    /// meantime. Does its own rate limiting.
    fn retrieve_block(
        &self,
        req: &Request,
    ) -> impl std::future::Future<Output = anyhow::Result<Option<Bytes>>> + Send;
    fn on_sent_block(&self, req: &Request);
    /// Filter for the torrent-wide HAVE broadcast.
    fn should_send_have(&self, piece: u32) -> bool;
}

pub(crate) async fn with_timeout<T, E>(
    what: &'static str,
    t: Duration,
    fut: impl std::future::Future<Output = Result<T, E>>,
) -> anyhow::Result<T>
where
    E: Into<anyhow::Error>,
{
    match timeout(t, fut).await {
        Ok(v) => v.map_err(Into::into),
        Err(_) => bail!("timeout at {t:?} while {what}"),
    }
}

pub struct PeerConnection<H> {
    pub addr: SocketAddr,
    info_hash: InfoHash,
    peer_id: PeerId,
    handler: H,
    options: PeerConnectionOptions,
}

impl<H: PeerConnectionHandler> PeerConnection<H> {
    pub fn new(
        addr: SocketAddr,
        info_hash: InfoHash,
        peer_id: PeerId,
        handler: H,
        options: PeerConnectionOptions,
    ) -> Self {
        Self {
            addr,
            info_hash,
            peer_id,
            handler,
            options,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Dial the peer, optionally negotiate MSE, exchange handshakes, then
    /// run the message loops until disconnect or error.
    pub async fn manage_outgoing(
        &self,
        mse_mode: MseMode,
        rx: PeerRx,
        have_rx: broadcast::Receiver<u32>,
    ) -> anyhow::Result<()> {
        let our_handshake = Handshake::new(self.info_hash, self.peer_id);

        let (stream, mut read_buf, handshake_sent) = if mse_mode.initiate_encrypted() {
            match self.connect_encrypted(mse_mode, &our_handshake).await {
                Ok(ok) => ok,
                Err(e) if mse_mode == MseMode::Prefer => {
                    // Nothing plaintext was consumed on that socket; retry
                    // in the clear on a fresh one.
                    debug!("encrypted connect failed ({e:#}), retrying plaintext");
                    (self.connect_plain().await?, ReadBuf::new(), false)
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            (self.connect_plain().await?, ReadBuf::new(), false)
        };

        let mut stream = stream;
        if !handshake_sent {
            with_timeout(
                "writing handshake",
                self.options.handshake_timeout,
                stream.write_all(&our_handshake.serialize()),
            )
            .await?;
        }
        let remote = read_buf
            .read_handshake(&mut stream, self.options.handshake_timeout)
            .await
            .context("error reading handshake")?;
        self.check_remote_handshake(&remote)?;
        self.handler.on_handshake(&remote)?;

        self.manage(stream, read_buf, remote, rx, have_rx).await
    }

    /// Take over an accepted connection whose handshake the session
    /// already read (possibly through the MSE responder). Sends our
    /// handshake in reply.
    pub async fn manage_incoming(
        &self,
        mut stream: MseStream<TcpStream>,
        read_buf: ReadBuf,
        remote: Handshake,
        rx: PeerRx,
        have_rx: broadcast::Receiver<u32>,
    ) -> anyhow::Result<()> {
        self.check_remote_handshake(&remote)?;
        let our_handshake = Handshake::new(self.info_hash, self.peer_id);
        with_timeout(
            "writing handshake",
            self.options.handshake_timeout,
            stream.write_all(&our_handshake.serialize()),
        )
        .await?;
        self.handler.on_handshake(&remote)?;
        self.manage(stream, read_buf, remote, rx, have_rx).await
    }

    fn check_remote_handshake(&self, remote: &Handshake) -> anyhow::Result<()> {
        if remote.info_hash != self.info_hash {
            bail!("handshake for wrong torrent {}", remote.info_hash);
        }
        if remote.peer_id == self.peer_id {
            bail!("connected to ourselves");
        }
        Ok(())
    }

    async fn connect_plain(&self) -> anyhow::Result<MseStream<TcpStream>> {
        let stream = with_timeout(
            "connecting",
            self.options.connect_timeout,
            TcpStream::connect(self.addr),
        )
        .await?;
        stream.set_nodelay(true).ok();
        Ok(MseStream::plain(stream))
    }

    async fn connect_encrypted(
        &self,
        mse_mode: MseMode,
        our_handshake: &Handshake,
    ) -> anyhow::Result<(MseStream<TcpStream>, ReadBuf, bool)> {
        let stream = with_timeout(
            "connecting",
            self.options.connect_timeout,
            TcpStream::connect(self.addr),
        )
        .await?;
        stream.set_nodelay(true).ok();
        // Our handshake rides inside the encrypted envelope, saving a
        // round-trip.
        let outcome =
            torq_mse::initiate(stream, self.info_hash, mse_mode, &our_handshake.serialize())
                .await?;
        trace!(encrypted = outcome.stream.is_encrypted(), "mse negotiated");
        Ok((
            outcome.stream,
            ReadBuf::with_prefix(&outcome.initial_data),
            true,
        ))
    }

    async fn manage<S>(
        &self,
        stream: S,
        mut read_buf: ReadBuf,
        remote: Handshake,
        mut rx: PeerRx,
        mut have_rx: broadcast::Receiver<u32>,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        // The remote's ut_metadata id arrives in its extended handshake;
        // the writer needs it to address ut_metadata messages.
        let peer_ut_metadata: RwLock<Option<u8>> = RwLock::new(None);
        let peer_ut_metadata = &peer_ut_metadata;
        let supports_extended = remote.supports_extended();

        let writer = async {
            let mut write_buf: Vec<u8> = Vec::with_capacity(32 * 1024);
            for msg in self.handler.initial_messages() {
                if matches!(msg, Message::Extended(_)) && !supports_extended {
                    continue;
                }
                msg.serialize_into(&mut write_buf, None)?;
            }
            write_half.write_all(&write_buf).await?;
            write_half.flush().await?;

            loop {
                write_buf.clear();
                let req = tokio::select! {
                    h = have_rx.recv() => match h {
                        Ok(piece) => {
                            if !self.handler.should_send_have(piece) {
                                continue;
                            }
                            WriterRequest::Message(Message::Have(piece))
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {
                            WriterRequest::Disconnect
                        }
                    },
                    r = timeout(self.options.keep_alive_interval, rx.recv()) => match r {
                        Ok(Some(req)) => req,
                        Ok(None) => WriterRequest::Disconnect,
                        Err(_) => WriterRequest::Message(Message::KeepAlive),
                    },
                };

                match req {
                    WriterRequest::Message(msg) => {
                        trace!("sending {}", msg.name());
                        msg.serialize_into(&mut write_buf, *peer_ut_metadata.read())?;
                        write_half.write_all(&write_buf).await?;
                    }
                    WriterRequest::SendBlock(request) => {
                        let Some(block) = self.handler.retrieve_block(&request).await? else {
                            continue;
                        };
                        Message::Piece(Piece {
                            index: request.index,
                            begin: request.begin,
                            block,
                        })
                        .serialize_into(&mut write_buf, None)?;
                        write_half.write_all(&write_buf).await?;
                        self.handler.on_sent_block(&request);
                    }
                    WriterRequest::Disconnect => {
                        trace!("writer disconnecting");
                        let _ = write_half.shutdown().await;
                        return Ok(());
                    }
                }
                write_half.flush().await?;
            }

            #[allow(unreachable_code)]
            Ok::<_, anyhow::Error>(())
        };

        let reader = async {
            loop {
                let msg = read_buf
                    .read_message(&mut read_half, self.options.read_timeout)
                    .await?;
                trace!("received {}", msg.name());
                if let Message::Extended(ExtendedMessage::Handshake(eh)) = &msg {
                    *peer_ut_metadata.write() = eh.ut_metadata_id;
                    self.handler.on_extended_handshake(eh)?;
                    continue;
                }
                self.handler
                    .on_message(msg)
                    .await
                    .context("error handling message")?;
            }

            #[allow(unreachable_code)]
            Ok::<_, anyhow::Error>(())
        };

        tokio::select! {
            r = reader => r,
            r = writer => r,
        }
    }
}
