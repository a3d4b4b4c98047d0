// The engine: owns the peer identity, the listener, the torrent registry
// and the global limits. One Session per process is the intended shape.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, Instrument};

use torq_core::magnet::Magnet;
use torq_core::metainfo::Metainfo;
use torq_core::peer_id::generate_peer_id;
use torq_core::{InfoHash, PeerId};
use torq_mse::{MseMode, MseStream};
use torq_tracker::UdpTrackerClient;

use crate::bans::BanList;
use crate::limits::{BandwidthTracker, Limits, LimitsConfig};
use crate::peer_connection::PeerConnectionOptions;
use crate::read_buf::ReadBuf;
use crate::torrent::{ManagedTorrent, TorrentOptions, TorrentShared};
use crate::type_aliases::PeerHandle;

/// The wire prefix of a plaintext BitTorrent handshake; anything else on
/// the listen port is treated as an MSE key exchange.
const BT_PSTR_LEN: u8 = 19;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    pub output_dir: PathBuf,
    /// None disables the listener (outgoing only); Some(0) binds an
    /// ephemeral port.
    pub listen_port: Option<u16>,
    pub mse_mode: MseMode,
    pub limits: LimitsConfig,
    #[serde(skip)]
    pub connection: PeerConnectionOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            listen_port: Some(0),
            mse_mode: MseMode::default(),
            limits: LimitsConfig::default(),
            connection: PeerConnectionOptions::default(),
        }
    }
}

/// What to add: a .torrent file or a magnet link.
pub enum AddTorrent<'a> {
    TorrentFileBytes(&'a [u8]),
    Magnet(Magnet),
}

impl<'a> AddTorrent<'a> {
    pub fn from_url(url: &str) -> anyhow::Result<AddTorrent<'static>> {
        Ok(AddTorrent::Magnet(Magnet::parse(url)?))
    }
}

#[derive(Default)]
pub struct AddTorrentOptions {
    /// Register only; the torrent stays stopped until `start()`.
    pub paused: bool,
    pub torrent: TorrentOptions,
    /// Extra peers to seed the swarm with (tests, known peers).
    pub initial_peers: Vec<PeerHandle>,
}

pub struct Session {
    pub peer_id: PeerId,
    shared: Arc<TorrentShared>,
    torrents: DashMap<InfoHash, Arc<ManagedTorrent>>,
    cancel: CancellationToken,
    listen_addr: Option<SocketAddr>,
}

impl Session {
    pub async fn new(opts: SessionOptions) -> anyhow::Result<Arc<Self>> {
        let peer_id = generate_peer_id();
        let cancel = CancellationToken::new();

        let listener = match opts.listen_port {
            Some(port) => {
                let listener = TcpListener::bind(("0.0.0.0", port))
                    .await
                    .with_context(|| format!("error binding listen port {port}"))?;
                Some(listener)
            }
            None => None,
        };
        let listen_addr = listener.as_ref().and_then(|l| l.local_addr().ok());

        let shared = Arc::new(TorrentShared {
            peer_id,
            output_dir: opts.output_dir.clone(),
            mse_mode: opts.mse_mode,
            global_limits: Arc::new(Limits::new(opts.limits)),
            global_bandwidth: Arc::new(BandwidthTracker::default()),
            bans: Arc::new(BanList::default()),
            announce_port: listen_addr.map(|a| a.port()).unwrap_or(6881),
            http_client: reqwest::Client::new(),
            udp_tracker: UdpTrackerClient::new(),
            connection_options: opts.connection,
        });

        let session = Arc::new(Session {
            peer_id,
            shared,
            torrents: DashMap::new(),
            cancel: cancel.clone(),
            listen_addr,
        });

        if let Some(listener) = listener {
            info!(addr = %listen_addr.unwrap(), "listening for peers");
            let this = session.clone();
            tokio::spawn(
                this.task_listener(listener)
                    .instrument(debug_span!("listener")),
            );
        }

        // Global once-a-second bookkeeping (speed samples).
        {
            let bandwidth = session.shared.global_bandwidth.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = interval.tick() => bandwidth.tick(),
                    }
                }
            });
        }

        Ok(session)
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub fn get_torrent(&self, info_hash: &InfoHash) -> Option<Arc<ManagedTorrent>> {
        self.torrents.get(info_hash).map(|e| e.value().clone())
    }

    pub fn torrents(&self) -> Vec<Arc<ManagedTorrent>> {
        self.torrents.iter().map(|e| e.value().clone()).collect()
    }

    pub fn global_stats(&self) -> (u64, u64) {
        (
            self.shared.global_bandwidth.downloaded(),
            self.shared.global_bandwidth.uploaded(),
        )
    }

    pub fn set_limits(&self, limits: LimitsConfig) {
        self.shared.global_limits.set(limits);
    }

    pub async fn add_torrent(
        self: &Arc<Self>,
        add: AddTorrent<'_>,
        opts: AddTorrentOptions,
    ) -> anyhow::Result<Arc<ManagedTorrent>> {
        let (info_hash, meta, trackers, mut peer_hints) = match add {
            AddTorrent::TorrentFileBytes(bytes) => {
                let meta = Metainfo::parse(bytes).context("error parsing torrent file")?;
                (
                    meta.info_hash,
                    Some(meta.clone()),
                    meta.trackers.clone(),
                    Vec::new(),
                )
            }
            AddTorrent::Magnet(magnet) => {
                // Magnet trackers have no tier structure; each URL gets its
                // own tier.
                let trackers = magnet
                    .trackers
                    .iter()
                    .map(|t| vec![t.clone()])
                    .collect();
                (magnet.info_hash, None, trackers, magnet.peer_hints)
            }
        };

        if let Some(existing) = self.get_torrent(&info_hash) {
            debug!(%info_hash, "torrent already registered");
            return Ok(existing);
        }

        peer_hints.extend(opts.initial_peers);
        let torrent = ManagedTorrent::new(
            info_hash,
            meta,
            trackers,
            peer_hints,
            opts.torrent,
            self.shared.clone(),
            self.cancel.child_token(),
        );
        self.torrents.insert(info_hash, torrent.clone());
        if !opts.paused {
            torrent.start();
        }
        Ok(torrent)
    }

    /// Unregister a torrent. With `with_data`, its files are deleted too.
    pub async fn remove_torrent(&self, info_hash: &InfoHash, with_data: bool) -> anyhow::Result<()> {
        let (_, torrent) = self
            .torrents
            .remove(info_hash)
            .with_context(|| format!("torrent {info_hash} is not registered"))?;
        torrent.stop().await;
        if with_data {
            torrent.delete_data().await?;
        }
        Ok(())
    }

    /// Drop all in-memory state for the torrent and recheck from disk.
    pub async fn reset_torrent(&self, info_hash: &InfoHash) -> anyhow::Result<()> {
        let torrent = self
            .get_torrent(info_hash)
            .with_context(|| format!("torrent {info_hash} is not registered"))?;
        torrent.stop().await;
        torrent.start();
        Ok(())
    }

    /// Stop everything: torrents, listener, background tasks.
    pub async fn stop(&self) {
        self.cancel.cancel();
        for torrent in self.torrents() {
            torrent.stop().await;
        }
    }

    async fn task_listener(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (socket, addr) = tokio::select! {
                _ = self.cancel.cancelled() => return,
                r = listener.accept() => match r {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("accept error: {e:#}");
                        continue;
                    }
                },
            };
            let this = self.clone();
            tokio::spawn(
                async move {
                    if let Err(e) = this.handle_incoming(socket, addr).await {
                        debug!("incoming connection dropped: {e:#}");
                    }
                }
                .instrument(debug_span!("incoming", %addr)),
            );
        }
    }

    /// Demultiplex a fresh inbound stream: 0x13 means plaintext
    /// BitTorrent, anything else is (possibly) an MSE key exchange.
    async fn handle_incoming(
        self: &Arc<Self>,
        mut socket: TcpStream,
        addr: SocketAddr,
    ) -> anyhow::Result<()> {
        if self.shared.bans.is_banned(addr.ip()) {
            bail!("peer is banned");
        }
        socket.set_nodelay(true).ok();

        let handshake_timeout = self.shared.connection_options.handshake_timeout;
        let mut first = [0u8; 1];
        tokio::time::timeout(handshake_timeout, socket.read_exact(&mut first))
            .await
            .context("timeout reading first byte")??;

        let (stream, mut read_buf) = if first[0] == BT_PSTR_LEN {
            if self.shared.mse_mode == MseMode::Required {
                bail!("plaintext connection refused, encryption is required");
            }
            (MseStream::plain(socket), ReadBuf::with_prefix(&first))
        } else {
            if self.shared.mse_mode == MseMode::Disabled {
                bail!("non-BitTorrent bytes and encryption is disabled");
            }
            let known: Vec<InfoHash> = self.torrents.iter().map(|e| *e.key()).collect();
            let outcome = torq_mse::respond(socket, &first, known, self.shared.mse_mode)
                .await
                .context("mse responder failed")?;
            debug!(info_hash = %outcome.info_hash, "mse responder ok");
            (
                outcome.stream,
                ReadBuf::with_prefix(&outcome.initial_data),
            )
        };

        let mut stream = stream;
        let handshake = read_buf
            .read_handshake(&mut stream, handshake_timeout)
            .await
            .context("error reading inbound handshake")?;

        let torrent = self
            .get_torrent(&handshake.info_hash)
            .with_context(|| format!("no torrent with hash {}", handshake.info_hash))?;
        torrent.accept_incoming(stream, read_buf, handshake, addr)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
