// Everything about one torrent: its state machine (metadata -> checking ->
// downloading -> seeding), its peers, and the flow of blocks between them
// and storage.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use peer_protocol::extended::{ExtendedHandshake, ExtendedMessage, UtMetadata};
use peer_protocol::{Handshake, Message, Piece, Request};
use serde::Serialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{broadcast, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, warn, Instrument};

use sha1w::sha1;
use torq_core::constants::BLOCK_SIZE;
use torq_core::lengths::{BlockInfo, Lengths, ValidPieceIndex};
use torq_core::metainfo::Metainfo;
use torq_core::peer_id::try_decode_client;
use torq_core::{InfoHash, PeerId};
use torq_mse::{MseMode, MseStream};
use torq_tracker::{AnnounceStats, AnnounceStatsProvider, Announcer, TrackerStats, UdpTrackerClient};

use crate::active_pieces::{ActivePieces, BlockWrite};
use crate::bans::BanList;
use crate::choker::{Candidate, Choker, CHOKE_INTERVAL_SECS};
use crate::file_ops::FileOps;
use crate::limits::{BandwidthTracker, Limits, LimitsConfig};
use crate::metadata::{metadata_piece, MetadataDownload};
use crate::peer_connection::{
    PeerConnection, PeerConnectionHandler, PeerConnectionOptions, PeerRx, WriterRequest,
};
use crate::peers::{InflightBlock, PeerStates, PIPELINE_START};
use crate::picker::{PiecePicker, PiecePriority};
use crate::read_buf::ReadBuf;
use crate::storage::FilesystemStorage;
use crate::type_aliases::{bf_from_vec, bf_with_bits, PeerHandle, BF};

pub const DEFAULT_MAX_PEERS: usize = 50;
pub const DEFAULT_UPLOAD_SLOTS: usize = 4;
pub const DEFAULT_MAX_PIPELINE: u32 = 64;

/// Outgoing PIECE sends a single peer may have queued.
const MAX_QUEUED_UPLOADS: u32 = 8;
/// Bad pieces a peer may contribute to before it is banned.
const HASH_FAILURE_LIMIT: u32 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct TorrentOptions {
    pub max_peers: usize,
    pub upload_slots: usize,
    pub max_pipeline_depth: u32,
    pub limits: LimitsConfig,
}

impl Default for TorrentOptions {
    fn default() -> Self {
        Self {
            max_peers: DEFAULT_MAX_PEERS,
            upload_slots: DEFAULT_UPLOAD_SLOTS,
            max_pipeline_depth: DEFAULT_MAX_PIPELINE,
            limits: LimitsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    GettingMetadata,
    Checking,
    Downloading,
    Seeding,
    Error,
}

/// Session-owned context every torrent shares.
pub(crate) struct TorrentShared {
    pub peer_id: PeerId,
    pub output_dir: PathBuf,
    pub mse_mode: MseMode,
    pub global_limits: Arc<Limits>,
    pub global_bandwidth: Arc<BandwidthTracker>,
    pub bans: Arc<BanList>,
    pub announce_port: u16,
    pub http_client: reqwest::Client,
    pub udp_tracker: UdpTrackerClient,
    pub connection_options: PeerConnectionOptions,
}

/// Built once the metadata is known and the initial check has run.
struct LiveState {
    meta: Arc<Metainfo>,
    lengths: Lengths,
    storage: Arc<FilesystemStorage>,
    locked: RwLock<LiveLocked>,
}

struct LiveLocked {
    picker: PiecePicker,
    active: ActivePieces,
}

pub struct ManagedTorrent {
    pub info_hash: InfoHash,
    pub(crate) opts: TorrentOptions,
    pub(crate) shared: Arc<TorrentShared>,

    /// Cancelled when the torrent is stopped or removed; children of the
    /// session token.
    run_cancel: Mutex<Option<CancellationToken>>,
    session_cancel: CancellationToken,

    user_active: AtomicBool,
    activity: RwLock<ActivityState>,
    error_message: RwLock<Option<String>>,

    /// Known metadata; None while a magnet is still resolving.
    meta: RwLock<Option<Arc<Metainfo>>>,
    live: RwLock<Option<Arc<LiveState>>>,
    metadata_dl: Mutex<Option<MetadataDownload>>,
    trackers: Vec<Vec<String>>,
    peer_hints: Mutex<Vec<PeerHandle>>,

    peers: PeerStates,
    peer_queue_tx: Mutex<Option<UnboundedSender<PeerHandle>>>,
    peer_sem: Arc<Semaphore>,
    have_tx: broadcast::Sender<u32>,

    pub(crate) bandwidth: BandwidthTracker,
    pub(crate) limits: Limits,
    choker: Mutex<Choker>,

    announcer: Mutex<Option<Arc<Announcer>>>,
    complete: AtomicBool,
    finished_notify: Notify,
}

struct TorrentStatsForAnnounce {
    torrent: Arc<ManagedTorrent>,
}

impl AnnounceStatsProvider for TorrentStatsForAnnounce {
    fn get(&self) -> AnnounceStats {
        let (total, have) = self.torrent.byte_progress();
        AnnounceStats {
            uploaded: self.torrent.bandwidth.uploaded(),
            downloaded: self.torrent.bandwidth.downloaded(),
            left: total.saturating_sub(have),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TorrentStats {
    pub info_hash: InfoHash,
    pub name: Option<String>,
    pub activity: ActivityState,
    pub user_active: bool,
    pub error: Option<String>,
    pub total_bytes: u64,
    pub have_bytes: u64,
    pub uploaded_bytes: u64,
    pub downloaded_bytes: u64,
    pub up_bps: u64,
    pub down_bps: u64,
    pub pieces_total: u32,
    pub pieces_have: u32,
    pub peers: crate::peers::AggregatePeerStats,
    pub trackers: Vec<TrackerStats>,
}

impl ManagedTorrent {
    pub(crate) fn new(
        info_hash: InfoHash,
        meta: Option<Metainfo>,
        trackers: Vec<Vec<String>>,
        peer_hints: Vec<PeerHandle>,
        opts: TorrentOptions,
        shared: Arc<TorrentShared>,
        session_cancel: CancellationToken,
    ) -> Arc<Self> {
        let (have_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            info_hash,
            peer_sem: Arc::new(Semaphore::new(opts.max_peers)),
            limits: Limits::new(opts.limits),
            opts,
            shared,
            run_cancel: Mutex::new(None),
            session_cancel,
            user_active: AtomicBool::new(false),
            activity: RwLock::new(ActivityState::GettingMetadata),
            error_message: RwLock::new(None),
            meta: RwLock::new(meta.map(Arc::new)),
            live: RwLock::new(None),
            metadata_dl: Mutex::new(None),
            trackers,
            peer_hints: Mutex::new(peer_hints),
            peers: PeerStates::default(),
            peer_queue_tx: Mutex::new(None),
            have_tx,
            bandwidth: BandwidthTracker::default(),
            choker: Mutex::new(Choker::default()),
            announcer: Mutex::new(None),
            complete: AtomicBool::new(false),
            finished_notify: Notify::new(),
        })
    }

    // ----- lifecycle -----

    /// Start (or restart after stop/error) the torrent.
    pub fn start(self: &Arc<Self>) {
        let mut g = self.run_cancel.lock();
        if g.is_some() {
            return;
        }
        let token = self.session_cancel.child_token();
        *g = Some(token.clone());
        drop(g);

        self.user_active.store(true, Ordering::SeqCst);
        *self.error_message.write() = None;

        let this = self.clone();
        let span = debug_span!("torrent", info_hash = %self.info_hash);
        tokio::spawn(
            async move {
                let run = this.clone().run(token.clone());
                tokio::select! {
                    r = run => {
                        if let Err(e) = r {
                            warn!("torrent failed: {e:#}");
                            this.enter_error(format!("{e:#}"));
                        }
                    }
                    _ = token.cancelled() => {}
                }
            }
            .instrument(span),
        );
    }

    /// Stop all activity. State on disk is untouched; `start` resumes.
    pub async fn stop(self: &Arc<Self>) {
        let token = self.run_cancel.lock().take();
        self.user_active.store(false, Ordering::SeqCst);
        let announcer = self.announcer.lock().take();
        if let Some(token) = token {
            token.cancel();
        }
        *self.peer_queue_tx.lock() = None;
        self.peers.send_all(|| WriterRequest::Disconnect);
        if let Some(announcer) = announcer {
            announcer.announce_stopped().await;
        }
        *self.live.write() = None;
        *self.metadata_dl.lock() = None;
    }

    fn enter_error(&self, message: String) {
        *self.activity.write() = ActivityState::Error;
        *self.error_message.write() = Some(message);
        self.run_cancel.lock().take().map(|t| t.cancel());
        self.user_active.store(false, Ordering::SeqCst);
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        // Peer intake pipeline.
        let (peer_tx, peer_rx) = unbounded_channel();
        *self.peer_queue_tx.lock() = Some(peer_tx);
        tokio::spawn(
            self.clone()
                .task_peer_adder(peer_rx, cancel.clone())
                .instrument(debug_span!("peer_adder", info_hash = %self.info_hash)),
        );

        let meta = self.meta.read().clone();
        match meta {
            Some(meta) => {
                self.clone().initialize_with_meta(meta).await?;
            }
            None => {
                *self.activity.write() = ActivityState::GettingMetadata;
            }
        }

        self.start_announcer(cancel.clone());

        for addr in self.peer_hints.lock().drain(..) {
            self.add_peer(addr);
        }

        // The torrent heartbeat: request timeouts, choking, speed samples.
        let mut tick = 0u64;
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = interval.tick() => {}
            }
            tick += 1;
            self.bandwidth.tick();
            self.scan_request_timeouts();
            if tick % CHOKE_INTERVAL_SECS == 0 {
                self.run_choke_round();
            }
        }
    }

    /// Build storage, optionally re-check existing data, and go live.
    async fn initialize_with_meta(self: Arc<Self>, meta: Arc<Metainfo>) -> anyhow::Result<()> {
        if meta.total_length == 0 {
            // A zero-byte torrent is complete by definition; there is
            // nothing to transfer or store.
            *self.activity.write() = ActivityState::Seeding;
            self.complete.store(true, Ordering::SeqCst);
            self.finished_notify.notify_waiters();
            return Ok(());
        }

        let lengths = meta.lengths()?;
        let storage = Arc::new(FilesystemStorage::new(&self.shared.output_dir, &meta));
        let init = {
            let storage = storage.clone();
            tokio::task::spawn_blocking(move || storage.init())
                .await?
                .context("error initializing storage")?
        };

        let mut have = bf_with_bits(lengths.total_pieces() as usize);
        if init.any_existing {
            *self.activity.write() = ActivityState::Checking;
            for piece_index in 0..lengths.total_pieces() {
                let piece = lengths.validate_piece_index(piece_index).unwrap();
                let ok = {
                    let storage = storage.clone();
                    let meta = meta.clone();
                    tokio::task::spawn_blocking(move || {
                        FileOps::new(&meta, &lengths, storage.as_ref()).check_piece(piece)
                    })
                    .await?
                    .context("error checking piece")?
                };
                if ok {
                    have.set(piece_index as usize, true);
                }
                // Leave room for everything else going on; checking is a
                // background chore.
                if piece_index % 8 == 7 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        }

        let complete = have.count_ones() as u32 == lengths.total_pieces();
        let live = Arc::new(LiveState {
            locked: RwLock::new(LiveLocked {
                picker: PiecePicker::new(lengths, have),
                active: ActivePieces::default(),
            }),
            meta,
            lengths,
            storage,
        });
        *self.live.write() = Some(live);
        self.complete.store(complete, Ordering::SeqCst);
        *self.activity.write() = if complete {
            ActivityState::Seeding
        } else {
            ActivityState::Downloading
        };
        if complete {
            self.finished_notify.notify_waiters();
        }

        // Peers that connected during metadata/checking now get sized
        // bitfields and interest.
        self.sync_existing_peers_to_live();
        Ok(())
    }

    fn start_announcer(self: &Arc<Self>, cancel: CancellationToken) {
        if self.trackers.is_empty() {
            return;
        }
        let (announcer, mut peer_rx) = Announcer::start(
            self.info_hash,
            self.shared.peer_id,
            self.shared.announce_port,
            self.trackers.clone(),
            Box::new(TorrentStatsForAnnounce {
                torrent: self.clone(),
            }),
            self.shared.http_client.clone(),
            self.shared.udp_tracker.clone(),
            cancel.clone(),
        );
        *self.announcer.lock() = Some(announcer);
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    peer = peer_rx.recv() => match peer {
                        Some(addr) => this.add_peer(addr),
                        None => return,
                    },
                }
            }
        });
    }

    // ----- peers -----

    /// Feed a possible peer into the queue (tracker result, magnet hint,
    /// user addition).
    pub fn add_peer(&self, addr: PeerHandle) {
        if !self.user_active.load(Ordering::SeqCst) {
            return;
        }
        if self.shared.bans.is_banned(addr.ip()) {
            trace!(%addr, "ignoring banned peer");
            return;
        }
        if !self.peers.add_if_not_seen(addr) {
            return;
        }
        if let Some(tx) = self.peer_queue_tx.lock().as_ref() {
            let _ = tx.send(addr);
        }
    }

    async fn task_peer_adder(
        self: Arc<Self>,
        mut peer_rx: UnboundedReceiver<PeerHandle>,
        cancel: CancellationToken,
    ) {
        loop {
            let addr = tokio::select! {
                _ = cancel.cancelled() => return,
                addr = peer_rx.recv() => match addr {
                    Some(addr) => addr,
                    None => return,
                },
            };
            if self.is_complete() {
                // Seeding: no point dialing out; incoming leechers still
                // get served.
                self.peers.mark_not_needed(addr);
                continue;
            }
            let permit = match self.peer_sem.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let this = self.clone();
            let span = debug_span!("peer", %addr);
            tokio::spawn(
                async move {
                    let _permit = permit;
                    this.task_manage_peer_outgoing(addr).await;
                }
                .instrument(span),
            );
        }
    }

    async fn task_manage_peer_outgoing(self: Arc<Self>, addr: PeerHandle) {
        let Some(rx) = self.peers.mark_connecting(addr) else {
            return;
        };
        let handler = PeerHandler {
            torrent: self.clone(),
            addr,
        };
        let conn = PeerConnection::new(
            addr,
            self.info_hash,
            self.shared.peer_id,
            handler,
            self.shared.connection_options,
        );
        let cancel = self.run_cancel.lock().clone();
        let Some(cancel) = cancel else { return };

        let requester = self.clone().task_requester(addr);
        let manage = conn.manage_outgoing(self.shared.mse_mode, rx, self.have_tx.subscribe());
        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            r = manage => r,
            r = requester => r,
        };
        self.on_peer_finished(addr, result);
    }

    /// Called by the session with an accepted, handshake-complete stream.
    pub(crate) fn accept_incoming(
        self: &Arc<Self>,
        stream: MseStream<tokio::net::TcpStream>,
        read_buf: ReadBuf,
        handshake: Handshake,
        addr: PeerHandle,
    ) -> anyhow::Result<()> {
        if !self.user_active.load(Ordering::SeqCst) {
            bail!("torrent is stopped");
        }
        if self.shared.bans.is_banned(addr.ip()) {
            bail!("peer is banned");
        }
        let Some(rx) = self.incoming_slot(addr, &handshake) else {
            bail!("duplicate connection from {addr}");
        };
        let permit = self
            .peer_sem
            .clone()
            .try_acquire_owned()
            .context("per-torrent peer limit reached")?;

        let this = self.clone();
        let cancel = self.run_cancel.lock().clone().context("not running")?;
        let span = debug_span!("peer", %addr, incoming = true);
        tokio::spawn(
            async move {
                let _permit = permit;
                let handler = PeerHandler {
                    torrent: this.clone(),
                    addr,
                };
                let conn = PeerConnection::new(
                    addr,
                    this.info_hash,
                    this.shared.peer_id,
                    handler,
                    this.shared.connection_options,
                );
                let requester = this.clone().task_requester(addr);
                let manage =
                    conn.manage_incoming(stream, read_buf, handshake, rx, this.have_tx.subscribe());
                let result = tokio::select! {
                    _ = cancel.cancelled() => Ok(()),
                    r = manage => r,
                    r = requester => r,
                };
                this.on_peer_finished(addr, result);
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Duplicate-connection policy: a fresh inbound handshake replaces an
    /// existing connection only when the remote id wins the tiebreak.
    fn incoming_slot(&self, addr: PeerHandle, handshake: &Handshake) -> Option<PeerRx> {
        if let Some(rx) = self.peers.insert_incoming(addr) {
            return Some(rx);
        }
        if handshake.peer_id < self.shared.peer_id {
            debug!(%addr, "incoming connection wins tiebreak, replacing existing");
            self.peers.send(addr, WriterRequest::Disconnect);
            self.peers.drop_peer(addr);
            return self.peers.insert_incoming(addr);
        }
        None
    }

    fn on_peer_finished(self: &Arc<Self>, addr: PeerHandle, result: anyhow::Result<()>) {
        let was_live = {
            let live_state = self.peers.mark_dead(addr);
            match live_state {
                Some(mut live) => {
                    // Give the blocks back so others can fetch them.
                    let blocks = live.take_inflight();
                    self.release_blocks(blocks.iter().map(|b| &b.block));
                    true
                }
                None => false,
            }
        };

        match result {
            Ok(()) => {
                debug!(%addr, "peer closed cleanly");
            }
            Err(e) => {
                debug!(%addr, "peer errored: {e:#}");
                if !was_live {
                    // Garbage before a completed handshake is grounds for
                    // a ban, not a retry.
                    self.shared.bans.ban(addr.ip());
                    self.peers.drop_peer(addr);
                    return;
                }
            }
        }

        if self.is_complete() || !self.user_active.load(Ordering::SeqCst) {
            self.peers.mark_not_needed(addr);
            return;
        }

        // Retry with backoff.
        let delay = self
            .peers
            .with_peer_mut(addr, |p| p.backoff_delay())
            .unwrap_or_default();
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.peers.requeue_if_dead(addr) {
                if let Some(tx) = this.peer_queue_tx.lock().as_ref() {
                    let _ = tx.send(addr);
                }
            }
        });
    }

    fn release_blocks<'a>(&self, blocks: impl Iterator<Item = &'a BlockInfo>) {
        let live = self.live.read().clone();
        if let Some(live) = live {
            let mut g = live.locked.write();
            for block in blocks {
                g.picker.release_block(block);
            }
        }
    }

    // ----- requester -----

    /// Keeps one peer's request pipeline full. Runs alongside the
    /// connection tasks and returns only on unrecoverable state.
    async fn task_requester(self: Arc<Self>, addr: PeerHandle) -> anyhow::Result<()> {
        loop {
            let wake = match self.peers.with_live(addr, |l| l.wake.clone()) {
                Some(wake) => wake,
                None => {
                    // Not live yet (or anymore); check back when poked.
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    continue;
                }
            };

            let live = self.live.read().clone();
            let Some(live) = live else {
                // Metadata phase: nothing to request here.
                let _ = tokio::time::timeout(Duration::from_secs(1), wake.notified()).await;
                continue;
            };

            let (can_request, want) = self
                .peers
                .with_live(addr, |l| {
                    let can = l.am_interested && !l.peer_choking;
                    let want = l.pipeline_limit.saturating_sub(l.inflight.len() as u32);
                    (can, want)
                })
                .unwrap_or((false, 0));

            if !can_request || want == 0 {
                let _ = tokio::time::timeout(Duration::from_secs(1), wake.notified()).await;
                continue;
            }

            // Download ceilings: a request commits us to receiving a
            // block, so the tokens are taken before it goes out. One block
            // per loop keeps accounting exact.
            self.shared.global_limits.down.acquire(BLOCK_SIZE as u64).await;
            self.limits.down.acquire(BLOCK_SIZE as u64).await;

            let picked = {
                let (bitfield, inflight_keys) = match self.peers.with_live(addr, |l| {
                    (
                        l.bitfield.clone(),
                        l.inflight.keys().copied().collect::<HashSet<u32>>(),
                    )
                }) {
                    Some(v) => v,
                    None => continue,
                };
                let mut g = live.locked.write();
                g.picker.pick_blocks(&bitfield, 1, &inflight_keys)
            };

            if picked.is_empty() {
                // Nothing to ask this peer for right now. Stay around:
                // even at 100% the connection keeps serving uploads.
                let _ = tokio::time::timeout(Duration::from_secs(5), wake.notified()).await;
                continue;
            }

            // Record the request before it can possibly be answered; the
            // peer-table lock orders this against the reader seeing the
            // PIECE.
            let now = Instant::now();
            let sent = self
                .peers
                .with_live_mut(addr, |l| {
                    for block in &picked {
                        l.inflight.insert(
                            block.absolute_index,
                            InflightBlock {
                                block: *block,
                                requested_at: now,
                            },
                        );
                        let _ = l.tx.send(WriterRequest::Message(Message::Request(
                            Request::new(block.piece_index.get(), block.offset, block.size),
                        )));
                    }
                })
                .is_some();
            if !sent {
                // Peer vanished between pick and send.
                self.release_blocks(picked.iter());
            }
        }
    }

    // ----- periodic duties -----

    fn scan_request_timeouts(&self) {
        let now = Instant::now();
        for addr in self.peers.live_addrs() {
            let timed_out = self
                .peers
                .with_live_mut(addr, |l| {
                    let timed_out = l.take_timed_out(now);
                    if !timed_out.is_empty() {
                        // Punish the window, and remember the cancels so a
                        // late block isn't treated as unsolicited.
                        l.pipeline_limit = (l.pipeline_limit / 2).max(PIPELINE_START);
                        for b in &timed_out {
                            l.cancelled_downloads.insert(b.block.absolute_index);
                            let _ = l.tx.send(WriterRequest::Message(Message::Cancel(
                                Request::new(
                                    b.block.piece_index.get(),
                                    b.block.offset,
                                    b.block.size,
                                ),
                            )));
                        }
                        l.wake.notify_waiters();
                    }
                    timed_out
                })
                .unwrap_or_default();
            if !timed_out.is_empty() {
                debug!(%addr, count = timed_out.len(), "requests timed out");
                self.release_blocks(timed_out.iter().map(|b| &b.block));
            }
        }
    }

    fn run_choke_round(&self) {
        let seeding = self.is_complete();
        let mut candidates = Vec::new();
        for addr in self.peers.live_addrs() {
            let candidate = self.peers.with_live_mut(addr, |l| {
                let contribution = if seeding {
                    l.uploaded - l.choke_snapshot_up
                } else {
                    l.choke_window_downloaded()
                };
                l.choke_snapshot = l.downloaded;
                l.choke_snapshot_up = l.uploaded;
                l.peer_interested.then_some(Candidate {
                    addr,
                    contribution,
                })
            });
            if let Some(Some(c)) = candidate {
                candidates.push(c);
            }
        }

        let unchoked = self
            .choker
            .lock()
            .run_round(candidates, self.opts.upload_slots);

        for addr in self.peers.live_addrs() {
            self.peers.with_live_mut(addr, |l| {
                let should_unchoke = unchoked.contains(&addr);
                if should_unchoke && l.am_choking {
                    l.am_choking = false;
                    let _ = l.tx.send(WriterRequest::Message(Message::Unchoke));
                } else if !should_unchoke && !l.am_choking {
                    l.am_choking = true;
                    let _ = l.tx.send(WriterRequest::Message(Message::Choke));
                }
            });
        }
    }

    // ----- message handling helpers (called from PeerHandler) -----

    fn update_interest(&self, addr: PeerHandle) {
        let live = self.live.read().clone();
        let Some(live) = live else { return };
        let interested = self
            .peers
            .with_live(addr, |l| l.bitfield.clone())
            .map(|bf| live.locked.read().picker.peer_has_needed_piece(&bf))
            .unwrap_or(false);
        self.peers.with_live_mut(addr, |l| {
            if l.am_interested != interested {
                l.am_interested = interested;
                let msg = if interested {
                    Message::Interested
                } else {
                    Message::NotInterested
                };
                let _ = l.tx.send(WriterRequest::Message(msg));
            }
            l.wake.notify_waiters();
        });
    }

    /// Apply a full bitfield (BITFIELD / HAVE_ALL / HAVE_NONE).
    fn set_peer_bitfield(&self, addr: PeerHandle, bitfield: BF, claims_all: bool) -> anyhow::Result<()> {
        let live = self.live.read().clone();
        if let Some(live) = live {
            let total = live.lengths.total_pieces() as usize;
            let mut sized = if claims_all {
                let mut bf = bf_with_bits(total);
                bf.fill(true);
                bf
            } else {
                bitfield
            };
            if !claims_all {
                if sized.len() < total {
                    bail!("bitfield too short: {} < {total}", sized.len());
                }
                // Spare bits past the last piece must be zero-ish; just
                // truncate them.
                sized.truncate(total);
            }
            let old = self
                .peers
                .with_live_mut(addr, |l| std::mem::replace(&mut l.bitfield, sized.clone()))
                .context("peer not live")?;
            {
                let mut g = live.locked.write();
                if !old.is_empty() {
                    g.picker.remove_peer_bitfield(&old);
                }
                g.picker.add_peer_bitfield(&sized);
            }
            self.update_interest(addr);
        } else {
            self.peers.with_live_mut(addr, |l| {
                l.claims_all = claims_all;
                if !claims_all {
                    l.bitfield = bitfield;
                }
            });
        }
        Ok(())
    }

    fn on_have(&self, addr: PeerHandle, piece: u32) -> anyhow::Result<()> {
        let live = self.live.read().clone();
        match live {
            Some(live) => {
                let valid = live
                    .lengths
                    .validate_piece_index(piece)
                    .with_context(|| format!("HAVE for piece {piece} out of range"))?;
                let newly = self
                    .peers
                    .with_live_mut(addr, |l| {
                        if l.bitfield.is_empty() {
                            l.bitfield = bf_with_bits(live.lengths.total_pieces() as usize);
                        }
                        let had = l.has_piece(piece);
                        l.bitfield.set(piece as usize, true);
                        !had
                    })
                    .unwrap_or(false);
                if newly {
                    live.locked.write().picker.inc_availability(valid);
                    self.update_interest(addr);
                }
            }
            None => {
                self.peers.with_live_mut(addr, |l| l.pending_haves.push(piece));
            }
        }
        Ok(())
    }

    /// Once metadata+checking finish, retrofit peers that connected early.
    fn sync_existing_peers_to_live(&self) {
        let live = self.live.read().clone();
        let Some(live) = live else { return };
        let total = live.lengths.total_pieces() as usize;
        for addr in self.peers.live_addrs() {
            let fixed = self.peers.with_live_mut(addr, |l| {
                let mut bf = std::mem::take(&mut l.bitfield);
                if l.claims_all {
                    bf = bf_with_bits(total);
                    bf.fill(true);
                } else {
                    if bf.is_empty() {
                        bf = bf_with_bits(total);
                    }
                    if bf.len() < total {
                        return None;
                    }
                    bf.truncate(total);
                    for p in l.pending_haves.drain(..) {
                        if (p as usize) < total {
                            bf.set(p as usize, true);
                        }
                    }
                }
                l.bitfield = bf.clone();
                Some(bf)
            });
            match fixed {
                Some(Some(bf)) => {
                    live.locked.write().picker.add_peer_bitfield(&bf);
                    self.update_interest(addr);
                }
                Some(None) => {
                    debug!(%addr, "peer bitfield does not match metadata, disconnecting");
                    self.peers.send(addr, WriterRequest::Disconnect);
                }
                None => {}
            }
        }
    }

    fn on_request(&self, addr: PeerHandle, req: Request) -> anyhow::Result<()> {
        let live = self.live.read().clone();
        let live = live.context("REQUEST before metadata is known")?;

        let reject = |reason: &str| {
            trace!(%addr, ?req, reason, "rejecting request");
            self.peers.with_live(addr, |l| {
                if l.supports_fast {
                    let _ = l.tx.send(WriterRequest::Message(Message::Reject(req)));
                }
            });
        };

        let piece = match live.lengths.validate_piece_index(req.index) {
            Some(p) => p,
            None => bail!("REQUEST for invalid piece {}", req.index),
        };
        if req.length == 0
            || req.length > BLOCK_SIZE
            || req.begin.saturating_add(req.length) > live.lengths.piece_length(piece)
        {
            bail!("REQUEST with bad bounds {req:?}");
        }

        let verified = live.locked.read().picker.have()[req.index as usize];
        if !verified {
            reject("piece not verified");
            return Ok(());
        }
        let queued = self
            .peers
            .with_live_mut(addr, |l| {
                if l.am_choking || l.queued_uploads >= MAX_QUEUED_UPLOADS {
                    return false;
                }
                l.queued_uploads += 1;
                let _ = l.tx.send(WriterRequest::SendBlock(req));
                true
            })
            .unwrap_or(false);
        if !queued {
            reject("choked or upload queue full");
        }
        Ok(())
    }

    async fn on_piece_message(self: &Arc<Self>, addr: PeerHandle, piece: Piece) -> anyhow::Result<()> {
        let live = self.live.read().clone();
        let live = live.context("PIECE before metadata is known")?;

        let block = live
            .lengths
            .block_info_from_wire(piece.index, piece.begin, piece.block.len() as u32)
            .with_context(|| {
                format!(
                    "bogus PIECE {}/{} of {} bytes",
                    piece.index,
                    piece.begin,
                    piece.block.len()
                )
            })?;

        let accepted = self
            .peers
            .with_live_mut(addr, |l| {
                if l.inflight.remove(&block.absolute_index).is_some() {
                    l.pipeline_limit = (l.pipeline_limit + 1).min(self.opts.max_pipeline_depth);
                    l.downloaded += piece.block.len() as u64;
                    l.wake.notify_waiters();
                    true
                } else if l.cancelled_downloads.remove(&block.absolute_index) {
                    // A block we gave up on; count it, take it anyway.
                    l.downloaded += piece.block.len() as u64;
                    true
                } else {
                    false
                }
            })
            .context("peer not live")?;
        if !accepted {
            bail!("unsolicited PIECE {}/{}", piece.index, piece.begin);
        }

        self.bandwidth.add_downloaded(piece.block.len() as u64);
        self.shared
            .global_bandwidth
            .add_downloaded(piece.block.len() as u64);

        let completed = {
            let mut g = live.locked.write();
            // Make room by evicting a stale buffered piece if needed.
            if g.active.is_full() && !g.active.contains(block.piece_index) {
                let candidate = {
                    let picker = &g.picker;
                    let lengths = &live.lengths;
                    g.active.eviction_candidate(|p| {
                        lengths
                            .validate_piece_index(p)
                            .map(|vp| picker.piece_has_inflight(vp))
                            .unwrap_or(true)
                    })
                };
                if let Some(evict) = candidate {
                    let evict = live.lengths.validate_piece_index(evict).unwrap();
                    debug!(piece = %evict, "evicting buffered piece");
                    g.active.discard(evict);
                    g.picker.mark_piece_failed(evict);
                }
            }
            let write =
                g.active
                    .record_block(&live.lengths, &block, &piece.block, addr)?;
            match write {
                BlockWrite::Completed { data, contributors } => {
                    g.picker.mark_block_received(&block);
                    Some((data, contributors))
                }
                BlockWrite::Accepted => {
                    g.picker.mark_block_received(&block);
                    None
                }
                BlockWrite::AlreadyHave => None,
            }
        };

        if live.locked.read().picker.is_endgame() {
            self.cancel_duplicate_requests(&live, block);
        }

        if let Some((data, contributors)) = completed {
            self.finish_piece(&live, block.piece_index, data, contributors)
                .await?;
        }
        Ok(())
    }

    /// Endgame housekeeping: a block that just arrived may be in flight on
    /// other peers; tell them to forget it.
    fn cancel_duplicate_requests(&self, live: &Arc<LiveState>, block: BlockInfo) {
        let _ = live;
        for addr in self.peers.live_addrs() {
            self.peers.with_live_mut(addr, |l| {
                if l.inflight.remove(&block.absolute_index).is_some() {
                    l.cancelled_downloads.insert(block.absolute_index);
                    let _ = l.tx.send(WriterRequest::Message(Message::Cancel(Request::new(
                        block.piece_index.get(),
                        block.offset,
                        block.size,
                    ))));
                }
            });
        }
    }

    /// Hash a completed piece and commit or blame.
    async fn finish_piece(
        self: &Arc<Self>,
        live: &Arc<LiveState>,
        piece: ValidPieceIndex,
        data: Vec<u8>,
        contributors: HashSet<PeerHandle>,
    ) -> anyhow::Result<()> {
        let expected = live
            .meta
            .piece_hash(piece.get())
            .map(|h| h.to_vec())
            .context("piece hash missing from metadata")?;

        let verify_and_write = {
            let live = live.clone();
            tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
                if sha1(&data)[..] != expected[..] {
                    return Ok(false);
                }
                FileOps::new(&live.meta, &live.lengths, live.storage.as_ref())
                    .write_piece(piece, &data)?;
                Ok(true)
            })
        };
        let ok = match verify_and_write.await? {
            Ok(ok) => ok,
            Err(e) => {
                // Disk trouble is torrent-fatal, not the peer's fault.
                self.enter_error(format!("storage error: {e:#}"));
                return Err(e);
            }
        };

        if ok {
            {
                let mut g = live.locked.write();
                g.picker.mark_piece_verified(piece);
            }
            trace!(%piece, "piece verified and written");
            // The write is on disk; only now may remotes learn about it.
            let _ = self.have_tx.send(piece.get());
            if live.locked.read().picker.is_complete() {
                self.on_download_complete();
            }
        } else {
            warn!(%piece, "piece failed verification, discarding");
            {
                let mut g = live.locked.write();
                g.picker.mark_piece_failed(piece);
            }
            for addr in contributors {
                let failures = self
                    .peers
                    .with_live_mut(addr, |l| {
                        l.hash_failures += 1;
                        l.hash_failures
                    })
                    .unwrap_or(0);
                if failures >= HASH_FAILURE_LIMIT {
                    warn!(%addr, "peer contributed to {failures} bad pieces, banning");
                    self.shared.bans.ban(addr.ip());
                    self.peers.send(addr, WriterRequest::Disconnect);
                }
            }
        }
        Ok(())
    }

    fn on_download_complete(self: &Arc<Self>) {
        if self.complete.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("torrent complete");
        *self.activity.write() = ActivityState::Seeding;
        self.finished_notify.notify_waiters();
        if let Some(announcer) = self.announcer.lock().clone() {
            announcer.notify_completed();
        }
        // Fellow seeds are of no further use to either side.
        for addr in self.peers.live_addrs() {
            let is_seed = self
                .peers
                .with_live(addr, |l| {
                    !l.bitfield.is_empty() && l.bitfield.count_zeros() == 0
                })
                .unwrap_or(false);
            if is_seed {
                self.peers.send(addr, WriterRequest::Disconnect);
            }
        }
    }

    // ----- ut_metadata -----

    fn on_peer_extended_handshake(
        self: &Arc<Self>,
        addr: PeerHandle,
        eh: &ExtendedHandshake,
    ) -> anyhow::Result<()> {
        self.peers.with_live_mut(addr, |l| l.ext = Some(eh.clone()));
        let needs_metadata = self.meta.read().is_none();
        if !needs_metadata {
            return Ok(());
        }
        let (Some(size), Some(_)) = (eh.metadata_size, eh.ut_metadata_id) else {
            return Ok(());
        };
        let mut dl = self.metadata_dl.lock();
        if dl.is_some() {
            return Ok(());
        }
        let download = MetadataDownload::new(addr, size)?;
        let first = download.next_missing().context("empty metadata")?;
        *dl = Some(download);
        debug!(%addr, size, "fetching metadata from peer");
        self.peers.send(
            addr,
            WriterRequest::Message(Message::Extended(ExtendedMessage::UtMetadata(
                UtMetadata::Request(first),
            ))),
        );
        Ok(())
    }

    async fn on_ut_metadata(self: &Arc<Self>, addr: PeerHandle, msg: UtMetadata) -> anyhow::Result<()> {
        match msg {
            UtMetadata::Request(piece) => {
                let meta = self.meta.read().clone();
                let reply = match meta
                    .as_ref()
                    .and_then(|m| metadata_piece(&m.info_bytes, piece))
                {
                    Some(chunk) => UtMetadata::Data {
                        piece,
                        total_size: meta.as_ref().unwrap().info_bytes.len() as u32,
                        data: Bytes::copy_from_slice(chunk),
                    },
                    None => UtMetadata::Reject(piece),
                };
                self.peers.send(
                    addr,
                    WriterRequest::Message(Message::Extended(ExtendedMessage::UtMetadata(reply))),
                );
                Ok(())
            }
            UtMetadata::Data { piece, data, .. } => self.on_metadata_data(addr, piece, &data).await,
            UtMetadata::Reject(piece) => {
                debug!(%addr, piece, "peer rejected metadata request");
                let mut dl = self.metadata_dl.lock();
                if dl.as_ref().map(|d| d.source) == Some(addr) {
                    // Elect somebody else on their next handshake.
                    *dl = None;
                }
                Ok(())
            }
        }
    }

    async fn on_metadata_data(
        self: &Arc<Self>,
        addr: PeerHandle,
        piece: u32,
        data: &[u8],
    ) -> anyhow::Result<()> {
        let done = {
            let mut guard = self.metadata_dl.lock();
            let dl = match guard.as_mut() {
                Some(dl) if dl.source == addr => dl,
                _ => return Ok(()), // unsolicited or stale; ignore
            };
            match dl.record_piece(piece, data) {
                Ok(true) => guard.take(),
                Ok(false) => {
                    let next = dl.next_missing();
                    drop(guard);
                    if let Some(next) = next {
                        self.peers.send(
                            addr,
                            WriterRequest::Message(Message::Extended(
                                ExtendedMessage::UtMetadata(UtMetadata::Request(next)),
                            )),
                        );
                    }
                    return Ok(());
                }
                Err(e) => {
                    *guard = None;
                    return Err(e);
                }
            }
        };

        let Some(done) = done else { return Ok(()) };
        match done.finish(self.info_hash) {
            Ok(meta) => {
                debug!("metadata acquired and verified");
                let meta = Arc::new(meta);
                *self.meta.write() = Some(meta.clone());
                self.clone().initialize_with_meta(meta).await?;
                Ok(())
            }
            Err(e) => {
                // The elected peer fed us garbage; drop it and let another
                // advertiser take over.
                warn!(%addr, "metadata verification failed: {e:#}");
                self.shared.bans.ban(addr.ip());
                self.peers.send(addr, WriterRequest::Disconnect);
                Ok(())
            }
        }
    }

    /// Change one file's priority. Skip excludes its pieces from picking;
    /// High fetches them before everything Normal. A piece straddling two
    /// files takes the last priority written.
    pub fn set_file_priority(
        &self,
        file_index: usize,
        priority: PiecePriority,
    ) -> anyhow::Result<()> {
        let live = self.live.read().clone();
        let live = live.context("file priorities need the metadata")?;
        let file = live
            .meta
            .files
            .get(file_index)
            .with_context(|| format!("no file with index {file_index}"))?;
        let pieces = live.lengths.pieces_within(file.offset, file.length);
        live.locked.write().picker.set_priority_range(pieces, priority);
        for addr in self.peers.live_addrs() {
            self.update_interest(addr);
        }
        Ok(())
    }

    // ----- queries -----

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    pub fn activity(&self) -> ActivityState {
        *self.activity.read()
    }

    pub fn error_message(&self) -> Option<String> {
        self.error_message.read().clone()
    }

    pub fn metainfo(&self) -> Option<Arc<Metainfo>> {
        self.meta.read().clone()
    }

    pub async fn wait_until_completed(&self) {
        if self.is_complete() {
            return;
        }
        self.finished_notify.notified().await;
    }

    fn byte_progress(&self) -> (u64, u64) {
        let live = self.live.read().clone();
        match live {
            Some(live) => {
                let g = live.locked.read();
                let have: u64 = g
                    .picker
                    .have()
                    .iter_ones()
                    .filter_map(|p| {
                        live.lengths
                            .validate_piece_index(p as u32)
                            .map(|p| live.lengths.piece_length(p) as u64)
                    })
                    .sum();
                (live.lengths.total_length(), have)
            }
            None => {
                let total = self
                    .meta
                    .read()
                    .as_ref()
                    .map(|m| m.total_length)
                    .unwrap_or(0);
                (total, if self.is_complete() { total } else { 0 })
            }
        }
    }

    pub fn stats(&self) -> TorrentStats {
        let (total, have) = self.byte_progress();
        let (pieces_total, pieces_have) = {
            let live = self.live.read().clone();
            match live {
                Some(live) => {
                    let g = live.locked.read();
                    (live.lengths.total_pieces(), g.picker.have_count())
                }
                None => (0, 0),
            }
        };
        TorrentStats {
            info_hash: self.info_hash,
            name: self.meta.read().as_ref().map(|m| m.name.clone()),
            activity: self.activity(),
            user_active: self.user_active.load(Ordering::SeqCst),
            error: self.error_message(),
            total_bytes: total,
            have_bytes: have,
            uploaded_bytes: self.bandwidth.uploaded(),
            downloaded_bytes: self.bandwidth.downloaded(),
            up_bps: self.bandwidth.up_speed.bps(),
            down_bps: self.bandwidth.down_speed.bps(),
            pieces_total,
            pieces_have,
            peers: self.peers.stats(),
            trackers: self
                .announcer
                .lock()
                .as_ref()
                .map(|a| a.stats())
                .unwrap_or_default(),
        }
    }

    /// Delete all data files (used by remove-with-data).
    pub(crate) async fn delete_data(&self) -> anyhow::Result<()> {
        let meta = self.meta.read().clone();
        let Some(meta) = meta else { return Ok(()) };
        let storage = FilesystemStorage::new(&self.shared.output_dir, &meta);
        tokio::task::spawn_blocking(move || storage.delete_all()).await?
    }
}

/// Glue between a peer connection and its torrent.
pub(crate) struct PeerHandler {
    pub torrent: Arc<ManagedTorrent>,
    pub addr: PeerHandle,
}

impl PeerConnectionHandler for PeerHandler {
    fn on_handshake(&self, handshake: &Handshake) -> anyhow::Result<()> {
        if !self.torrent.peers.mark_live(
            self.addr,
            handshake.peer_id,
            handshake.supports_fast(),
            handshake.supports_extended(),
        ) {
            bail!("peer slot disappeared while connecting");
        }
        trace!(client = ?try_decode_client(&handshake.peer_id), "peer live");
        Ok(())
    }

    fn on_extended_handshake(&self, eh: &ExtendedHandshake) -> anyhow::Result<()> {
        self.torrent.on_peer_extended_handshake(self.addr, eh)
    }

    fn initial_messages(&self) -> Vec<Message> {
        let torrent = &self.torrent;
        let (supports_fast, supports_extended) = torrent
            .peers
            .with_live(self.addr, |l| (l.supports_fast, l.supports_extended))
            .unwrap_or((false, false));

        let mut out = Vec::new();
        let live = torrent.live.read().clone();
        match live {
            Some(live) => {
                let g = live.locked.read();
                let have = g.picker.have();
                let count = g.picker.have_count();
                if count == live.lengths.total_pieces() && supports_fast {
                    out.push(Message::HaveAll);
                } else if count == 0 && supports_fast {
                    out.push(Message::HaveNone);
                } else if count > 0 {
                    out.push(Message::Bitfield(Bytes::copy_from_slice(
                        have.as_raw_slice(),
                    )));
                }
            }
            None => {
                if supports_fast {
                    out.push(Message::HaveNone);
                }
            }
        }
        if supports_extended {
            let metadata_size = torrent
                .metainfo()
                .map(|m| m.info_bytes.len() as u32);
            out.push(Message::Extended(ExtendedMessage::Handshake(
                ExtendedHandshake::ours(metadata_size, Some(torrent.shared.announce_port)),
            )));
        }
        out
    }

    async fn on_message(&self, msg: Message) -> anyhow::Result<()> {
        let torrent = &self.torrent;
        let addr = self.addr;
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                let blocks = torrent.peers.with_live_mut(addr, |l| {
                    l.peer_choking = true;
                    l.pipeline_limit = PIPELINE_START;
                    l.take_inflight()
                });
                if let Some(blocks) = blocks {
                    torrent.release_blocks(blocks.iter().map(|b| &b.block));
                }
            }
            Message::Unchoke => {
                torrent.peers.with_live_mut(addr, |l| {
                    l.peer_choking = false;
                    l.wake.notify_waiters();
                });
            }
            Message::Interested => {
                torrent
                    .peers
                    .with_live_mut(addr, |l| l.peer_interested = true);
                // Don't make a fresh peer wait out a whole choke round if
                // there are free slots right now.
                let unchoked_now = torrent
                    .peers
                    .live_addrs()
                    .iter()
                    .filter(|a| {
                        torrent
                            .peers
                            .with_live(**a, |l| !l.am_choking)
                            .unwrap_or(false)
                    })
                    .count();
                if unchoked_now < torrent.opts.upload_slots {
                    torrent.peers.with_live_mut(addr, |l| {
                        if l.am_choking {
                            l.am_choking = false;
                            let _ = l.tx.send(WriterRequest::Message(Message::Unchoke));
                        }
                    });
                }
            }
            Message::NotInterested => {
                torrent
                    .peers
                    .with_live_mut(addr, |l| l.peer_interested = false);
            }
            Message::Have(piece) => torrent.on_have(addr, piece)?,
            Message::Bitfield(bits) => {
                let bf = bf_from_vec(bits.to_vec(), bits.len() * 8);
                torrent.set_peer_bitfield(addr, bf, false)?;
            }
            Message::HaveAll => torrent.set_peer_bitfield(addr, BF::new(), true)?,
            Message::HaveNone => {
                let total = torrent
                    .live
                    .read()
                    .as_ref()
                    .map(|l| l.lengths.total_pieces() as usize)
                    .unwrap_or(0);
                torrent.set_peer_bitfield(addr, bf_with_bits(total), false)?;
            }
            Message::Request(req) => torrent.on_request(addr, req)?,
            Message::Piece(piece) => torrent.on_piece_message(addr, piece).await?,
            Message::Cancel(req) => {
                torrent.peers.with_live_mut(addr, |l| {
                    l.cancelled_uploads.insert((req.index, req.begin));
                });
            }
            Message::Reject(req) => {
                // The peer refused a block we asked for; put it back.
                let live = torrent.live.read().clone();
                if let Some(live) = live {
                    if let Some(block) = live.lengths.block_info_from_wire(
                        req.index,
                        req.begin,
                        req.length,
                    ) {
                        let removed = torrent
                            .peers
                            .with_live_mut(addr, |l| {
                                l.inflight.remove(&block.absolute_index).is_some()
                            })
                            .unwrap_or(false);
                        if removed {
                            torrent.release_blocks(std::iter::once(&block));
                        }
                    }
                }
            }
            Message::Suggest(piece) | Message::AllowedFast(piece) => {
                trace!(piece, "fast-extension hint ignored");
            }
            Message::Extended(ExtendedMessage::UtMetadata(msg)) => {
                torrent.on_ut_metadata(addr, msg).await?
            }
            Message::Extended(ExtendedMessage::Unknown(id, _)) => {
                trace!(id, "ignoring unknown extended message");
            }
            Message::Extended(ExtendedMessage::Handshake(_)) => {
                // Handled by the connection layer before dispatch.
            }
        }
        Ok(())
    }

    async fn retrieve_block(&self, req: &Request) -> anyhow::Result<Option<Bytes>> {
        let torrent = &self.torrent;
        let addr = self.addr;

        let cancelled = torrent
            .peers
            .with_live_mut(addr, |l| {
                l.queued_uploads = l.queued_uploads.saturating_sub(1);
                l.cancelled_uploads.remove(&(req.index, req.begin)) || l.am_choking
            })
            .unwrap_or(true);
        if cancelled {
            return Ok(None);
        }

        let live = torrent.live.read().clone();
        let Some(live) = live else { return Ok(None) };
        let piece = live
            .lengths
            .validate_piece_index(req.index)
            .context("invalid piece in queued upload")?;

        // Upload ceilings apply to payload bytes only.
        torrent
            .shared
            .global_limits
            .up
            .acquire(req.length as u64)
            .await;
        torrent.limits.up.acquire(req.length as u64).await;

        let read = {
            let live = live.clone();
            let req = *req;
            tokio::task::spawn_blocking(move || -> anyhow::Result<Bytes> {
                let mut buf = vec![0u8; req.length as usize];
                FileOps::new(&live.meta, &live.lengths, live.storage.as_ref())
                    .read_piece_range(piece, req.begin, &mut buf)?;
                Ok(Bytes::from(buf))
            })
            .await?
        };
        match read {
            Ok(data) => Ok(Some(data)),
            Err(e) => {
                torrent.enter_error(format!("storage error: {e:#}"));
                Err(e)
            }
        }
    }

    fn on_sent_block(&self, req: &Request) {
        let torrent = &self.torrent;
        torrent.bandwidth.add_uploaded(req.length as u64);
        torrent
            .shared
            .global_bandwidth
            .add_uploaded(req.length as u64);
        torrent
            .peers
            .with_live_mut(self.addr, |l| l.uploaded += req.length as u64);
    }

    fn should_send_have(&self, piece: u32) -> bool {
        !self
            .torrent
            .peers
            .with_live(self.addr, |l| l.has_piece(piece))
            .unwrap_or(true)
    }
}
