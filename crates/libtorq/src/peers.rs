// The per-torrent peer table. Peers move Queued -> Connecting -> Live and
// end up Dead (awaiting backoff) or NotNeeded (both sides complete).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use peer_protocol::extended::ExtendedHandshake;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::Notify;
use torq_core::lengths::BlockInfo;
use torq_core::PeerId;

use crate::peer_connection::{PeerRx, PeerTx, WriterRequest};
use crate::type_aliases::{PeerHandle, BF};

/// Pipeline floor: where new and recently punished peers start.
pub const PIPELINE_START: u32 = 4;

/// A block without a PIECE response for this long is cancelled and
/// re-picked.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry schedule for peers that disconnected cleanly.
const BACKOFF_BASE: Duration = Duration::from_secs(30);
const BACKOFF_CAP: Duration = Duration::from_secs(30 * 60);

#[derive(Debug)]
pub struct InflightBlock {
    pub block: BlockInfo,
    pub requested_at: Instant,
}

#[derive(Debug)]
pub struct LivePeerState {
    pub peer_id: PeerId,
    /// Choke/interest flags, from our point of view ("peer_" is them).
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub am_choking: bool,
    pub am_interested: bool,
    pub supports_fast: bool,
    pub supports_extended: bool,
    /// What the peer has. Empty until a bitfield/have_all arrives or
    /// metadata tells us the piece count.
    pub bitfield: BF,
    /// Sent HAVE_ALL before we knew the piece count.
    pub claims_all: bool,
    /// HAVEs received before the piece count was known.
    pub pending_haves: Vec<u32>,
    pub ext: Option<ExtendedHandshake>,
    /// Outstanding requests keyed by absolute block index.
    pub inflight: HashMap<u32, InflightBlock>,
    /// Blocks we cancelled but whose data may still arrive.
    pub cancelled_downloads: HashSet<u32>,
    /// Current request window (additive increase, halve on trouble).
    pub pipeline_limit: u32,
    /// Outgoing PIECE sends queued on the writer.
    pub queued_uploads: u32,
    /// CANCELs received for uploads still sitting in the writer queue.
    pub cancelled_uploads: HashSet<(u32, u32)>,
    pub downloaded: u64,
    pub uploaded: u64,
    /// `downloaded`/`uploaded` at the start of the current choke window.
    pub choke_snapshot: u64,
    pub choke_snapshot_up: u64,
    pub hash_failures: u32,
    pub tx: PeerTx,
    /// Wakes the requester when choke/bitfield/pipeline state changes.
    pub wake: Arc<Notify>,
}

impl LivePeerState {
    fn new(peer_id: PeerId, supports_fast: bool, supports_extended: bool, tx: PeerTx) -> Self {
        Self {
            peer_id,
            peer_choking: true,
            peer_interested: false,
            am_choking: true,
            am_interested: false,
            supports_fast,
            supports_extended,
            bitfield: BF::new(),
            claims_all: false,
            pending_haves: Vec::new(),
            ext: None,
            inflight: HashMap::new(),
            cancelled_downloads: HashSet::new(),
            pipeline_limit: PIPELINE_START,
            queued_uploads: 0,
            cancelled_uploads: HashSet::new(),
            downloaded: 0,
            uploaded: 0,
            choke_snapshot: 0,
            choke_snapshot_up: 0,
            hash_failures: 0,
            tx,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn has_piece(&self, piece: u32) -> bool {
        self.bitfield.get(piece as usize).map(|b| *b).unwrap_or(false)
    }

    /// Contribution within the current choke window.
    pub fn choke_window_downloaded(&self) -> u64 {
        self.downloaded - self.choke_snapshot
    }

    pub fn take_inflight(&mut self) -> Vec<InflightBlock> {
        self.inflight.drain().map(|(_, v)| v).collect()
    }

    /// Requests older than the timeout, removed from the window.
    pub fn take_timed_out(&mut self, now: Instant) -> Vec<InflightBlock> {
        let expired: Vec<u32> = self
            .inflight
            .iter()
            .filter(|(_, v)| now.duration_since(v.requested_at) >= REQUEST_TIMEOUT)
            .map(|(k, _)| *k)
            .collect();
        expired
            .into_iter()
            .filter_map(|k| self.inflight.remove(&k))
            .collect()
    }
}

#[derive(Debug, Default)]
pub enum PeerState {
    #[default]
    Queued,
    Connecting(PeerTx),
    Live(LivePeerState),
    /// Errored; waiting for backoff before re-queueing.
    Dead,
    /// Nothing left to exchange with this peer.
    NotNeeded,
}

impl PeerState {
    pub fn name(&self) -> &'static str {
        match self {
            PeerState::Queued => "queued",
            PeerState::Connecting(_) => "connecting",
            PeerState::Live(_) => "live",
            PeerState::Dead => "dead",
            PeerState::NotNeeded => "not_needed",
        }
    }
}

#[derive(Debug, Default)]
pub struct Peer {
    pub state: PeerState,
    /// Consecutive failed/closed connections, for backoff.
    pub attempts: u32,
}

impl Peer {
    pub fn backoff_delay(&self) -> Duration {
        let exp = self.attempts.saturating_sub(1).min(10);
        BACKOFF_BASE
            .saturating_mul(1u32 << exp)
            .min(BACKOFF_CAP)
    }
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct AggregatePeerStats {
    pub queued: u32,
    pub connecting: u32,
    pub live: u32,
    pub dead: u32,
    pub not_needed: u32,
    pub seen: u32,
}

#[derive(Default)]
pub struct PeerStates {
    states: DashMap<PeerHandle, Peer>,
}

impl PeerStates {
    pub fn add_if_not_seen(&self, addr: PeerHandle) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.states.entry(addr) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vac) => {
                vac.insert(Default::default());
                true
            }
        }
    }

    pub fn contains(&self, addr: PeerHandle) -> bool {
        self.states.contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn drop_peer(&self, addr: PeerHandle) -> Option<Peer> {
        self.states.remove(&addr).map(|(_, p)| p)
    }

    pub fn with_peer_mut<R>(
        &self,
        addr: PeerHandle,
        f: impl FnOnce(&mut Peer) -> R,
    ) -> Option<R> {
        self.states.get_mut(&addr).map(|mut e| f(e.value_mut()))
    }

    pub fn with_live<R>(&self, addr: PeerHandle, f: impl FnOnce(&LivePeerState) -> R) -> Option<R> {
        self.states.get(&addr).and_then(|e| match &e.value().state {
            PeerState::Live(live) => Some(f(live)),
            _ => None,
        })
    }

    pub fn with_live_mut<R>(
        &self,
        addr: PeerHandle,
        f: impl FnOnce(&mut LivePeerState) -> R,
    ) -> Option<R> {
        self.states
            .get_mut(&addr)
            .and_then(|mut e| match &mut e.value_mut().state {
                PeerState::Live(live) => Some(f(live)),
                _ => None,
            })
    }

    /// Queued -> Connecting, handing back the writer channel receiver.
    pub fn mark_connecting(&self, addr: PeerHandle) -> Option<PeerRx> {
        self.with_peer_mut(addr, |peer| match peer.state {
            PeerState::Queued => {
                let (tx, rx) = unbounded_channel();
                peer.state = PeerState::Connecting(tx);
                Some(rx)
            }
            _ => None,
        })
        .flatten()
    }

    /// Register an accepted connection that is already past its handshake.
    /// Returns None if the peer exists and should not be replaced.
    pub fn insert_incoming(&self, addr: PeerHandle) -> Option<PeerRx> {
        use dashmap::mapref::entry::Entry;
        match self.states.entry(addr) {
            Entry::Occupied(mut e) => match e.get().state {
                // A queued or backed-off peer is happily replaced by an
                // incoming connection.
                PeerState::Queued | PeerState::Dead => {
                    let (tx, rx) = unbounded_channel();
                    e.get_mut().state = PeerState::Connecting(tx);
                    Some(rx)
                }
                _ => None,
            },
            Entry::Vacant(vac) => {
                let (tx, rx) = unbounded_channel();
                vac.insert(Peer {
                    state: PeerState::Connecting(tx),
                    attempts: 0,
                });
                Some(rx)
            }
        }
    }

    /// Connecting -> Live once the remote handshake checks out.
    pub fn mark_live(
        &self,
        addr: PeerHandle,
        peer_id: PeerId,
        supports_fast: bool,
        supports_extended: bool,
    ) -> bool {
        self.with_peer_mut(addr, |peer| {
            let tx = match &peer.state {
                PeerState::Connecting(tx) => tx.clone(),
                _ => return false,
            };
            peer.attempts = 0;
            peer.state =
                PeerState::Live(LivePeerState::new(peer_id, supports_fast, supports_extended, tx));
            true
        })
        .unwrap_or(false)
    }

    /// Live/Connecting -> Dead. Returns the live state so the caller can
    /// reclaim in-flight blocks.
    pub fn mark_dead(&self, addr: PeerHandle) -> Option<LivePeerState> {
        self.with_peer_mut(addr, |peer| {
            peer.attempts += 1;
            match std::mem::take(&mut peer.state) {
                PeerState::Live(live) => {
                    peer.state = PeerState::Dead;
                    Some(live)
                }
                _ => {
                    peer.state = PeerState::Dead;
                    None
                }
            }
        })
        .flatten()
    }

    pub fn mark_not_needed(&self, addr: PeerHandle) {
        self.with_peer_mut(addr, |peer| {
            peer.state = PeerState::NotNeeded;
        });
    }

    pub fn requeue_if_dead(&self, addr: PeerHandle) -> bool {
        self.with_peer_mut(addr, |peer| match peer.state {
            PeerState::Dead => {
                peer.state = PeerState::Queued;
                true
            }
            _ => false,
        })
        .unwrap_or(false)
    }

    pub fn clone_tx(&self, addr: PeerHandle) -> Option<PeerTx> {
        self.with_live(addr, |live| live.tx.clone())
    }

    pub fn send(&self, addr: PeerHandle, req: WriterRequest) -> bool {
        self.with_live(addr, |live| live.tx.send(req).is_ok())
            .unwrap_or(false)
    }

    pub fn live_addrs(&self) -> Vec<PeerHandle> {
        self.states
            .iter()
            .filter(|e| matches!(e.value().state, PeerState::Live(_)))
            .map(|e| *e.key())
            .collect()
    }

    pub fn stats(&self) -> AggregatePeerStats {
        let mut s = AggregatePeerStats::default();
        for e in self.states.iter() {
            s.seen += 1;
            match e.value().state {
                PeerState::Queued => s.queued += 1,
                PeerState::Connecting(_) => s.connecting += 1,
                PeerState::Live(_) => s.live += 1,
                PeerState::Dead => s.dead += 1,
                PeerState::NotNeeded => s.not_needed += 1,
            }
        }
        s
    }

    /// Broadcast a writer request to every live peer.
    pub fn send_all(&self, mut make: impl FnMut() -> WriterRequest) {
        for e in self.states.iter() {
            if let PeerState::Live(live) = &e.value().state {
                let _ = live.tx.send(make());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> PeerHandle {
        format!("10.1.1.{n}:6881").parse().unwrap()
    }

    #[test]
    fn test_lifecycle() {
        let peers = PeerStates::default();
        assert!(peers.add_if_not_seen(addr(1)));
        assert!(!peers.add_if_not_seen(addr(1)));

        let _rx = peers.mark_connecting(addr(1)).unwrap();
        assert!(peers.mark_connecting(addr(1)).is_none());

        assert!(peers.mark_live(addr(1), PeerId::new([9; 20]), true, true));
        assert!(peers.with_live(addr(1), |l| l.peer_choking).unwrap());

        let live = peers.mark_dead(addr(1)).unwrap();
        assert_eq!(live.peer_id, PeerId::new([9; 20]));
        assert!(peers.requeue_if_dead(addr(1)));
        assert_eq!(peers.stats().queued, 1);
    }

    #[test]
    fn test_backoff_schedule() {
        let mut peer = Peer::default();
        peer.attempts = 1;
        assert_eq!(peer.backoff_delay(), Duration::from_secs(30));
        peer.attempts = 3;
        assert_eq!(peer.backoff_delay(), Duration::from_secs(120));
        peer.attempts = 20;
        assert_eq!(peer.backoff_delay(), Duration::from_secs(1800));
    }

    #[test]
    fn test_incoming_replaces_dead_only() {
        let peers = PeerStates::default();
        // Unknown peer: accepted.
        assert!(peers.insert_incoming(addr(1)).is_some());
        // Already connecting: refused.
        assert!(peers.insert_incoming(addr(1)).is_none());

        peers.mark_live(addr(1), PeerId::new([9; 20]), false, false);
        assert!(peers.insert_incoming(addr(1)).is_none());

        peers.mark_dead(addr(1));
        assert!(peers.insert_incoming(addr(1)).is_some());
    }

    #[test]
    fn test_request_timeouts() {
        let peers = PeerStates::default();
        peers.add_if_not_seen(addr(1));
        peers.mark_connecting(addr(1)).unwrap();
        peers.mark_live(addr(1), PeerId::new([9; 20]), false, false);

        let lengths = torq_core::lengths::Lengths::new(65536, 32768).unwrap();
        let block = lengths
            .iter_block_infos(lengths.validate_piece_index(0).unwrap())
            .next()
            .unwrap();
        let now = Instant::now();
        peers.with_live_mut(addr(1), |l| {
            l.inflight.insert(
                block.absolute_index,
                InflightBlock {
                    block,
                    requested_at: now - Duration::from_secs(31),
                },
            );
            l.inflight.insert(
                block.absolute_index + 1,
                InflightBlock {
                    block,
                    requested_at: now,
                },
            );
        });
        let timed_out = peers
            .with_live_mut(addr(1), |l| l.take_timed_out(now))
            .unwrap();
        assert_eq!(timed_out.len(), 1);
        assert_eq!(
            peers.with_live(addr(1), |l| l.inflight.len()).unwrap(),
            1
        );
    }
}
