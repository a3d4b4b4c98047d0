// Tracker communication: the HTTP (BEP 3/23) and UDP (BEP 15) announce
// clients, and the per-torrent announcer that drives them on their
// intervals.

mod announcer;
mod http;
mod udp;

pub use announcer::{Announcer, TrackerStats, TrackerStatus};
pub use udp::UdpTrackerClient;

use std::net::SocketAddr;
use std::time::Duration;

use torq_core::{InfoHash, PeerId};

/// Tracker announces that fail are retried no sooner than this.
pub const MIN_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Deadline for any single announce attempt.
pub const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<AnnounceEvent>,
    pub key: u32,
}

#[derive(Debug, Default)]
pub struct AnnounceResponse {
    pub interval: Option<Duration>,
    pub peers: Vec<SocketAddr>,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
}

/// Progress counters the announcer polls right before each announce, so the
/// numbers it reports are current rather than captured at start.
pub trait AnnounceStatsProvider: Send + Sync + 'static {
    fn get(&self) -> AnnounceStats;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AnnounceStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {
    #[error("unsupported tracker URL {0}")]
    UnsupportedUrl(String),
    #[error("tracker HTTP status {0}")]
    HttpStatus(u16),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("error decoding tracker response: {0}")]
    Bencode(#[from] bencode::DecodeError),
    #[error("tracker failure: {0}")]
    Failure(String),
    #[error("udp tracker gave up after {0} retransmits")]
    UdpTimeout(usize),
    #[error("udp response for wrong transaction")]
    UdpWrongTransaction,
    #[error("udp tracker error: {0}")]
    UdpTrackerError(String),
    #[error("malformed udp response")]
    UdpMalformed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("announce timed out")]
    Timeout,
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}
