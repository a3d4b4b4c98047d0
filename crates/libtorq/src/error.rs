/// The error kinds the engine distinguishes. Peer-local failures never
/// leave the peer task; everything else surfaces through these.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(#[from] peer_protocol::MessageError),
    #[error("encryption error: {0}")]
    Encryption(#[from] torq_mse::MseError),
    #[error("tracker error: {0}")]
    Tracker(#[from] torq_tracker::TrackerError),
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
    #[error("piece {piece} failed hash verification")]
    HashMismatch { piece: u32 },
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    #[error("torrent {0} is not registered")]
    UnknownTorrent(torq_core::InfoHash),
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
