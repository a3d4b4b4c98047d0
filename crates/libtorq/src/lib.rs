//! A BitTorrent engine: torrent sessions, peer wire connections with
//! optional stream encryption, piece picking, verification, storage and
//! rate limiting.
//!
//! The entry point is [`Session`]: it owns the listen socket, the peer
//! identity and the torrent registry.
//!
//! ```no_run
//! use libtorq::{AddTorrent, AddTorrentOptions, Session, SessionOptions};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let session = Session::new(SessionOptions {
//!     output_dir: "/tmp/downloads".into(),
//!     ..Default::default()
//! })
//! .await?;
//! let torrent = session
//!     .add_torrent(
//!         AddTorrent::from_url("magnet:?xt=urn:btih:cafebabe...")?,
//!         AddTorrentOptions::default(),
//!     )
//!     .await?;
//! torrent.wait_until_completed().await;
//! # Ok(())
//! # }
//! ```

mod active_pieces;
mod bans;
mod choker;
mod error;
mod file_ops;
mod limits;
mod metadata;
mod peer_connection;
mod peers;
mod picker;
mod read_buf;
mod session;
mod storage;
mod torrent;
mod type_aliases;

pub use error::{Error, Result};
pub use limits::LimitsConfig;
pub use peer_connection::PeerConnectionOptions;
pub use picker::PiecePriority;
pub use session::{AddTorrent, AddTorrentOptions, Session, SessionOptions};
pub use storage::{FilesystemStorage, TorrentStorage};
pub use torrent::{ActivityState, ManagedTorrent, TorrentOptions, TorrentStats};

pub use torq_core::magnet::Magnet;
pub use torq_core::metainfo::Metainfo;
pub use torq_core::{InfoHash, PeerId};
pub use torq_mse::MseMode;

#[cfg(test)]
mod tests;

/// The cargo version of the engine.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
