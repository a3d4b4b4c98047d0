pub mod constants;
pub mod hash_id;
pub mod lengths;
pub mod magnet;
pub mod metainfo;
pub mod peer_id;
pub mod speed_estimator;

pub use hash_id::{Id20, InfoHash, PeerId};
