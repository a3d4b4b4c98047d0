// Assembly of the info dict fetched over ut_metadata (BEP 9).

use anyhow::{bail, Context};
use peer_protocol::extended::MAX_METADATA_SIZE;
use sha1w::sha1;
use torq_core::constants::BLOCK_SIZE;
use torq_core::metainfo::Metainfo;
use torq_core::InfoHash;

use crate::type_aliases::PeerHandle;

/// One in-progress metadata download, fed by a single elected peer.
pub struct MetadataDownload {
    /// The peer currently serving us.
    pub source: PeerHandle,
    total_size: u32,
    buf: Vec<u8>,
    received: Vec<bool>,
}

impl MetadataDownload {
    pub fn new(source: PeerHandle, total_size: u32) -> anyhow::Result<Self> {
        if total_size == 0 || total_size > MAX_METADATA_SIZE {
            bail!("unreasonable metadata size {total_size}");
        }
        let total_pieces = total_size.div_ceil(BLOCK_SIZE) as usize;
        Ok(Self {
            source,
            total_size,
            buf: vec![0u8; total_size as usize],
            received: vec![false; total_pieces],
        })
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn next_missing(&self) -> Option<u32> {
        self.received.iter().position(|r| !r).map(|p| p as u32)
    }

    /// Store one 16 KiB metadata piece. Returns true when all pieces are
    /// in.
    pub fn record_piece(&mut self, piece: u32, data: &[u8]) -> anyhow::Result<bool> {
        let idx = piece as usize;
        if idx >= self.received.len() {
            bail!("metadata piece {piece} out of range");
        }
        let offset = (piece * BLOCK_SIZE) as usize;
        let expected = (self.total_size as usize - offset).min(BLOCK_SIZE as usize);
        if data.len() != expected {
            bail!(
                "metadata piece {piece}: got {} bytes, expected {expected}",
                data.len()
            );
        }
        if self.received[idx] {
            bail!("metadata piece {piece} received twice");
        }
        self.buf[offset..offset + data.len()].copy_from_slice(data);
        self.received[idx] = true;
        Ok(self.received.iter().all(|r| *r))
    }

    /// Verify the assembled dict against the torrent identity and parse
    /// it. A mismatch means the source peer lied; the caller drops it and
    /// elects another.
    pub fn finish(self, info_hash: InfoHash) -> anyhow::Result<Metainfo> {
        if sha1(&self.buf) != info_hash.0 {
            bail!("assembled metadata does not hash to {info_hash}");
        }
        Metainfo::parse_info_dict(&self.buf).context("error parsing assembled metadata")
    }
}

/// Slice the raw info dict for serving a ut_metadata request.
pub fn metadata_piece(info_bytes: &[u8], piece: u32) -> Option<&[u8]> {
    let start = (piece as usize).checked_mul(BLOCK_SIZE as usize)?;
    if start >= info_bytes.len() {
        return None;
    }
    let end = (start + BLOCK_SIZE as usize).min(info_bytes.len());
    Some(&info_bytes[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> PeerHandle {
        "10.0.0.1:1".parse().unwrap()
    }

    #[test]
    fn test_roundtrip_through_pieces() {
        // A real (tiny) info dict, served to ourselves in pieces.
        let meta = crate::storage::tests::test_metainfo(&[("a.bin", 1000)], 16384);
        let info_bytes = meta.info_bytes.clone();

        let mut dl = MetadataDownload::new(addr(), info_bytes.len() as u32).unwrap();
        let mut piece = 0;
        loop {
            let chunk = metadata_piece(&info_bytes, piece).unwrap();
            if dl.record_piece(piece, chunk).unwrap() {
                break;
            }
            piece += 1;
        }
        let parsed = dl.finish(meta.info_hash).unwrap();
        assert_eq!(parsed.info_hash, meta.info_hash);
        assert_eq!(parsed.total_length, 1000);
    }

    #[test]
    fn test_hash_mismatch_rejected() {
        let mut dl = MetadataDownload::new(addr(), 5).unwrap();
        assert!(dl.record_piece(0, b"junk!").unwrap());
        assert!(dl.finish(InfoHash::new([0; 20])).is_err());
    }

    #[test]
    fn test_bad_sizes() {
        assert!(MetadataDownload::new(addr(), 0).is_err());
        assert!(MetadataDownload::new(addr(), MAX_METADATA_SIZE + 1).is_err());

        let mut dl = MetadataDownload::new(addr(), 100).unwrap();
        assert!(dl.record_piece(1, b"x").is_err());
        assert!(dl.record_piece(0, b"short").is_err());
    }

    #[test]
    fn test_serving_slices() {
        let data = vec![7u8; 20_000];
        assert_eq!(metadata_piece(&data, 0).unwrap().len(), 16384);
        assert_eq!(metadata_piece(&data, 1).unwrap().len(), 20_000 - 16384);
        assert!(metadata_piece(&data, 2).is_none());
    }
}
