// In-progress pieces: a buffer per piece accumulating blocks until the
// piece is whole, at which point it goes off to be hashed.

use std::collections::{HashMap, HashSet};

use anyhow::bail;
use torq_core::lengths::{BlockInfo, Lengths, ValidPieceIndex};

use crate::type_aliases::{bf_with_bits, PeerHandle, BF};

/// Cap on concurrently buffered pieces. At the default piece sizes this
/// bounds buffer memory to a few hundred MB worst case.
pub const MAX_ACTIVE_PIECES: usize = 200;

struct ActivePiece {
    buf: Vec<u8>,
    received: BF,
    received_count: u32,
    /// Everyone who supplied a block; on hash failure they all take blame.
    contributors: HashSet<PeerHandle>,
}

pub enum BlockWrite {
    /// Block stored; the piece needs more.
    Accepted,
    /// This block was already present (endgame duplicates land here).
    AlreadyHave,
    /// The piece is complete; the buffer and its contributors are handed
    /// back, and the entry is gone.
    Completed {
        data: Vec<u8>,
        contributors: HashSet<PeerHandle>,
    },
}

#[derive(Default)]
pub struct ActivePieces {
    pieces: HashMap<u32, ActivePiece>,
}

impl ActivePieces {
    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn contains(&self, piece: ValidPieceIndex) -> bool {
        self.pieces.contains_key(&piece.get())
    }

    pub fn is_full(&self) -> bool {
        self.pieces.len() >= MAX_ACTIVE_PIECES
    }

    /// Store one received block.
    pub fn record_block(
        &mut self,
        lengths: &Lengths,
        block: &BlockInfo,
        data: &[u8],
        from: PeerHandle,
    ) -> anyhow::Result<BlockWrite> {
        if data.len() != block.size as usize {
            bail!(
                "block {}/{} has {} bytes, expected {}",
                block.piece_index,
                block.block_index,
                data.len(),
                block.size
            );
        }
        let piece = block.piece_index;
        let entry = self.pieces.entry(piece.get()).or_insert_with(|| ActivePiece {
            buf: vec![0u8; lengths.piece_length(piece) as usize],
            received: bf_with_bits(lengths.blocks_per_piece(piece) as usize),
            received_count: 0,
            contributors: HashSet::new(),
        });
        if entry.received[block.block_index as usize] {
            return Ok(BlockWrite::AlreadyHave);
        }
        let start = block.offset as usize;
        entry.buf[start..start + data.len()].copy_from_slice(data);
        entry.received.set(block.block_index as usize, true);
        entry.received_count += 1;
        entry.contributors.insert(from);

        if entry.received_count == lengths.blocks_per_piece(piece) {
            let entry = self.pieces.remove(&piece.get()).unwrap();
            return Ok(BlockWrite::Completed {
                data: entry.buf,
                contributors: entry.contributors,
            });
        }
        Ok(BlockWrite::Accepted)
    }

    /// Drop a buffered piece (hash failure, cancellation). Returns whether
    /// it existed.
    pub fn discard(&mut self, piece: ValidPieceIndex) -> bool {
        self.pieces.remove(&piece.get()).is_some()
    }

    /// Pick a piece to throw away when the table is full: fewest received
    /// blocks among pieces with nothing currently requested.
    pub fn eviction_candidate(
        &self,
        piece_has_inflight: impl Fn(u32) -> bool,
    ) -> Option<u32> {
        self.pieces
            .iter()
            .filter(|(piece, _)| !piece_has_inflight(**piece))
            .min_by_key(|(_, p)| p.received_count)
            .map(|(piece, _)| *piece)
    }
}
