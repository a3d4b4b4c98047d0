// Decides which block a peer should fetch next.
//
// Strategy per the classic client playbook: a few random pieces first so we
// have something to trade, rarest-first after that, sequential blocks
// within a piece, and duplicate requests for the last few blocks so one
// slow peer can't stall completion.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;
use torq_core::lengths::{BlockInfo, Lengths, ValidPieceIndex};

use crate::type_aliases::{bf_with_bits, BF};

/// How many pieces to grab at random before switching to rarest-first.
const RANDOM_FIRST_PIECES: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PiecePriority {
    Skip,
    #[default]
    Normal,
    High,
}

pub struct PiecePicker {
    lengths: Lengths,
    /// Verified pieces.
    have: BF,
    /// Per absolute block: received and buffered (or on disk).
    block_done: BF,
    /// Per absolute block: requested from some peer.
    block_inflight: BF,
    availability: Vec<u32>,
    priorities: Vec<PiecePriority>,
    /// Random per-torrent offset breaking index-order correlation between
    /// peers in the same swarm.
    rotation: u32,
    verified_count: u32,
}

impl PiecePicker {
    pub fn new(lengths: Lengths, have: BF) -> Self {
        let total_pieces = lengths.total_pieces();
        assert_eq!(have.len(), total_pieces as usize);
        let mut block_done = bf_with_bits(lengths.total_blocks() as usize);
        let mut verified_count = 0;
        for piece in have.iter_ones() {
            verified_count += 1;
            let piece = lengths.validate_piece_index(piece as u32).unwrap();
            for block in lengths.iter_block_infos(piece) {
                block_done.set(block.absolute_index as usize, true);
            }
        }
        Self {
            block_inflight: bf_with_bits(lengths.total_blocks() as usize),
            block_done,
            have,
            availability: vec![0; total_pieces as usize],
            priorities: vec![PiecePriority::Normal; total_pieces as usize],
            rotation: rand::thread_rng().gen_range(0..total_pieces),
            lengths,
            verified_count,
        }
    }

    pub fn have(&self) -> &BF {
        &self.have
    }

    pub fn have_count(&self) -> u32 {
        self.verified_count
    }

    pub fn is_complete(&self) -> bool {
        self.verified_count == self.lengths.total_pieces()
    }

    pub fn set_priority_range(&mut self, pieces: std::ops::Range<u32>, priority: PiecePriority) {
        for p in pieces {
            if let Some(slot) = self.priorities.get_mut(p as usize) {
                *slot = priority;
            }
        }
    }

    pub fn add_peer_bitfield(&mut self, bf: &BF) {
        for piece in bf.iter_ones().take(self.availability.len()) {
            self.availability[piece] += 1;
        }
    }

    pub fn remove_peer_bitfield(&mut self, bf: &BF) {
        for piece in bf.iter_ones().take(self.availability.len()) {
            self.availability[piece] = self.availability[piece].saturating_sub(1);
        }
    }

    pub fn inc_availability(&mut self, piece: ValidPieceIndex) {
        self.availability[piece.get() as usize] += 1;
    }

    /// Interest check: does the peer hold any piece we still want?
    pub fn peer_has_needed_piece(&self, bf: &BF) -> bool {
        bf.iter_ones().take(self.priorities.len()).any(|p| {
            !self.have[p] && self.priorities[p] != PiecePriority::Skip
        })
    }

    pub fn remaining_blocks(&self) -> u32 {
        self.lengths.total_blocks() - self.block_done.count_ones() as u32
    }

    /// Endgame: few enough blocks left that duplicate requests are worth
    /// the waste.
    pub fn is_endgame(&self) -> bool {
        let threshold = (self.lengths.total_blocks() / 200).max(1);
        let remaining = self.remaining_blocks();
        remaining > 0 && remaining < threshold
    }

    /// Pick up to `max` blocks for a peer holding `peer_bf`. Picked blocks
    /// are marked in-flight; the caller must hand them back through
    /// `release_block` if they are never delivered.
    ///
    /// `peer_inflight` (absolute block indices) stops endgame duplicates
    /// from being re-sent to the same peer.
    pub fn pick_blocks(
        &mut self,
        peer_bf: &BF,
        max: usize,
        peer_inflight: &HashSet<u32>,
    ) -> Vec<BlockInfo> {
        let mut out = Vec::new();
        if max == 0 {
            return out;
        }

        let mut candidates: Vec<u32> = (0..self.lengths.total_pieces())
            .filter(|&p| {
                peer_bf.get(p as usize).map(|b| *b).unwrap_or(false)
                    && !self.have[p as usize]
                    && self.priorities[p as usize] != PiecePriority::Skip
            })
            .collect();
        if candidates.is_empty() {
            return out;
        }

        let endgame = self.is_endgame();
        if self.verified_count < RANDOM_FIRST_PIECES && !endgame {
            candidates.shuffle(&mut rand::thread_rng());
        } else {
            let total = self.lengths.total_pieces();
            let rotation = self.rotation;
            candidates.sort_by_key(|&p| {
                let started = self.piece_started(p) && !endgame;
                (
                    std::cmp::Reverse(started),
                    std::cmp::Reverse(self.priorities[p as usize]),
                    self.availability[p as usize],
                    (p + total - rotation) % total,
                )
            });
        }

        for piece in candidates {
            let piece = self.lengths.validate_piece_index(piece).unwrap();
            for block in self.lengths.iter_block_infos(piece) {
                if out.len() >= max {
                    return out;
                }
                let idx = block.absolute_index as usize;
                if self.block_done[idx] {
                    continue;
                }
                if self.block_inflight[idx] && !endgame {
                    continue;
                }
                if endgame && peer_inflight.contains(&block.absolute_index) {
                    continue;
                }
                self.block_inflight.set(idx, true);
                out.push(block);
            }
        }
        out
    }

    /// Whether any block of this piece is currently requested. Used when
    /// choosing which buffered piece is safe to evict.
    pub fn piece_has_inflight(&self, piece: ValidPieceIndex) -> bool {
        self.lengths
            .iter_block_infos(piece)
            .any(|b| self.block_inflight[b.absolute_index as usize])
    }

    fn piece_started(&self, piece: u32) -> bool {
        let piece = match self.lengths.validate_piece_index(piece) {
            Some(p) => p,
            None => return false,
        };
        self.lengths.iter_block_infos(piece).any(|b| {
            self.block_done[b.absolute_index as usize]
                || self.block_inflight[b.absolute_index as usize]
        })
    }

    /// A block arrived and is buffered.
    pub fn mark_block_received(&mut self, block: &BlockInfo) {
        let idx = block.absolute_index as usize;
        self.block_done.set(idx, true);
        self.block_inflight.set(idx, false);
    }

    /// A request was cancelled, timed out, or its peer went away.
    pub fn release_block(&mut self, block: &BlockInfo) {
        let idx = block.absolute_index as usize;
        if !self.block_done[idx] {
            self.block_inflight.set(idx, false);
        }
    }

    pub fn mark_piece_verified(&mut self, piece: ValidPieceIndex) {
        if !self.have[piece.get() as usize] {
            self.have.set(piece.get() as usize, true);
            self.verified_count += 1;
        }
    }

    /// Verification failed, or the buffered piece was evicted: its blocks
    /// are needed again.
    pub fn mark_piece_failed(&mut self, piece: ValidPieceIndex) {
        for block in self.lengths.iter_block_infos(piece) {
            self.block_done.set(block.absolute_index as usize, false);
            self.block_inflight.set(block.absolute_index as usize, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lengths() -> Lengths {
        // 10 pieces of 2 blocks, last piece 1 block.
        Lengths::new(16384 * 19, 16384 * 2).unwrap()
    }

    fn full_bf(l: &Lengths) -> BF {
        let mut bf = bf_with_bits(l.total_pieces() as usize);
        bf.fill(true);
        bf
    }

    fn picker_past_random_first(l: Lengths) -> PiecePicker {
        let mut have = bf_with_bits(l.total_pieces() as usize);
        for p in 0..RANDOM_FIRST_PIECES {
            have.set(p as usize, true);
        }
        PiecePicker::new(l, have)
    }

    #[test]
    fn test_sequential_blocks_within_piece() {
        let l = lengths();
        let mut picker = picker_past_random_first(l);
        let peer = full_bf(&l);
        let picked = picker.pick_blocks(&peer, 2, &HashSet::new());
        assert_eq!(picked.len(), 2);
        // Both blocks of one piece, in offset order.
        assert_eq!(picked[0].piece_index, picked[1].piece_index);
        assert_eq!(picked[0].offset, 0);
        assert_eq!(picked[1].offset, 16384);
    }

    #[test]
    fn test_no_duplicate_requests_outside_endgame() {
        let l = lengths();
        let mut picker = picker_past_random_first(l);
        let peer = full_bf(&l);
        let first = picker.pick_blocks(&peer, 100, &HashSet::new());
        let second = picker.pick_blocks(&peer, 100, &HashSet::new());
        // Everything pickable went out the first time.
        assert_eq!(first.len(), (l.total_blocks() - 8) as usize);
        assert!(second.is_empty());
    }

    #[test]
    fn test_rarest_first() {
        let l = lengths();
        let mut picker = picker_past_random_first(l);
        let peer = full_bf(&l);
        // Everyone has everything except piece 7, which only our peer has.
        for _ in 0..3 {
            let mut others = full_bf(&l);
            others.set(7, false);
            picker.add_peer_bitfield(&others);
        }
        picker.add_peer_bitfield(&peer);
        let picked = picker.pick_blocks(&peer, 1, &HashSet::new());
        assert_eq!(picked[0].piece_index.get(), 7);
    }

    #[test]
    fn test_priorities() {
        let l = lengths();
        let mut picker = picker_past_random_first(l);
        let peer = full_bf(&l);
        picker.add_peer_bitfield(&peer);
        picker.set_priority_range(0..9, PiecePriority::Skip);
        picker.set_priority_range(8..9, PiecePriority::High);
        // 8 is High, 9 is Normal, everything else is skipped.
        let picked = picker.pick_blocks(&peer, 1, &HashSet::new());
        assert_eq!(picked[0].piece_index.get(), 8);
        let picked = picker.pick_blocks(&peer, 10, &HashSet::new());
        assert!(picked.iter().all(|b| b.piece_index.get() >= 8));

        // A peer holding only skipped pieces is not interesting.
        let mut only_skipped = bf_with_bits(l.total_pieces() as usize);
        only_skipped.set(0, true);
        assert!(!picker.peer_has_needed_piece(&only_skipped));
        assert!(picker.peer_has_needed_piece(&peer));
    }

    #[test]
    fn test_started_piece_finished_first() {
        let l = lengths();
        let mut picker = picker_past_random_first(l);
        let peer = full_bf(&l);
        let first = picker.pick_blocks(&peer, 1, &HashSet::new());
        let started = first[0].piece_index;
        // Make the started piece the most common one: rarest-first alone
        // would now prefer any other piece, but started pieces win.
        let mut others = bf_with_bits(l.total_pieces() as usize);
        others.set(started.get() as usize, true);
        picker.add_peer_bitfield(&others);
        let next = picker.pick_blocks(&peer, 1, &HashSet::new());
        assert_eq!(next[0].piece_index, started);
        assert_eq!(next[0].offset, 16384);
    }

    #[test]
    fn test_release_and_reissue() {
        let l = lengths();
        let mut picker = picker_past_random_first(l);
        let peer = full_bf(&l);
        let block = picker.pick_blocks(&peer, 1, &HashSet::new())[0];
        picker.release_block(&block);
        let again = picker.pick_blocks(&peer, 1, &HashSet::new())[0];
        assert_eq!(block, again);
    }

    #[test]
    fn test_piece_failure_reissues_blocks() {
        let l = lengths();
        let mut picker = picker_past_random_first(l);
        let peer = full_bf(&l);
        let blocks = picker.pick_blocks(&peer, 2, &HashSet::new());
        let piece = blocks[0].piece_index;
        for b in &blocks {
            picker.mark_block_received(b);
        }
        picker.mark_piece_failed(piece);
        let again = picker.pick_blocks(&peer, 100, &HashSet::new());
        assert!(again.iter().filter(|b| b.piece_index == piece).count() == 2);
    }

    #[test]
    fn test_endgame_duplicates() {
        let l = lengths();
        let mut have = bf_with_bits(l.total_pieces() as usize);
        have.fill(true);
        have.set(9, false);
        let mut picker = PiecePicker::new(l, have);
        let peer = full_bf(&l);

        // 19 blocks total, threshold = max(1, 19/200) = 1: endgame only
        // when nothing is left, so force it by receiving... nothing: with
        // one block remaining and it in flight, a second peer may still
        // pick it once endgame is on.
        let first_peer_pick = picker.pick_blocks(&peer, 10, &HashSet::new());
        assert_eq!(first_peer_pick.len(), 1);
        assert!(!picker.is_endgame(), "threshold 1 means no endgame here");

        // With a bigger threshold the same situation allows duplicates.
        let l = Lengths::new(16384 * 400, 16384).unwrap();
        let mut have = bf_with_bits(l.total_pieces() as usize);
        have.fill(true);
        have.set(399, false);
        let mut picker = PiecePicker::new(l, have);
        let mut peer = bf_with_bits(l.total_pieces() as usize);
        peer.fill(true);

        assert!(picker.is_endgame());
        let p1 = picker.pick_blocks(&peer, 10, &HashSet::new());
        assert_eq!(p1.len(), 1);
        // Same block again for a different peer.
        let p2 = picker.pick_blocks(&peer, 10, &HashSet::new());
        assert_eq!(p2, p1);
        // But not for a peer that already has it in flight.
        let inflight: HashSet<u32> = p1.iter().map(|b| b.absolute_index).collect();
        assert!(picker.pick_blocks(&peer, 10, &inflight).is_empty());
    }

    #[test]
    fn test_endgame_never_activates_early() {
        let l = Lengths::new(16384 * 400, 16384).unwrap();
        let have = bf_with_bits(l.total_pieces() as usize);
        let mut picker = PiecePicker::new(l, have);
        assert!(!picker.is_endgame());
        // Receive all but 2 blocks.
        let mut peer = bf_with_bits(l.total_pieces() as usize);
        peer.fill(true);
        let blocks = picker.pick_blocks(&peer, 398, &HashSet::new());
        for b in &blocks {
            picker.mark_block_received(b);
        }
        assert_eq!(picker.remaining_blocks(), 2);
        assert!(!picker.is_endgame(), "2 = threshold, strictly-less required");
        let blocks = picker.pick_blocks(&peer, 1, &HashSet::new());
        picker.mark_block_received(&blocks[0]);
        assert!(picker.is_endgame());
    }
}
