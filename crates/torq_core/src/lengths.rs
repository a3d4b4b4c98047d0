use crate::constants::BLOCK_SIZE;

/// Size of the last element when packing `total` bytes into `element`-sized
/// cells.
pub fn last_element_size(total: u64, element: u64) -> u64 {
    let rem = total % element;
    if rem == 0 { element } else { rem }
}

/// A piece index that has been checked against the torrent's piece count.
/// Everything past the wire boundary works with these, so out-of-range
/// indices can only exist inside validation code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValidPieceIndex(u32);

impl ValidPieceIndex {
    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated (piece, block) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub piece_index: ValidPieceIndex,
    /// Index of the block within its piece.
    pub block_index: u32,
    /// Index of the block if blocks of all pieces were numbered
    /// consecutively.
    pub absolute_index: u32,
    /// Byte offset within the piece.
    pub offset: u32,
    pub size: u32,
}

/// All the derived arithmetic for a torrent's piece space.
#[derive(Debug, Clone, Copy)]
pub struct Lengths {
    total_length: u64,
    piece_length: u32,
    last_piece_id: u32,
    last_piece_length: u32,
    blocks_per_piece: u32,
}

impl Lengths {
    pub fn new(total_length: u64, piece_length: u32) -> anyhow::Result<Self> {
        if total_length == 0 {
            anyhow::bail!("torrent with zero length has no pieces");
        }
        if piece_length == 0 {
            anyhow::bail!("piece length cannot be zero");
        }
        let total_pieces = total_length.div_ceil(piece_length as u64) as u32;
        Ok(Self {
            total_length,
            piece_length,
            last_piece_id: total_pieces - 1,
            last_piece_length: last_element_size(total_length, piece_length as u64) as u32,
            blocks_per_piece: piece_length.div_ceil(BLOCK_SIZE),
        })
    }

    pub const fn total_length(&self) -> u64 {
        self.total_length
    }

    pub const fn default_piece_length(&self) -> u32 {
        self.piece_length
    }

    pub const fn total_pieces(&self) -> u32 {
        self.last_piece_id + 1
    }

    pub const fn last_piece_id(&self) -> ValidPieceIndex {
        ValidPieceIndex(self.last_piece_id)
    }

    pub const fn validate_piece_index(&self, index: u32) -> Option<ValidPieceIndex> {
        if index > self.last_piece_id {
            return None;
        }
        Some(ValidPieceIndex(index))
    }

    pub const fn piece_length(&self, index: ValidPieceIndex) -> u32 {
        if index.0 == self.last_piece_id {
            return self.last_piece_length;
        }
        self.piece_length
    }

    pub const fn piece_offset(&self, index: ValidPieceIndex) -> u64 {
        index.0 as u64 * self.piece_length as u64
    }

    pub const fn default_blocks_per_piece(&self) -> u32 {
        self.blocks_per_piece
    }

    pub const fn blocks_per_piece(&self, index: ValidPieceIndex) -> u32 {
        if index.0 == self.last_piece_id {
            return self.last_piece_length.div_ceil(BLOCK_SIZE);
        }
        self.blocks_per_piece
    }

    pub const fn total_blocks(&self) -> u32 {
        self.last_piece_id * self.blocks_per_piece + self.blocks_per_piece(self.last_piece_id())
    }

    pub const fn piece_bitfield_bytes(&self) -> usize {
        self.total_pieces().div_ceil(8) as usize
    }

    pub fn block_size(&self, piece: ValidPieceIndex, block_index: u32) -> Option<u32> {
        let piece_length = self.piece_length(piece);
        let last_block = piece_length.div_ceil(BLOCK_SIZE) - 1;
        match block_index {
            b if b < last_block => Some(BLOCK_SIZE),
            b if b == last_block => Some(last_element_size(piece_length as u64, BLOCK_SIZE as u64) as u32),
            _ => None,
        }
    }

    fn block_info(&self, piece: ValidPieceIndex, block_index: u32) -> Option<BlockInfo> {
        let size = self.block_size(piece, block_index)?;
        Some(BlockInfo {
            piece_index: piece,
            block_index,
            absolute_index: piece.0 * self.blocks_per_piece + block_index,
            offset: block_index * BLOCK_SIZE,
            size,
        })
    }

    /// Validate a (index, begin, length) triple from a REQUEST/PIECE/CANCEL
    /// payload. Only block-aligned, exactly-sized addresses are accepted.
    pub fn block_info_from_wire(
        &self,
        piece_index: u32,
        begin: u32,
        len: u32,
    ) -> Option<BlockInfo> {
        let piece = self.validate_piece_index(piece_index)?;
        if begin % BLOCK_SIZE != 0 {
            return None;
        }
        let info = self.block_info(piece, begin / BLOCK_SIZE)?;
        if info.size != len {
            return None;
        }
        Some(info)
    }

    pub fn iter_block_infos(
        &self,
        piece: ValidPieceIndex,
    ) -> impl Iterator<Item = BlockInfo> + '_ {
        (0..self.blocks_per_piece(piece)).map(move |b| self.block_info(piece, b).unwrap())
    }

    pub fn iter_piece_lengths(&self) -> impl Iterator<Item = (ValidPieceIndex, u32)> + '_ {
        (0..self.total_pieces()).map(move |i| {
            let p = ValidPieceIndex(i);
            (p, self.piece_length(p))
        })
    }

    /// Pieces overlapping the byte range `[offset, offset + len)`, clamped
    /// to the torrent. Used to map files to pieces.
    pub fn pieces_within(&self, offset: u64, len: u64) -> std::ops::Range<u32> {
        let offset = offset.min(self.total_length);
        let end = (offset + len).min(self.total_length);
        let start_piece = (offset / self.piece_length as u64) as u32;
        let end_piece = if end == offset {
            start_piece
        } else {
            end.div_ceil(self.piece_length as u64) as u32
        };
        start_piece..end_piece
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_counts() {
        let l = Lengths::new(130_072, 65_536).unwrap();
        assert_eq!(l.total_pieces(), 2);
        assert_eq!(l.piece_length(l.validate_piece_index(0).unwrap()), 65_536);
        assert_eq!(l.piece_length(l.last_piece_id()), 64_536);
        assert!(l.validate_piece_index(2).is_none());
    }

    #[test]
    fn test_block_counts() {
        // ceil(P / 16384) blocks per piece, truncated final block.
        let l = Lengths::new(100_000, 50_000).unwrap();
        let p0 = l.validate_piece_index(0).unwrap();
        assert_eq!(l.blocks_per_piece(p0), 4);
        assert_eq!(l.block_size(p0, 0), Some(16384));
        assert_eq!(l.block_size(p0, 2), Some(16384));
        assert_eq!(l.block_size(p0, 3), Some(50_000 - 3 * 16384));
        assert_eq!(l.block_size(p0, 4), None);
        assert_eq!(l.total_blocks(), 8);
    }

    #[test]
    fn test_tiny_torrent_single_piece() {
        // Total size under one block: exactly one piece of that size.
        let l = Lengths::new(1000, 16384).unwrap();
        assert_eq!(l.total_pieces(), 1);
        assert_eq!(l.piece_length(l.last_piece_id()), 1000);
        assert_eq!(l.total_blocks(), 1);
        assert_eq!(l.block_size(l.last_piece_id(), 0), Some(1000));
    }

    #[test]
    fn test_block_info_from_wire() {
        let l = Lengths::new(65_536 * 4, 65_536).unwrap();
        let ok = l.block_info_from_wire(1, 16384, 16384).unwrap();
        assert_eq!(ok.piece_index.get(), 1);
        assert_eq!(ok.block_index, 1);
        assert_eq!(ok.absolute_index, 5);
        assert_eq!(ok.offset, 16384);

        // wrong piece
        assert!(l.block_info_from_wire(4, 0, 16384).is_none());
        // unaligned offset
        assert!(l.block_info_from_wire(0, 1, 16384).is_none());
        // wrong size
        assert!(l.block_info_from_wire(0, 0, 16000).is_none());
        // offset beyond the piece
        assert!(l.block_info_from_wire(0, 65_536, 16384).is_none());
    }

    #[test]
    fn test_last_block_formula() {
        // last block length == P - 16384 * floor((P - 1) / 16384)
        for p in [16384u32, 16385, 30_000, 32_768, 100_000] {
            let l = Lengths::new(p as u64, p).unwrap();
            let last = l.blocks_per_piece(l.last_piece_id()) - 1;
            let expected = p - 16384 * ((p - 1) / 16384);
            assert_eq!(l.block_size(l.last_piece_id(), last), Some(expected));
        }
    }

    #[test]
    fn test_iter_block_infos() {
        let l = Lengths::new(40_000, 20_000).unwrap();
        let p1 = l.validate_piece_index(1).unwrap();
        let infos: Vec<_> = l.iter_block_infos(p1).collect();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].offset, 0);
        assert_eq!(infos[0].size, 16384);
        assert_eq!(infos[0].absolute_index, 2);
        assert_eq!(infos[1].offset, 16384);
        assert_eq!(infos[1].size, 20_000 - 16384);
    }

    #[test]
    fn test_pieces_within() {
        let l = Lengths::new(21, 10).unwrap();
        assert_eq!(l.pieces_within(0, 5), 0..1);
        assert_eq!(l.pieces_within(0, 11), 0..2);
        assert_eq!(l.pieces_within(10, 0), 1..1);
        assert_eq!(l.pieces_within(5, 16), 0..3);
        assert_eq!(l.pieces_within(20, 1000), 2..3);
        assert_eq!(l.pieces_within(21, 1), 2..2);
    }

    #[test]
    fn test_zero_rejected() {
        assert!(Lengths::new(0, 16384).is_err());
        assert!(Lengths::new(100, 0).is_err());
    }
}
