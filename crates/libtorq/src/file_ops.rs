// Translation between the piece address space and the file list.

use anyhow::{bail, Context};
use sha1w::{ISha1, Sha1};
use torq_core::lengths::{Lengths, ValidPieceIndex};
use torq_core::metainfo::Metainfo;

use crate::storage::TorrentStorage;

/// One file's share of a contiguous byte range in the piece space.
#[derive(Debug, PartialEq, Eq)]
struct FileSpan {
    file_id: usize,
    offset_in_file: u64,
    /// Offset of this span within the requested range.
    buf_offset: usize,
    len: usize,
}

pub struct FileOps<'a> {
    meta: &'a Metainfo,
    lengths: &'a Lengths,
    storage: &'a dyn TorrentStorage,
}

impl<'a> FileOps<'a> {
    pub fn new(meta: &'a Metainfo, lengths: &'a Lengths, storage: &'a dyn TorrentStorage) -> Self {
        Self {
            meta,
            lengths,
            storage,
        }
    }

    fn spans(&self, abs_offset: u64, len: usize) -> anyhow::Result<Vec<FileSpan>> {
        let abs_end = abs_offset + len as u64;
        if abs_end > self.lengths.total_length() {
            bail!(
                "range {}..{} outside torrent of {} bytes",
                abs_offset,
                abs_end,
                self.lengths.total_length()
            );
        }
        let mut spans = Vec::new();
        for (file_id, file) in self.meta.files.iter().enumerate() {
            let file_end = file.offset + file.length;
            let start = abs_offset.max(file.offset);
            let end = abs_end.min(file_end);
            if start >= end {
                continue;
            }
            spans.push(FileSpan {
                file_id,
                offset_in_file: start - file.offset,
                buf_offset: (start - abs_offset) as usize,
                len: (end - start) as usize,
            });
        }
        Ok(spans)
    }

    /// Write a fully verified piece across the files it overlaps.
    pub fn write_piece(&self, piece: ValidPieceIndex, data: &[u8]) -> anyhow::Result<()> {
        let expected = self.lengths.piece_length(piece) as usize;
        if data.len() != expected {
            bail!(
                "piece {piece} has {} bytes, expected {expected}",
                data.len()
            );
        }
        for span in self.spans(self.lengths.piece_offset(piece), data.len())? {
            self.storage
                .pwrite_all(
                    span.file_id,
                    span.offset_in_file,
                    &data[span.buf_offset..span.buf_offset + span.len],
                )
                .with_context(|| format!("error writing piece {piece}"))?;
        }
        Ok(())
    }

    /// Read part of a piece; only valid for verified pieces.
    pub fn read_piece_range(
        &self,
        piece: ValidPieceIndex,
        offset: u32,
        buf: &mut [u8],
    ) -> anyhow::Result<()> {
        let piece_len = self.lengths.piece_length(piece) as u64;
        if offset as u64 + buf.len() as u64 > piece_len {
            bail!(
                "read of {} bytes at {offset} exceeds piece {piece} of {piece_len} bytes",
                buf.len()
            );
        }
        let abs = self.lengths.piece_offset(piece) + offset as u64;
        for span in self.spans(abs, buf.len())? {
            self.storage
                .pread_exact(
                    span.file_id,
                    span.offset_in_file,
                    &mut buf[span.buf_offset..span.buf_offset + span.len],
                )
                .with_context(|| format!("error reading piece {piece}"))?;
        }
        Ok(())
    }

    /// Read and hash a piece, comparing against the metainfo hash table.
    pub fn check_piece(&self, piece: ValidPieceIndex) -> anyhow::Result<bool> {
        let len = self.lengths.piece_length(piece) as usize;
        let mut buf = vec![0u8; len];
        self.read_piece_range(piece, 0, &mut buf)?;
        let mut hasher = Sha1::new();
        hasher.update(&buf);
        let digest = hasher.finish();
        Ok(self.meta.piece_hash(piece.get()) == Some(&digest[..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FilesystemStorage;
    use bencode::OwnedValue;
    use std::collections::BTreeMap;

    fn metainfo_with_hashes(files: &[(&str, u64)], piece_length: u32, data: &[u8]) -> Metainfo {
        let total: u64 = files.iter().map(|(_, l)| l).sum();
        assert_eq!(total as usize, data.len());
        let mut pieces = Vec::new();
        for chunk in data.chunks(piece_length as usize) {
            pieces.extend_from_slice(&sha1w::sha1(chunk));
        }
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), OwnedValue::str("t"));
        info.insert(
            b"piece length".to_vec(),
            OwnedValue::Int(piece_length as i64),
        );
        info.insert(b"pieces".to_vec(), OwnedValue::Bytes(pieces));
        let entries = files
            .iter()
            .map(|(name, len)| {
                let mut f = BTreeMap::new();
                f.insert(b"length".to_vec(), OwnedValue::Int(*len as i64));
                f.insert(
                    b"path".to_vec(),
                    OwnedValue::List(vec![OwnedValue::str(name)]),
                );
                OwnedValue::Dict(f)
            })
            .collect();
        info.insert(b"files".to_vec(), OwnedValue::List(entries));
        Metainfo::parse_info_dict(&OwnedValue::Dict(info).encode()).unwrap()
    }

    #[test]
    fn test_write_read_check_across_file_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..60u32).flat_map(|i| i.to_le_bytes()).collect(); // 240 bytes
        let meta = metainfo_with_hashes(&[("a.bin", 100), ("b.bin", 140)], 64, &data);
        let lengths = meta.lengths().unwrap();
        let storage = FilesystemStorage::new(dir.path(), &meta);
        storage.init().unwrap();
        let ops = FileOps::new(&meta, &lengths, &storage);

        for (idx, chunk) in data.chunks(64).enumerate() {
            let piece = lengths.validate_piece_index(idx as u32).unwrap();
            ops.write_piece(piece, chunk).unwrap();
        }

        // Piece 1 (bytes 64..128) straddles the a.bin/b.bin boundary.
        let piece1 = lengths.validate_piece_index(1).unwrap();
        let mut buf = vec![0u8; 64];
        ops.read_piece_range(piece1, 0, &mut buf).unwrap();
        assert_eq!(&buf, &data[64..128]);

        for idx in 0..lengths.total_pieces() {
            let piece = lengths.validate_piece_index(idx).unwrap();
            assert!(ops.check_piece(piece).unwrap(), "piece {idx}");
        }

        // Corrupt a byte on disk: the check notices.
        storage.pwrite_all(1, 3, &[0xEE]).unwrap();
        assert!(!ops.check_piece(piece1).unwrap());
    }

    #[test]
    fn test_out_of_range_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![7u8; 100];
        let meta = metainfo_with_hashes(&[("a.bin", 100)], 64, &data);
        let lengths = meta.lengths().unwrap();
        let storage = FilesystemStorage::new(dir.path(), &meta);
        storage.init().unwrap();
        let ops = FileOps::new(&meta, &lengths, &storage);

        let last = lengths.last_piece_id();
        // Last piece is 36 bytes; a full-size write must be refused.
        assert!(ops.write_piece(last, &data[..64]).is_err());
        let mut buf = vec![0u8; 64];
        assert!(ops.read_piece_range(last, 0, &mut buf).is_err());
    }
}
