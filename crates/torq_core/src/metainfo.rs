use std::path::PathBuf;

use anyhow::Context;
use bencode::Value;
use bytes::Bytes;
use sha1w::sha1;

use crate::hash_id::InfoHash;
use crate::lengths::Lengths;

/// One file of the torrent, at its offset in the concatenated piece space.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path relative to the torrent output directory.
    pub relative_path: PathBuf,
    pub length: u64,
    pub offset: u64,
}

/// Parsed torrent metadata. Immutable once built, whether it came from a
/// .torrent file or was assembled over ut_metadata.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    /// N * 20 bytes of piece hashes.
    pieces: Bytes,
    pub total_length: u64,
    pub files: Vec<FileEntry>,
    /// Announce URLs as a list of tiers.
    pub trackers: Vec<Vec<String>>,
    /// The raw bencoded info dict, kept around for serving ut_metadata.
    pub info_bytes: Bytes,
}

impl Metainfo {
    /// Parse a whole .torrent file.
    pub fn parse(buf: &[u8]) -> anyhow::Result<Self> {
        let (root, info_span) =
            bencode::decode_with_info_span(buf).context("error decoding torrent file")?;
        let info_span = info_span.context("torrent file has no info dict")?;
        let info_bytes = &buf[info_span];
        let info = root.get(b"info").context("torrent file has no info dict")?;

        let mut m = Self::from_info_value(info, info_bytes)?;
        m.trackers = parse_trackers(&root);
        Ok(m)
    }

    /// Parse a raw info dict, e.g. one assembled from ut_metadata pieces.
    /// The info-hash is the SHA-1 of exactly these bytes.
    pub fn parse_info_dict(info_bytes: &[u8]) -> anyhow::Result<Self> {
        let info = bencode::decode(info_bytes).context("error decoding info dict")?;
        Self::from_info_value(&info, info_bytes)
    }

    fn from_info_value(info: &Value<'_>, info_bytes: &[u8]) -> anyhow::Result<Self> {
        let name = info
            .get_str(b"name")
            .map(sanitize_path_component)
            .transpose()?
            .unwrap_or_else(|| "torrent-content".to_string());

        let piece_length: u32 = info
            .get_int(b"piece length")
            .context("info dict has no piece length")?
            .try_into()
            .context("piece length out of range")?;

        let pieces = info.get_bytes(b"pieces").context("info dict has no pieces")?;
        if pieces.len() % 20 != 0 {
            anyhow::bail!("pieces length {} is not a multiple of 20", pieces.len());
        }

        let mut files = Vec::new();
        let mut offset = 0u64;
        match (info.get_int(b"length"), info.get(b"files")) {
            // Single-file torrent: the file is named after the torrent.
            (Some(length), None) => {
                let length: u64 = length.try_into().context("negative file length")?;
                files.push(FileEntry {
                    relative_path: PathBuf::from(&name),
                    length,
                    offset: 0,
                });
                offset = length;
            }
            (None, Some(list)) => {
                let list = list.as_list().context("files is not a list")?;
                if list.is_empty() {
                    anyhow::bail!("multi-file torrent with no files");
                }
                for entry in list {
                    let length: u64 = entry
                        .get_int(b"length")
                        .context("file entry has no length")?
                        .try_into()
                        .context("negative file length")?;
                    let path_parts = entry
                        .get(b"path")
                        .and_then(Value::as_list)
                        .context("file entry has no path")?;
                    let mut relative_path = PathBuf::from(&name);
                    for part in path_parts {
                        let part = part.as_str().context("file path part is not UTF-8")?;
                        relative_path.push(sanitize_path_component(part)?);
                    }
                    files.push(FileEntry {
                        relative_path,
                        length,
                        offset,
                    });
                    offset += length;
                }
            }
            _ => anyhow::bail!("torrent must be either single-file or multi-file"),
        }

        let total_length = offset;
        let piece_count = total_length.div_ceil(piece_length.max(1) as u64);
        if total_length > 0 && pieces.len() as u64 / 20 != piece_count {
            anyhow::bail!(
                "expected {} piece hashes, got {}",
                piece_count,
                pieces.len() / 20
            );
        }

        Ok(Metainfo {
            info_hash: InfoHash::new(sha1(info_bytes)),
            name,
            piece_length,
            pieces: Bytes::copy_from_slice(pieces),
            total_length,
            files,
            trackers: Vec::new(),
            info_bytes: Bytes::copy_from_slice(info_bytes),
        })
    }

    pub fn total_pieces(&self) -> u32 {
        (self.pieces.len() / 20) as u32
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8]> {
        let start = index as usize * 20;
        self.pieces.get(start..start + 20)
    }

    pub fn lengths(&self) -> anyhow::Result<Lengths> {
        Lengths::new(self.total_length, self.piece_length)
    }
}

fn parse_trackers(root: &Value<'_>) -> Vec<Vec<String>> {
    let mut tiers: Vec<Vec<String>> = Vec::new();
    if let Some(list) = root.get(b"announce-list").and_then(Value::as_list) {
        for tier in list {
            let Some(tier) = tier.as_list() else { continue };
            let urls: Vec<String> = tier
                .iter()
                .filter_map(|u| u.as_str())
                .map(str::to_owned)
                .collect();
            if !urls.is_empty() {
                tiers.push(urls);
            }
        }
    }
    if tiers.is_empty() {
        if let Some(announce) = root.get_str(b"announce") {
            tiers.push(vec![announce.to_owned()]);
        }
    }
    tiers
}

fn sanitize_path_component(part: &str) -> anyhow::Result<String> {
    if part.is_empty() || part == "." || part == ".." {
        anyhow::bail!("suspicious path component {part:?}");
    }
    if part.contains('/') || part.contains('\\') || part.contains('\0') {
        anyhow::bail!("separator inside path component {part:?}");
    }
    Ok(part.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bencode::OwnedValue;
    use std::collections::BTreeMap;

    fn single_file_torrent(name: &str, length: u64, piece_length: u32) -> Vec<u8> {
        let piece_count = length.div_ceil(piece_length as u64);
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), OwnedValue::str(name));
        info.insert(b"length".to_vec(), OwnedValue::Int(length as i64));
        info.insert(
            b"piece length".to_vec(),
            OwnedValue::Int(piece_length as i64),
        );
        info.insert(
            b"pieces".to_vec(),
            OwnedValue::Bytes(vec![0xab; piece_count as usize * 20]),
        );
        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            OwnedValue::str("http://tracker.example/announce"),
        );
        root.insert(b"info".to_vec(), OwnedValue::Dict(info));
        OwnedValue::Dict(root).encode()
    }

    #[test]
    fn test_parse_single_file() {
        let buf = single_file_torrent("a.bin", 100_000, 65_536);
        let m = Metainfo::parse(&buf).unwrap();
        assert_eq!(m.name, "a.bin");
        assert_eq!(m.total_length, 100_000);
        assert_eq!(m.total_pieces(), 2);
        assert_eq!(m.files.len(), 1);
        assert_eq!(m.files[0].relative_path, PathBuf::from("a.bin"));
        assert_eq!(
            m.trackers,
            vec![vec!["http://tracker.example/announce".to_string()]]
        );
        // info-hash covers exactly the info dict bytes
        assert_eq!(m.info_hash.0, sha1(&m.info_bytes));
        // reparsing the kept info bytes yields the same identity
        let again = Metainfo::parse_info_dict(&m.info_bytes).unwrap();
        assert_eq!(again.info_hash, m.info_hash);
    }

    #[test]
    fn test_parse_multi_file() {
        let mut f1 = BTreeMap::new();
        f1.insert(b"length".to_vec(), OwnedValue::Int(100_000));
        f1.insert(
            b"path".to_vec(),
            OwnedValue::List(vec![OwnedValue::str("a.bin")]),
        );
        let mut f2 = BTreeMap::new();
        f2.insert(b"length".to_vec(), OwnedValue::Int(30_072));
        f2.insert(
            b"path".to_vec(),
            OwnedValue::List(vec![OwnedValue::str("sub"), OwnedValue::str("b.bin")]),
        );
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), OwnedValue::str("pack"));
        info.insert(b"piece length".to_vec(), OwnedValue::Int(65_536));
        info.insert(
            b"files".to_vec(),
            OwnedValue::List(vec![OwnedValue::Dict(f1), OwnedValue::Dict(f2)]),
        );
        info.insert(b"pieces".to_vec(), OwnedValue::Bytes(vec![0u8; 2 * 20]));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), OwnedValue::Dict(info));
        let buf = OwnedValue::Dict(root).encode();

        let m = Metainfo::parse(&buf).unwrap();
        assert_eq!(m.total_length, 130_072);
        assert_eq!(m.files.len(), 2);
        assert_eq!(m.files[0].offset, 0);
        assert_eq!(m.files[1].offset, 100_000);
        assert_eq!(m.files[1].relative_path, PathBuf::from("pack/sub/b.bin"));
    }

    #[test]
    fn test_path_traversal_rejected() {
        let mut f1 = BTreeMap::new();
        f1.insert(b"length".to_vec(), OwnedValue::Int(10));
        f1.insert(
            b"path".to_vec(),
            OwnedValue::List(vec![OwnedValue::str(".."), OwnedValue::str("evil")]),
        );
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), OwnedValue::str("pack"));
        info.insert(b"piece length".to_vec(), OwnedValue::Int(16384));
        info.insert(b"files".to_vec(), OwnedValue::List(vec![OwnedValue::Dict(f1)]));
        info.insert(b"pieces".to_vec(), OwnedValue::Bytes(vec![0u8; 20]));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), OwnedValue::Dict(info));
        assert!(Metainfo::parse(&OwnedValue::Dict(root).encode()).is_err());
    }

    #[test]
    fn test_zero_length_accepted() {
        // A zero-byte single-file torrent is a valid (if useless) artifact.
        let buf = single_file_torrent("empty.bin", 0, 16384);
        let m = Metainfo::parse(&buf).unwrap();
        assert_eq!(m.total_length, 0);
        assert_eq!(m.total_pieces(), 0);
        assert!(m.lengths().is_err());
    }

    #[test]
    fn test_announce_list_tiers() {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), OwnedValue::str("x"));
        info.insert(b"length".to_vec(), OwnedValue::Int(16384));
        info.insert(b"piece length".to_vec(), OwnedValue::Int(16384));
        info.insert(b"pieces".to_vec(), OwnedValue::Bytes(vec![0u8; 20]));
        let mut root = BTreeMap::new();
        root.insert(b"announce".to_vec(), OwnedValue::str("http://a/"));
        root.insert(
            b"announce-list".to_vec(),
            OwnedValue::List(vec![
                OwnedValue::List(vec![OwnedValue::str("udp://t1/"), OwnedValue::str("udp://t2/")]),
                OwnedValue::List(vec![OwnedValue::str("http://b/")]),
            ]),
        );
        root.insert(b"info".to_vec(), OwnedValue::Dict(info));
        let m = Metainfo::parse(&OwnedValue::Dict(root).encode()).unwrap();
        assert_eq!(
            m.trackers,
            vec![
                vec!["udp://t1/".to_string(), "udp://t2/".to_string()],
                vec!["http://b/".to_string()]
            ]
        );
    }
}
