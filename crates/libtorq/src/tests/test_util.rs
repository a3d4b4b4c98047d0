use std::collections::BTreeMap;
use std::path::Path;

use bencode::OwnedValue;
use rand::{Rng, SeedableRng};

/// Deterministic pseudo-random file content.
pub fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut out = vec![0u8; len];
    rng.fill(&mut out[..]);
    out
}

/// Build a complete multi-file .torrent for the given content and write
/// the data files where a seeding session will find them.
pub fn make_torrent_on_disk(
    seeder_output_dir: &Path,
    name: &str,
    files: &[(&str, &[u8])],
    piece_length: u32,
) -> Vec<u8> {
    let content_dir = seeder_output_dir.join(name);
    std::fs::create_dir_all(&content_dir).unwrap();
    let mut all = Vec::new();
    for (file_name, data) in files {
        std::fs::write(content_dir.join(file_name), data).unwrap();
        all.extend_from_slice(data);
    }

    let mut pieces = Vec::new();
    for chunk in all.chunks(piece_length as usize) {
        pieces.extend_from_slice(&sha1w::sha1(chunk));
    }

    let mut info = BTreeMap::new();
    info.insert(b"name".to_vec(), OwnedValue::str(name));
    info.insert(
        b"piece length".to_vec(),
        OwnedValue::Int(piece_length as i64),
    );
    info.insert(b"pieces".to_vec(), OwnedValue::Bytes(pieces));
    let entries = files
        .iter()
        .map(|(file_name, data)| {
            let mut f = BTreeMap::new();
            f.insert(b"length".to_vec(), OwnedValue::Int(data.len() as i64));
            f.insert(
                b"path".to_vec(),
                OwnedValue::List(vec![OwnedValue::str(file_name)]),
            );
            OwnedValue::Dict(f)
        })
        .collect();
    info.insert(b"files".to_vec(), OwnedValue::List(entries));

    let mut root = BTreeMap::new();
    root.insert(b"info".to_vec(), OwnedValue::Dict(info));
    OwnedValue::Dict(root).encode()
}
