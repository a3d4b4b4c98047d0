// Two sessions on localhost: one seeds from disk, the other starts from a
// magnet link with nothing but the info-hash and a peer hint.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use peer_protocol::Handshake;
use torq_core::magnet::Magnet;
use torq_core::metainfo::Metainfo;
use torq_core::{Id20, InfoHash};
use torq_mse::MseMode;

use crate::session::{AddTorrent, AddTorrentOptions, Session, SessionOptions};
use crate::tests::test_util::{make_torrent_on_disk, random_bytes};

const A_LEN: usize = 100_000;
const B_LEN: usize = 30_072;
const PIECE_LEN: u32 = 32_768; // 4 pieces

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .try_init();
}

async fn run_seed_to_leech(seeder_mse: MseMode, leecher_mse: MseMode) {
    init_logging();
    let seeder_dir = tempfile::tempdir().unwrap();
    let leecher_dir = tempfile::tempdir().unwrap();

    let a_data = random_bytes(1, A_LEN);
    let b_data = random_bytes(2, B_LEN);
    let torrent_bytes = make_torrent_on_disk(
        seeder_dir.path(),
        "pack",
        &[("a.bin", &a_data), ("b.bin", &b_data)],
        PIECE_LEN,
    );
    let meta = Metainfo::parse(&torrent_bytes).unwrap();
    assert_eq!(meta.total_pieces(), 4);

    let seeder = Session::new(SessionOptions {
        output_dir: seeder_dir.path().to_owned(),
        listen_port: Some(0),
        mse_mode: seeder_mse,
        ..Default::default()
    })
    .await
    .unwrap();
    let seed_torrent = seeder
        .add_torrent(
            AddTorrent::TorrentFileBytes(&torrent_bytes),
            AddTorrentOptions::default(),
        )
        .await
        .unwrap();

    // The seeder finds its data on disk and goes straight to seeding.
    tokio::time::timeout(Duration::from_secs(10), seed_torrent.wait_until_completed())
        .await
        .expect("seeder did not finish checking");

    let magnet = Magnet {
        info_hash: meta.info_hash,
        name: None,
        trackers: vec![],
        peer_hints: vec![seeder.listen_addr().unwrap()],
    };
    let magnet = Magnet::parse(&magnet.to_string()).unwrap();
    assert_eq!(magnet.peer_hints.len(), 1);

    let leecher = Session::new(SessionOptions {
        output_dir: leecher_dir.path().to_owned(),
        listen_port: Some(0),
        mse_mode: leecher_mse,
        ..Default::default()
    })
    .await
    .unwrap();
    let leech_torrent = leecher
        .add_torrent(AddTorrent::Magnet(magnet), AddTorrentOptions::default())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(60), leech_torrent.wait_until_completed())
        .await
        .expect("leecher did not complete");

    let stats = leech_torrent.stats();
    assert_eq!(stats.pieces_have, 4);
    assert_eq!(stats.have_bytes, (A_LEN + B_LEN) as u64);

    // Byte-for-byte identical output.
    let got_a = std::fs::read(leecher_dir.path().join("pack/a.bin")).unwrap();
    let got_b = std::fs::read(leecher_dir.path().join("pack/b.bin")).unwrap();
    assert_eq!(got_a, a_data);
    assert_eq!(got_b, b_data);

    seeder.stop().await;
    leecher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_e2e_magnet_plaintext() {
    run_seed_to_leech(MseMode::Allow, MseMode::Allow).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_e2e_magnet_encrypted() {
    run_seed_to_leech(MseMode::Required, MseMode::Required).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_info_hash_is_dropped() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let session = Session::new(SessionOptions {
        output_dir: dir.path().to_owned(),
        listen_port: Some(0),
        ..Default::default()
    })
    .await
    .unwrap();
    let addr = session.listen_addr().unwrap();

    let mut socket = tokio::net::TcpStream::connect(("127.0.0.1", addr.port()))
        .await
        .unwrap();
    let handshake = Handshake::new(InfoHash::new([0xAA; 20]), Id20::new([0xBB; 20]));
    socket.write_all(&handshake.serialize()).await.unwrap();

    // The session must close the socket promptly without answering.
    let mut buf = [0u8; 68];
    let read = tokio::time::timeout(Duration::from_secs(1), socket.read(&mut buf))
        .await
        .expect("socket was not closed within a second")
        .unwrap();
    assert_eq!(read, 0, "expected EOF, got {read} bytes");
    session.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mse_required_refuses_plaintext() {
    init_logging();
    let seeder_dir = tempfile::tempdir().unwrap();
    let a_data = random_bytes(3, 50_000);
    let torrent_bytes = make_torrent_on_disk(
        seeder_dir.path(),
        "sealed",
        &[("a.bin", &a_data)],
        16_384,
    );
    let meta = Metainfo::parse(&torrent_bytes).unwrap();

    let session = Session::new(SessionOptions {
        output_dir: seeder_dir.path().to_owned(),
        listen_port: Some(0),
        mse_mode: MseMode::Required,
        ..Default::default()
    })
    .await
    .unwrap();
    session
        .add_torrent(
            AddTorrent::TorrentFileBytes(&torrent_bytes),
            AddTorrentOptions::default(),
        )
        .await
        .unwrap();
    let addr = session.listen_addr().unwrap();

    // A legitimate plaintext handshake for a torrent the session has.
    let mut socket = tokio::net::TcpStream::connect(("127.0.0.1", addr.port()))
        .await
        .unwrap();
    let handshake = Handshake::new(meta.info_hash, Id20::new([0xBB; 20]));
    socket.write_all(&handshake.serialize()).await.unwrap();

    let mut buf = [0u8; 68];
    let read = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf))
        .await
        .expect("socket was not closed")
        .unwrap();
    assert_eq!(read, 0, "plaintext must be refused when MSE is required");
    session.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_add_torrent_twice_returns_same_handle() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let data = random_bytes(4, 10_000);
    let torrent_bytes = make_torrent_on_disk(dir.path(), "dup", &[("a.bin", &data)], 16_384);

    let session = Session::new(SessionOptions {
        output_dir: dir.path().to_owned(),
        listen_port: None,
        ..Default::default()
    })
    .await
    .unwrap();
    let first = session
        .add_torrent(
            AddTorrent::TorrentFileBytes(&torrent_bytes),
            AddTorrentOptions::default(),
        )
        .await
        .unwrap();
    let second = session
        .add_torrent(
            AddTorrent::TorrentFileBytes(&torrent_bytes),
            AddTorrentOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(first.info_hash, second.info_hash);
    assert_eq!(session.torrents().len(), 1);
    session.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remove_with_data_deletes_files() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let data = random_bytes(5, 10_000);
    let torrent_bytes = make_torrent_on_disk(dir.path(), "gone", &[("a.bin", &data)], 16_384);
    let meta = Metainfo::parse(&torrent_bytes).unwrap();

    let session = Session::new(SessionOptions {
        output_dir: dir.path().to_owned(),
        listen_port: None,
        ..Default::default()
    })
    .await
    .unwrap();
    let torrent = session
        .add_torrent(
            AddTorrent::TorrentFileBytes(&torrent_bytes),
            AddTorrentOptions::default(),
        )
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), torrent.wait_until_completed())
        .await
        .unwrap();

    assert!(dir.path().join("gone/a.bin").exists());
    session.remove_torrent(&meta.info_hash, true).await.unwrap();
    assert!(!dir.path().join("gone/a.bin").exists());
    assert!(session.get_torrent(&meta.info_hash).is_none());
    session.stop().await;
}
