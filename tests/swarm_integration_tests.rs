//! Swarm integration tests
//!
//! End-to-end scenarios against mock peers over loopback TCP: loading the
//! smallest valid torrent, handshake rejection, full single- and multi-file
//! downloads, hash-failure recycling, and the choked-peer guarantee that no
//! requests go out before an unchoke.


use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use swarm_dl::{
    ClientConfig, ClientError, Metainfo, PeerConnection, PieceManager, ProtocolErrorKind,
    FileStorage, SwarmDownloader,
};

use mock_peer::{MockPeer, MockPeerConfig};
use test_helpers::{info_hash_by_range, wait_for, TestTorrentBuilder};

// =============================================================================
// Helpers
// =============================================================================

/// Short-deadline config pointed at a scratch directory.
fn test_config(dir: &Path) -> ClientConfig {
    ClientConfig {
        output_dir: dir.to_path_buf(),
        max_peers: 10,
        resume_scan: false,
        dial_timeout: Duration::from_secs(5),
        handshake_timeout: Duration::from_secs(5),
        message_timeout: Duration::from_secs(5),
        keepalive_interval: Duration::from_secs(1),
        inactivity_limit: Duration::from_secs(3),
        ..ClientConfig::default()
    }
}

/// Start a mock peer that has every piece of the torrent.
async fn start_seeder(info_hash: [u8; 20], pieces: &[Vec<u8>]) -> Arc<MockPeer> {
    let mut config = MockPeerConfig::new(info_hash, pieces.len());
    for (index, data) in pieces.iter().enumerate() {
        config = config.with_piece(index as u32, data.clone());
    }
    let peer = Arc::new(MockPeer::new(config).await.expect("mock peer should bind"));
    Arc::clone(&peer).start_accepting();
    peer
}

/// Build a swarm over injected peers, run the peer loop until completion or
/// the deadline, then shut it down.
async fn run_swarm(
    metainfo: Metainfo,
    peers: &[SocketAddr],
    dir: &Path,
    timeout_ms: u64,
) -> Arc<SwarmDownloader> {
    let swarm = SwarmDownloader::new(metainfo, test_config(dir)).expect("swarm setup");
    swarm.add_known_peers(peers.iter().copied());

    let loop_handle = tokio::spawn(Arc::clone(&swarm).run_peer_loop());

    wait_for(timeout_ms, || swarm.is_complete()).await;

    swarm.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), loop_handle).await;
    swarm
}

// =============================================================================
// Loading
// =============================================================================

#[test]
fn test_smallest_valid_torrent() {
    // Single file of one zero-filled 16384-byte piece
    let builder = TestTorrentBuilder::new("a.bin")
        .piece_length(16384)
        .add_file("a.bin", vec![0u8; 16384]);
    let (data, piece_hashes) = builder.build();

    let metainfo = Metainfo::parse(&data).expect("valid torrent");
    assert_eq!(metainfo.info.name, "a.bin");
    assert_eq!(metainfo.info.num_pieces(), 1);
    assert_eq!(metainfo.info.total_length(), 16384);
    assert_eq!(metainfo.last_piece_length(), 16384);

    // Golden digest of 16384 zero bytes
    let hex: String = piece_hashes[0]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    assert_eq!(hex, "5188431849b4613152fd7bdba6a3ff0a4fd6424b");
    assert_eq!(&metainfo.info.pieces[0], &piece_hashes[0]);
}

#[test]
fn test_info_hash_stability() {
    // The loader's re-encoding hash equals the byte-range hash for both
    // single-file and multi-file torrents.
    let (single, _) = TestTorrentBuilder::single_file("one.bin", 20000).build();
    let metainfo = Metainfo::parse(&single).unwrap();
    assert_eq!(metainfo.info_hash, info_hash_by_range(&single).unwrap());

    let (multi, _) = TestTorrentBuilder::new("pack")
        .piece_length(16384)
        .add_file("a", (0..10000).map(|i| (i % 256) as u8).collect())
        .add_file("sub/b", (0..30000).map(|i| (i % 151) as u8).collect())
        .build();
    let metainfo = Metainfo::parse(&multi).unwrap();
    assert_eq!(metainfo.info_hash, info_hash_by_range(&multi).unwrap());
}

// =============================================================================
// Handshake
// =============================================================================

#[tokio::test]
async fn test_handshake_info_hash_mismatch_rejected() {
    let (data, _) = TestTorrentBuilder::single_file("hs.bin", 16384).build();
    let metainfo = Metainfo::parse(&data).unwrap();

    // The mock answers with an info hash differing in one byte
    let mut wrong = metainfo.info_hash;
    wrong[7] ^= 0x01;
    let mut config = MockPeerConfig::new(metainfo.info_hash, 1);
    config.handshake_info_hash = Some(wrong);
    let peer = Arc::new(MockPeer::new(config).await.unwrap());
    let addr = peer.addr();
    Arc::clone(&peer).start_accepting();

    let result = PeerConnection::connect(
        addr,
        metainfo.info_hash,
        swarm_dl::generate_peer_id(),
        1,
        Duration::from_secs(5),
        Duration::from_secs(5),
    )
    .await;

    match result {
        Err(ClientError::Protocol {
            kind: ProtocolErrorKind::PeerProtocol,
            message,
        }) => assert!(message.contains("info hash")),
        other => panic!("expected handshake rejection, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_handshake_success_reports_peer_id() {
    let (data, _) = TestTorrentBuilder::single_file("id.bin", 16384).build();
    let metainfo = Metainfo::parse(&data).unwrap();

    let config = MockPeerConfig::new(metainfo.info_hash, 1);
    let expected_id = config.peer_id;
    let peer = Arc::new(MockPeer::new(config).await.unwrap());
    let addr = peer.addr();
    Arc::clone(&peer).start_accepting();

    let conn = PeerConnection::connect(
        addr,
        metainfo.info_hash,
        swarm_dl::generate_peer_id(),
        1,
        Duration::from_secs(5),
        Duration::from_secs(5),
    )
    .await
    .expect("handshake should succeed");

    assert_eq!(conn.remote_peer_id(), &expected_id);
    assert!(conn.am_choked());
    assert!(!conn.peer_interested());
}

// =============================================================================
// Downloads
// =============================================================================

#[tokio::test]
async fn test_single_file_download() {
    let builder = TestTorrentBuilder::single_file("single.bin", 40000).piece_length(16384);
    let (data, _) = builder.build();
    let metainfo = Metainfo::parse(&data).unwrap();
    let content = builder.content();

    let seeder = start_seeder(metainfo.info_hash, &builder.pieces()).await;

    let dir = tempfile::tempdir().unwrap();
    let swarm = run_swarm(metainfo, &[seeder.addr()], dir.path(), 10_000).await;

    assert!(swarm.is_complete(), "download did not finish");
    let on_disk = std::fs::read(dir.path().join("single.bin")).unwrap();
    assert_eq!(on_disk, content);

    let status = swarm.status();
    assert_eq!(status.progress.completed_pieces, 3);
    assert!(status.downloaded_bytes >= content.len() as u64);
}

#[tokio::test]
async fn test_multi_file_download_layout() {
    let file_a: Vec<u8> = (0..10000).map(|i| (i % 256) as u8).collect();
    let file_b: Vec<u8> = (0..30000).map(|i| (i % 151) as u8).collect();

    let builder = TestTorrentBuilder::new("pack")
        .piece_length(16384)
        .add_file("a", file_a.clone())
        .add_file("sub/b", file_b.clone());
    let (data, _) = builder.build();
    let metainfo = Metainfo::parse(&data).unwrap();

    let seeder = start_seeder(metainfo.info_hash, &builder.pieces()).await;

    let dir = tempfile::tempdir().unwrap();
    let swarm = run_swarm(metainfo, &[seeder.addr()], dir.path(), 10_000).await;

    assert!(swarm.is_complete(), "download did not finish");

    // Bytes land in the declared files, across piece boundaries
    assert_eq!(std::fs::read(dir.path().join("pack/a")).unwrap(), file_a);
    assert_eq!(std::fs::read(dir.path().join("pack/sub/b")).unwrap(), file_b);
}

#[tokio::test]
async fn test_download_from_two_partial_seeders() {
    let builder = TestTorrentBuilder::single_file("split.bin", 49152).piece_length(16384);
    let (data, _) = builder.build();
    let metainfo = Metainfo::parse(&data).unwrap();
    let pieces = builder.pieces();

    // Peer one has pieces 0 and 1, peer two has piece 2
    let mut one = MockPeerConfig::new(metainfo.info_hash, 3);
    one = one.with_piece(0, pieces[0].clone()).with_piece(1, pieces[1].clone());
    let one = Arc::new(MockPeer::new(one).await.unwrap());
    let one_addr = one.addr();
    Arc::clone(&one).start_accepting();

    let mut two = MockPeerConfig::new(metainfo.info_hash, 3);
    two = two.with_piece(2, pieces[2].clone());
    let two = Arc::new(MockPeer::new(two).await.unwrap());
    let two_addr = two.addr();
    Arc::clone(&two).start_accepting();

    let dir = tempfile::tempdir().unwrap();
    let swarm = run_swarm(metainfo, &[one_addr, two_addr], dir.path(), 10_000).await;

    assert!(swarm.is_complete(), "download did not finish");
    assert_eq!(
        std::fs::read(dir.path().join("split.bin")).unwrap(),
        builder.content()
    );
}

#[tokio::test]
async fn test_verification_failure_recycles_piece() {
    let builder = TestTorrentBuilder::single_file("flaky.bin", 32768).piece_length(16384);
    let (data, _) = builder.build();
    let metainfo = Metainfo::parse(&data).unwrap();
    let pieces = builder.pieces();

    // The seeder serves piece 0 corrupted on the first round and clean
    // afterwards; the client must discard the bad piece and retry.
    let mut config = MockPeerConfig::new(metainfo.info_hash, 2);
    config = config
        .with_piece(0, pieces[0].clone())
        .with_piece(1, pieces[1].clone())
        .with_corrupt_first(0);
    let peer = Arc::new(MockPeer::new(config).await.unwrap());
    let addr = peer.addr();
    Arc::clone(&peer).start_accepting();

    let dir = tempfile::tempdir().unwrap();
    let swarm = run_swarm(metainfo, &[addr], dir.path(), 15_000).await;

    assert!(swarm.is_complete(), "piece was not recycled after mismatch");
    assert_eq!(
        std::fs::read(dir.path().join("flaky.bin")).unwrap(),
        builder.content()
    );
}

#[tokio::test]
async fn test_choked_peer_receives_no_requests() {
    let builder = TestTorrentBuilder::single_file("choked.bin", 32768).piece_length(16384);
    let (data, _) = builder.build();
    let metainfo = Metainfo::parse(&data).unwrap();

    // Seeder that never unchokes, no matter what
    let mut config = MockPeerConfig::new(metainfo.info_hash, 2);
    config.auto_unchoke = false;
    config.unchoke_on_interested = false;
    for (index, piece) in builder.pieces().into_iter().enumerate() {
        config = config.with_piece(index as u32, piece);
    }
    let peer = Arc::new(MockPeer::new(config).await.unwrap());
    let addr = peer.addr();
    Arc::clone(&peer).start_accepting();

    let dir = tempfile::tempdir().unwrap();
    let swarm = SwarmDownloader::new(metainfo, test_config(dir.path())).unwrap();
    swarm.add_known_peers([addr]);
    let loop_handle = tokio::spawn(Arc::clone(&swarm).run_peer_loop());

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(peer.request_count(), 0, "requests went out while choked");
    assert!(!swarm.is_complete());

    swarm.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), loop_handle).await;
}

// =============================================================================
// Resume
// =============================================================================

#[tokio::test]
async fn test_resume_scan_skips_verified_pieces() {
    let builder = TestTorrentBuilder::single_file("resume.bin", 40000).piece_length(16384);
    let (data, _) = builder.build();
    let metainfo = Arc::new(Metainfo::parse(&data).unwrap());
    let pieces = builder.pieces();

    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FileStorage::create(Arc::clone(&metainfo), dir.path()).unwrap());

    // Piece 1 is already on disk from a previous run
    storage.write_piece(1, &pieces[1]).unwrap();

    let scanned = storage.completion_bitfield().unwrap();
    assert!(!scanned.has(0));
    assert!(scanned.has(1));
    assert!(!scanned.has(2));

    let manager = PieceManager::new(Arc::clone(&metainfo), storage);
    manager.restore(&scanned);
    assert_eq!(manager.missing_indices(), vec![0, 2]);
    assert!(!manager.is_complete());
}
