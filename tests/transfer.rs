//! End to end transfers over loopback TCP

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_torrent_engine::{
    Bitfield, MemoryStorage, PieceVerifier, Sha1Verifier, StrikeLimit, Torrent, TorrentConfig, TorrentInfo,
};

const PIECE_LENGTH: u32 = 256 * 1024;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 7) % 253) as u8).collect()
}

fn local_config() -> TorrentConfig {
    TorrentConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        tick_interval_ms: 100,
        ..TorrentConfig::default()
    }
}

async fn start_seeder(info: &TorrentInfo, data: Vec<u8>) -> (Torrent, SocketAddr) {
    let storage = Arc::new(MemoryStorage::from_vec(data));
    let seeder = Torrent::new(info.clone(), storage, Bitfield::full(info.piece_count()), local_config()).unwrap();
    seeder.start().await.unwrap();
    let port = seeder.notify_listen().borrow().unwrap();
    (seeder, SocketAddr::from(([127, 0, 0, 1], port)))
}

async fn wait_complete(torrent: &Torrent) {
    let mut complete = torrent.notify_complete();
    tokio::time::timeout(Duration::from_secs(60), complete.wait_for(|done| *done))
        .await
        .expect("transfer timed out")
        .unwrap();
}

#[tokio::test]
async fn test_download_from_one_seeder() {
    let data = payload(10 * 1024 * 1024);
    let info = TorrentInfo::from_data("ten-megs", &data, PIECE_LENGTH).unwrap();
    assert_eq!(info.piece_count(), 40);
    let (seeder, addr) = start_seeder(&info, data.clone()).await;

    let storage = Arc::new(MemoryStorage::new(data.len()));
    let leecher = Torrent::new(info.clone(), storage.clone(), Bitfield::new(info.piece_count()), local_config()).unwrap();
    leecher.start().await.unwrap();
    leecher.add_peers(vec![addr]).unwrap();

    wait_complete(&leecher).await;
    assert!(storage.snapshot() == data);

    let stats = leecher.stats();
    assert_eq!(stats.pieces_owned, 40);
    assert!(stats.downloaded >= data.len() as u64);
    assert!(leecher.notify_error().borrow().is_none());

    leecher.close().await;
    seeder.close().await;
    assert!(seeder.stats().uploaded >= data.len() as u64);
}

/// Rejects the first copy of one piece, accepts everything after
struct FailOnce {
    inner: Sha1Verifier,
    piece: u32,
    failed: AtomicBool,
    calls: AtomicU32,
}

impl PieceVerifier for FailOnce {
    fn verify(&self, index: u32, data: &[u8]) -> bool {
        if index == self.piece {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.failed.swap(true, Ordering::SeqCst) {
                return false;
            }
        }
        self.inner.verify(index, data)
    }
}

#[tokio::test]
async fn test_failed_piece_is_fetched_again() {
    let data = payload(1024 * 1024 + 1000);
    let info = TorrentInfo::from_data("flaky", &data, PIECE_LENGTH).unwrap();
    let (seeder, addr) = start_seeder(&info, data.clone()).await;

    let verifier = Arc::new(FailOnce {
        inner: Sha1Verifier::new(Arc::new(info.clone())),
        piece: 2,
        failed: AtomicBool::new(false),
        calls: AtomicU32::new(0),
    });
    let storage = Arc::new(MemoryStorage::new(data.len()));
    let leecher = Torrent::new(info.clone(), storage.clone(), Bitfield::new(info.piece_count()), local_config())
        .unwrap()
        .with_verifier(verifier.clone());
    leecher.start().await.unwrap();
    leecher.add_peers(vec![addr]).unwrap();

    wait_complete(&leecher).await;
    assert!(storage.snapshot() == data);
    assert_eq!(verifier.calls.load(Ordering::SeqCst), 2);

    leecher.close().await;
    seeder.close().await;
}

#[tokio::test]
async fn test_download_from_two_seeders() {
    let data = payload(3 * 1024 * 1024);
    let info = TorrentInfo::from_data("two-seeders", &data, PIECE_LENGTH).unwrap();
    let (first, first_addr) = start_seeder(&info, data.clone()).await;
    let (second, second_addr) = start_seeder(&info, data.clone()).await;

    let storage = Arc::new(MemoryStorage::new(data.len()));
    let leecher = Torrent::new(info.clone(), storage.clone(), Bitfield::new(info.piece_count()), local_config())
        .unwrap()
        .with_corruption_policy(Box::new(StrikeLimit::new(1)));
    leecher.start().await.unwrap();
    leecher.add_peers(vec![first_addr, second_addr]).unwrap();

    wait_complete(&leecher).await;
    assert!(storage.snapshot() == data);

    leecher.close().await;
    first.close().await;
    second.close().await;
}

#[tokio::test]
async fn test_resume_with_partial_data() {
    let data = payload(2 * 1024 * 1024);
    let info = TorrentInfo::from_data("partial", &data, PIECE_LENGTH).unwrap();
    let (seeder, addr) = start_seeder(&info, data.clone()).await;

    // first half already present
    let half = info.piece_count() / 2;
    let mut initial = vec![0u8; data.len()];
    let split = (half * PIECE_LENGTH) as usize;
    initial[..split].copy_from_slice(&data[..split]);
    let mut have = Bitfield::new(info.piece_count());
    for index in 0..half {
        have.set(index).unwrap();
    }

    let storage = Arc::new(MemoryStorage::from_vec(initial));
    let leecher = Torrent::new(info.clone(), storage.clone(), have, local_config()).unwrap();
    leecher.start().await.unwrap();
    leecher.add_peers(vec![addr]).unwrap();

    wait_complete(&leecher).await;
    assert!(storage.snapshot() == data);
    assert!(leecher.stats().downloaded < data.len() as u64);

    leecher.close().await;
    seeder.close().await;
}

#[tokio::test]
async fn test_mismatched_torrent_is_rejected() {
    let data = payload(600 * 1024);
    let info = TorrentInfo::from_data("one", &data, PIECE_LENGTH).unwrap();
    let other = TorrentInfo::from_data("two", &payload(700 * 1024), PIECE_LENGTH).unwrap();
    let (seeder, addr) = start_seeder(&info, data).await;

    let storage = Arc::new(MemoryStorage::new(700 * 1024));
    let leecher = Torrent::new(other.clone(), storage, Bitfield::new(other.piece_count()), local_config()).unwrap();
    leecher.start().await.unwrap();
    leecher.add_peers(vec![addr]).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(leecher.stats().peers, 0);
    assert_eq!(seeder.stats().peers, 0);
    assert!(!*leecher.notify_complete().borrow());

    leecher.close().await;
    seeder.close().await;
}
