//! Misbehaving peers over loopback TCP

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use rust_torrent_engine::protocol::{exchange, write_message, MessageReader};
use rust_torrent_engine::{Bitfield, MemoryStorage, Message, Storage, Torrent, TorrentConfig, TorrentInfo};

const PIECE_LENGTH: u32 = 256 * 1024;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 17 + i / 5) % 251) as u8).collect()
}

fn local_config() -> TorrentConfig {
    TorrentConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        tick_interval_ms: 100,
        ..TorrentConfig::default()
    }
}

/// Memory storage that counts reads
struct CountingStorage {
    inner: MemoryStorage,
    reads: AtomicUsize,
}

#[async_trait]
impl Storage for CountingStorage {
    async fn read_at(&self, offset: u64, len: u32) -> Result<Bytes> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_at(offset, len).await
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.inner.write_at(offset, data).await
    }

    async fn size(&self) -> Result<u64> {
        self.inner.size().await
    }
}

async fn listen_port(torrent: &Torrent) -> SocketAddr {
    let port = torrent.notify_listen().borrow().unwrap();
    SocketAddr::from(([127, 0, 0, 1], port))
}

#[tokio::test]
async fn test_request_flood_from_non_reading_peer_is_bounded() {
    let data = payload(1024 * 1024);
    let info = TorrentInfo::from_data("flood", &data, PIECE_LENGTH).unwrap();
    let storage = Arc::new(CountingStorage {
        inner: MemoryStorage::from_vec(data),
        reads: AtomicUsize::new(0),
    });
    let seeder = Torrent::new(info.clone(), storage.clone(), Bitfield::full(info.piece_count()), local_config()).unwrap();
    seeder.start().await.unwrap();

    let mut stream = TcpStream::connect(listen_port(&seeder).await).await.unwrap();
    exchange(&mut stream, info.info_hash, [7u8; 20]).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = MessageReader::new(read_half, info.piece_count());

    write_message(&mut write_half, &Message::Interested).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while reader.read_message().await.unwrap() != Message::Unchoke {}
    })
    .await
    .expect("never unchoked");

    // flood with requests and never read again
    let mut flood = BytesMut::new();
    for i in 0..20_000u32 {
        Message::Request {
            index: i % info.piece_count(),
            begin: (i / 4 % 8) * 32 * 1024,
            length: 32 * 1024,
        }
        .encode(&mut flood);
    }
    write_half.write_all(&flood).await.unwrap();
    write_half.flush().await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let reads = storage.reads.load(Ordering::SeqCst);
    assert!(reads > 0);
    assert!(reads < 1000, "served {} of 20000 requests to a peer that never reads", reads);

    drop(reader);
    drop(write_half);
    seeder.close().await;
}

#[tokio::test]
async fn test_stalled_peer_blocks_move_to_another_peer() {
    let data = payload(1024 * 1024);
    let info = TorrentInfo::from_data("stall", &data, PIECE_LENGTH).unwrap();

    // a peer that claims every piece, unchokes, and never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stalled_addr = listener.local_addr().unwrap();
    let requests = Arc::new(AtomicUsize::new(0));
    let cancels = Arc::new(AtomicUsize::new(0));
    let (seen_requests, seen_cancels) = (requests.clone(), cancels.clone());
    let (info_hash, piece_count) = (info.info_hash, info.piece_count());
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        exchange(&mut stream, info_hash, [9u8; 20]).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let bitfield = Bytes::copy_from_slice(Bitfield::full(piece_count).as_bytes());
        write_message(&mut write_half, &Message::Bitfield { bitfield }).await.unwrap();
        write_message(&mut write_half, &Message::Unchoke).await.unwrap();

        let mut reader = MessageReader::new(read_half, piece_count);
        while let Ok(message) = reader.read_message().await {
            match message {
                Message::Request { .. } => seen_requests.fetch_add(1, Ordering::SeqCst),
                Message::Cancel { .. } => seen_cancels.fetch_add(1, Ordering::SeqCst),
                _ => 0,
            };
        }
    });

    let seeder = Torrent::new(
        info.clone(),
        Arc::new(MemoryStorage::from_vec(data.clone())),
        Bitfield::full(info.piece_count()),
        local_config(),
    )
    .unwrap();
    seeder.start().await.unwrap();

    let storage = Arc::new(MemoryStorage::new(data.len()));
    let config = TorrentConfig {
        stall_timeout_secs: 1,
        ..local_config()
    };
    let leecher = Torrent::new(info.clone(), storage.clone(), Bitfield::new(info.piece_count()), config).unwrap();
    leecher.start().await.unwrap();

    // let the stalled peer take a full pipeline first
    leecher.add_peers(vec![stalled_addr]).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while requests.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("stalled peer got no requests");

    leecher.add_peers(vec![listen_port(&seeder).await]).unwrap();
    let mut complete = leecher.notify_complete();
    tokio::time::timeout(Duration::from_secs(30), complete.wait_for(|done| *done))
        .await
        .expect("stalled blocks never moved")
        .unwrap();

    assert!(storage.snapshot() == data);
    assert!(cancels.load(Ordering::SeqCst) > 0);

    leecher.close().await;
    seeder.close().await;
}
