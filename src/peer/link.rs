//! Peer link
//!
//! Owns one handshaken connection: a read loop that decodes, validates and
//! forwards messages, and a writer task that drains the outbound queue.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::TorrentError;
use crate::peer::state::{PeerState, PeerStats};
use crate::protocol::{write_message, Bitfield, Message, MessageReader, PeerId, BLOCK_LEN, MAX_BLOCK_LEN};
use crate::storage::piece::{block_len, BlockInfo};
use crate::torrent::TorrentInfo;

/// Idle time after which the writer sends a keep-alive
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Opaque handle the coordinator uses to find a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a link reports to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEventKind {
    Have(u32),
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// The peer asks us for a block
    Request(BlockInfo),
    /// The peer sent us a block
    Block { block: BlockInfo, data: Bytes },
}

/// An event tagged with the link it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub link: LinkId,
    pub kind: PeerEventKind,
}

/// Everything a link needs besides its socket
#[derive(Debug, Clone)]
pub struct LinkParams {
    pub id: LinkId,
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    pub info: Arc<TorrentInfo>,
    /// Bounded channel to the coordinator
    pub events: mpsc::Sender<PeerEvent>,
    /// Receives this link's id once its read loop has exited
    pub disconnects: mpsc::UnboundedSender<LinkId>,
    /// Link scoped token, usually a child of the torrent's stop token
    pub stop: CancellationToken,
    pub read_timeout: Duration,
    pub outbound_queue_len: usize,
}

/// One connected, handshaken peer
pub struct PeerLink {
    id: LinkId,
    peer_id: PeerId,
    addr: SocketAddr,
    info: Arc<TorrentInfo>,
    state: Mutex<PeerState>,
    outbound: mpsc::Sender<Message>,
    reader: Mutex<Option<BoxReader>>,
    events: mpsc::Sender<PeerEvent>,
    disconnects: mpsc::UnboundedSender<LinkId>,
    stop: CancellationToken,
    done: CancellationToken,
    read_timeout: Duration,
    connected_at: Instant,
    downloaded: AtomicU64,
    uploaded: AtomicU64,
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("peer_id", &hex::encode(self.peer_id))
            .finish()
    }
}

impl PeerLink {
    /// Wrap a handshaken stream and start its writer task
    pub fn new<S>(stream: S, params: LinkParams) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(params.outbound_queue_len.max(1));

        tokio::spawn(write_loop(writer, rx, params.stop.clone(), params.id));
        debug!("Link {} established with {} ({})", params.id, params.addr, hex::encode(params.peer_id));

        Arc::new(Self {
            id: params.id,
            peer_id: params.peer_id,
            addr: params.addr,
            info: params.info,
            state: Mutex::new(PeerState::default()),
            outbound: tx,
            reader: Mutex::new(Some(Box::new(reader))),
            events: params.events,
            disconnects: params.disconnects,
            stop: params.stop,
            done: CancellationToken::new(),
            read_timeout: params.read_timeout,
            connected_at: Instant::now(),
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
        })
    }

    /// Run the read loop until the connection ends.
    ///
    /// `local` is sent first unless it is empty. Returns the reason the loop
    /// stopped; a close or torrent stop is `Ok`. The disconnect notice is
    /// sent exactly once, when this returns.
    pub async fn run(&self, local: Bitfield) -> Result<()> {
        let reader = match self.lock_reader().take() {
            Some(reader) => reader,
            None => return Err(TorrentError::peer_error_with_peer("Link is already running", self.addr.to_string()).into()),
        };

        let result = self.read_loop(reader, local).await;
        match &result {
            Ok(()) => debug!("Link {} closed", self.id),
            Err(e) => match e.downcast_ref::<TorrentError>() {
                Some(te) if te.is_protocol_violation() => warn!("Link {} ({}) dropped: {}", self.id, self.addr, te),
                _ => debug!("Link {} ({}) disconnected: {}", self.id, self.addr, e),
            },
        }

        self.stop.cancel();
        self.done.cancel();
        let _ = self.disconnects.send(self.id);
        result
    }

    async fn read_loop(&self, reader: BoxReader, local: Bitfield) -> Result<()> {
        let mut reader = MessageReader::new(reader, self.info.piece_count());

        if local.count() > 0 {
            trace!("Sending bitfield {} to link {}", local.hex(), self.id);
            self.enqueue(Message::Bitfield {
                bitfield: Bytes::copy_from_slice(local.as_bytes()),
            })
            .await?;
        }

        let mut first = true;
        loop {
            let message = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(()),
                read = timeout(self.read_timeout, reader.read_message()) => match read {
                    Ok(message) => message?,
                    Err(_) => {
                        return Err(TorrentError::peer_error_full(
                            "Read timeout",
                            self.addr.to_string(),
                            format!("no message for {:?}", self.read_timeout),
                        )
                        .into())
                    }
                },
            };
            trace!("Link {} received {:?}", self.id, message.message_id());

            let is_first = first;
            if message != Message::KeepAlive {
                first = false;
            }
            self.handle(message, is_first).await?;
        }
    }

    async fn handle(&self, message: Message, first: bool) -> Result<()> {
        let piece_count = self.info.piece_count();
        match message {
            Message::KeepAlive => Ok(()),
            Message::Choke => {
                self.lock_state().peer_choking = true;
                self.forward(PeerEventKind::Choke).await
            }
            Message::Unchoke => {
                self.lock_state().peer_choking = false;
                self.forward(PeerEventKind::Unchoke).await
            }
            Message::Interested => {
                self.lock_state().peer_interested = true;
                self.forward(PeerEventKind::Interested).await
            }
            Message::NotInterested => {
                self.lock_state().peer_interested = false;
                self.forward(PeerEventKind::NotInterested).await
            }
            Message::Have { piece_index } => {
                if piece_index >= piece_count {
                    return Err(TorrentError::protocol_error_with_source(
                        "Have index out of range",
                        format!("index: {}, pieces: {}", piece_index, piece_count),
                    )
                    .into());
                }
                let added = {
                    let mut state = self.lock_state();
                    let bitfield = state.bitfield.get_or_insert_with(|| Bitfield::new(piece_count));
                    let added = !bitfield.has(piece_index);
                    bitfield.set(piece_index)?;
                    added
                };
                if added {
                    self.forward(PeerEventKind::Have(piece_index)).await?;
                }
                Ok(())
            }
            Message::Bitfield { bitfield } => {
                if !first {
                    return Err(TorrentError::protocol_error("Bitfield must be the first message").into());
                }
                let bitfield = Bitfield::from_bytes(&bitfield, piece_count)
                    .map_err(|e| TorrentError::protocol_error_with_source("Malformed bitfield", e.to_string()))?;
                trace!("Link {} bitfield {}", self.id, bitfield.hex());
                let pieces: Vec<u32> = bitfield.iter_set().collect();
                self.lock_state().bitfield = Some(bitfield);
                for index in pieces {
                    self.forward(PeerEventKind::Have(index)).await?;
                }
                Ok(())
            }
            Message::Request { index, begin, length } => {
                let block = self.check_request(index, begin, length)?;
                self.forward(PeerEventKind::Request(block)).await
            }
            Message::Piece { index, begin, block } => {
                let info = self.check_piece(index, begin, block.len())?;
                self.downloaded.fetch_add(block.len() as u64, Ordering::Relaxed);
                self.forward(PeerEventKind::Block { block: info, data: block }).await
            }
            Message::Cancel { index, begin, length } => {
                // requests are answered as soon as they arrive
                self.check_request(index, begin, length)?;
                Ok(())
            }
            Message::Port { listen_port } => {
                trace!("Ignoring port {} from link {}", listen_port, self.id);
                Ok(())
            }
            Message::Unknown { id, length } => {
                debug!("Ignoring unknown message {} ({} bytes) from link {}", id, length, self.id);
                Ok(())
            }
        }
    }

    fn check_request(&self, index: u32, begin: u32, length: u32) -> Result<BlockInfo> {
        let piece_len = self.info.piece_len(index);
        let valid = index < self.info.piece_count()
            && length > 0
            && length <= MAX_BLOCK_LEN
            && u64::from(begin) + u64::from(length) <= u64::from(piece_len);
        if !valid {
            return Err(TorrentError::protocol_error_with_source(
                "Invalid request",
                format!("index: {}, begin: {}, length: {}", index, begin, length),
            )
            .into());
        }
        Ok(BlockInfo::new(index, begin, length))
    }

    fn check_piece(&self, index: u32, begin: u32, len: usize) -> Result<BlockInfo> {
        let piece_len = self.info.piece_len(index);
        let expected = block_len(piece_len, begin);
        let valid = index < self.info.piece_count()
            && begin % BLOCK_LEN == 0
            && begin < piece_len
            && len == expected as usize;
        if !valid {
            return Err(TorrentError::protocol_error_with_source(
                "Invalid piece message",
                format!("index: {}, begin: {}, length: {}", index, begin, len),
            )
            .into());
        }
        Ok(BlockInfo::new(index, begin, expected))
    }

    async fn forward(&self, kind: PeerEventKind) -> Result<()> {
        let event = PeerEvent { link: self.id, kind };
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Ok(()),
            sent = self.events.send(event) => sent.map_err(|_| {
                anyhow::Error::from(TorrentError::peer_error_with_peer("Coordinator is gone", self.addr.to_string()))
            }),
        }
    }

    async fn enqueue(&self, message: Message) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(TorrentError::peer_error_with_peer("Link closed", self.addr.to_string()).into()),
            sent = self.outbound.send(message) => sent.map_err(|_| {
                anyhow::Error::from(TorrentError::peer_error_with_peer("Writer is gone", self.addr.to_string()))
            }),
        }
    }

    /// Flip a flag to `value`; false when it already had that value
    fn flip(&self, value: bool, flag: impl FnOnce(&mut PeerState) -> &mut bool) -> bool {
        let mut state = self.lock_state();
        let current = flag(&mut *state);
        if *current == value {
            return false;
        }
        *current = value;
        true
    }

    /// Send choke message to the peer
    pub async fn send_choke(&self) -> Result<()> {
        if !self.flip(true, |s| &mut s.am_choking) {
            return Ok(());
        }
        self.enqueue(Message::Choke).await
    }

    /// Send unchoke message to the peer
    pub async fn send_unchoke(&self) -> Result<()> {
        if !self.flip(false, |s| &mut s.am_choking) {
            return Ok(());
        }
        self.enqueue(Message::Unchoke).await
    }

    /// Send interested message to the peer
    pub async fn send_interested(&self) -> Result<()> {
        if !self.flip(true, |s| &mut s.am_interested) {
            return Ok(());
        }
        self.enqueue(Message::Interested).await
    }

    /// Send not interested message to the peer
    pub async fn send_not_interested(&self) -> Result<()> {
        if !self.flip(false, |s| &mut s.am_interested) {
            return Ok(());
        }
        self.enqueue(Message::NotInterested).await
    }

    pub async fn send_request(&self, block: BlockInfo) -> Result<()> {
        self.enqueue(Message::Request {
            index: block.piece_index,
            begin: block.offset,
            length: block.len,
        })
        .await
    }

    pub async fn send_cancel(&self, block: BlockInfo) -> Result<()> {
        self.enqueue(Message::Cancel {
            index: block.piece_index,
            begin: block.offset,
            length: block.len,
        })
        .await
    }

    pub async fn send_have(&self, index: u32) -> Result<()> {
        self.enqueue(Message::Have { piece_index: index }).await
    }

    pub async fn send_piece(&self, block: BlockInfo, data: Bytes) -> Result<()> {
        let len = data.len() as u64;
        self.enqueue(Message::Piece {
            index: block.piece_index,
            begin: block.offset,
            block: data,
        })
        .await?;
        self.uploaded.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// Ask the read loop and the writer to stop
    pub fn close(&self) {
        self.stop.cancel();
    }

    /// Whether the link has been told to stop
    pub fn is_closed(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Wait until the read loop has exited
    pub async fn disconnected(&self) {
        self.done.cancelled().await
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Payload bytes received from this peer
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Payload bytes queued to this peer
    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    /// Snapshot of the protocol state
    pub fn state(&self) -> PeerState {
        self.lock_state().clone()
    }

    /// Copy of the peer's bitfield, if it sent one
    pub fn bitfield(&self) -> Option<Bitfield> {
        self.lock_state().bitfield.clone()
    }

    pub fn am_choking(&self) -> bool {
        self.lock_state().am_choking
    }

    pub fn am_interested(&self) -> bool {
        self.lock_state().am_interested
    }

    pub fn peer_choking(&self) -> bool {
        self.lock_state().peer_choking
    }

    pub fn peer_interested(&self) -> bool {
        self.lock_state().peer_interested
    }

    /// Check if we can request from peer
    pub fn can_request(&self) -> bool {
        self.lock_state().can_request()
    }

    pub fn stats(&self) -> PeerStats {
        PeerStats::new(self.addr, self.peer_id, &self.lock_state())
    }

    fn lock_state(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_reader(&self) -> MutexGuard<'_, Option<BoxReader>> {
        self.reader.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn write_loop<W>(mut writer: W, mut outbound: mpsc::Receiver<Message>, stop: CancellationToken, id: LinkId)
where
    W: AsyncWrite + Unpin,
{
    let keepalive = tokio::time::sleep(KEEPALIVE_INTERVAL);
    tokio::pin!(keepalive);

    loop {
        let message = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = outbound.recv() => match next {
                Some(message) => message,
                None => break,
            },
            _ = &mut keepalive => Message::KeepAlive,
        };
        if let Err(e) = write_message(&mut writer, &message).await {
            debug!("Link {} write failed: {}", id, e);
            stop.cancel();
            break;
        }
        keepalive.as_mut().reset(Instant::now() + KEEPALIVE_INTERVAL);
    }

    let _ = writer.shutdown().await;
    trace!("Link {} writer stopped", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc::error::TryRecvError;

    const PIECE: u32 = 2 * BLOCK_LEN;
    const PIECES: u32 = 10;

    struct Harness {
        link: Arc<PeerLink>,
        remote: DuplexStream,
        events: mpsc::Receiver<PeerEvent>,
        disconnects: mpsc::UnboundedReceiver<LinkId>,
    }

    fn harness_with_timeout(read_timeout: Duration) -> Harness {
        let info = TorrentInfo::new(
            "t",
            PIECE,
            u64::from(PIECE) * u64::from(PIECES) - 100,
            vec![[0u8; 20]; PIECES as usize],
        )
        .unwrap();
        let (local, remote) = tokio::io::duplex(1 << 20);
        let (events_tx, events) = mpsc::channel(64);
        let (disconnects_tx, disconnects) = mpsc::unbounded_channel();
        let link = PeerLink::new(
            local,
            LinkParams {
                id: LinkId(1),
                peer_id: [9u8; 20],
                addr: "127.0.0.1:6881".parse().unwrap(),
                info: Arc::new(info),
                events: events_tx,
                disconnects: disconnects_tx,
                stop: CancellationToken::new(),
                read_timeout,
                outbound_queue_len: 16,
            },
        );
        Harness { link, remote, events, disconnects }
    }

    fn harness() -> Harness {
        harness_with_timeout(Duration::from_secs(30))
    }

    async fn send(remote: &mut DuplexStream, messages: &[Message]) {
        for message in messages {
            write_message(remote, message).await.unwrap();
        }
    }

    fn bitfield_message(set: &[u32]) -> Message {
        let mut bf = Bitfield::new(PIECES);
        for &i in set {
            bf.set(i).unwrap();
        }
        Message::Bitfield {
            bitfield: Bytes::copy_from_slice(bf.as_bytes()),
        }
    }

    fn is_protocol_error(err: &anyhow::Error) -> bool {
        err.downcast_ref::<TorrentError>()
            .map(|e| e.is_protocol_violation())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_bitfield_first_forwards_haves() {
        let mut h = harness();
        send(&mut h.remote, &[Message::KeepAlive, bitfield_message(&[1, 4, 9])]).await;
        drop(h.remote);

        let err = h.link.run(Bitfield::new(PIECES)).await.unwrap_err();
        assert!(!is_protocol_error(&err));

        let mut haves = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            assert_eq!(event.link, LinkId(1));
            haves.push(event.kind);
        }
        assert_eq!(
            haves,
            vec![PeerEventKind::Have(1), PeerEventKind::Have(4), PeerEventKind::Have(9)]
        );
        assert_eq!(h.link.bitfield().unwrap().count(), 3);
    }

    #[tokio::test]
    async fn test_bitfield_after_other_message_closes() {
        let mut h = harness();
        send(&mut h.remote, &[Message::Have { piece_index: 2 }, bitfield_message(&[1])]).await;

        let err = h.link.run(Bitfield::new(PIECES)).await.unwrap_err();
        assert!(is_protocol_error(&err));
        assert_eq!(h.events.try_recv().unwrap().kind, PeerEventKind::Have(2));
        assert_eq!(h.events.try_recv().unwrap_err(), TryRecvError::Empty);
        assert_eq!(h.disconnects.try_recv().unwrap(), LinkId(1));
        assert!(h.link.is_closed());
    }

    #[tokio::test]
    async fn test_have_out_of_range_forwards_nothing() {
        let mut h = harness();
        send(&mut h.remote, &[Message::Have { piece_index: PIECES }]).await;

        let err = h.link.run(Bitfield::new(PIECES)).await.unwrap_err();
        assert!(is_protocol_error(&err));
        assert_eq!(h.events.try_recv().unwrap_err(), TryRecvError::Empty);
        assert_eq!(h.disconnects.try_recv().unwrap(), LinkId(1));
        assert!(h.disconnects.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_have_forwarded_once() {
        let mut h = harness();
        send(&mut h.remote, &[Message::Have { piece_index: 3 }, Message::Have { piece_index: 3 }]).await;
        drop(h.remote);

        let _ = h.link.run(Bitfield::new(PIECES)).await;
        assert_eq!(h.events.try_recv().unwrap().kind, PeerEventKind::Have(3));
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_oversized_request_closes() {
        let mut h = harness();
        send(
            &mut h.remote,
            &[
                Message::Request { index: 0, begin: 0, length: MAX_BLOCK_LEN },
                Message::Request { index: 0, begin: 0, length: MAX_BLOCK_LEN + 1 },
            ],
        )
        .await;

        let err = h.link.run(Bitfield::new(PIECES)).await.unwrap_err();
        assert!(is_protocol_error(&err));
        assert_eq!(
            h.events.try_recv().unwrap().kind,
            PeerEventKind::Request(BlockInfo::new(0, 0, MAX_BLOCK_LEN))
        );
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_request_past_piece_end_closes() {
        let mut h = harness();
        // the last piece is 100 bytes short
        send(&mut h.remote, &[Message::Request { index: PIECES - 1, begin: BLOCK_LEN, length: BLOCK_LEN }]).await;
        let err = h.link.run(Bitfield::new(PIECES)).await.unwrap_err();
        assert!(is_protocol_error(&err));
    }

    #[tokio::test]
    async fn test_piece_layout_checked() {
        let mut h = harness();
        send(
            &mut h.remote,
            &[
                Message::Piece { index: 1, begin: BLOCK_LEN, block: Bytes::from(vec![1u8; BLOCK_LEN as usize]) },
                Message::Piece { index: 1, begin: 0, block: Bytes::from(vec![1u8; 10]) },
            ],
        )
        .await;

        let err = h.link.run(Bitfield::new(PIECES)).await.unwrap_err();
        assert!(is_protocol_error(&err));
        match h.events.try_recv().unwrap().kind {
            PeerEventKind::Block { block, data } => {
                assert_eq!(block, BlockInfo::new(1, BLOCK_LEN, BLOCK_LEN));
                assert_eq!(data.len(), BLOCK_LEN as usize);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(h.link.downloaded(), u64::from(BLOCK_LEN));
    }

    #[tokio::test]
    async fn test_flags_follow_messages() {
        let mut h = harness();
        send(&mut h.remote, &[Message::Unchoke, Message::Interested, Message::Port { listen_port: 1 }]).await;
        drop(h.remote);

        let _ = h.link.run(Bitfield::new(PIECES)).await;
        assert!(!h.link.peer_choking());
        assert!(h.link.peer_interested());
        assert_eq!(h.events.try_recv().unwrap().kind, PeerEventKind::Unchoke);
        assert_eq!(h.events.try_recv().unwrap().kind, PeerEventKind::Interested);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_message_is_skipped() {
        let mut h = harness();
        send(&mut h.remote, &[Message::Unknown { id: 20, length: 5 }, Message::Have { piece_index: 0 }]).await;
        drop(h.remote);

        let _ = h.link.run(Bitfield::new(PIECES)).await;
        assert_eq!(h.events.try_recv().unwrap().kind, PeerEventKind::Have(0));
    }

    #[tokio::test]
    async fn test_send_choke_twice_writes_once() {
        let h = harness();
        h.link.send_unchoke().await.unwrap();
        h.link.send_choke().await.unwrap();
        h.link.send_choke().await.unwrap();
        h.link.send_interested().await.unwrap();
        h.link.send_interested().await.unwrap();
        h.link.send_have(3).await.unwrap();

        let mut reader = MessageReader::new(h.remote, PIECES);
        assert_eq!(reader.read_message().await.unwrap(), Message::Unchoke);
        assert_eq!(reader.read_message().await.unwrap(), Message::Choke);
        assert_eq!(reader.read_message().await.unwrap(), Message::Interested);
        assert_eq!(reader.read_message().await.unwrap(), Message::Have { piece_index: 3 });
        assert!(h.link.am_choking());
        assert!(h.link.am_interested());
    }

    #[tokio::test]
    async fn test_local_bitfield_sent_first() {
        let h = harness();
        let link = h.link.clone();
        let mut local = Bitfield::new(PIECES);
        local.set(5).unwrap();
        let run = tokio::spawn(async move { link.run(local).await });

        let mut reader = MessageReader::new(h.remote, PIECES);
        let expected = bitfield_message(&[5]);
        assert_eq!(reader.read_message().await.unwrap(), expected);

        h.link.close();
        assert!(run.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_empty_local_bitfield_not_sent() {
        let h = harness();
        let link = h.link.clone();
        let run = tokio::spawn(async move { link.run(Bitfield::new(PIECES)).await });

        h.link.send_have(1).await.unwrap();
        let mut reader = MessageReader::new(h.remote, PIECES);
        assert_eq!(reader.read_message().await.unwrap(), Message::Have { piece_index: 1 });

        h.link.close();
        assert!(run.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_close_signals_disconnect_once() {
        let mut h = harness();
        let link = h.link.clone();
        let run = tokio::spawn(async move { link.run(Bitfield::new(PIECES)).await });

        h.link.close();
        h.link.disconnected().await;
        assert!(run.await.unwrap().is_ok());
        assert_eq!(h.disconnects.recv().await, Some(LinkId(1)));
        assert!(h.disconnects.try_recv().is_err());

        // a second run is refused and does not signal again
        assert!(h.link.run(Bitfield::new(PIECES)).await.is_err());
        assert!(h.disconnects.try_recv().is_err());
        assert!(h.link.send_have(0).await.is_err());
    }

    #[tokio::test]
    async fn test_read_timeout_disconnects() {
        let mut h = harness_with_timeout(Duration::from_millis(50));
        let err = h.link.run(Bitfield::new(PIECES)).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<TorrentError>(), Some(TorrentError::PeerError { .. })));
        assert_eq!(h.disconnects.recv().await, Some(LinkId(1)));
    }
}
