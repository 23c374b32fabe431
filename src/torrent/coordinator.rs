//! Torrent coordinator
//!
//! A `Torrent` owns the peers of one torrent. All shared bookkeeping (piece
//! tracker, request scheduler, choker, link registry) lives in a single
//! actor task; links talk to it through channels and never touch it directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::peer::{LinkId, LinkParams, PeerEvent, PeerEventKind, PeerLink};
use crate::protocol::{handshake, Bitfield, Handshake, PeerId};
use crate::storage::{BlockInfo, BlockOutcome, PieceTracker, PieceVerifier, RequestScheduler, Sha1Verifier, Storage, VerifyOutcome};
use crate::torrent::choker::{ChokeCandidate, Choker};
use crate::torrent::config::TorrentConfig;
use crate::torrent::policy::{CorruptionPolicy, TolerateCorruption};
use crate::torrent::TorrentInfo;

/// Snapshot of a torrent's progress
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TorrentStats {
    /// Verified pieces we hold
    pub pieces_owned: u32,
    pub piece_count: u32,
    /// Connected peers
    pub peers: usize,
    /// Accepted payload bytes
    pub downloaded: u64,
    /// Payload bytes queued to peers
    pub uploaded: u64,
}

/// Watch channels the torrent publishes on
#[derive(Debug)]
struct Notifications {
    listen: watch::Sender<Option<u16>>,
    complete: watch::Sender<bool>,
    error: watch::Sender<Option<TorrentError>>,
    stats: watch::Sender<TorrentStats>,
}

impl Notifications {
    fn new() -> Self {
        Self {
            listen: watch::channel(None).0,
            complete: watch::channel(false).0,
            error: watch::channel(None).0,
            stats: watch::channel(TorrentStats::default()).0,
        }
    }

    /// Publish `err` unless an error was already published
    fn fail(&self, err: TorrentError) {
        error!("Torrent failed: {}", err);
        self.error.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(err);
            true
        });
    }
}

/// Messages for the actor from outside the link channels
enum Command {
    /// A handshaken connection ready to become a link
    Register {
        stream: TcpStream,
        addr: SocketAddr,
        peer_id: PeerId,
    },
}

/// One torrent being exchanged with a set of peers
pub struct Torrent {
    info: Arc<TorrentInfo>,
    storage: Arc<dyn Storage>,
    have: Bitfield,
    config: TorrentConfig,
    peer_id: PeerId,
    verifier: Arc<dyn PieceVerifier>,
    policy: Mutex<Option<Box<dyn CorruptionPolicy>>>,
    stop: CancellationToken,
    notifications: Arc<Notifications>,
    started: AtomicBool,
    connector: Mutex<Option<Connector>>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl Torrent {
    /// Create a torrent. Pieces set in `have` are assumed present in
    /// `storage`.
    pub fn new(info: TorrentInfo, storage: Arc<dyn Storage>, have: Bitfield, config: TorrentConfig) -> Result<Self> {
        config.validate()?;
        if have.len() != info.piece_count() {
            return Err(TorrentError::validation_error_with_field(
                format!("bitfield has {} bits for {} pieces", have.len(), info.piece_count()),
                "have",
            )
            .into());
        }
        let info = Arc::new(info);
        Ok(Self {
            verifier: Arc::new(Sha1Verifier::new(info.clone())),
            info,
            storage,
            have,
            config,
            peer_id: Handshake::generate_peer_id(),
            policy: Mutex::new(Some(Box::new(TolerateCorruption))),
            stop: CancellationToken::new(),
            notifications: Arc::new(Notifications::new()),
            started: AtomicBool::new(false),
            connector: Mutex::new(None),
            actor: Mutex::new(None),
        })
    }

    /// Replace the SHA1 piece check
    pub fn with_verifier(mut self, verifier: Arc<dyn PieceVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Decide what happens to peers that send corrupt pieces
    pub fn with_corruption_policy(self, policy: Box<dyn CorruptionPolicy>) -> Self {
        *lock(&self.policy) = Some(policy);
        self
    }

    pub fn with_peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = peer_id;
        self
    }

    pub fn info(&self) -> &Arc<TorrentInfo> {
        &self.info
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Check storage, bind the listener and start exchanging.
    ///
    /// Startup failures are returned and also published once on the error
    /// notification.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TorrentError::validation_error("Torrent already started").into());
        }
        info!("Starting torrent {} ({} pieces)", self.info.info_hash_hex(), self.info.piece_count());

        match self.storage.size().await {
            Ok(size) if size >= self.info.total_length => {}
            Ok(size) => {
                let err = TorrentError::storage_error_full(
                    "Storage is smaller than the torrent",
                    "size",
                    format!("{} < {}", size, self.info.total_length),
                );
                self.notifications.fail(err.clone());
                return Err(err.into());
            }
            Err(e) => {
                let err = e
                    .downcast_ref::<TorrentError>()
                    .cloned()
                    .unwrap_or_else(|| TorrentError::storage_error(e.to_string()));
                self.notifications.fail(err.clone());
                return Err(err.into());
            }
        }

        let listener = match TcpListener::bind(self.config.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                let err = TorrentError::network_error_full(
                    "Failed to bind listener",
                    self.config.listen_addr.to_string(),
                    e.to_string(),
                );
                self.notifications.fail(err.clone());
                return Err(err.into());
            }
        };
        let port = listener.local_addr()?.port();

        let tracker = PieceTracker::new(&self.info, self.have.clone())?;
        let policy = lock(&self.policy).take().unwrap_or_else(|| Box::new(TolerateCorruption));
        let (events_tx, events_rx) = mpsc::channel(self.config.event_queue_len);
        let (disconnects_tx, disconnects_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let connector = Connector {
            info_hash: self.info.info_hash,
            peer_id: self.peer_id,
            handshake_timeout: self.config.handshake_timeout(),
            commands: commands_tx,
            stop: self.stop.clone(),
        };
        *lock(&self.connector) = Some(connector.clone());

        let coordinator = Coordinator {
            scheduler: RequestScheduler::new(self.info.piece_count(), self.config.max_pipeline, self.config.stall_timeout()),
            choker: Choker::new(self.config.max_unchoked, self.config.optimistic_rounds),
            tracker,
            info: self.info.clone(),
            storage: self.storage.clone(),
            verifier: self.verifier.clone(),
            policy,
            config: self.config.clone(),
            links: HashMap::new(),
            next_id: 0,
            events_tx,
            disconnects_tx,
            stop: self.stop.clone(),
            notifications: self.notifications.clone(),
            downloaded: 0,
            uploaded: Arc::new(AtomicU64::new(0)),
        };

        tokio::spawn(accept_loop(listener, connector));
        let handle = tokio::spawn(coordinator.run(events_rx, disconnects_rx, commands_rx));
        *lock(&self.actor) = Some(handle);

        info!("Listening on port {}", port);
        self.notifications.listen.send_replace(Some(port));
        Ok(())
    }

    /// Connect to peers in the background
    pub fn add_peers(&self, addrs: impl IntoIterator<Item = SocketAddr>) -> Result<()> {
        let connector = lock(&self.connector)
            .clone()
            .ok_or_else(|| TorrentError::validation_error("Torrent is not started"))?;
        for addr in addrs {
            let connector = connector.clone();
            tokio::spawn(async move { connector.dial(addr).await });
        }
        Ok(())
    }

    /// Ask every task of this torrent to stop
    pub fn stop(&self) {
        info!("Stopping torrent {}", self.info.info_hash_hex());
        self.stop.cancel();
    }

    /// Stop and wait for the coordinator to finish
    pub async fn close(&self) {
        self.stop();
        let handle = lock(&self.actor).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Coordinator task failed: {}", e);
            }
        }
    }

    /// Port the listener is bound to, once started
    pub fn notify_listen(&self) -> watch::Receiver<Option<u16>> {
        self.notifications.listen.subscribe()
    }

    /// Becomes true when every piece is verified and stored
    pub fn notify_complete(&self) -> watch::Receiver<bool> {
        self.notifications.complete.subscribe()
    }

    /// The first fatal error
    pub fn notify_error(&self) -> watch::Receiver<Option<TorrentError>> {
        self.notifications.error.subscribe()
    }

    pub fn stats(&self) -> TorrentStats {
        self.notifications.stats.borrow().clone()
    }
}

impl Drop for Torrent {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Turns sockets into handshaken connections for the actor
#[derive(Clone)]
struct Connector {
    info_hash: [u8; 20],
    peer_id: PeerId,
    handshake_timeout: std::time::Duration,
    commands: mpsc::UnboundedSender<Command>,
    stop: CancellationToken,
}

impl Connector {
    async fn dial(&self, addr: SocketAddr) {
        debug!("Connecting to peer: {}", addr);
        let connect = timeout(self.handshake_timeout, TcpStream::connect(addr));
        let stream = tokio::select! {
            _ = self.stop.cancelled() => return,
            connected = connect => match connected {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!("Failed to connect to {}: {}", addr, e);
                    return;
                }
                Err(elapsed) => {
                    let err = TorrentError::from(elapsed).with_context(format!("connecting to {}", addr));
                    warn!("{}", err);
                    return;
                }
            },
        };
        self.register(stream, addr).await;
    }

    async fn register(&self, mut stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            trace!("Failed to set nodelay for {}: {}", addr, e);
        }
        let exchange = timeout(self.handshake_timeout, handshake::exchange(&mut stream, self.info_hash, self.peer_id));
        let peer_id = tokio::select! {
            _ = self.stop.cancelled() => return,
            result = exchange => match result {
                Ok(Ok(peer_id)) => peer_id,
                Ok(Err(e)) => {
                    debug!("Handshake with {} failed: {}", addr, e);
                    return;
                }
                Err(elapsed) => {
                    let err = TorrentError::from(elapsed).with_context(format!("handshake with {}", addr));
                    debug!("{}", err);
                    return;
                }
            },
        };
        debug!("Handshake completed with peer: {} ({})", addr, hex::encode(peer_id));
        let _ = self.commands.send(Command::Register { stream, addr, peer_id });
    }
}

async fn accept_loop(listener: TcpListener, connector: Connector) {
    loop {
        tokio::select! {
            _ = connector.stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Accepted connection from {}", addr);
                    let connector = connector.clone();
                    tokio::spawn(async move { connector.register(stream, addr).await });
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            },
        }
    }
    debug!("Accept loop stopped");
}

/// A registered link and the pieces the actor has seen it announce
struct LinkEntry {
    link: Arc<PeerLink>,
    known: Bitfield,
    /// Permits for requests of this peer being served
    uploads: Arc<Semaphore>,
}

/// The actor owning all torrent-wide state
struct Coordinator {
    info: Arc<TorrentInfo>,
    storage: Arc<dyn Storage>,
    verifier: Arc<dyn PieceVerifier>,
    policy: Box<dyn CorruptionPolicy>,
    config: TorrentConfig,
    tracker: PieceTracker,
    scheduler: RequestScheduler,
    choker: Choker,
    links: HashMap<LinkId, LinkEntry>,
    next_id: u64,
    events_tx: mpsc::Sender<PeerEvent>,
    disconnects_tx: mpsc::UnboundedSender<LinkId>,
    stop: CancellationToken,
    notifications: Arc<Notifications>,
    downloaded: u64,
    uploaded: Arc<AtomicU64>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<PeerEvent>,
        mut disconnects: mpsc::UnboundedReceiver<LinkId>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        if self.tracker.is_complete() {
            info!("All {} pieces present, seeding", self.info.piece_count());
            self.notifications.complete.send_replace(true);
        }
        self.publish_stats();

        let mut tick = interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rechoke = interval(self.config.rechoke_interval());
        rechoke.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                Some(link) = disconnects.recv() => self.on_disconnect(link).await,
                Some(command) = commands.recv() => self.on_command(command),
                Some(event) = events.recv() => self.on_event(event).await,
                _ = tick.tick() => self.on_tick().await,
                _ = rechoke.tick() => self.rechoke(true).await,
            }
        }

        for entry in self.links.values() {
            entry.link.close();
        }
        self.publish_stats();
        info!("Torrent {} stopped", self.info.info_hash_hex());
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Register { stream, addr, peer_id } => self.register(stream, addr, peer_id),
        }
    }

    fn register(&mut self, stream: TcpStream, addr: SocketAddr, peer_id: PeerId) {
        if self.links.len() >= self.config.max_peers {
            debug!("Dropping {}: peer limit {} reached", addr, self.config.max_peers);
            return;
        }
        if self.links.values().any(|e| e.link.peer_id() == peer_id) {
            debug!("Dropping {}: peer {} already connected", addr, hex::encode(peer_id));
            return;
        }

        self.next_id += 1;
        let id = LinkId(self.next_id);
        let link = PeerLink::new(
            stream,
            LinkParams {
                id,
                peer_id,
                addr,
                info: self.info.clone(),
                events: self.events_tx.clone(),
                disconnects: self.disconnects_tx.clone(),
                stop: self.stop.child_token(),
                read_timeout: self.config.read_timeout(),
                outbound_queue_len: self.config.outbound_queue_len,
            },
        );
        info!("Peer {} connected as link {}", addr, id);

        let local = self.tracker.have().clone();
        let runner = link.clone();
        tokio::spawn(async move {
            let _ = runner.run(local).await;
        });
        self.links.insert(
            id,
            LinkEntry {
                link,
                known: Bitfield::new(self.info.piece_count()),
                uploads: Arc::new(Semaphore::new(self.config.max_upload_requests)),
            },
        );
        self.publish_stats();
    }

    async fn on_event(&mut self, event: PeerEvent) {
        let id = event.link;
        let Some(link) = self.links.get(&id).map(|e| e.link.clone()) else {
            trace!("Dropping event from departed link {}", id);
            return;
        };

        match event.kind {
            PeerEventKind::Have(index) => {
                let added = match self.links.get_mut(&id) {
                    Some(entry) if !entry.known.has(index) => entry.known.set(index).is_ok(),
                    _ => false,
                };
                if added {
                    self.scheduler.peer_has(index);
                }
                let wanted = self.tracker.piece(index).map(|p| p.is_wanted()).unwrap_or(false);
                if wanted {
                    if let Err(e) = link.send_interested().await {
                        debug!("Link {}: {}", id, e);
                    }
                    self.plan(id).await;
                }
            }
            PeerEventKind::Choke => {
                let released = self.scheduler.release_link(id);
                if !released.is_empty() {
                    debug!("Link {} choked us, released {} requests", id, released.len());
                    self.plan_all().await;
                }
            }
            PeerEventKind::Unchoke => self.plan(id).await,
            PeerEventKind::Interested | PeerEventKind::NotInterested => self.rechoke(false).await,
            PeerEventKind::Request(block) => self.serve(id, block),
            PeerEventKind::Block { block, data } => {
                self.on_block(id, block, data).await;
                self.plan(id).await;
            }
        }
    }

    fn serve(&self, id: LinkId, block: BlockInfo) {
        let Some(entry) = self.links.get(&id) else {
            return;
        };
        let link = entry.link.clone();
        if link.am_choking() {
            debug!("Ignoring request {} from choked link {}", block, link.id());
            return;
        }
        if !self.tracker.have().has(block.piece_index) {
            debug!("Ignoring request {} for a piece we lack", block);
            return;
        }
        // released once the piece is queued on the link
        let permit = match entry.uploads.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("Dropping request {} from link {}: too many being served", block, id);
                return;
            }
        };

        let storage = self.storage.clone();
        let uploaded = self.uploaded.clone();
        let offset = self.info.piece_offset(block.piece_index) + u64::from(block.offset);
        tokio::spawn(async move {
            match storage.read_at(offset, block.len).await {
                Ok(data) => {
                    if link.send_piece(block, data).await.is_ok() {
                        uploaded.fetch_add(u64::from(block.len), Ordering::Relaxed);
                    }
                }
                Err(e) => warn!("Failed to read {} for link {}: {}", block, link.id(), e),
            }
            drop(permit);
        });
    }

    async fn on_block(&mut self, id: LinkId, block: BlockInfo, data: Bytes) {
        if !self.scheduler.take(id, &block) {
            debug!("Discarding unrequested block {} from link {}", block, id);
            return;
        }
        self.downloaded += data.len() as u64;

        match self.tracker.receive_block(id, block, &data) {
            Ok(BlockOutcome::Stored) => {}
            Ok(BlockOutcome::PieceReady(piece)) => self.verify(block.piece_index, piece).await,
            Ok(outcome) => debug!("Block {} from link {}: {:?}", block, id, outcome),
            Err(e) => warn!("Rejected block {} from link {}: {}", block, id, e),
        }
    }

    async fn verify(&mut self, index: u32, data: Bytes) {
        if !self.verifier.verify(index, &data) {
            warn!("Piece {} failed verification", index);
            if let VerifyOutcome::Failed(contributors) = self.tracker.finish_verification(index, false) {
                for banned in self.policy.on_hash_failure(index, &contributors) {
                    if let Some(entry) = self.links.get(&banned) {
                        warn!("Disconnecting link {} for corrupt data", banned);
                        entry.link.close();
                    }
                }
            }
            self.plan_all().await;
            return;
        }

        let offset = self.info.piece_offset(index);
        if let Err(e) = self.storage.write_at(offset, &data).await {
            let err = e
                .downcast_ref::<TorrentError>()
                .cloned()
                .unwrap_or_else(|| TorrentError::storage_error_full("Failed to write piece", format!("piece {}", index), e.to_string()));
            self.notifications.fail(err);
            self.stop.cancel();
            return;
        }

        if self.tracker.finish_verification(index, true) != VerifyOutcome::Completed {
            return;
        }
        debug!("Piece {} complete ({}/{})", index, self.tracker.have().count(), self.info.piece_count());

        let entries: Vec<(Arc<PeerLink>, bool)> = self
            .links
            .values()
            .map(|e| (e.link.clone(), self.tracker.wants_any(&e.known)))
            .collect();
        for (link, wanted) in entries {
            let sent = link.send_have(index).await;
            let sent = match sent {
                Ok(()) if !wanted => link.send_not_interested().await,
                other => other,
            };
            if let Err(e) = sent {
                debug!("Link {}: {}", link.id(), e);
            }
        }

        self.publish_stats();
        if self.tracker.is_complete() {
            info!("Torrent {} complete", self.info.info_hash_hex());
            self.notifications.complete.send_replace(true);
        }
    }

    /// Send new requests on `id` while its pipeline has room
    async fn plan(&mut self, id: LinkId) {
        let Some(entry) = self.links.get(&id) else {
            return;
        };
        if !entry.link.can_request() {
            return;
        }
        let link = entry.link.clone();
        let blocks = self.scheduler.plan(id, &entry.known, &self.tracker, std::time::Instant::now());
        for block in blocks {
            if let Err(e) = link.send_request(block).await {
                // the disconnect notice will release the rest
                debug!("Link {}: {}", id, e);
                break;
            }
        }
    }

    async fn plan_all(&mut self) {
        let ids: Vec<LinkId> = self.links.keys().copied().collect();
        for id in ids {
            self.plan(id).await;
        }
    }

    async fn on_tick(&mut self) {
        let expired = self.scheduler.expire(std::time::Instant::now());
        for request in &expired {
            if let Some(entry) = self.links.get(&request.link) {
                debug!("Request {} on link {} stalled", request.block, request.link);
                if let Err(e) = entry.link.send_cancel(request.block).await {
                    debug!("Link {}: {}", request.link, e);
                }
            }
        }
        self.plan_all().await;
        self.publish_stats();
    }

    async fn rechoke(&mut self, periodic: bool) {
        let candidates: Vec<ChokeCandidate> = self
            .links
            .values()
            .map(|e| ChokeCandidate {
                link: e.link.id(),
                interested: e.link.peer_interested(),
                downloaded: e.link.downloaded(),
                connected_at: e.link.connected_at(),
            })
            .collect();
        let unchoked = self.choker.rechoke(&candidates, periodic);

        let links: Vec<Arc<PeerLink>> = self.links.values().map(|e| e.link.clone()).collect();
        for link in links {
            let result = if unchoked.contains(&link.id()) {
                link.send_unchoke().await
            } else {
                link.send_choke().await
            };
            if let Err(e) = result {
                debug!("Link {}: {}", link.id(), e);
            }
        }
    }

    async fn on_disconnect(&mut self, id: LinkId) {
        let Some(entry) = self.links.remove(&id) else {
            return;
        };
        info!("Link {} ({}) disconnected", id, entry.link.addr());
        self.scheduler.peer_lost(&entry.known);
        let released = self.scheduler.release_link(id);
        self.choker.remove(id);
        self.policy.forget(id);

        if !released.is_empty() {
            debug!("Released {} requests of link {}", released.len(), id);
            self.plan_all().await;
        }
        self.rechoke(false).await;
        self.publish_stats();
    }

    fn publish_stats(&self) {
        let stats = TorrentStats {
            pieces_owned: self.tracker.have().count(),
            piece_count: self.info.piece_count(),
            peers: self.links.len(),
            downloaded: self.downloaded,
            uploaded: self.uploaded.load(Ordering::Relaxed),
        };
        self.notifications.stats.send_replace(stats);
    }
}
