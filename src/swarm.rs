//! Swarm coordinator
//!
//! Owns the piece inventory, storage, and the table of peer sessions for one
//! torrent. The flow: optional resume scan, initial `started` announce
//! (fatal only if every tracker fails), then a dial loop that keeps up to
//! `max_peers` concurrent sessions running while a ticker re-announces on
//! the tracker's interval. Completion or cancellation collapses every
//! session, fires the final `completed`/`stopped` announce, and flushes
//! storage.
//!
//! Each session is one task: it sends `interested` on entry, reads messages
//! under the per-message deadline, paces keep-alives, and keeps a pipeline
//! of up to `pipeline_depth` block requests in flight whenever the peer has
//! us unchoked. Peer failures never terminate the download; they release
//! the session's outstanding block requests back to the inventory.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, StrategyKind};
use crate::error::{ClientError, ProtocolErrorKind, Result};
use crate::metainfo::Metainfo;
use crate::peer::{PeerConnection, PeerMessage};
use crate::piece::{BlockOutcome, BlockRequest, PieceManager, Progress};
use crate::storage::FileStorage;
use crate::strategy::{PieceStrategy, RandomStrategy, RarestFirstStrategy};
use crate::tracker::{
    is_valid_peer, AnnounceEvent, AnnounceRequest, AnnounceResponse, PeerEndpoint, TrackerClient,
};

/// Cadence of the dial/completion maintenance tick
const DIAL_ROUND_INTERVAL: Duration = Duration::from_secs(1);

/// Grace period between cancelling sessions and aborting stragglers
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

/// Counters shared across sessions
struct SwarmStats {
    downloaded: AtomicU64,
    peers_connected: AtomicU64,
    seeders: AtomicU64,
    leechers: AtomicU64,
}

/// Snapshot of the swarm for progress reporting
#[derive(Debug, Clone)]
pub struct SwarmStatus {
    /// Piece-level progress
    pub progress: Progress,
    /// Currently connected peers
    pub connected_peers: u64,
    /// Addresses known but not necessarily connected
    pub known_peers: usize,
    /// Block payload bytes received
    pub downloaded_bytes: u64,
    /// Seeders per the last tracker response
    pub seeders: u64,
    /// Leechers per the last tracker response
    pub leechers: u64,
}

/// Download coordinator for a single torrent
pub struct SwarmDownloader {
    metainfo: Arc<Metainfo>,
    config: ClientConfig,
    piece_manager: Arc<PieceManager>,
    storage: Arc<FileStorage>,
    strategy: Arc<dyn PieceStrategy>,
    tracker: TrackerClient,
    known_peers: Mutex<HashSet<SocketAddr>>,
    sessions: Mutex<HashMap<SocketAddr, JoinHandle<()>>>,
    stats: SwarmStats,
    /// First unrecoverable error observed by any session
    fatal: Mutex<Option<ClientError>>,
    cancel: CancellationToken,
}

impl SwarmDownloader {
    /// Set up storage, the piece inventory, and the selection strategy.
    pub fn new(metainfo: Metainfo, config: ClientConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let metainfo = Arc::new(metainfo);
        let storage = Arc::new(FileStorage::create(
            Arc::clone(&metainfo),
            &config.output_dir,
        )?);
        let piece_manager = Arc::new(PieceManager::new(
            Arc::clone(&metainfo),
            Arc::clone(&storage),
        ));

        let strategy: Arc<dyn PieceStrategy> = match config.strategy {
            StrategyKind::RarestFirst => {
                Arc::new(RarestFirstStrategy::new(metainfo.info.num_pieces()))
            }
            StrategyKind::Random => Arc::new(RandomStrategy),
        };

        Ok(Arc::new(Self {
            metainfo,
            config,
            piece_manager,
            storage,
            strategy,
            tracker: TrackerClient::new()?,
            known_peers: Mutex::new(HashSet::new()),
            sessions: Mutex::new(HashMap::new()),
            stats: SwarmStats {
                downloaded: AtomicU64::new(0),
                peers_connected: AtomicU64::new(0),
                seeders: AtomicU64::new(0),
                leechers: AtomicU64::new(0),
            },
            fatal: Mutex::new(None),
            cancel: CancellationToken::new(),
        }))
    }

    /// The torrent this swarm downloads
    pub fn metainfo(&self) -> &Metainfo {
        &self.metainfo
    }

    /// Root cancellation token; cancelling it collapses every session.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request shutdown.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True once every piece has verified
    pub fn is_complete(&self) -> bool {
        self.piece_manager.is_complete()
    }

    /// Piece-level progress
    pub fn progress(&self) -> Progress {
        self.piece_manager.progress()
    }

    /// Swarm snapshot for progress displays
    pub fn status(&self) -> SwarmStatus {
        SwarmStatus {
            progress: self.piece_manager.progress(),
            connected_peers: self.stats.peers_connected.load(Ordering::Relaxed),
            known_peers: self.known_peers.lock().len(),
            downloaded_bytes: self.stats.downloaded.load(Ordering::Relaxed),
            seeders: self.stats.seeders.load(Ordering::Relaxed),
            leechers: self.stats.leechers.load(Ordering::Relaxed),
        }
    }

    /// Currently connected peer count
    pub fn peer_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Add already-vetted peer addresses to the dial pool. Embedders can
    /// inject peers obtained out of band.
    pub fn add_known_peers(&self, peers: impl IntoIterator<Item = SocketAddr>) {
        let mut known = self.known_peers.lock();
        for addr in peers {
            known.insert(addr);
        }
    }

    /// Feed tracker-discovered peers into the dial pool, dropping invalid
    /// entries (loopback, unparseable hosts, port 0).
    fn add_tracker_peers(&self, peers: Vec<PeerEndpoint>) {
        self.add_known_peers(
            peers
                .iter()
                .filter(|peer| is_valid_peer(peer))
                .filter_map(|peer| peer.socket_addr()),
        );
    }

    /// Run the download to completion or cancellation. Returns `Ok(true)`
    /// when the content fully verified, `Ok(false)` on a clean early stop.
    pub async fn run(self: Arc<Self>) -> Result<bool> {
        if self.config.resume_scan {
            let scanned = self.storage.completion_bitfield()?;
            let found = scanned.count_complete();
            if found > 0 {
                tracing::info!(
                    "resume scan: {}/{} pieces already on disk",
                    found,
                    self.metainfo.info.num_pieces()
                );
            }
            self.piece_manager.restore(&scanned);
        }

        if self.piece_manager.is_complete() {
            tracing::info!("{} is already complete", self.metainfo.info.name);
            return Ok(true);
        }

        // Initial announce; every tracker failing here is fatal.
        let trackers = self.metainfo.all_trackers();
        let response = self
            .tracker
            .announce_all(&trackers, &self.announce_request(AnnounceEvent::Started))
            .await?;
        self.record_swarm_counts(&response);
        tracing::info!(
            "tracker returned {} peers, interval {}s",
            response.peers.len(),
            response.interval
        );
        let announce_interval = Duration::from_secs(response.interval as u64);
        self.add_tracker_peers(response.peers);

        let announcer = tokio::spawn(Arc::clone(&self).run_announcer(announce_interval));

        let loop_result = Arc::clone(&self).run_peer_loop().await;

        self.cancel.cancel();
        announcer.abort();

        // Final announce: completed when the bitfield is full, else stopped.
        let complete = self.piece_manager.is_complete();
        let event = if complete {
            AnnounceEvent::Completed
        } else {
            AnnounceEvent::Stopped
        };
        if let Err(e) = self
            .tracker
            .announce_all(&trackers, &self.announce_request(event))
            .await
        {
            tracing::debug!("final announce failed: {}", e);
        }

        loop_result?;
        self.storage.sync()?;
        Ok(complete)
    }

    /// Dial/completion maintenance loop. Public so embedders (and tests)
    /// can drive a swarm from injected peers without tracker traffic.
    pub async fn run_peer_loop(self: Arc<Self>) -> Result<()> {
        let mut dial_tick = tokio::time::interval(DIAL_ROUND_INTERVAL);
        let mut fatal_error = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = dial_tick.tick() => {
                    if let Some(error) = self.fatal.lock().take() {
                        fatal_error = Some(error);
                        self.cancel.cancel();
                        break;
                    }
                    if self.piece_manager.is_complete() {
                        tracing::info!("download of {} complete", self.metainfo.info.name);
                        self.cancel.cancel();
                        break;
                    }
                    self.dial_new_peers();
                }
            }
        }

        // Sessions observe the token between messages; abort stragglers.
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        let handles: Vec<JoinHandle<()>> =
            self.sessions.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.abort();
        }

        match fatal_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Periodic re-announces at the tracker-supplied interval. Failures are
    /// swallowed and retried next cycle.
    async fn run_announcer(self: Arc<Self>, initial_interval: Duration) {
        let mut period = initial_interval;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {
                    let request = self.announce_request(AnnounceEvent::None);
                    match self
                        .tracker
                        .announce_all(&self.metainfo.all_trackers(), &request)
                        .await
                    {
                        Ok(response) => {
                            self.record_swarm_counts(&response);
                            period = Duration::from_secs(response.interval as u64);
                            self.add_tracker_peers(response.peers);
                        }
                        Err(e) => {
                            tracing::warn!("periodic announce failed: {}", e);
                            period = self.config.announce_fallback_interval;
                        }
                    }
                }
            }
        }
    }

    fn announce_request(&self, event: AnnounceEvent) -> AnnounceRequest {
        let progress = self.piece_manager.progress();
        AnnounceRequest {
            info_hash: self.metainfo.info_hash,
            port: self.config.listen_port,
            downloaded: self.stats.downloaded.load(Ordering::Relaxed),
            left: progress.bytes_remaining(),
            event,
        }
    }

    fn record_swarm_counts(&self, response: &AnnounceResponse) {
        if let Some(seeders) = response.complete {
            self.stats.seeders.store(seeders as u64, Ordering::Relaxed);
        }
        if let Some(leechers) = response.incomplete {
            self.stats
                .leechers
                .store(leechers as u64, Ordering::Relaxed);
        }
    }

    /// Spawn sessions for known peers we are not yet connected to, up to
    /// the peer cap. Dials that fail simply end their session task.
    fn dial_new_peers(self: &Arc<Self>) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, handle| !handle.is_finished());

        let capacity = self.config.max_peers.saturating_sub(sessions.len());
        if capacity == 0 {
            return;
        }

        let candidates: Vec<SocketAddr> = {
            let known = self.known_peers.lock();
            known
                .iter()
                .filter(|addr| !sessions.contains_key(*addr))
                .take(capacity)
                .copied()
                .collect()
        };

        for addr in candidates {
            let swarm = Arc::clone(self);
            let handle = tokio::spawn(async move {
                if let Err(e) = Arc::clone(&swarm).run_peer_session(addr).await {
                    tracing::debug!("peer {} session ended: {}", addr, e);
                }
                swarm.sessions.lock().remove(&addr);
            });
            sessions.insert(addr, handle);
        }
    }

    /// One full peer session: dial, handshake, drive the message loop, and
    /// on the way out release any still-outstanding block requests so other
    /// peers can pick them up.
    async fn run_peer_session(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let mut conn = PeerConnection::connect(
            addr,
            self.metainfo.info_hash,
            *self.tracker.peer_id(),
            self.metainfo.info.num_pieces(),
            self.config.dial_timeout,
            self.config.handshake_timeout,
        )
        .await?;
        tracing::debug!("connected to peer {}", addr);
        self.stats.peers_connected.fetch_add(1, Ordering::Relaxed);

        let mut outstanding: HashSet<(u32, u32)> = HashSet::new();
        let result = self.drive_session(&mut conn, &mut outstanding).await;

        let mut by_piece: HashMap<u32, Vec<u32>> = HashMap::new();
        for (piece, offset) in outstanding.drain() {
            by_piece.entry(piece).or_default().push(offset);
        }
        for (piece, offsets) in by_piece {
            self.piece_manager.release_requests(piece, &offsets);
        }

        self.stats.peers_connected.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn drive_session(
        &self,
        conn: &mut PeerConnection,
        outstanding: &mut HashSet<(u32, u32)>,
    ) -> Result<()> {
        // Leech-only: we never have anything to offer, so interest is
        // unconditional and no bitfield is sent.
        conn.send(PeerMessage::Interested).await?;

        let mut observed_availability = false;
        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.tick().await; // the first tick completes immediately

        enum Event {
            Cancelled,
            KeepaliveTick,
            Message(Result<PeerMessage>),
        }

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => Event::Cancelled,
                _ = keepalive.tick() => Event::KeepaliveTick,
                message = conn.recv_timeout(self.config.message_timeout) => Event::Message(message),
            };

            match event {
                Event::Cancelled => return Ok(()),

                Event::KeepaliveTick => {
                    if conn.receive_idle_time() >= self.config.inactivity_limit {
                        tracing::debug!("peer {} inactive, closing", conn.addr());
                        return Ok(());
                    }
                    if conn.idle_time() >= self.config.keepalive_interval {
                        conn.send(PeerMessage::KeepAlive).await?;
                    }
                }

                Event::Message(message) => {
                    let message = message?;
                    self.handle_message(conn, outstanding, message, &mut observed_availability)
                        .await?;
                }
            }
        }
    }

    async fn handle_message(
        &self,
        conn: &mut PeerConnection,
        outstanding: &mut HashSet<(u32, u32)>,
        message: PeerMessage,
        observed_availability: &mut bool,
    ) -> Result<()> {
        match message {
            PeerMessage::Unchoke => {
                self.fill_pipeline(conn, outstanding).await?;
            }

            // Outstanding requests stay marked: the peer may still answer
            // them, and a timeout will release them via session teardown.
            PeerMessage::Choke => {}

            PeerMessage::Bitfield { .. } => {
                if !*observed_availability {
                    self.strategy.observe_bitfield(conn.peer_pieces());
                    *observed_availability = true;
                }
                self.fill_pipeline(conn, outstanding).await?;
            }

            PeerMessage::Have { .. } => {
                if !*observed_availability {
                    self.strategy.observe_bitfield(conn.peer_pieces());
                    *observed_availability = true;
                }
                self.fill_pipeline(conn, outstanding).await?;
            }

            PeerMessage::Piece {
                index,
                begin,
                block,
            } => {
                outstanding.remove(&(index, begin));
                let received = block.len() as u64;

                match self.piece_manager.add_block(index, begin, block) {
                    Ok(BlockOutcome::PieceVerified) => {
                        tracing::debug!("piece {} verified via {}", index, conn.addr());
                    }
                    Ok(BlockOutcome::InProgress) => {}
                    Err(
                        e @ ClientError::Protocol {
                            kind: ProtocolErrorKind::HashMismatch,
                            ..
                        },
                    ) => {
                        // The record is gone; drop our in-flight marks for
                        // the recycled piece.
                        tracing::warn!("{} (peer {})", e, conn.addr());
                        outstanding.retain(|(piece, _)| *piece != index);
                    }
                    Err(e @ ClientError::Storage { .. }) => {
                        tracing::error!("storage failure: {}", e);
                        *self.fatal.lock() = Some(e);
                        self.cancel.cancel();
                        return Ok(());
                    }
                    Err(e) => {
                        // Late or unusable block, e.g. the piece completed
                        // through another peer. Not worth the session.
                        tracing::debug!("peer {} block dropped: {}", conn.addr(), e);
                    }
                }

                self.stats.downloaded.fetch_add(received, Ordering::Relaxed);
                self.fill_pipeline(conn, outstanding).await?;
            }

            // Leech-only: we never serve, so requests and cancels are
            // dropped; port and unknown tags are ignored.
            PeerMessage::KeepAlive
            | PeerMessage::Interested
            | PeerMessage::NotInterested
            | PeerMessage::Request { .. }
            | PeerMessage::Cancel { .. }
            | PeerMessage::Port { .. }
            | PeerMessage::Unknown { .. } => {}
        }

        Ok(())
    }

    /// Top the request pipeline up to `pipeline_depth` while unchoked.
    async fn fill_pipeline(
        &self,
        conn: &mut PeerConnection,
        outstanding: &mut HashSet<(u32, u32)>,
    ) -> Result<()> {
        if conn.am_choked() {
            return Ok(());
        }

        while outstanding.len() < self.config.pipeline_depth {
            let Some(request) = self.next_work(conn) else {
                break;
            };
            conn.send(PeerMessage::Request {
                index: request.piece,
                begin: request.offset,
                length: request.length,
            })
            .await?;
            outstanding.insert((request.piece, request.offset));
        }

        Ok(())
    }

    /// Find the next block this peer should fetch: first top up pieces
    /// already in progress that the peer can serve, then ask the strategy
    /// for a fresh piece.
    fn next_work(&self, conn: &PeerConnection) -> Option<BlockRequest> {
        for index in self.piece_manager.pending_indices() {
            if !conn.peer_has_piece(index) {
                continue;
            }
            if let Ok(Some(request)) = self.piece_manager.next_block_request(index) {
                return Some(request);
            }
        }

        let missing = self.piece_manager.missing_indices();
        if missing.is_empty() {
            return None;
        }

        let index = self.strategy.select(&missing, conn.peer_pieces())?;
        if self.piece_manager.start(index).is_err() {
            // Another session claimed it between select and start; the next
            // pipeline refill will try again.
            return None;
        }
        self.piece_manager.next_block_request(index).ok().flatten()
    }
}
