//! Session coordinator
//!
//! A single task owns the piece manager, the file manager and every peer
//! connection. Transports, tracker rounds and timers only ever talk to it
//! through channels, so none of this state is shared.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::peer::{
    spawn_transport, LocalIdentity, PeerConnection, PeerEvent, PeerEventKind, PeerKey, PeerNotification,
};
use crate::protocol::{Handshake, Message};
use crate::session::commands::{Command, Internal};
use crate::session::config::SessionConfig;
use crate::session::stats::{SessionState, SpeedMeter, TorrentStatus};
use crate::storage::{BlockOutcome, CompletedPiece, FileManager, PieceManager};
use crate::torrent::TorrentInfo;
use crate::tracker::{AnnounceRequest, Announcer, TrackerEvent};

/// Invoked once with the torrent name when the last piece is verified
pub type CompletionCallback = Box<dyn FnOnce(String) + Send>;

/// Receivers the run loop drains; split from the coordinator so handlers can borrow it mutably
pub struct Inbox {
    events: mpsc::UnboundedReceiver<PeerEvent>,
    internal: mpsc::UnboundedReceiver<Internal>,
}

/// What the run loop does after a command
enum Flow {
    Continue,
    ResetTimers,
    Stop,
}

pub struct Coordinator {
    info: TorrentInfo,
    config: SessionConfig,
    identity: LocalIdentity,
    pieces: PieceManager,
    files: FileManager,
    announcer: Arc<dyn Announcer>,
    peers: HashMap<PeerKey, PeerConnection>,
    next_key: PeerKey,
    /// Every address any tracker has returned, in arrival order
    known_peers: Vec<SocketAddr>,
    known: HashSet<SocketAddr>,
    /// Addresses dialled since the last resume
    tried: HashSet<SocketAddr>,
    /// Peers we unchoked, oldest first
    unchoked: VecDeque<PeerKey>,
    state: SessionState,
    on_complete: Option<CompletionCallback>,
    received: u64,
    uploaded: u64,
    speed: SpeedMeter,
    announce_interval: Duration,
    /// The first tracker-suggested interval has replaced the default
    tracker_interval: bool,
    reschedule_announce: Option<Duration>,
    announce_in_flight: bool,
    started_sent: bool,
    last_shortfall_announce: Option<Instant>,
    /// Bumped on pause; delayed work tagged with an older epoch is dropped
    epoch: u64,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl Coordinator {
    /// Open storage and replay the resume record
    pub async fn new(
        info: TorrentInfo,
        destination: &Path,
        config: SessionConfig,
        announcer: Arc<dyn Announcer>,
        on_complete: Option<CompletionCallback>,
    ) -> Result<(Self, Inbox)> {
        let files = FileManager::open(&info, destination, config.resume_every_pieces, config.resume_every).await?;
        let mut pieces = PieceManager::new(&info, config.endgame_threshold, config.block_batch);

        let recorded = files.get_resume_json_file().await;
        let restored = recorded
            .into_iter()
            .filter(|&index| pieces.mark_piece_complete(index))
            .count();
        if restored > 0 {
            info!("Resuming {}: {}/{} pieces already verified", info.name, restored, pieces.piece_count());
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let identity = LocalIdentity {
            info_hash: info.info_hash,
            peer_id: Handshake::generate_peer_id(),
        };
        let announce_interval = config.announce_interval;

        let coordinator = Self {
            info,
            config,
            identity,
            pieces,
            files,
            announcer,
            peers: HashMap::new(),
            next_key: 0,
            known_peers: Vec::new(),
            known: HashSet::new(),
            tried: HashSet::new(),
            unchoked: VecDeque::new(),
            state: SessionState::Active,
            on_complete,
            received: 0,
            uploaded: 0,
            speed: SpeedMeter::default(),
            announce_interval,
            tracker_interval: false,
            reschedule_announce: None,
            announce_in_flight: false,
            started_sent: false,
            last_shortfall_announce: None,
            epoch: 0,
            events_tx,
            internal_tx,
        };
        Ok((coordinator, Inbox { events, internal }))
    }

    /// Event loop; returns after shutdown, removal or once every handle is dropped
    pub async fn run(mut self, mut inbox: Inbox, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.begin().await;

        let mut unchoke = interval_at(Instant::now() + self.config.unchoke_interval, self.config.unchoke_interval);
        let mut announce = interval_at(Instant::now() + self.announce_interval, self.announce_interval);
        let mut speed_tick = interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                Some(event) = inbox.events.recv() => self.handle_peer_event(event).await,
                Some(message) = inbox.internal.recv() => self.handle_internal(message),
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("All session handles dropped");
                        self.shutdown().await;
                        break;
                    };
                    match self.handle_command(command).await {
                        Flow::Continue => {}
                        Flow::ResetTimers => {
                            unchoke.reset();
                            announce = interval_at(Instant::now() + self.announce_interval, self.announce_interval);
                        }
                        Flow::Stop => break,
                    }
                }
                _ = unchoke.tick(), if self.state == SessionState::Active => self.rotate_unchokes(),
                _ = announce.tick(), if self.state == SessionState::Active => self.spawn_announce(TrackerEvent::None),
                _ = speed_tick.tick() => self.speed.sample(self.received),
            }

            if let Some(period) = self.reschedule_announce.take() {
                announce = interval_at(Instant::now() + period, period);
            }
        }
        info!("Session for {} stopped", self.info.name);
    }

    async fn begin(&mut self) {
        if self.pieces.is_done() {
            info!("{} is already complete", self.info.name);
            self.finish().await;
            return;
        }
        self.spawn_announce(TrackerEvent::Started);
    }

    async fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Pause { responder } => {
                self.pause().await;
                let _ = responder.send(Ok(()));
                Flow::Continue
            }
            Command::Resume { responder } => {
                let resumed = self.resume();
                let _ = responder.send(Ok(()));
                if resumed {
                    Flow::ResetTimers
                } else {
                    Flow::Continue
                }
            }
            Command::Status { responder } => {
                let _ = responder.send(self.status());
                Flow::Continue
            }
            Command::Remove { delete_data, responder } => {
                self.shutdown().await;
                let _ = responder.send(self.remove_files(delete_data).await);
                Flow::Stop
            }
            Command::Shutdown { responder } => {
                self.shutdown().await;
                let _ = responder.send(());
                Flow::Stop
            }
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::PeersDiscovered { peers, interval } => self.on_peers_discovered(peers, interval),
            Internal::EndgameKick { epoch } => {
                if epoch == self.epoch && self.state == SessionState::Active && self.pieces.is_endgame_mode() {
                    debug!("Re-issuing endgame requests after resume");
                    self.request_endgame();
                }
            }
        }
    }

    pub fn status(&self) -> TorrentStatus {
        let total = self.pieces.total_size();
        let downloaded = self.pieces.bytes_completed();
        let percent = if total == 0 {
            100.0
        } else {
            downloaded as f64 * 100.0 / total as f64
        };
        TorrentStatus {
            name: self.info.name.clone(),
            state: self.state,
            percent,
            downloaded,
            uploaded: self.uploaded,
            total,
            speed: self.speed.bytes_per_sec(),
            peers: self.peers.values().filter(|c| c.is_ready()).count(),
            completed_pieces: self.pieces.completed_count(),
            total_pieces: self.pieces.piece_count(),
        }
    }

    // ---- peers ----

    fn allocate_key(&mut self) -> PeerKey {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    fn attach(&mut self, key: PeerKey, addr: SocketAddr, outbound: mpsc::UnboundedSender<Message>) {
        let conn = PeerConnection::new(key, addr, self.pieces.piece_count(), self.config.max_pipeline, outbound);
        self.peers.insert(key, conn);
    }

    fn is_connected(&self, addr: SocketAddr) -> bool {
        self.peers.values().any(|c| c.addr() == addr)
    }

    fn connect_peer(&mut self, addr: SocketAddr) {
        if self.is_connected(addr) || self.peers.len() >= self.config.max_connections {
            return;
        }
        self.tried.insert(addr);
        let key = self.allocate_key();
        trace!("Dialling {} as peer {}", addr, key);
        let (outbound, _transport) =
            spawn_transport(key, addr, self.identity, self.config.transport(), self.events_tx.clone());
        self.attach(key, addr, outbound);
    }

    /// Dial up to `limit` known addresses not tried since the last resume
    fn connect_untried(&mut self, limit: usize) -> usize {
        let fresh: Vec<SocketAddr> = self
            .known_peers
            .iter()
            .copied()
            .filter(|addr| !self.tried.contains(addr) && !self.is_connected(*addr))
            .take(limit)
            .collect();
        let count = fresh.len();
        for addr in fresh {
            self.connect_peer(addr);
        }
        count
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        let key = event.key;
        match event.kind {
            PeerEventKind::Connected => {
                if let Some(conn) = self.peers.get_mut(&key) {
                    trace!("Peer {} connected, handshaking", key);
                    conn.on_connected();
                }
            }
            PeerEventKind::Handshaken { peer_id, extensions } => {
                let ours = self.pieces.completed_bitfield();
                if let Some(conn) = self.peers.get_mut(&key) {
                    conn.on_handshake(peer_id, extensions, &ours);
                    if self.state == SessionState::Complete {
                        conn.send_not_interested();
                    }
                }
            }
            PeerEventKind::Message(message) => {
                let Some(conn) = self.peers.get_mut(&key) else {
                    return;
                };
                if let Some(notification) = conn.handle_message(message) {
                    self.handle_notification(key, notification).await;
                }
            }
            PeerEventKind::Disconnected { reason } => self.on_disconnect(key, &reason),
        }
    }

    async fn handle_notification(&mut self, key: PeerKey, notification: PeerNotification) {
        match notification {
            PeerNotification::Choke => trace!("Peer {} choked us", key),
            PeerNotification::Unchoke => self.assign_work(key),
            PeerNotification::Interested => {
                if self.state == SessionState::Active && self.unchoked.len() < self.config.max_unchoked {
                    self.unchoke_peer(key);
                }
            }
            PeerNotification::NotInterested => {
                if let Some(conn) = self.peers.get_mut(&key) {
                    conn.choke();
                }
                self.unchoked.retain(|k| *k != key);
            }
            PeerNotification::Have(index) => {
                self.pieces.increment_piece_availability(index);
                self.assign_work(key);
            }
            PeerNotification::BitfieldReceived { previous } => {
                self.pieces.update_availability(&previous, false);
                if let Some(conn) = self.peers.get(&key) {
                    self.pieces.update_availability(&conn.peer.bitfield, true);
                }
                self.assign_work(key);
            }
            PeerNotification::Request { index, offset, length } => self.serve_request(key, index, offset, length).await,
            PeerNotification::Piece { index, offset, block } => self.on_block(key, index, offset, block).await,
        }
    }

    fn on_disconnect(&mut self, key: PeerKey, reason: &str) {
        let Some(mut conn) = self.peers.remove(&key) else {
            return;
        };
        debug!("Dropping peer {} ({}): {}", key, conn.addr(), reason);
        conn.close();
        self.pieces.update_availability(&conn.peer.bitfield, false);
        let released = self.pieces.release_peer(key);
        self.unchoked.retain(|k| *k != key);

        if self.state != SessionState::Active {
            return;
        }
        if !released.is_empty() {
            let idle: Vec<PeerKey> = self
                .peers
                .iter()
                .filter(|(_, c)| !c.has_work())
                .map(|(k, _)| *k)
                .collect();
            for other in idle {
                self.assign_work(other);
            }
        }
        if self.peers.len() < self.config.peer_floor && self.connect_untried(self.config.recruit_batch) == 0 {
            self.request_shortfall_announce();
        }
    }

    // ---- downloading ----

    /// Give an idle, unchoked peer the next piece it can serve
    fn assign_work(&mut self, key: PeerKey) {
        if self.state != SessionState::Active || self.pieces.is_done() {
            return;
        }
        let Some(conn) = self.peers.get_mut(&key) else {
            return;
        };
        if !conn.peer.can_request() || conn.has_work() {
            return;
        }
        let Some(index) = self.pieces.get_piece_to_download(&conn.peer.bitfield) else {
            trace!("Nothing to request from peer {}", key);
            return;
        };
        self.pieces.track_peer_assignment(index, key);
        let blocks = self.pieces.piece_blocks(index);
        debug!("Peer {} assigned piece {} ({} blocks)", key, index, blocks.len());
        for block in blocks {
            conn.request_block(index, block.offset, block.length);
        }
    }

    /// Queue a few more missing blocks of a piece the peer is working on
    fn top_up(&mut self, key: PeerKey, index: u32) {
        if !self.pieces.assigned_peers(index).contains(&key) {
            return;
        }
        let Some(conn) = self.peers.get_mut(&key) else {
            return;
        };
        let more: Vec<_> = self
            .pieces
            .missing_blocks(index)
            .into_iter()
            .filter(|b| !conn.is_requested(index, b.offset))
            .take(self.config.top_up_batch)
            .collect();
        for block in more {
            conn.request_block(index, block.offset, block.length);
        }
    }

    /// Ask every unchoked peer for every missing block of the remaining pieces it has
    fn request_endgame(&mut self) {
        let remaining: Vec<u32> = self.pieces.needed().collect();
        for (&key, conn) in self.peers.iter_mut() {
            if !conn.peer.can_request() {
                continue;
            }
            let held: Vec<u32> = remaining.iter().copied().filter(|&i| conn.peer.has_piece(i)).collect();
            for index in held {
                self.pieces.track_peer_assignment(index, key);
                for block in self.pieces.missing_blocks(index) {
                    conn.request_block(index, block.offset, block.length);
                }
            }
        }
    }

    async fn on_block(&mut self, key: PeerKey, index: u32, offset: u32, block: Vec<u8>) {
        self.received += block.len() as u64;
        match self.pieces.on_block_received(index, offset, &block, key) {
            BlockOutcome::Incomplete => self.top_up(key, index),
            BlockOutcome::Complete(piece) => self.on_piece_complete(key, piece).await,
            BlockOutcome::Failed => {
                warn!("Piece {} failed verification, downloading it again", index);
                self.assign_work(key);
            }
            BlockOutcome::Stale => self.assign_work(key),
        }
    }

    async fn on_piece_complete(&mut self, key: PeerKey, piece: CompletedPiece) {
        debug!(
            "Piece {} verified ({}/{})",
            piece.index,
            self.pieces.completed_count(),
            self.pieces.piece_count()
        );
        if let Err(e) = self.files.write_piece_to_file(piece.index, &piece.data).await {
            warn!("Failed to store piece {}: {}", piece.index, e);
        }
        self.files.note_piece_completed();

        for other in &piece.cancel_peers {
            if let Some(conn) = self.peers.get_mut(other) {
                let cancelled = conn.cancel_piece(piece.index);
                trace!("Cancelled {} requests for piece {} on peer {}", cancelled, piece.index, other);
            }
        }
        for conn in self.peers.values().filter(|c| c.is_ready()) {
            conn.send_have(piece.index);
        }
        self.save_resume(false).await;

        if self.pieces.is_done() {
            self.finish().await;
            return;
        }
        if piece.entered_endgame {
            self.request_endgame();
        }
        self.assign_work(key);
        for other in piece.cancel_peers {
            self.assign_work(other);
        }
    }

    /// Runs once when the last piece is verified
    async fn finish(&mut self) {
        if self.state == SessionState::Complete {
            return;
        }
        self.state = SessionState::Complete;
        self.save_resume(true).await;
        if let Err(e) = self.files.close().await {
            warn!("Failed to close files: {}", e);
        }
        for conn in self.peers.values_mut() {
            conn.send_not_interested();
            conn.choke();
        }
        self.unchoked.clear();
        info!("Download complete: {}", self.info.name);

        if let Some(callback) = self.on_complete.take() {
            callback(self.info.name.clone());
        }
        self.spawn_announce(TrackerEvent::Completed);
    }

    async fn save_resume(&mut self, force: bool) {
        let completed: Vec<u32> = self.pieces.completed().collect();
        if let Err(e) = self.files.write_to_resume(&completed, force).await {
            warn!("Failed to save resume record: {}", e);
        }
    }

    // ---- uploading ----

    async fn serve_request(&mut self, key: PeerKey, index: u32, offset: u32, length: u32) {
        let Some(conn) = self.peers.get(&key) else {
            return;
        };
        let in_bounds = (index as usize) < self.pieces.piece_count()
            && offset as u64 + length as u64 <= self.pieces.piece_size(index);
        if conn.peer.am_choking
            || length == 0
            || length > self.config.max_request_len
            || !in_bounds
            || !self.pieces.is_piece_complete(index)
        {
            debug!("Ignoring request {}:{}+{} from peer {}", index, offset, length, key);
            return;
        }

        match self.files.read_file_piece(index, offset, length).await {
            Ok(block) => {
                if let Some(conn) = self.peers.get_mut(&key) {
                    conn.send_piece(index, offset, block);
                    self.uploaded += length as u64;
                }
            }
            Err(e) => warn!("Failed to read block {}:{} for peer {}: {}", index, offset, key, e),
        }
    }

    fn unchoke_peer(&mut self, key: PeerKey) {
        let Some(conn) = self.peers.get_mut(&key) else {
            return;
        };
        if conn.peer.am_choking {
            conn.unchoke();
            self.unchoked.push_back(key);
            trace!("Unchoked peer {}", key);
        }
    }

    /// Periodic rotation: free the oldest slot if others wait, then fill up to the cap
    fn rotate_unchokes(&mut self) {
        self.unchoked.retain(|k| self.peers.contains_key(k));
        let mut waiting: Vec<PeerKey> = self
            .peers
            .iter()
            .filter(|(_, c)| c.is_ready() && c.peer.peer_interested && c.peer.am_choking)
            .map(|(k, _)| *k)
            .collect();
        waiting.sort_unstable();

        if self.unchoked.len() >= self.config.max_unchoked && !waiting.is_empty() {
            if let Some(oldest) = self.unchoked.pop_front() {
                if let Some(conn) = self.peers.get_mut(&oldest) {
                    conn.choke();
                }
                trace!("Choked peer {} to rotate", oldest);
            }
        }
        for key in waiting {
            if self.unchoked.len() >= self.config.max_unchoked {
                break;
            }
            self.unchoke_peer(key);
        }
    }

    // ---- trackers ----

    fn announce_request(&self, event: TrackerEvent) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.info.info_hash,
            peer_id: self.identity.peer_id,
            port: self.config.port,
            uploaded: self.uploaded,
            downloaded: self.received,
            left: self.pieces.total_size() - self.pieces.bytes_completed(),
            event,
            numwant: self.config.numwant,
        }
    }

    /// Query trackers off the coordinator task; the answer comes back as `PeersDiscovered`
    fn spawn_announce(&mut self, event: TrackerEvent) {
        if self.announce_in_flight && event == TrackerEvent::None {
            trace!("Announce already in flight");
            return;
        }
        let event = if event == TrackerEvent::None && !self.started_sent {
            TrackerEvent::Started
        } else {
            event
        };
        if event == TrackerEvent::Started {
            self.started_sent = true;
        }
        self.announce_in_flight = true;

        let request = self.announce_request(event);
        let announcer = Arc::clone(&self.announcer);
        let internal = self.internal_tx.clone();
        debug!("Announcing ({:?})", event);
        tokio::spawn(async move {
            let response = announcer.announce(&request).await;
            let _ = internal.send(Internal::PeersDiscovered {
                peers: response.peers,
                interval: response.interval,
            });
        });
    }

    fn request_shortfall_announce(&mut self) {
        let due = self
            .last_shortfall_announce
            .map_or(true, |at| at.elapsed() >= self.config.min_announce_gap);
        if !due || self.announce_in_flight {
            return;
        }
        debug!("Only {} peers left, asking trackers for more", self.peers.len());
        self.last_shortfall_announce = Some(Instant::now());
        self.spawn_announce(TrackerEvent::None);
    }

    fn on_peers_discovered(&mut self, peers: Vec<SocketAddr>, interval: Option<u32>) {
        self.announce_in_flight = false;
        if let (Some(secs), false) = (interval, self.tracker_interval) {
            debug!("Tracker asks for a {}s announce interval", secs);
            self.tracker_interval = true;
            self.announce_interval = Duration::from_secs(secs as u64);
            self.reschedule_announce = Some(self.announce_interval);
        }

        let total = peers.len();
        let mut added = 0;
        for addr in peers {
            if self.known.insert(addr) {
                self.known_peers.push(addr);
                added += 1;
            }
        }
        info!("Trackers returned {} peers ({} new)", total, added);

        if self.state != SessionState::Active {
            return;
        }
        let slots = self
            .config
            .max_connections
            .saturating_sub(self.peers.len())
            .min(self.config.fresh_batch);
        self.connect_untried(slots);
    }

    // ---- lifecycle ----

    fn drop_all_peers(&mut self) {
        for (_, mut conn) in self.peers.drain() {
            conn.close();
            self.pieces.update_availability(&conn.peer.bitfield, false);
        }
        self.unchoked.clear();
    }

    async fn pause(&mut self) {
        if self.state != SessionState::Active {
            debug!("Pause ignored in state {:?}", self.state);
            return;
        }
        info!("Pausing {}", self.info.name);
        self.state = SessionState::Paused;
        self.epoch += 1;
        self.drop_all_peers();
        self.pieces.release_all_assignments();
        self.save_resume(true).await;
    }

    /// True if the session was paused and is now active again
    fn resume(&mut self) -> bool {
        if self.state != SessionState::Paused {
            debug!("Resume ignored in state {:?}", self.state);
            return false;
        }
        info!("Resuming {}", self.info.name);
        self.state = SessionState::Active;
        self.tried.clear();
        self.speed.reset(self.received);
        self.connect_untried(self.config.fresh_batch);

        if self.pieces.is_endgame_mode() {
            let epoch = self.epoch;
            let grace = self.config.endgame_grace;
            let internal = self.internal_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let _ = internal.send(Internal::EndgameKick { epoch });
            });
        }
        self.announce_in_flight = false;
        self.spawn_announce(TrackerEvent::None);
        true
    }

    async fn shutdown(&mut self) {
        self.drop_all_peers();
        if self.state != SessionState::Complete {
            self.save_resume(true).await;
        }
        if let Err(e) = self.files.close().await {
            warn!("Failed to close files: {}", e);
        }
    }

    async fn remove_files(&mut self, delete_data: bool) -> Result<()> {
        if delete_data {
            let dir = self.files.output_dir();
            info!("Deleting {}", dir.display());
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        } else {
            self.files.delete_resume().await
        }
    }
}
