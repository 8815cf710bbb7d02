//! Session controller: one task per torrent.
//!
//! The session task owns the torrent's piece manager and peer manager and
//! is the only code that touches them, so download, upload and
//! verification logic for one torrent run strictly one at a time while the
//! peer sockets, tracker requests and timers run concurrently around it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::commands::{AddTorrentParams, SessionState, SessionStatus};
use super::events::EngineEvent;
use super::snapshot::TorrentSnapshot;
use crate::config::ShoalConfig;
use crate::storage::Storage;
use crate::torrent::peer_manager::{PeerLink, validate_message};
use crate::torrent::tracker::{AnnounceIdentity, AnnounceOutcome, TransferTotals};
use crate::torrent::uploader::UploadOutcome;
use crate::torrent::{
    Announcer, AnnouncerHandle, Bitfield, BlockOutcome, ConnectionId, Downloader, PeerEvent,
    PeerHandshake, PeerId, PeerManager, PeerMessage, PieceManager, TorrentError, TorrentMetadata,
    TrackerManager, Uploader,
};

const COMMAND_CHANNEL_CAPACITY: usize = 32;
const ANNOUNCE_CHANNEL_CAPACITY: usize = 8;

/// Requests from the engine (and the listener) to one session.
pub(crate) enum SessionCommand {
    Pause(oneshot::Sender<Result<(), TorrentError>>),
    Resume(oneshot::Sender<Result<(), TorrentError>>),
    Remove {
        keep_files: bool,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    Status(oneshot::Sender<SessionStatus>),
    Snapshot(oneshot::Sender<TorrentSnapshot>),
    /// A connection whose handshake named this torrent.
    IncomingPeer {
        stream: TcpStream,
        address: SocketAddr,
        handshake: PeerHandshake,
    },
}

/// Engine-wide context a session is started with.
pub(crate) struct SessionSetup {
    pub params: AddTorrentParams,
    /// Pieces covered by the file selection, already validated.
    pub wanted: Option<Bitfield>,
    pub storage: Box<dyn Storage>,
    pub peer_id: PeerId,
    pub listen_port: u16,
    pub config: ShoalConfig,
    pub events: broadcast::Sender<EngineEvent>,
}

/// Exponentially smoothed transfer rate.
#[derive(Debug, Clone)]
pub(crate) struct SpeedMeter {
    rate: f64,
    last_total: u64,
    last_sample: Instant,
}

impl SpeedMeter {
    const SMOOTHING: f64 = 0.3;

    pub(crate) fn new(total: u64, now: Instant) -> Self {
        Self {
            rate: 0.0,
            last_total: total,
            last_sample: now,
        }
    }

    /// Feeds the running byte total; returns the smoothed bytes per second.
    pub(crate) fn sample(&mut self, total: u64, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.last_sample).as_secs_f64();
        if elapsed > 0.0 {
            let instant = total.saturating_sub(self.last_total) as f64 / elapsed;
            self.rate = Self::SMOOTHING * instant + (1.0 - Self::SMOOTHING) * self.rate;
            self.last_total = total;
            self.last_sample = now;
        }
        self.rate()
    }

    pub(crate) fn rate(&self) -> u64 {
        self.rate.round() as u64
    }

    pub(crate) fn reset(&mut self, total: u64, now: Instant) {
        *self = Self::new(total, now);
    }
}

struct SwarmSession {
    metadata: Arc<TorrentMetadata>,
    destination: PathBuf,
    torrent_path: Option<PathBuf>,
    selected_files: Option<Vec<usize>>,
    resume: Option<Bitfield>,
    config: ShoalConfig,
    identity: AnnounceIdentity,
    state: SessionState,
    pieces: PieceManager,
    peers: PeerManager,
    downloader: Downloader,
    uploader: Uploader,
    announcer: Option<AnnouncerHandle>,
    totals: watch::Sender<TransferTotals>,
    announce_outcomes: mpsc::Sender<AnnounceOutcome>,
    events: broadcast::Sender<EngineEvent>,
    downloaded: u64,
    uploaded: u64,
    download_rate: SpeedMeter,
    upload_rate: SpeedMeter,
    connected_peers: usize,
    last_error: Option<String>,
}

/// Starts a session task and returns its command channel.
pub(crate) fn spawn_session(setup: SessionSetup) -> (mpsc::Sender<SessionCommand>, JoinHandle<()>) {
    let SessionSetup {
        params,
        wanted,
        storage,
        peer_id,
        listen_port,
        config,
        events,
    } = setup;
    let metadata = params.metadata;
    let info_hash = metadata.info_hash;

    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (announce_tx, announce_rx) = mpsc::channel(ANNOUNCE_CHANNEL_CAPACITY);
    let (peers, peer_events) = PeerManager::new(
        info_hash,
        peer_id,
        metadata.piece_count(),
        config.network.clone(),
    );
    let mut pieces = PieceManager::new(
        Arc::clone(&metadata),
        storage,
        config.torrent.block_size,
        config.torrent.hash_strike_threshold,
    );
    if let Some(wanted) = &wanted {
        pieces.set_wanted(wanted);
    }
    let (totals, _) = watch::channel(TransferTotals {
        uploaded: 0,
        downloaded: 0,
        left: pieces.bytes_left(),
    });
    let now = Instant::now();

    let session = SwarmSession {
        identity: AnnounceIdentity {
            info_hash,
            peer_id,
            port: listen_port,
        },
        destination: params.download_dir,
        torrent_path: params.torrent_path,
        selected_files: params.selected_files,
        resume: params.resume,
        downloader: Downloader::new(&config.torrent),
        uploader: Uploader::new(&config.network),
        state: SessionState::Idle,
        pieces,
        peers,
        announcer: None,
        totals,
        announce_outcomes: announce_tx,
        events,
        downloaded: 0,
        uploaded: 0,
        download_rate: SpeedMeter::new(0, now),
        upload_rate: SpeedMeter::new(0, now),
        connected_peers: 0,
        last_error: None,
        metadata,
        config,
    };

    let task = tokio::spawn(session.run(command_rx, peer_events, announce_rx));
    (command_tx, task)
}

impl SwarmSession {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut peer_events: mpsc::Receiver<PeerEvent>,
        mut announce_outcomes: mpsc::Receiver<AnnounceOutcome>,
    ) {
        tracing::debug!("Session {} started", self.metadata.info_hash);
        self.start().await;

        let mut tick = tokio::time::interval(self.config.torrent.status_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        // Engine dropped its handle.
                        self.deactivate().await;
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(event) = peer_events.recv() => self.handle_peer_event(event).await,
                Some(outcome) = announce_outcomes.recv() => self.handle_announce(outcome),
                _ = tick.tick() => self.on_tick(),
            }
        }

        tracing::debug!("Session {} stopped", self.metadata.info_hash);
    }

    /// Establishes the verified set, then starts announcing.
    async fn start(&mut self) {
        match self.resume.take() {
            Some(verified) if verified.len() == self.pieces.piece_count() => {
                self.pieces.restore_verified(&verified);
                tracing::info!(
                    "Resumed {} with {}/{} pieces verified",
                    self.metadata.name,
                    self.pieces.verified_count(),
                    self.pieces.piece_count()
                );
            }
            resume => {
                if resume.is_some() {
                    tracing::warn!(
                        "Ignoring resume data for {}: piece count differs",
                        self.metadata.name
                    );
                }
                match self.pieces.verify_existing().await {
                    Ok(0) => {}
                    Ok(found) => tracing::info!(
                        "Found {}/{} verified pieces of {} on disk",
                        found,
                        self.pieces.piece_count(),
                        self.metadata.name
                    ),
                    Err(e) => {
                        self.fail(e).await;
                        return;
                    }
                }
            }
        }

        self.publish_totals();
        self.activate();
    }

    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Pause(responder) => {
                let result = self.pause().await;
                let _ = responder.send(result);
            }
            SessionCommand::Resume(responder) => {
                let result = self.resume();
                let _ = responder.send(result);
            }
            SessionCommand::Remove {
                keep_files,
                responder,
            } => {
                let result = self.remove(keep_files).await;
                let _ = responder.send(result);
                return false;
            }
            SessionCommand::Status(responder) => {
                let _ = responder.send(self.status());
            }
            SessionCommand::Snapshot(responder) => {
                let _ = responder.send(self.snapshot());
            }
            SessionCommand::IncomingPeer {
                stream,
                address,
                handshake,
            } => {
                if self.state.is_active() {
                    self.peers.accept_incoming(stream, address, handshake);
                } else {
                    tracing::debug!(
                        "Dropping incoming peer {}: session is {}",
                        address,
                        self.state
                    );
                }
            }
        }
        true
    }

    async fn pause(&mut self) -> Result<(), TorrentError> {
        if !self.state.is_active() {
            return Err(self.invalid_transition("pause"));
        }
        self.deactivate().await;
        self.transition(SessionState::Paused);
        Ok(())
    }

    fn resume(&mut self) -> Result<(), TorrentError> {
        if self.state != SessionState::Paused {
            return Err(self.invalid_transition("resume"));
        }
        let now = Instant::now();
        self.download_rate.reset(self.downloaded, now);
        self.upload_rate.reset(self.uploaded, now);
        self.activate();
        Ok(())
    }

    async fn remove(&mut self, keep_files: bool) -> Result<(), TorrentError> {
        self.deactivate().await;
        let result = if keep_files {
            Ok(())
        } else {
            tracing::info!("Deleting files of {}", self.metadata.name);
            self.pieces.remove_files().await
        };
        self.transition(SessionState::Removed);
        result
    }

    fn invalid_transition(&self, operation: &str) -> TorrentError {
        TorrentError::InvalidStateTransition {
            operation: operation.to_string(),
            state: self.state.to_string(),
        }
    }

    /// Starts the announcer and moves to announcing, or seeding if done.
    fn activate(&mut self) {
        let trackers = TrackerManager::new(&self.metadata.announce_tiers, &self.config.tracker);
        self.announcer = Some(Announcer::spawn(
            trackers,
            self.identity.clone(),
            self.config.tracker.clone(),
            self.totals.subscribe(),
            self.announce_outcomes.clone(),
        ));

        let next = if self.pieces.is_complete() {
            SessionState::Seeding
        } else {
            SessionState::Announcing
        };
        self.transition(next);
    }

    /// Stops announcing and closes every peer, keeping piece state.
    async fn deactivate(&mut self) {
        if let Some(announcer) = self.announcer.take() {
            announcer.stop().await;
        }
        for (id, link) in self.peers.disconnect_all() {
            self.forget_link(id, &link);
        }
        self.update_peer_count();
    }

    async fn fail(&mut self, error: TorrentError) {
        tracing::error!("Session {} failed: {}", self.metadata.name, error);
        let message = error.to_string();
        self.last_error = Some(message.clone());
        self.deactivate().await;
        self.transition(SessionState::Error);
        let _ = self.events.send(EngineEvent::Error {
            info_hash: self.metadata.info_hash,
            message,
        });
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Handshaked { id, peer_id } => {
                if !self.peers.on_handshaked(id, peer_id) {
                    return;
                }
                if self.pieces.verified_count() > 0 {
                    let bitfield = self.pieces.verified_bitfield().to_bytes();
                    self.peers.send(id, PeerMessage::Bitfield { bitfield });
                }
                self.update_peer_count();
            }
            PeerEvent::Message { id, message } => self.handle_message(id, message).await,
            PeerEvent::Closed { id, reason } => {
                if let Some(link) = self.peers.on_closed(id, &reason) {
                    self.forget_link(id, &link);
                    self.downloader
                        .fill_all(&mut self.peers, &mut self.pieces, Instant::now());
                    self.update_peer_count();
                }
            }
        }
    }

    async fn handle_message(&mut self, id: ConnectionId, message: PeerMessage) {
        // Events from connections already dropped are stale.
        let Some(address) = self.peers.link(id).map(|link| link.address) else {
            return;
        };
        if let Err(reason) = validate_message(
            &message,
            &self.metadata,
            self.config.network.max_request_length,
        ) {
            tracing::debug!("Protocol violation from {}: {}", address, reason);
            self.drop_peer(id, &reason);
            return;
        }

        let now = Instant::now();
        match message {
            PeerMessage::Choke => self.downloader.on_choked(&mut self.peers, &mut self.pieces, id),
            PeerMessage::Unchoke => {
                self.downloader
                    .on_unchoked(&mut self.peers, &mut self.pieces, id, now)
            }
            PeerMessage::Interested => self.uploader.on_interest(&mut self.peers, id, true),
            PeerMessage::NotInterested => self.uploader.on_interest(&mut self.peers, id, false),
            PeerMessage::Have { piece_index } => {
                if let Some(link) = self.peers.link_mut(id) {
                    if !link.bitfield.has(piece_index.as_usize()) {
                        link.bitfield.set(piece_index.as_usize());
                        self.pieces.peer_has(piece_index);
                    }
                }
                self.downloader
                    .update_interest(&mut self.peers, &self.pieces, id);
                self.downloader
                    .fill_pipeline(&mut self.peers, &mut self.pieces, id, now);
            }
            PeerMessage::Bitfield { bitfield } => {
                let Some(parsed) = Bitfield::from_bytes(&bitfield, self.pieces.piece_count())
                else {
                    return;
                };
                if let Some(link) = self.peers.link_mut(id) {
                    let previous = std::mem::replace(&mut link.bitfield, parsed);
                    self.pieces.remove_peer_bitfield(&previous);
                    self.pieces.add_peer_bitfield(&link.bitfield);
                }
                self.downloader
                    .update_interest(&mut self.peers, &self.pieces, id);
                self.downloader
                    .fill_pipeline(&mut self.peers, &mut self.pieces, id, now);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                let outcome = self
                    .uploader
                    .on_request(&mut self.peers, &self.pieces, id, piece_index, offset, length)
                    .await;
                if let UploadOutcome::Served { bytes } = outcome {
                    self.uploaded += u64::from(bytes);
                }
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                let length = data.len() as u64;
                let result = self
                    .downloader
                    .on_block(
                        &mut self.peers,
                        &mut self.pieces,
                        id,
                        address,
                        piece_index,
                        offset,
                        data,
                    )
                    .await;
                match result {
                    Ok(BlockOutcome::Ignored) => {}
                    Ok(outcome) => {
                        self.downloaded += length;
                        self.on_block_outcome(outcome);
                    }
                    Err(e) => self.fail(e).await,
                }
            }
            // Requests are answered as they arrive, so there is nothing
            // queued to cancel.
            PeerMessage::Cancel { .. }
            | PeerMessage::Port { .. }
            | PeerMessage::Unknown { .. }
            | PeerMessage::KeepAlive => {}
        }
    }

    fn on_block_outcome(&mut self, outcome: BlockOutcome) {
        let now = Instant::now();
        match outcome {
            BlockOutcome::PieceVerified { index } => {
                self.peers.broadcast(&PeerMessage::Have { piece_index: index });
                self.downloader
                    .fill_all(&mut self.peers, &mut self.pieces, now);
                self.publish_totals();
                let total_bytes = self.pieces.bytes_wanted();
                let _ = self.events.send(EngineEvent::Progress {
                    info_hash: self.metadata.info_hash,
                    bytes_verified: total_bytes - self.pieces.bytes_left(),
                    total_bytes,
                });
                if self.pieces.is_complete() {
                    self.on_complete();
                }
            }
            BlockOutcome::HashMismatch { offenders, .. } => {
                for address in offenders {
                    if let Some((id, link)) = self.peers.ban(address) {
                        self.forget_link(id, &link);
                    }
                }
                self.downloader
                    .fill_all(&mut self.peers, &mut self.pieces, now);
                self.update_peer_count();
            }
            BlockOutcome::Accepted | BlockOutcome::Ignored => {}
        }
    }

    fn on_complete(&mut self) {
        tracing::info!(
            "Download of {} complete ({} bytes)",
            self.metadata.name,
            self.pieces.bytes_wanted()
        );
        if let Some(announcer) = &self.announcer {
            announcer.completed();
        }
        self.transition(SessionState::Seeding);
    }

    fn handle_announce(&mut self, outcome: AnnounceOutcome) {
        match outcome {
            AnnounceOutcome::Peers(addresses) => {
                if !self.state.is_active() {
                    return;
                }
                tracing::debug!(
                    "Announce for {} returned {} peers",
                    self.metadata.name,
                    addresses.len()
                );
                self.peers.add_candidates(addresses);
                self.peers.fill_connections();
            }
            AnnounceOutcome::Failed { reason, retry_in } => {
                tracing::debug!(
                    "Announce for {} failed ({}); retrying in {:?}",
                    self.metadata.name,
                    reason,
                    retry_in
                );
            }
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        if self.state.is_active() {
            self.downloader
                .expire(&mut self.peers, &mut self.pieces, now);
            self.peers.fill_connections();

            self.download_rate.sample(self.downloaded, now);
            self.upload_rate.sample(self.uploaded, now);
            let _ = self.events.send(EngineEvent::Stats {
                info_hash: self.metadata.info_hash,
                download_rate: self.download_rate.rate(),
                upload_rate: self.upload_rate.rate(),
                downloaded: self.downloaded,
                uploaded: self.uploaded,
            });
        }
        self.publish_totals();
        self.update_peer_count();
    }

    fn drop_peer(&mut self, id: ConnectionId, reason: &str) {
        if let Some(link) = self.peers.disconnect(id, reason) {
            self.forget_link(id, &link);
            self.downloader
                .fill_all(&mut self.peers, &mut self.pieces, Instant::now());
            self.update_peer_count();
        }
    }

    fn forget_link(&mut self, id: ConnectionId, link: &PeerLink) {
        self.pieces.release_peer(id);
        self.pieces.remove_peer_bitfield(&link.bitfield);
    }

    fn update_peer_count(&mut self) {
        let connected = self.peers.connected_count();
        if connected != self.connected_peers {
            self.connected_peers = connected;
            let _ = self.events.send(EngineEvent::PeerCountChanged {
                info_hash: self.metadata.info_hash,
                connected,
            });
        }
        if self.state == SessionState::Announcing && connected > 0 {
            self.transition(SessionState::Downloading);
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        tracing::info!(
            "Torrent {} {} -> {}",
            self.metadata.name,
            self.state,
            next
        );
        self.state = next;
        let _ = self.events.send(EngineEvent::StateChanged {
            info_hash: self.metadata.info_hash,
            state: next,
        });
    }

    fn publish_totals(&self) {
        self.totals.send_replace(TransferTotals {
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            left: self.pieces.bytes_left(),
        });
    }

    fn status(&self) -> SessionStatus {
        let total_bytes = self.pieces.bytes_wanted();
        SessionStatus {
            info_hash: self.metadata.info_hash,
            name: self.metadata.name.clone(),
            state: self.state,
            piece_count: self.pieces.piece_count(),
            pieces_wanted: self.pieces.wanted_count(),
            pieces_verified: self.pieces.wanted_verified_count(),
            bytes_verified: total_bytes - self.pieces.bytes_left(),
            total_bytes,
            downloaded: self.downloaded,
            uploaded: self.uploaded,
            download_rate: self.download_rate.rate(),
            upload_rate: self.upload_rate.rate(),
            connected_peers: self.peers.connected_count(),
            last_error: self.last_error.clone(),
        }
    }

    fn snapshot(&self) -> TorrentSnapshot {
        TorrentSnapshot::new(
            self.metadata.info_hash,
            self.torrent_path.clone(),
            self.destination.clone(),
            self.pieces.verified_bitfield(),
            self.downloaded,
            self.uploaded,
        )
        .with_file_selection(self.selected_files.clone())
    }
}
