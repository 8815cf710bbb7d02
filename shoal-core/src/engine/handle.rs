//! Handle for communicating with the engine actor.

use std::net::SocketAddr;

use tokio::sync::{broadcast, mpsc, oneshot};

use super::commands::{AddTorrentParams, EngineCommand, SessionStatus};
use super::events::EngineEvent;
use super::snapshot::EngineSnapshot;
use crate::torrent::{InfoHash, TorrentError};

/// Handle for communicating with the engine actor.
///
/// Provides an async API over the actor's command channel. It can be cloned
/// and shared across tasks.
#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineCommand>,
    events: broadcast::Sender<EngineEvent>,
}

impl EngineHandle {
    pub(crate) fn new(
        sender: mpsc::Sender<EngineCommand>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self { sender, events }
    }

    /// Adds a torrent and starts its session.
    ///
    /// The session checks existing data (or trusts `params.resume`), then
    /// announces and begins exchanging pieces.
    ///
    /// # Errors
    /// - `TorrentError::DuplicateTorrent` - Torrent already added
    /// - `TorrentError::MalformedTorrent` - Torrent has no pieces
    pub async fn add_torrent(&self, params: AddTorrentParams) -> Result<InfoHash, TorrentError> {
        self.request(|responder| EngineCommand::AddTorrent { params, responder })
            .await?
    }

    /// Closes every peer and stops announcing. Verified pieces are kept.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not in the engine
    /// - `TorrentError::InvalidStateTransition` - Session is not active
    pub async fn pause(&self, info_hash: InfoHash) -> Result<(), TorrentError> {
        self.request(|responder| EngineCommand::Pause {
            info_hash,
            responder,
        })
        .await?
    }

    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not in the engine
    /// - `TorrentError::InvalidStateTransition` - Session is not paused
    pub async fn resume(&self, info_hash: InfoHash) -> Result<(), TorrentError> {
        self.request(|responder| EngineCommand::Resume {
            info_hash,
            responder,
        })
        .await?
    }

    /// Stops a session; with `keep_files == false` its data is deleted too.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not in the engine
    /// - `TorrentError::Storage` - Files could not be deleted
    pub async fn remove(&self, info_hash: InfoHash, keep_files: bool) -> Result<(), TorrentError> {
        self.request(|responder| EngineCommand::Remove {
            info_hash,
            keep_files,
            responder,
        })
        .await?
    }

    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not in the engine
    pub async fn session(&self, info_hash: InfoHash) -> Result<SessionStatus, TorrentError> {
        self.request(|responder| EngineCommand::GetSession {
            info_hash,
            responder,
        })
        .await?
    }

    /// Status of every session, sorted by name.
    pub async fn sessions(&self) -> Result<Vec<SessionStatus>, TorrentError> {
        self.request(|responder| EngineCommand::GetSessions { responder })
            .await
    }

    /// Resume data for every session; pair with `EngineSnapshot::save`.
    pub async fn snapshot(&self) -> Result<EngineSnapshot, TorrentError> {
        self.request(|responder| EngineCommand::Snapshot { responder })
            .await
    }

    pub async fn listen_addr(&self) -> Result<SocketAddr, TorrentError> {
        self.request(|responder| EngineCommand::ListenAddr { responder })
            .await
    }

    /// Receiver for engine events. Subscribers that fall behind by more
    /// than the channel capacity see `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Stops every session, keeping files, and waits for the actor to exit.
    ///
    /// After this call all other operations return `TorrentError::EngineShutdown`.
    pub async fn shutdown(&self) -> Result<(), TorrentError> {
        self.request(|responder| EngineCommand::Shutdown { responder })
            .await
    }

    /// Checks if the engine actor is still accepting commands.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> EngineCommand,
    ) -> Result<R, TorrentError> {
        let (responder, rx) = oneshot::channel();

        self.sender
            .send(command(responder))
            .await
            .map_err(|_| TorrentError::EngineShutdown)?;

        rx.await.map_err(|_| TorrentError::EngineShutdown)
    }
}
