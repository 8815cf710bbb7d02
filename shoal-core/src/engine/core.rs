//! Core engine state for the actor model.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt, join_all};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::commands::{AddTorrentParams, SessionStatus};
use super::events::EngineEvent;
use super::listener::{self, SessionRoutes};
use super::session::{SessionCommand, SessionSetup, spawn_session};
use super::snapshot::{EngineSnapshot, TorrentSnapshot};
use crate::config::ShoalConfig;
use crate::storage::FileStorage;
use crate::torrent::{InfoHash, PeerId, TorrentError};

/// Reply to a command, resolved outside the actor loop.
pub type Pending<T> = BoxFuture<'static, Result<T, TorrentError>>;

struct SessionEntry {
    commands: mpsc::Sender<SessionCommand>,
    task: JoinHandle<()>,
}

/// Engine implementation running inside the actor.
///
/// Owns the session table and the peer listener. Every torrent's work
/// happens in its own session task; the engine only starts, routes to and
/// stops sessions. Replies that depend on a session are awaited off the
/// actor, so one busy session never holds up commands for another.
pub struct Engine {
    config: ShoalConfig,
    /// Shared by every session
    peer_id: PeerId,
    listen_addr: SocketAddr,
    sessions: HashMap<InfoHash, SessionEntry>,
    routes: SessionRoutes,
    events: broadcast::Sender<EngineEvent>,
    listener: JoinHandle<()>,
}

impl Engine {
    /// Binds the peer listener and creates an empty engine.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Io` - Listen port unavailable
    pub async fn start(
        config: ShoalConfig,
        events: broadcast::Sender<EngineEvent>,
    ) -> Result<Self, TorrentError> {
        let socket = listener::bind(config.network.listen_port).await?;
        let listen_addr = socket.local_addr()?;
        let routes = SessionRoutes::default();
        let listener = listener::spawn_listener(
            socket,
            Arc::clone(&routes),
            config.network.handshake_timeout,
        );
        let peer_id = PeerId::generate(config.torrent.client_id);
        tracing::debug!("Engine peer id {}", peer_id);

        Ok(Self {
            config,
            peer_id,
            listen_addr,
            sessions: HashMap::new(),
            routes,
            events,
            listener,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Starts a session for a torrent.
    ///
    /// # Errors
    ///
    /// - `TorrentError::DuplicateTorrent` - Already running
    /// - `TorrentError::MalformedTorrent` - Descriptor has no pieces
    /// - `TorrentError::InvalidFileSelection` - Selection names an unknown
    ///   file or covers no data
    pub fn add_torrent(&mut self, params: AddTorrentParams) -> Result<InfoHash, TorrentError> {
        let info_hash = params.metadata.info_hash;
        if self.sessions.contains_key(&info_hash) {
            return Err(TorrentError::DuplicateTorrent { info_hash });
        }
        if params.metadata.piece_count() == 0 {
            return Err(TorrentError::MalformedTorrent {
                reason: "torrent has no pieces".to_string(),
            });
        }

        let wanted = params
            .selected_files
            .as_deref()
            .map(|files| params.metadata.pieces_for_files(files))
            .transpose()?;

        let storage = FileStorage::new(&params.metadata, &params.download_dir);
        tracing::info!(
            "Adding {} ({}) into {}",
            params.metadata.name,
            info_hash,
            params.download_dir.display()
        );
        let (commands, task) = spawn_session(SessionSetup {
            params,
            wanted,
            storage: Box::new(storage),
            peer_id: self.peer_id,
            listen_port: self.listen_addr.port(),
            config: self.config.clone(),
            events: self.events.clone(),
        });

        self.routes.write().insert(info_hash, commands.clone());
        self.sessions
            .insert(info_hash, SessionEntry { commands, task });
        Ok(info_hash)
    }

    /// Queues a pause; the returned future resolves once the session has
    /// closed its peers and sent its stopped announce.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TorrentNotFound` - Unknown torrent
    /// - `TorrentError::InvalidStateTransition` - Not active
    pub async fn pause(&self, info_hash: InfoHash) -> Pending<()> {
        self.dispatch(info_hash, SessionCommand::Pause)
            .await
            .map(|reply| reply.and_then(|result| result))
            .boxed()
    }

    /// # Errors
    ///
    /// - `TorrentError::TorrentNotFound` - Unknown torrent
    /// - `TorrentError::InvalidStateTransition` - Not paused
    pub async fn resume(&self, info_hash: InfoHash) -> Pending<()> {
        self.dispatch(info_hash, SessionCommand::Resume)
            .await
            .map(|reply| reply.and_then(|result| result))
            .boxed()
    }

    /// Forgets a session at once and stops it in the background.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TorrentNotFound` - Unknown torrent
    /// - `TorrentError::Storage` - Files could not be deleted
    pub async fn remove(&mut self, info_hash: InfoHash, keep_files: bool) -> Pending<()> {
        let reply = self
            .dispatch(info_hash, |responder| SessionCommand::Remove {
                keep_files,
                responder,
            })
            .await;
        self.routes.write().remove(&info_hash);
        let task = self.sessions.remove(&info_hash).map(|entry| entry.task);
        async move {
            let result = reply.await;
            if let Some(task) = task {
                let _ = task.await;
            }
            result?
        }
        .boxed()
    }

    /// # Errors
    ///
    /// - `TorrentError::TorrentNotFound` - Unknown torrent
    pub async fn session(&self, info_hash: InfoHash) -> Pending<SessionStatus> {
        self.dispatch(info_hash, SessionCommand::Status).await
    }

    /// Status of every live session, sorted by name.
    pub async fn sessions(&self) -> BoxFuture<'static, Vec<SessionStatus>> {
        let mut pending = Vec::with_capacity(self.sessions.len());
        for info_hash in self.sessions.keys() {
            pending.push(self.dispatch(*info_hash, SessionCommand::Status).await);
        }
        async move {
            let mut statuses: Vec<SessionStatus> =
                join_all(pending).await.into_iter().flatten().collect();
            statuses.sort_by(|a, b| a.name.cmp(&b.name));
            statuses
        }
        .boxed()
    }

    pub async fn snapshot(&self) -> BoxFuture<'static, EngineSnapshot> {
        let mut pending = Vec::with_capacity(self.sessions.len());
        for info_hash in self.sessions.keys() {
            pending.push(self.dispatch(*info_hash, SessionCommand::Snapshot).await);
        }
        async move {
            let mut torrents: Vec<TorrentSnapshot> =
                join_all(pending).await.into_iter().flatten().collect();
            torrents.sort_by(|a, b| a.info_hash.cmp(&b.info_hash));
            EngineSnapshot::new(torrents)
        }
        .boxed()
    }

    /// Removes every session, keeping files, and stops listening.
    pub async fn shutdown(&mut self) {
        let info_hashes: Vec<_> = self.sessions.keys().copied().collect();
        let mut stops = Vec::with_capacity(info_hashes.len());
        for info_hash in info_hashes {
            let stop = self.remove(info_hash, true).await;
            stops.push(stop.map(move |result| (info_hash, result)));
        }
        for (info_hash, result) in join_all(stops).await {
            if let Err(e) = result {
                tracing::warn!("Stopping {} failed: {}", info_hash, e);
            }
        }
        self.listener.abort();
    }

    /// Queues a command carrying a responder on the session's channel and
    /// returns a future for the reply.
    ///
    /// Queueing here keeps commands to one session in the order they were
    /// issued; only the wait for the reply leaves the actor.
    async fn dispatch<R: Send + 'static>(
        &self,
        info_hash: InfoHash,
        command: impl FnOnce(oneshot::Sender<R>) -> SessionCommand,
    ) -> Pending<R> {
        let not_found = TorrentError::TorrentNotFound { info_hash };
        let Some(entry) = self.sessions.get(&info_hash) else {
            return future::ready(Err(not_found)).boxed();
        };
        let (responder, reply) = oneshot::channel();
        if entry.commands.send(command(responder)).await.is_err() {
            return future::ready(Err(not_found)).boxed();
        }
        reply
            .map(move |reply| reply.map_err(|_| TorrentError::TorrentNotFound { info_hash }))
            .boxed()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
