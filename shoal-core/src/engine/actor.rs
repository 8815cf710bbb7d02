//! Actor implementation for the swarm engine.

use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::commands::EngineCommand;
use super::core::Engine;
use super::events::EVENT_CHANNEL_CAPACITY;
use super::handle::EngineHandle;
use crate::config::ShoalConfig;
use crate::torrent::TorrentError;

const COMMAND_CHANNEL_CAPACITY: usize = 100;

/// Binds the peer listener, spawns the engine actor and returns its handle.
///
/// The actor processes commands sequentially and hands each session's reply
/// to a short-lived task; each torrent runs in its own session task, so a
/// slow torrent never blocks the others.
///
/// # Examples
/// ```rust,no_run
/// # #[tokio::main]
/// # async fn main() {
/// use shoal_core::config::ShoalConfig;
/// use shoal_core::engine::spawn_engine;
///
/// let handle = spawn_engine(ShoalConfig::default()).await.unwrap();
/// println!("listening on {}", handle.listen_addr().await.unwrap());
/// # }
/// ```
///
/// # Errors
///
/// - `TorrentError::Io` - Listen port unavailable
pub async fn spawn_engine(config: ShoalConfig) -> Result<EngineHandle, TorrentError> {
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let engine = Engine::start(config, events.clone()).await?;
    let (sender, receiver) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        run_actor_loop(engine, receiver).await;
    });

    Ok(EngineHandle::new(sender, events))
}

/// Runs the main actor message processing loop.
///
/// Continues until a shutdown command arrives or every handle is dropped;
/// either way the sessions are stopped before the loop exits.
async fn run_actor_loop(mut engine: Engine, mut receiver: mpsc::Receiver<EngineCommand>) {
    tracing::debug!("Engine actor started on {}", engine.listen_addr());

    while let Some(command) = receiver.recv().await {
        if !handle_command(&mut engine, command).await {
            tracing::debug!("Engine actor stopped");
            return;
        }
    }

    tracing::debug!("All engine handles dropped; stopping sessions");
    engine.shutdown().await;
}

/// Handles a single command for the engine.
/// Returns true to continue processing, false to shutdown.
async fn handle_command(engine: &mut Engine, command: EngineCommand) -> bool {
    match command {
        EngineCommand::AddTorrent { params, responder } => {
            let result = engine.add_torrent(params);
            let _ = responder.send(result);
        }

        EngineCommand::Pause {
            info_hash,
            responder,
        } => reply_later(engine.pause(info_hash).await, responder),

        EngineCommand::Resume {
            info_hash,
            responder,
        } => reply_later(engine.resume(info_hash).await, responder),

        EngineCommand::Remove {
            info_hash,
            keep_files,
            responder,
        } => reply_later(engine.remove(info_hash, keep_files).await, responder),

        EngineCommand::GetSession {
            info_hash,
            responder,
        } => reply_later(engine.session(info_hash).await, responder),

        EngineCommand::GetSessions { responder } => {
            reply_later(engine.sessions().await, responder);
        }

        EngineCommand::Snapshot { responder } => {
            reply_later(engine.snapshot().await, responder);
        }

        EngineCommand::ListenAddr { responder } => {
            let _ = responder.send(engine.listen_addr());
        }

        EngineCommand::Shutdown { responder } => {
            tracing::debug!("Engine actor shutting down");
            engine.shutdown().await;
            let _ = responder.send(());
            return false;
        }
    }

    true
}

/// Waits for a session's reply on its own task and forwards it.
fn reply_later<T: Send + 'static>(pending: BoxFuture<'static, T>, responder: oneshot::Sender<T>) {
    tokio::spawn(async move {
        let _ = responder.send(pending.await);
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::{AddTorrentParams, EngineEvent, SessionState};
    use crate::torrent::InfoHash;
    use crate::torrent::test_data::three_piece_torrent;

    fn offline_config() -> ShoalConfig {
        let mut config = ShoalConfig::for_testing();
        config.tracker.udp_max_attempts = 1;
        config
    }

    #[tokio::test]
    async fn test_add_and_query_session() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_engine(offline_config()).await.unwrap();
        let (metadata, _) = three_piece_torrent();

        let info_hash = handle
            .add_torrent(AddTorrentParams::new(metadata.clone(), dir.path()))
            .await
            .unwrap();
        assert_eq!(info_hash, metadata.info_hash);

        let status = handle.session(info_hash).await.unwrap();
        assert_eq!(status.name, "reference.bin");
        assert_eq!(status.piece_count, 3);
        assert_eq!(status.pieces_verified, 0);
        assert_eq!(status.total_bytes, 36864);

        let sessions = handle.sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_torrents() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_engine(offline_config()).await.unwrap();
        let (metadata, _) = three_piece_torrent();

        handle
            .add_torrent(AddTorrentParams::new(metadata.clone(), dir.path()))
            .await
            .unwrap();
        let duplicate = handle
            .add_torrent(AddTorrentParams::new(metadata, dir.path()))
            .await;
        assert!(matches!(
            duplicate,
            Err(TorrentError::DuplicateTorrent { .. })
        ));

        let unknown = InfoHash::new([0xee; 20]);
        assert!(matches!(
            handle.session(unknown).await,
            Err(TorrentError::TorrentNotFound { .. })
        ));
        assert!(matches!(
            handle.pause(unknown).await,
            Err(TorrentError::TorrentNotFound { .. })
        ));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_resume_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_engine(offline_config()).await.unwrap();
        let mut events = handle.subscribe();
        let (metadata, _) = three_piece_torrent();

        let info_hash = handle
            .add_torrent(AddTorrentParams::new(metadata, dir.path()))
            .await
            .unwrap();

        handle.pause(info_hash).await.unwrap();
        assert_eq!(
            handle.session(info_hash).await.unwrap().state,
            SessionState::Paused
        );
        assert!(matches!(
            handle.pause(info_hash).await,
            Err(TorrentError::InvalidStateTransition { .. })
        ));

        handle.resume(info_hash).await.unwrap();
        assert!(handle.session(info_hash).await.unwrap().state.is_active());

        handle.remove(info_hash, false).await.unwrap();
        assert!(matches!(
            handle.session(info_hash).await,
            Err(TorrentError::TorrentNotFound { .. })
        ));

        let mut saw_paused = false;
        while let Ok(Ok(event)) =
            tokio::time::timeout(Duration::from_millis(200), events.recv()).await
        {
            if let EngineEvent::StateChanged {
                state: SessionState::Paused,
                ..
            } = event
            {
                saw_paused = true;
            }
        }
        assert!(saw_paused);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_after_shutdown_fail() {
        let handle = spawn_engine(offline_config()).await.unwrap();
        let address = handle.listen_addr().await.unwrap();
        assert_ne!(address.port(), 0);

        handle.shutdown().await.unwrap();
        assert!(matches!(
            handle.sessions().await,
            Err(TorrentError::EngineShutdown)
        ));
    }
}
