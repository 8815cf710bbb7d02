//! Shoal Core - BitTorrent swarm engine
//!
//! This crate provides the building blocks of a BitTorrent client: torrent
//! metadata parsing and creation, tracker announces (HTTP and UDP), the peer
//! wire protocol, piece verification and file storage, and an actor-based
//! engine that runs one session per torrent.

pub mod config;
pub mod engine;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::ShoalConfig;
pub use engine::{EngineHandle, spawn_engine};
pub use engine::snapshot::SnapshotError;
pub use storage::{FileStorage, StorageError};
pub use torrent::TorrentError;

/// Core errors that can bubble up from any Shoal subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ShoalError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Session for {info_hash} stopped: {reason}")]
    SessionFailed {
        info_hash: torrent::InfoHash,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShoalError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            ShoalError::Torrent(e) => match e {
                TorrentError::MalformedTorrent { reason } => {
                    format!("Invalid torrent file: {reason}")
                }
                TorrentError::TrackerUnreachable { url, .. } => {
                    format!("Could not reach tracker: {url}")
                }
                TorrentError::TrackerError { url, reason } => {
                    format!("Tracker {url} refused the announce: {reason}")
                }
                TorrentError::TorrentNotFound { info_hash } => {
                    format!("Torrent {info_hash} not found")
                }
                TorrentError::DuplicateTorrent { info_hash } => {
                    format!("Torrent {info_hash} is already running")
                }
                TorrentError::Storage(_) => "Could not read or write torrent data".to_string(),
                _ => "Download error occurred".to_string(),
            },
            ShoalError::Storage(_) => "Could not read or write torrent data".to_string(),
            ShoalError::Snapshot(_) => "Could not read or write the state file".to_string(),
            ShoalError::Configuration { reason } => format!("Configuration error: {reason}"),
            ShoalError::SessionFailed { reason, .. } => format!("Download stopped: {reason}"),
            ShoalError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ShoalError::Configuration { .. }
                | ShoalError::Torrent(TorrentError::MalformedTorrent { .. })
                | ShoalError::Snapshot(SnapshotError::UnsupportedVersion { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, ShoalError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::InfoHash;

    #[test]
    fn test_user_messages() {
        let malformed: ShoalError = TorrentError::MalformedTorrent {
            reason: "missing info".to_string(),
        }
        .into();
        assert_eq!(malformed.user_message(), "Invalid torrent file: missing info");
        assert!(malformed.is_user_error());

        let missing: ShoalError = TorrentError::TorrentNotFound {
            info_hash: InfoHash::new([0xaa; 20]),
        }
        .into();
        assert!(missing.user_message().contains(&"aa".repeat(20)));
        assert!(!missing.is_user_error());

        let shutdown: ShoalError = TorrentError::EngineShutdown.into();
        assert_eq!(shutdown.user_message(), "Download error occurred");
    }
}
