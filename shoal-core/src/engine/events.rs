//! Notifications published to engine subscribers.

use super::commands::SessionState;
use crate::torrent::InfoHash;

/// Capacity of the event broadcast; slow subscribers see `Lagged`.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What an observer of the engine is told.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StateChanged {
        info_hash: InfoHash,
        state: SessionState,
    },
    /// A piece verified.
    Progress {
        info_hash: InfoHash,
        bytes_verified: u64,
        total_bytes: u64,
    },
    /// Periodic transfer figures.
    Stats {
        info_hash: InfoHash,
        download_rate: u64,
        upload_rate: u64,
        downloaded: u64,
        uploaded: u64,
    },
    PeerCountChanged {
        info_hash: InfoHash,
        connected: usize,
    },
    /// A failure that stopped the session.
    Error { info_hash: InfoHash, message: String },
}

impl EngineEvent {
    pub fn info_hash(&self) -> InfoHash {
        match self {
            EngineEvent::StateChanged { info_hash, .. }
            | EngineEvent::Progress { info_hash, .. }
            | EngineEvent::Stats { info_hash, .. }
            | EngineEvent::PeerCountChanged { info_hash, .. }
            | EngineEvent::Error { info_hash, .. } => *info_hash,
        }
    }
}
