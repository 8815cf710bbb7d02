//! Command definitions for the engine actor model.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::oneshot;

use super::snapshot::EngineSnapshot;
use crate::torrent::{Bitfield, InfoHash, TorrentError, TorrentMetadata};

/// Commands that can be sent to the engine actor.
///
/// Each command carries a response channel for the actor to send back its
/// result, so callers never share state with the actor.
pub enum EngineCommand {
    /// Start a new session for a parsed torrent.
    AddTorrent {
        params: AddTorrentParams,
        responder: oneshot::Sender<Result<InfoHash, TorrentError>>,
    },
    /// Close all peers and stop announcing, keeping piece state.
    Pause {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    /// Re-announce and reconnect a paused session.
    Resume {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    /// Tear a session down, optionally deleting its files.
    Remove {
        info_hash: InfoHash,
        keep_files: bool,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    /// Status of one session.
    GetSession {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<SessionStatus, TorrentError>>,
    },
    /// Status of every session.
    GetSessions {
        responder: oneshot::Sender<Vec<SessionStatus>>,
    },
    /// Resume data for every session.
    Snapshot {
        responder: oneshot::Sender<EngineSnapshot>,
    },
    /// Address the peer listener is bound to.
    ListenAddr {
        responder: oneshot::Sender<SocketAddr>,
    },
    /// Stop every session and the listener.
    Shutdown { responder: oneshot::Sender<()> },
}

/// Everything needed to start a session.
#[derive(Debug, Clone)]
pub struct AddTorrentParams {
    pub metadata: Arc<TorrentMetadata>,
    /// Directory the torrent's files are placed under.
    pub download_dir: PathBuf,
    /// Pieces known to be verified from an earlier run; skips rehashing.
    pub resume: Option<Bitfield>,
    /// Where the `.torrent` came from, recorded in snapshots.
    pub torrent_path: Option<PathBuf>,
    /// Indices into `metadata.files` to download; `None` downloads all.
    pub selected_files: Option<Vec<usize>>,
}

impl AddTorrentParams {
    pub fn new(
        metadata: impl Into<Arc<TorrentMetadata>>,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            metadata: metadata.into(),
            download_dir: download_dir.into(),
            resume: None,
            torrent_path: None,
            selected_files: None,
        }
    }

    pub fn with_resume(mut self, verified: Bitfield) -> Self {
        self.resume = Some(verified);
        self
    }

    pub fn with_torrent_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.torrent_path = Some(path.into());
        self
    }

    /// Downloads only the pieces touched by the given files.
    pub fn with_file_selection(mut self, files: Vec<usize>) -> Self {
        self.selected_files = Some(files);
        self
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created; checking existing data.
    Idle,
    /// Waiting for trackers or the first peer.
    Announcing,
    Downloading,
    /// Every wanted piece verified; still serving requests.
    Seeding,
    Paused,
    /// Terminal.
    Removed,
    /// A storage failure stopped the session.
    Error,
}

impl SessionState {
    /// True while the session talks to peers and trackers.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Announcing | SessionState::Downloading | SessionState::Seeding
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Announcing => "announcing",
            SessionState::Downloading => "downloading",
            SessionState::Seeding => "seeding",
            SessionState::Paused => "paused",
            SessionState::Removed => "removed",
            SessionState::Error => "errored",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub info_hash: InfoHash,
    pub name: String,
    pub state: SessionState,
    pub piece_count: usize,
    /// Pieces selected for download; `piece_count` without a file selection.
    pub pieces_wanted: usize,
    /// Verified pieces among the wanted ones.
    pub pieces_verified: usize,
    pub bytes_verified: u64,
    /// Size of the wanted pieces.
    pub total_bytes: u64,
    /// Payload bytes received from peers, including discarded pieces.
    pub downloaded: u64,
    pub uploaded: u64,
    /// Smoothed bytes per second.
    pub download_rate: u64,
    pub upload_rate: u64,
    pub connected_peers: usize,
    pub last_error: Option<String>,
}

impl SessionStatus {
    /// Fraction of bytes verified, 0.0 to 1.0.
    pub fn progress(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        self.bytes_verified as f64 / self.total_bytes as f64
    }

    /// Upload/download ratio; zero before anything was downloaded.
    pub fn ratio(&self) -> f64 {
        if self.downloaded == 0 {
            return 0.0;
        }
        self.uploaded as f64 / self.downloaded as f64
    }

    pub fn is_complete(&self) -> bool {
        self.pieces_verified == self.pieces_wanted
    }

    /// Returns download speed in a human-readable format.
    pub fn download_rate_formatted(&self) -> String {
        format_bytes_per_second(self.download_rate)
    }

    /// Returns upload speed in a human-readable format.
    pub fn upload_rate_formatted(&self) -> String {
        format_bytes_per_second(self.upload_rate)
    }
}

/// Formats bytes per second into a human-readable string.
pub fn format_bytes_per_second(bytes_per_second: u64) -> String {
    if bytes_per_second == 0 {
        return "0 B/s".to_string();
    }

    const UNITS: &[&str] = &["B/s", "KB/s", "MB/s", "GB/s"];
    let mut value = bytes_per_second as f64;
    let mut unit_index = 0;

    while value >= 1024.0 && unit_index < UNITS.len() - 1 {
        value /= 1024.0;
        unit_index += 1;
    }

    if value >= 10.0 {
        format!("{:.0} {}", value, UNITS[unit_index])
    } else {
        format!("{:.1} {}", value, UNITS[unit_index])
    }
}
