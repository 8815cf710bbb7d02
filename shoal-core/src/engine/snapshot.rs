//! Versioned resume data.
//!
//! A snapshot records, per torrent, where its data lives and which pieces
//! were verified, so a restart can skip rehashing. The format is plain JSON.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::torrent::{Bitfield, InfoHash, TorrentError};

/// Format version written by this build.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Errors reading or writing a snapshot file.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Snapshot I/O on {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported snapshot version {version}")]
    UnsupportedVersion { version: u32 },
}

/// Resume data for every session in an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub torrents: Vec<TorrentSnapshot>,
}

/// Resume data for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentSnapshot {
    /// Hex info hash.
    pub info_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub torrent_path: Option<PathBuf>,
    pub destination: PathBuf,
    pub piece_count: usize,
    /// Hex of the verified bitfield in wire layout.
    pub verified: String,
    pub downloaded: u64,
    pub uploaded: u64,
    /// File indices chosen for download; absent means every file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_files: Option<Vec<usize>>,
}

impl TorrentSnapshot {
    pub fn new(
        info_hash: InfoHash,
        torrent_path: Option<PathBuf>,
        destination: PathBuf,
        verified: &Bitfield,
        downloaded: u64,
        uploaded: u64,
    ) -> Self {
        Self {
            info_hash: info_hash.to_string(),
            torrent_path,
            destination,
            piece_count: verified.len(),
            verified: hex::encode(verified.as_bytes()),
            downloaded,
            uploaded,
            selected_files: None,
        }
    }

    pub fn with_file_selection(mut self, files: Option<Vec<usize>>) -> Self {
        self.selected_files = files;
        self
    }

    /// # Errors
    ///
    /// - `TorrentError::MalformedTorrent` - Not a 40 character hex hash
    pub fn info_hash(&self) -> Result<InfoHash, TorrentError> {
        InfoHash::from_hex(&self.info_hash)
    }

    /// Decodes the verified set; `None` if it does not fit `piece_count`.
    pub fn verified_bitfield(&self) -> Option<Bitfield> {
        let bytes = hex::decode(&self.verified).ok()?;
        Bitfield::from_bytes(&bytes, self.piece_count)
    }
}

impl EngineSnapshot {
    pub fn new(torrents: Vec<TorrentSnapshot>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            torrents,
        }
    }

    pub fn find(&self, info_hash: InfoHash) -> Option<&TorrentSnapshot> {
        let wanted = info_hash.to_string();
        self.torrents.iter().find(|torrent| torrent.info_hash == wanted)
    }

    /// Writes the snapshot next to `path` and renames it into place.
    ///
    /// # Errors
    ///
    /// - `SnapshotError::Io` - Write or rename failed
    /// - `SnapshotError::Json` - Serialization failed
    pub async fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let json = serde_json::to_vec_pretty(self)?;
        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, json)
            .await
            .map_err(|source| io_error(&staging, source))?;
        tokio::fs::rename(&staging, path)
            .await
            .map_err(|source| io_error(path, source))?;
        tracing::debug!(
            "Saved snapshot of {} torrents to {}",
            self.torrents.len(),
            path.display()
        );
        Ok(())
    }

    /// # Errors
    ///
    /// - `SnapshotError::Io` - File could not be read
    /// - `SnapshotError::Json` - Contents are not a snapshot
    /// - `SnapshotError::UnsupportedVersion` - Written by a newer format
    pub async fn load(path: &Path) -> Result<Self, SnapshotError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| io_error(path, source))?;
        let snapshot: Self = serde_json::from_slice(&bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                version: snapshot.version,
            });
        }
        Ok(snapshot)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> SnapshotError {
    SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    }
}
