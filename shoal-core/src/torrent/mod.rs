//! BitTorrent protocol implementation: metadata, trackers, peer wire and piece state

pub mod bitfield;
pub mod creation;
pub mod downloader;
pub mod parsing;
pub mod peer_manager;
pub mod piece_manager;
pub mod protocol;
#[cfg(test)]
pub mod test_data;
pub mod tracker;
pub mod uploader;

use std::fmt;
use std::net::SocketAddr;

pub use bitfield::Bitfield;
pub use creation::{CreatedTorrent, DEFAULT_PIECE_SIZE, TorrentCreator};
pub use downloader::Downloader;
pub use parsing::{BencodeTorrentParser, TorrentFile, TorrentMetadata, TorrentParser};
pub use peer_manager::{ConnectionId, PeerEvent, PeerManager, PeerSource, PeerStatus};
pub use piece_manager::{BlockOutcome, BlockRequest, BlockState, PieceManager, PieceState};
pub use protocol::{ConnectionState, PeerConnection, PeerHandshake, PeerId, PeerMessage};
pub use tracker::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, Announcer, AnnouncerHandle,
    HttpTrackerClient, ScrapeRequest, ScrapeResponse, ScrapeStats, TrackerClient,
    TrackerManagement, TrackerManager, UdpTrackerClient,
};
pub use uploader::Uploader;

use crate::storage::StorageError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used to uniquely identify torrents across the BitTorrent network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parses a 40 character hex string.
    ///
    /// # Errors
    ///
    /// - `TorrentError::MalformedTorrent` - Not 40 hex characters
    pub fn from_hex(hex_str: &str) -> Result<Self, TorrentError> {
        let bytes = hex::decode(hex_str).map_err(|e| TorrentError::MalformedTorrent {
            reason: format!("Invalid info hash hex: {e}"),
        })?;
        let hash: [u8; 20] = bytes
            .try_into()
            .map_err(|_| TorrentError::MalformedTorrent {
                reason: "Info hash must be 20 bytes".to_string(),
            })?;
        Ok(Self(hash))
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Zero-based index of a piece within a torrent.
///
/// Torrent files are divided into pieces for downloading and verification.
/// Each piece has a sequential index starting from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during torrent operations.
///
/// Peer and tracker failures are recoverable and stay below the session;
/// storage failures are fatal to the session that hit them.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Malformed torrent: {reason}")]
    MalformedTorrent { reason: String },

    #[error("Invalid file selection: {reason}")]
    InvalidFileSelection { reason: String },

    #[error("Tracker {url} returned an error: {reason}")]
    TrackerError { url: String, reason: String },

    #[error("Tracker {url} unreachable after {attempts} attempts")]
    TrackerUnreachable { url: String, attempts: u32 },

    #[error("Handshake with {address} failed: {reason}")]
    HandshakeMismatch { address: SocketAddr, reason: String },

    #[error("Protocol violation from {address}: {reason}")]
    ProtocolViolation { address: SocketAddr, reason: String },

    #[error("Peer connection error: {reason}")]
    PeerConnectionError { reason: String },

    #[error("Piece {index} hash mismatch")]
    HashMismatch { index: PieceIndex },

    #[error("Piece {index} is not verified")]
    PieceNotVerified { index: PieceIndex },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Torrent {info_hash} not found")]
    TorrentNotFound { info_hash: InfoHash },

    #[error("Torrent {info_hash} already added")]
    DuplicateTorrent { info_hash: InfoHash },

    #[error("Cannot {operation} a torrent that is {state}")]
    InvalidStateTransition { operation: String, state: String },

    #[error("Engine has shut down")]
    EngineShutdown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error: {0}")]
    UrlParsing(#[from] url::ParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TorrentError {
    /// Returns true for failures confined to one peer connection.
    pub fn is_peer_local(&self) -> bool {
        matches!(
            self,
            TorrentError::HandshakeMismatch { .. }
                | TorrentError::ProtocolViolation { .. }
                | TorrentError::PeerConnectionError { .. }
                | TorrentError::Io(_)
        )
    }
}
