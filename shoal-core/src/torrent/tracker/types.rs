//! Core types and enumerations for BitTorrent tracker communication

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;

use crate::torrent::{InfoHash, PeerId, TorrentError};

/// Tracker announce request.
///
/// Contains client statistics and torrent information sent to tracker
/// during announce operations to report progress and request peer list.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    /// Unique identifier for the torrent being announced
    pub info_hash: InfoHash,
    /// Client's unique 20-byte identifier
    pub peer_id: PeerId,
    /// TCP port client is listening on for peer connections
    pub port: u16,
    /// Total bytes uploaded to other peers
    pub uploaded: u64,
    /// Total bytes downloaded from other peers
    pub downloaded: u64,
    /// Bytes remaining to download (0 for seeders)
    pub left: u64,
    /// Current client state for this torrent
    pub event: AnnounceEvent,
    /// Number of peers we would like back
    pub numwant: u32,
}

/// BitTorrent announce events.
///
/// Indicates client state changes that should be reported to tracker
/// for proper swarm management and statistics tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// Periodic re-announce with no state change
    Regular,
    /// Client completed downloading this torrent
    Completed,
    /// Client started downloading this torrent
    Started,
    /// Client stopped downloading this torrent
    Stopped,
}

impl AnnounceEvent {
    /// Value of the HTTP `event` parameter; regular announces omit it.
    pub fn as_query_value(self) -> Option<&'static str> {
        match self {
            AnnounceEvent::Regular => None,
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Stopped => Some("stopped"),
        }
    }

    /// Event code in a UDP announce packet.
    pub fn udp_code(self) -> u32 {
        match self {
            AnnounceEvent::Regular => 0,
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Started => 2,
            AnnounceEvent::Stopped => 3,
        }
    }
}

/// Tracker announce response.
///
/// Contains peer list and swarm statistics returned by tracker
/// in response to announce requests.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceResponse {
    /// Seconds until next announce request should be sent
    pub interval: u32,
    /// Minimum allowed interval between announces
    pub min_interval: Option<u32>,
    /// Tracker-specific identifier for subsequent requests
    pub tracker_id: Option<String>,
    /// Number of seeders in the swarm
    pub complete: u32,
    /// Number of leechers in the swarm
    pub incomplete: u32,
    /// List of peer addresses for connection attempts
    pub peers: Vec<SocketAddr>,
}

/// Tracker scrape request.
#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    /// List of torrent info hashes to query statistics for
    pub info_hashes: Vec<InfoHash>,
}

/// Individual torrent statistics from scrape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeStats {
    /// Number of seeders (peers with complete file)
    pub complete: u32,
    /// Total number of completed downloads
    pub downloaded: u32,
    /// Number of leechers (peers downloading)
    pub incomplete: u32,
}

/// Tracker scrape response.
///
/// Contains statistics for all requested torrents indexed by info hash.
#[derive(Debug, Clone, Default)]
pub struct ScrapeResponse {
    /// Statistics for each torrent indexed by info hash
    pub files: HashMap<InfoHash, ScrapeStats>,
}

/// Abstract tracker communication interface for BitTorrent trackers.
///
/// Provides announce and scrape operations. Implementations handle
/// protocol-specific details (HTTP/UDP) while keeping error reporting
/// consistent.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Announces client presence to tracker and retrieves peer list.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerError` - Tracker rejected the request or answered garbage
    /// - `TorrentError::TrackerUnreachable` - No answer within the retry budget
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError>;

    /// Retrieves torrent statistics from tracker without announcing.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerError` - Scrape unsupported or rejected
    /// - `TorrentError::TrackerUnreachable` - No answer within the retry budget
    async fn scrape(&self, request: ScrapeRequest) -> Result<ScrapeResponse, TorrentError>;

    /// Returns tracker URL for debugging and logging purposes.
    fn tracker_url(&self) -> &str;
}
