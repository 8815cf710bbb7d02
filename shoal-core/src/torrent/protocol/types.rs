//! Core types and enumerations for BitTorrent wire protocol

use std::fmt;

use bytes::Bytes;

use crate::torrent::{InfoHash, PieceIndex};

/// BitTorrent peer identifier.
///
/// 20-byte identifier for peers in the BitTorrent network.
/// Used in handshakes and tracker communication to identify clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generates an Azureus-style peer ID: the client prefix followed by
    /// random bytes. Prefixes longer than 20 bytes are truncated.
    pub fn generate(client_prefix: &str) -> Self {
        let mut id: [u8; 20] = rand::random();
        let prefix = client_prefix.as_bytes();
        let prefix_len = prefix.len().min(id.len());
        id[..prefix_len].copy_from_slice(&prefix[..prefix_len]);
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            if byte.is_ascii_graphic() {
                write!(f, "{}", *byte as char)?;
            } else {
                write!(f, "%{byte:02x}")?;
            }
        }
        Ok(())
    }
}

/// BitTorrent wire protocol messages.
///
/// Complete set of message types defined in BEP 3 for peer communication.
/// Handles keep-alive, choke/unchoke, piece requests, and data transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Keep-alive message to maintain connection
    KeepAlive,
    /// Inform peer that we are choking them
    Choke,
    /// Inform peer that we are no longer choking them
    Unchoke,
    /// Inform peer that we are interested in their pieces
    Interested,
    /// Inform peer that we are not interested in their pieces
    NotInterested,
    /// Inform peer that we have acquired a specific piece
    Have {
        /// Index of the piece we now have
        piece_index: PieceIndex,
    },
    /// Send our complete piece availability bitmap
    Bitfield {
        /// Bitmap indicating which pieces we have
        bitfield: Bytes,
    },
    /// Request a block of data from a piece
    Request {
        /// Index of the piece to request from
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes to request
        length: u32,
    },
    /// Send a block of piece data
    Piece {
        /// Index of the piece this data belongs to
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// The actual piece data
        data: Bytes,
    },
    /// Cancel a previously sent request
    Cancel {
        /// Index of the piece to cancel
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes that were requested
        length: u32,
    },
    /// DHT port announcement; parsed and ignored
    Port {
        /// UDP port for DHT communication
        port: u16,
    },
    /// Extension message we do not speak
    Unknown {
        /// Message ID as received
        id: u8,
    },
}

/// Peer handshake information.
///
/// Initial exchange between peers to establish protocol compatibility
/// and verify info hash matching for torrent verification.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHandshake {
    /// Reserved bytes for protocol extensions
    pub reserved: [u8; 8],
    /// Info hash of the torrent being shared
    pub info_hash: InfoHash,
    /// Unique identifier for the peer
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Create handshake for BitTorrent protocol.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
}

/// Lifecycle of a single peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP connection in progress
    Connecting,
    /// Exchanging the 68-byte handshake
    Handshaking,
    /// Handshake validated; messages may flow
    Connected,
    /// Socket closed or failed; terminal
    Closed,
}
