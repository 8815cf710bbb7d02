//! Serving side of the piece exchange.
//!
//! Requests are answered from verified pieces on disk whatever the
//! session's own download progress, so a leeching session already seeds
//! the pieces it has.

use bytes::Bytes;

use super::PieceIndex;
use super::peer_manager::{ConnectionId, PeerManager};
use super::piece_manager::PieceManager;
use super::protocol::PeerMessage;
use crate::config::NetworkConfig;

/// What happened to a peer's block request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Served { bytes: u32 },
    Refused { reason: String },
}

/// Choke policy and request serving for one session.
///
/// Interested peers are unchoked and stay unchoked until they lose
/// interest; there is no rotation.
#[derive(Debug, Clone)]
pub struct Uploader {
    max_request_length: u32,
}

impl Uploader {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            max_request_length: config.max_request_length,
        }
    }

    pub fn on_interest(&self, peers: &mut PeerManager, id: ConnectionId, interested: bool) {
        let Some(link) = peers.link_mut(id) else {
            return;
        };
        link.peer_interested = interested;

        let reply = match (interested, link.am_choking) {
            (true, true) => PeerMessage::Unchoke,
            (false, false) => PeerMessage::Choke,
            _ => return,
        };
        if peers.send(id, reply) {
            if let Some(link) = peers.link_mut(id) {
                link.am_choking = !interested;
            }
        }
    }

    /// Answers a `request` with a `piece` message when we may.
    pub async fn on_request(
        &self,
        peers: &mut PeerManager,
        pieces: &PieceManager,
        id: ConnectionId,
        piece: PieceIndex,
        offset: u32,
        length: u32,
    ) -> UploadOutcome {
        let Some(link) = peers.link(id) else {
            return refused("peer gone");
        };
        if link.am_choking {
            return refused("peer is choked");
        }
        if length > self.max_request_length {
            return refused("request too long");
        }

        let data = match pieces.read_block(piece, offset, length).await {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!("Not serving {}@{} to {}: {}", piece, offset, id, e);
                return refused(&e.to_string());
            }
        };

        let message = PeerMessage::Piece {
            piece_index: piece,
            offset,
            data: Bytes::from(data),
        };
        if !peers.send(id, message) {
            return refused("outbound queue closed");
        }
        if let Some(link) = peers.link_mut(id) {
            link.uploaded += u64::from(length);
        }
        tracing::trace!("Served {}@{}+{} to {}", piece, offset, length, id);
        UploadOutcome::Served { bytes: length }
    }
}

fn refused(reason: &str) -> UploadOutcome {
    UploadOutcome::Refused {
        reason: reason.to_string(),
    }
}
