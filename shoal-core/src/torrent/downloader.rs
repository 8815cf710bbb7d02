//! Request side of the piece exchange.
//!
//! Keeps each unchoked peer's request pipeline full, tracks interest and
//! hands received blocks to the piece manager. Holds no state of its own:
//! the session passes in the peer and piece managers it owns.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::peer_manager::{ConnectionId, PeerManager};
use super::piece_manager::{BlockOutcome, PieceManager};
use super::protocol::PeerMessage;
use super::{PieceIndex, TorrentError};
use crate::config::TorrentConfig;

/// Request scheduling policy for one session.
#[derive(Debug, Clone)]
pub struct Downloader {
    pipeline_depth: usize,
    block_timeout: Duration,
}

impl Downloader {
    pub fn new(config: &TorrentConfig) -> Self {
        Self {
            pipeline_depth: config.pipeline_depth.max(1),
            block_timeout: config.block_timeout,
        }
    }

    /// Sends `interested`/`not interested` when our view of a peer changed.
    pub fn update_interest(
        &self,
        peers: &mut PeerManager,
        pieces: &PieceManager,
        id: ConnectionId,
    ) {
        let Some(link) = peers.link(id) else {
            return;
        };
        let interesting = pieces.is_interesting(&link.bitfield);
        if interesting == link.am_interested {
            return;
        }

        let message = if interesting {
            PeerMessage::Interested
        } else {
            PeerMessage::NotInterested
        };
        if peers.send(id, message) {
            if let Some(link) = peers.link_mut(id) {
                link.am_interested = interesting;
            }
        }
    }

    /// Tops up a peer's request pipeline. Returns the number of requests sent.
    pub fn fill_pipeline(
        &self,
        peers: &mut PeerManager,
        pieces: &mut PieceManager,
        id: ConnectionId,
        now: Instant,
    ) -> usize {
        let Some(link) = peers.link(id) else {
            return 0;
        };
        if !link.is_connected() || link.peer_choking || !link.am_interested {
            return 0;
        }

        let budget = self.pipeline_depth.saturating_sub(pieces.in_flight(id));
        let requests = pieces.select_blocks(id, &link.bitfield, budget, now);
        let mut sent = 0;
        for request in requests {
            let message = PeerMessage::Request {
                piece_index: request.piece,
                offset: request.offset,
                length: request.length,
            };
            if !peers.send(id, message) {
                // The link is gone; hand the rest back.
                pieces.release_peer(id);
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Refreshes interest and pipelines for every connected peer.
    pub fn fill_all(&self, peers: &mut PeerManager, pieces: &mut PieceManager, now: Instant) {
        for id in peers.connected_ids() {
            self.update_interest(peers, pieces, id);
            self.fill_pipeline(peers, pieces, id, now);
        }
    }

    /// The remote choked us; our outstanding requests will not be served.
    pub fn on_choked(&self, peers: &mut PeerManager, pieces: &mut PieceManager, id: ConnectionId) {
        if let Some(link) = peers.link_mut(id) {
            link.peer_choking = true;
        }
        let released = pieces.release_peer(id);
        if released > 0 {
            tracing::trace!("Choked by {}; released {} requests", id, released);
        }
    }

    pub fn on_unchoked(
        &self,
        peers: &mut PeerManager,
        pieces: &mut PieceManager,
        id: ConnectionId,
        now: Instant,
    ) {
        if let Some(link) = peers.link_mut(id) {
            link.peer_choking = false;
        }
        self.fill_pipeline(peers, pieces, id, now);
    }

    /// Hands a `piece` message to the piece manager and refills the pipeline.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Storage` - A verified piece could not be written
    pub async fn on_block(
        &self,
        peers: &mut PeerManager,
        pieces: &mut PieceManager,
        id: ConnectionId,
        address: SocketAddr,
        piece: PieceIndex,
        offset: u32,
        data: Bytes,
    ) -> Result<BlockOutcome, TorrentError> {
        let outcome = pieces
            .block_received(id, address, piece, offset, &data)
            .await?;
        if outcome != BlockOutcome::Ignored {
            if let Some(link) = peers.link_mut(id) {
                link.downloaded += data.len() as u64;
            }
        }
        self.fill_pipeline(peers, pieces, id, Instant::now());
        Ok(outcome)
    }

    /// Re-opens timed-out requests, cancels them on the wire and refills.
    pub fn expire(&self, peers: &mut PeerManager, pieces: &mut PieceManager, now: Instant) {
        let expired = pieces.expire_requests(now, self.block_timeout);
        if expired.is_empty() {
            return;
        }
        tracing::debug!("{} block requests timed out", expired.len());
        for (id, request) in expired {
            peers.send(
                id,
                PeerMessage::Cancel {
                    piece_index: request.piece,
                    offset: request.offset,
                    length: request.length,
                },
            );
        }
        self.fill_all(peers, pieces, now);
    }
}
