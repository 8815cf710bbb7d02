//! Block-level piece state, rarest-first selection and hash verification.
//!
//! Only the owning session touches a `PieceManager`. Blocks are assembled
//! in memory and a piece reaches storage only after its SHA-1 matches.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha1::{Digest, Sha1};

use super::peer_manager::ConnectionId;
use super::{Bitfield, PieceIndex, TorrentError, TorrentMetadata};
use crate::storage::{Storage, StorageError};

/// A block to request from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: PieceIndex,
    pub offset: u32,
    pub length: u32,
}

/// Download state of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    NotRequested,
    Requested { peer: ConnectionId, at: Instant },
    Received,
}

/// Coarse state of a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Missing,
    InProgress,
    Verified,
}

/// Result of handing a received block to the piece manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Duplicate, misaligned or already verified; nothing changed.
    Ignored,
    /// Stored; the piece still has missing blocks.
    Accepted,
    /// Last block arrived and the piece hashed correctly.
    PieceVerified { index: PieceIndex },
    /// Last block arrived and the hash was wrong. The piece was reset.
    /// `offenders` lists contributors that crossed the strike threshold.
    HashMismatch {
        index: PieceIndex,
        contributors: Vec<SocketAddr>,
        offenders: Vec<SocketAddr>,
    },
}

struct PieceProgress {
    blocks: Vec<BlockState>,
    buffer: Vec<u8>,
    received: usize,
    contributors: HashSet<SocketAddr>,
}

impl PieceProgress {
    fn new(block_count: usize) -> Self {
        Self {
            blocks: vec![BlockState::NotRequested; block_count],
            buffer: Vec::new(),
            received: 0,
            contributors: HashSet::new(),
        }
    }

    fn reset(&mut self) {
        self.blocks.fill(BlockState::NotRequested);
        self.buffer = Vec::new();
        self.received = 0;
        self.contributors.clear();
    }

    fn has_unrequested(&self) -> bool {
        self.blocks
            .iter()
            .any(|block| *block == BlockState::NotRequested)
    }

    fn is_started(&self) -> bool {
        self.blocks
            .iter()
            .any(|block| *block != BlockState::NotRequested)
    }
}

/// Piece and block bookkeeping for one torrent.
pub struct PieceManager {
    metadata: Arc<TorrentMetadata>,
    storage: Box<dyn Storage>,
    block_size: u32,
    strike_threshold: u32,
    pieces: Vec<PieceProgress>,
    verified: Bitfield,
    /// Pieces to download; every piece unless a file selection narrowed it.
    wanted: Bitfield,
    availability: Vec<u32>,
    in_flight: HashMap<ConnectionId, usize>,
    strikes: HashMap<SocketAddr, u32>,
}

impl PieceManager {
    pub fn new(
        metadata: Arc<TorrentMetadata>,
        storage: Box<dyn Storage>,
        block_size: u32,
        strike_threshold: u32,
    ) -> Self {
        let block_size = block_size.max(1);
        let piece_count = metadata.piece_count();
        let pieces = (0..piece_count)
            .map(|index| {
                let size = metadata.piece_size(PieceIndex::new(index as u32));
                PieceProgress::new(size.div_ceil(block_size) as usize)
            })
            .collect();

        Self {
            metadata,
            storage,
            block_size,
            strike_threshold,
            pieces,
            verified: Bitfield::new(piece_count),
            wanted: Bitfield::full(piece_count),
            availability: vec![0; piece_count],
            in_flight: HashMap::new(),
            strikes: HashMap::new(),
        }
    }

    /// Limits downloading to the pieces set in `wanted`.
    ///
    /// Verified pieces outside the set are kept and still served.
    pub fn set_wanted(&mut self, wanted: &Bitfield) {
        self.wanted = Bitfield::new(self.pieces.len());
        for index in wanted.iter_set().filter(|index| *index < self.pieces.len()) {
            self.wanted.set(index);
        }
    }

    /// Hashes whatever wanted data is already on disk and marks matching
    /// pieces verified.
    ///
    /// Missing files are expected and simply leave pieces missing.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Storage` - A file exists but could not be read
    pub async fn verify_existing(&mut self) -> Result<usize, TorrentError> {
        let mut found = 0;
        for index in 0..self.pieces.len() {
            let piece = PieceIndex::new(index as u32);
            if self.verified.has(index) || !self.wanted.has(index) {
                continue;
            }
            let size = self.metadata.piece_size(piece);
            match self.storage.read(piece, 0, size).await {
                Ok(data) => {
                    if self.hash_matches(piece, &data) {
                        self.mark_verified(piece);
                        found += 1;
                    }
                }
                Err(StorageError::PieceNotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!(
            "Recheck of {} found {}/{} pieces",
            self.metadata.name,
            found,
            self.wanted.count()
        );
        Ok(found)
    }

    /// Trusts a previously saved verified set without rehashing.
    pub fn restore_verified(&mut self, bitfield: &Bitfield) {
        for index in bitfield.iter_set() {
            if index < self.pieces.len() {
                self.mark_verified(PieceIndex::new(index as u32));
            }
        }
    }

    pub fn add_peer_bitfield(&mut self, bitfield: &Bitfield) {
        for index in bitfield.iter_set() {
            if let Some(count) = self.availability.get_mut(index) {
                *count += 1;
            }
        }
    }

    pub fn remove_peer_bitfield(&mut self, bitfield: &Bitfield) {
        for index in bitfield.iter_set() {
            if let Some(count) = self.availability.get_mut(index) {
                *count = count.saturating_sub(1);
            }
        }
    }

    pub fn peer_has(&mut self, index: PieceIndex) {
        if let Some(count) = self.availability.get_mut(index.as_usize()) {
            *count += 1;
        }
    }

    /// Picks up to `max` blocks for a peer and marks them requested.
    ///
    /// Pieces are taken rarest first. Among equally rare pieces one already
    /// in progress goes first, then the lower index.
    pub fn select_blocks(
        &mut self,
        peer: ConnectionId,
        peer_pieces: &Bitfield,
        max: usize,
        now: Instant,
    ) -> Vec<BlockRequest> {
        if max == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<usize> = peer_pieces
            .iter_set()
            .filter(|index| {
                *index < self.pieces.len()
                    && self.wanted.has(*index)
                    && !self.verified.has(*index)
                    && self.pieces[*index].has_unrequested()
            })
            .collect();
        candidates.sort_by_key(|index| {
            (
                self.availability[*index],
                !self.pieces[*index].is_started(),
                *index,
            )
        });

        let mut requests = Vec::new();
        for index in candidates {
            let piece = PieceIndex::new(index as u32);
            let piece_size = self.metadata.piece_size(piece);
            let progress = &mut self.pieces[index];
            for (block, state) in progress.blocks.iter_mut().enumerate() {
                if requests.len() == max {
                    break;
                }
                if *state != BlockState::NotRequested {
                    continue;
                }
                let offset = block as u32 * self.block_size;
                *state = BlockState::Requested { peer, at: now };
                requests.push(BlockRequest {
                    piece,
                    offset,
                    length: self.block_size.min(piece_size - offset),
                });
            }
            if requests.len() == max {
                break;
            }
        }

        if !requests.is_empty() {
            *self.in_flight.entry(peer).or_default() += requests.len();
        }
        requests
    }

    /// Accepts a block from a peer, verifying and storing the piece when
    /// its last block lands.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Storage` - The verified piece could not be written
    pub async fn block_received(
        &mut self,
        peer: ConnectionId,
        address: SocketAddr,
        piece: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> Result<BlockOutcome, TorrentError> {
        let index = piece.as_usize();
        if index >= self.pieces.len() || self.verified.has(index) {
            return Ok(BlockOutcome::Ignored);
        }
        let piece_size = self.metadata.piece_size(piece);
        if offset % self.block_size != 0 {
            return Ok(BlockOutcome::Ignored);
        }
        let block = (offset / self.block_size) as usize;
        let expected = self.block_size.min(piece_size.saturating_sub(offset));
        let progress = &mut self.pieces[index];
        if block >= progress.blocks.len() || data.len() != expected as usize {
            return Ok(BlockOutcome::Ignored);
        }

        match progress.blocks[block] {
            BlockState::Received => return Ok(BlockOutcome::Ignored),
            BlockState::Requested { peer: owner, .. } => {
                decrement(&mut self.in_flight, owner);
            }
            BlockState::NotRequested => {}
        }

        if progress.buffer.is_empty() {
            progress.buffer = vec![0; piece_size as usize];
        }
        let start = offset as usize;
        progress.buffer[start..start + data.len()].copy_from_slice(data);
        progress.blocks[block] = BlockState::Received;
        progress.received += 1;
        progress.contributors.insert(address);
        tracing::trace!("Block {}@{} from {} ({})", piece, offset, address, peer);

        if progress.received < progress.blocks.len() {
            return Ok(BlockOutcome::Accepted);
        }

        let buffer = std::mem::take(&mut progress.buffer);
        if self.hash_matches(piece, &buffer) {
            self.storage.write_piece(piece, &buffer).await?;
            self.mark_verified(piece);
            tracing::debug!("Piece {} verified", piece);
            return Ok(BlockOutcome::PieceVerified { index: piece });
        }

        let progress = &mut self.pieces[index];
        let mut contributors: Vec<SocketAddr> = progress.contributors.drain().collect();
        contributors.sort();
        progress.reset();

        let mut offenders = Vec::new();
        for address in &contributors {
            let strikes = self.strikes.entry(*address).or_default();
            *strikes += 1;
            if *strikes > self.strike_threshold {
                offenders.push(*address);
            }
        }
        tracing::warn!(
            "Piece {} failed hash check; contributors {:?}",
            piece,
            contributors
        );
        Ok(BlockOutcome::HashMismatch {
            index: piece,
            contributors,
            offenders,
        })
    }

    /// Returns a peer's outstanding requests to the pool.
    pub fn release_peer(&mut self, peer: ConnectionId) -> usize {
        let mut released = 0;
        for progress in &mut self.pieces {
            for state in &mut progress.blocks {
                if matches!(state, BlockState::Requested { peer: owner, .. } if *owner == peer) {
                    *state = BlockState::NotRequested;
                    released += 1;
                }
            }
        }
        self.in_flight.remove(&peer);
        released
    }

    /// Re-opens requests older than `timeout` and reports them so the
    /// session can cancel them on the wire.
    pub fn expire_requests(
        &mut self,
        now: Instant,
        timeout: Duration,
    ) -> Vec<(ConnectionId, BlockRequest)> {
        let mut expired = Vec::new();
        for (index, progress) in self.pieces.iter_mut().enumerate() {
            let piece = PieceIndex::new(index as u32);
            let piece_size = self.metadata.piece_size(piece);
            for (block, state) in progress.blocks.iter_mut().enumerate() {
                if let BlockState::Requested { peer, at } = *state {
                    if now.saturating_duration_since(at) >= timeout {
                        *state = BlockState::NotRequested;
                        let offset = block as u32 * self.block_size;
                        expired.push((
                            peer,
                            BlockRequest {
                                piece,
                                offset,
                                length: self.block_size.min(piece_size - offset),
                            },
                        ));
                    }
                }
            }
        }
        for (peer, _) in &expired {
            decrement(&mut self.in_flight, *peer);
        }
        expired
    }

    pub fn in_flight(&self, peer: ConnectionId) -> usize {
        self.in_flight.get(&peer).copied().unwrap_or(0)
    }

    /// True when the peer has a piece we still need.
    pub fn is_interesting(&self, peer_pieces: &Bitfield) -> bool {
        peer_pieces.iter_set().any(|index| {
            index < self.pieces.len() && self.wanted.has(index) && !self.verified.has(index)
        })
    }

    pub fn piece_state(&self, index: PieceIndex) -> Option<PieceState> {
        let progress = self.pieces.get(index.as_usize())?;
        Some(if self.verified.has(index.as_usize()) {
            PieceState::Verified
        } else if progress.is_started() {
            PieceState::InProgress
        } else {
            PieceState::Missing
        })
    }

    pub fn block_state(&self, index: PieceIndex, block: usize) -> Option<BlockState> {
        self.pieces.get(index.as_usize())?.blocks.get(block).copied()
    }

    pub fn verified_bitfield(&self) -> &Bitfield {
        &self.verified
    }

    pub fn verified_count(&self) -> usize {
        self.verified.count()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn wanted_count(&self) -> usize {
        self.wanted.count()
    }

    pub fn wanted_verified_count(&self) -> usize {
        self.wanted
            .iter_set()
            .filter(|index| self.verified.has(*index))
            .count()
    }

    /// True once every wanted piece is verified.
    pub fn is_complete(&self) -> bool {
        self.wanted.iter_set().all(|index| self.verified.has(index))
    }

    pub fn bytes_verified(&self) -> u64 {
        self.sum_sizes(self.verified.iter_set())
    }

    pub fn bytes_wanted(&self) -> u64 {
        self.sum_sizes(self.wanted.iter_set())
    }

    /// Wanted bytes not yet verified; what trackers are told is `left`.
    pub fn bytes_left(&self) -> u64 {
        self.sum_sizes(
            self.wanted
                .iter_set()
                .filter(|index| !self.verified.has(*index)),
        )
    }

    fn sum_sizes(&self, indices: impl Iterator<Item = usize>) -> u64 {
        indices
            .map(|index| u64::from(self.metadata.piece_size(PieceIndex::new(index as u32))))
            .sum()
    }

    /// Reads a block of a verified piece for upload.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PieceNotVerified` - We do not have the piece
    /// - `TorrentError::Storage` - The read failed
    pub async fn read_block(
        &self,
        piece: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<Vec<u8>, TorrentError> {
        if !self.verified.has(piece.as_usize()) {
            return Err(TorrentError::PieceNotVerified { index: piece });
        }
        Ok(self.storage.read(piece, offset, length).await?)
    }

    /// Deletes the torrent's files from storage.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Storage` - A file could not be removed
    pub async fn remove_files(&mut self) -> Result<(), TorrentError> {
        Ok(self.storage.remove_files().await?)
    }

    fn hash_matches(&self, piece: PieceIndex, data: &[u8]) -> bool {
        match self.metadata.piece_hash(piece) {
            Some(expected) => Sha1::digest(data).as_slice() == expected.as_slice(),
            None => false,
        }
    }

    fn mark_verified(&mut self, piece: PieceIndex) {
        self.verified.set(piece.as_usize());
        if let Some(progress) = self.pieces.get_mut(piece.as_usize()) {
            progress.blocks.fill(BlockState::Received);
            progress.received = progress.blocks.len();
            progress.buffer = Vec::new();
            progress.contributors.clear();
        }
    }
}

fn decrement(in_flight: &mut HashMap<ConnectionId, usize>, peer: ConnectionId) {
    if let Some(count) = in_flight.get_mut(&peer) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            in_flight.remove(&peer);
        }
    }
}
