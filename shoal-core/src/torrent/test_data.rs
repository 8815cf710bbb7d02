//! Test data creation for torrent testing.
//!
//! Provides standardized torrent metadata and piece data for consistent
//! testing across torrent-related modules.

use std::sync::Arc;

use sha1::{Digest, Sha1};

use super::parsing::TorrentFile;
use super::{InfoHash, PieceIndex, TorrentMetadata};

/// Deterministic content for a torrent of `length` bytes.
pub fn reference_data(length: usize) -> Vec<u8> {
    (0..length).map(|i| (i % 251) as u8).collect()
}

/// Builds metadata describing `data` split into `piece_length` pieces.
pub fn metadata_for(data: &[u8], piece_length: u32, files: Vec<TorrentFile>) -> TorrentMetadata {
    let piece_hashes = data
        .chunks(piece_length as usize)
        .map(|chunk| {
            let digest = Sha1::digest(chunk);
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&digest);
            hash
        })
        .collect();
    let multi_file = files.len() > 1;

    TorrentMetadata {
        info_hash: InfoHash::new([7u8; 20]),
        name: if multi_file {
            "bundle".to_string()
        } else {
            files[0].path[0].clone()
        },
        piece_length,
        piece_hashes,
        total_length: data.len() as u64,
        files,
        announce_urls: vec!["http://tracker.example.com/announce".to_string()],
        announce_tiers: vec![vec!["http://tracker.example.com/announce".to_string()]],
        multi_file,
    }
}

/// 16 KiB pieces, three of them, the last one 4 KiB.
pub fn three_piece_torrent() -> (Arc<TorrentMetadata>, Vec<u8>) {
    let data = reference_data(36864);
    let metadata = metadata_for(
        &data,
        16384,
        vec![TorrentFile {
            path: vec!["reference.bin".to_string()],
            length: data.len() as u64,
        }],
    );
    (Arc::new(metadata), data)
}

/// Two files whose boundary falls inside the second piece.
pub fn straddling_torrent() -> (Arc<TorrentMetadata>, Vec<u8>) {
    let data = reference_data(40000);
    let metadata = metadata_for(
        &data,
        16384,
        vec![
            TorrentFile {
                path: vec!["a.bin".to_string()],
                length: 20000,
            },
            TorrentFile {
                path: vec!["nested".to_string(), "b.bin".to_string()],
                length: 20000,
            },
        ],
    );
    (Arc::new(metadata), data)
}

/// Slice of `data` covered by the given piece.
pub fn piece_bytes<'a>(metadata: &TorrentMetadata, data: &'a [u8], index: u32) -> &'a [u8] {
    let start = metadata.piece_offset(PieceIndex::new(index)) as usize;
    let length = metadata.piece_size(PieceIndex::new(index)) as usize;
    &data[start..start + length]
}
