//! Core types and structures for torrent parsing

use std::ops::Range;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::super::{Bitfield, InfoHash, PieceIndex, TorrentError};

/// Complete metadata extracted from a torrent file.
///
/// Contains all information needed to download a torrent including
/// piece hashes, file structure, and tracker URLs. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentMetadata {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: u64,
    pub files: Vec<TorrentFile>,
    /// Every announce URL, tier order flattened.
    pub announce_urls: Vec<String>,
    /// Announce tiers from `announce-list`, or a single tier holding `announce`.
    pub announce_tiers: Vec<Vec<String>>,
    /// True when the torrent stores its files under a `name` directory.
    pub multi_file: bool,
}

impl TorrentMetadata {
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of the given piece; only the final piece may be shorter.
    pub fn piece_size(&self, index: PieceIndex) -> u32 {
        let piece_length = u64::from(self.piece_length);
        let start = u64::from(index.as_u32()) * piece_length;
        let remaining = self.total_length.saturating_sub(start);
        remaining.min(piece_length) as u32
    }

    /// Byte offset of the piece within the concatenated file stream.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        u64::from(index.as_u32()) * u64::from(self.piece_length)
    }

    pub fn piece_hash(&self, index: PieceIndex) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index.as_usize())
    }

    /// Pieces overlapping the given file; empty for a zero-length file.
    pub fn file_pieces(&self, file: usize) -> Option<Range<usize>> {
        let start: u64 = self.files.get(..file)?.iter().map(|f| f.length).sum();
        let length = self.files.get(file)?.length;
        if length == 0 || self.piece_length == 0 {
            return Some(0..0);
        }
        let piece_length = u64::from(self.piece_length);
        let first = (start / piece_length) as usize;
        let last = ((start + length - 1) / piece_length) as usize;
        Some(first..last + 1)
    }

    /// Every piece touched by at least one of `files`.
    ///
    /// # Errors
    /// - `TorrentError::InvalidFileSelection` - Unknown file index, or the
    ///   selection covers no data
    pub fn pieces_for_files(&self, files: &[usize]) -> Result<Bitfield, TorrentError> {
        let mut wanted = Bitfield::new(self.piece_count());
        for &file in files {
            let pieces = self
                .file_pieces(file)
                .ok_or_else(|| TorrentError::InvalidFileSelection {
                    reason: format!("file {file} out of range ({} files)", self.files.len()),
                })?;
            for index in pieces {
                wanted.set(index);
            }
        }
        if wanted.count() == 0 {
            return Err(TorrentError::InvalidFileSelection {
                reason: "no data selected".to_string(),
            });
        }
        Ok(wanted)
    }

    /// Path of each file relative to a download directory.
    pub fn relative_file_paths(&self) -> Vec<PathBuf> {
        self.files
            .iter()
            .map(|file| {
                let mut path = PathBuf::new();
                if self.multi_file {
                    path.push(&self.name);
                }
                for component in &file.path {
                    path.push(component);
                }
                path
            })
            .collect()
    }
}

/// Individual file within a torrent.
///
/// Represents a single file entry in multi-file torrents with its
/// relative path components and byte length.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentFile {
    pub path: Vec<String>,
    pub length: u64,
}

/// Abstract torrent parsing interface.
///
/// Implementations handle format-specific details while maintaining consistent
/// error handling and metadata extraction.
#[async_trait]
pub trait TorrentParser: Send + Sync {
    /// Parses torrent metadata from raw bencode bytes.
    ///
    /// # Errors
    /// - `TorrentError::MalformedTorrent` - Malformed bencode or missing fields
    async fn parse_torrent_data(&self, data: &[u8]) -> Result<TorrentMetadata, TorrentError>;

    /// Parses torrent file from filesystem path.
    ///
    /// Reads file from disk and delegates to parse_torrent_data for processing.
    ///
    /// # Errors
    /// - `TorrentError::Io` - File could not be read
    /// - `TorrentError::MalformedTorrent` - Parsing failure
    async fn parse_torrent_file(&self, path: &Path) -> Result<TorrentMetadata, TorrentError>;
}

#[cfg(test)]
mod tests {
    use crate::torrent::TorrentError;
    use crate::torrent::test_data::straddling_torrent;

    #[test]
    fn test_file_pieces_follow_file_boundaries() {
        let (metadata, _) = straddling_torrent();
        // a.bin covers bytes 0..20000, b.bin 20000..40000; piece 1 holds both.
        assert_eq!(metadata.file_pieces(0), Some(0..2));
        assert_eq!(metadata.file_pieces(1), Some(1..3));
        assert_eq!(metadata.file_pieces(2), None);

        let wanted = metadata.pieces_for_files(&[1]).unwrap();
        assert_eq!(wanted.iter_set().collect::<Vec<_>>(), vec![1, 2]);
        let both = metadata.pieces_for_files(&[0, 1]).unwrap();
        assert!(both.is_complete());
    }

    #[test]
    fn test_invalid_file_selection() {
        let (metadata, _) = straddling_torrent();
        assert!(matches!(
            metadata.pieces_for_files(&[0, 7]),
            Err(TorrentError::InvalidFileSelection { .. })
        ));
        assert!(matches!(
            metadata.pieces_for_files(&[]),
            Err(TorrentError::InvalidFileSelection { .. })
        ));
    }
}
