//! Storage layer for torrent data.
//!
//! Maps verified pieces onto the torrent's file layout. Only the piece
//! manager holds a `Storage`, so only verified data ever reaches disk.

pub mod file_storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;

use std::path::PathBuf;

use async_trait::async_trait;
pub use file_storage::{FileLayout, FileStorage};

use crate::torrent::PieceIndex;

/// Storage operations for torrent piece data.
///
/// Defines interface for persisting and retrieving piece data at the byte
/// offsets a torrent's file layout dictates. Implementations handle storage
/// backend details.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Writes a verified piece into every file it overlaps.
    ///
    /// # Errors
    ///
    /// - `StorageError::InvalidRange` - Piece does not fit the layout
    /// - `StorageError::FileOperation` - If file system operation failed
    async fn write_piece(&mut self, index: PieceIndex, piece_bytes: &[u8])
    -> Result<(), StorageError>;

    /// Reads `length` bytes starting `offset` bytes into a piece.
    ///
    /// # Errors
    ///
    /// - `StorageError::PieceNotFound` - Backing files missing or too short
    /// - `StorageError::InvalidRange` - Range falls outside the torrent
    /// - `StorageError::FileOperation` - If file system operation failed
    async fn read(
        &self,
        index: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<Vec<u8>, StorageError>;

    /// Deletes every file belonging to the torrent.
    ///
    /// # Errors
    ///
    /// - `StorageError::FileOperation` - If a file could not be removed
    async fn remove_files(&mut self) -> Result<(), StorageError>;
}

/// Errors that occur during storage operations.
///
/// Covers file system errors and layout violations during piece storage and
/// retrieval operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Requested piece is not present on disk
    #[error("Piece {index} not found")]
    PieceNotFound {
        /// Index of the piece that was not found
        index: PieceIndex,
    },

    /// Byte range lies outside the torrent
    #[error("Invalid range: {length} bytes at offset {offset}")]
    InvalidRange { offset: u64, length: u64 },

    /// File system operation on a specific path failed
    #[error("File operation on {path} failed: {source}")]
    FileOperation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
