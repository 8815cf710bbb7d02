//! Test fixtures for storage testing.
//!
//! Provides standardized storage setup and teardown for consistent
//! testing across storage-related modules.

use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use super::{Storage, StorageError};
use crate::torrent::PieceIndex;

/// Creates a temporary download directory.
///
/// # Panics
///
/// Panics if temporary directory creation fails. This is acceptable in test
/// fixtures where failures indicate environment issues.
pub fn create_temp_download_dir() -> (tempfile::TempDir, PathBuf) {
    let temp_dir = tempfile::tempdir().unwrap();
    let downloads_dir = temp_dir.path().join("downloads");
    std::fs::create_dir_all(&downloads_dir).unwrap();
    (temp_dir, downloads_dir)
}

/// In-memory storage recording every piece written.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    pub pieces: Arc<Mutex<Vec<(PieceIndex, Vec<u8>)>>>,
    pub fail_writes: bool,
}

impl MemoryStorage {
    pub fn failing() -> Self {
        Self {
            pieces: Arc::default(),
            fail_writes: true,
        }
    }

    pub fn written(&self) -> Vec<(PieceIndex, Vec<u8>)> {
        self.pieces.lock().clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn write_piece(
        &mut self,
        index: PieceIndex,
        piece_bytes: &[u8],
    ) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::FileOperation {
                path: PathBuf::from("/read-only"),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            });
        }
        self.pieces.lock().push((index, piece_bytes.to_vec()));
        Ok(())
    }

    async fn read(
        &self,
        index: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<Vec<u8>, StorageError> {
        let pieces = self.pieces.lock();
        let (_, data) = pieces
            .iter()
            .rev()
            .find(|(stored, _)| *stored == index)
            .ok_or(StorageError::PieceNotFound { index })?;
        let start = offset as usize;
        let end = start + length as usize;
        data.get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or(StorageError::InvalidRange {
                offset: u64::from(offset),
                length: u64::from(length),
            })
    }

    async fn remove_files(&mut self) -> Result<(), StorageError> {
        self.pieces.lock().clear();
        Ok(())
    }
}
