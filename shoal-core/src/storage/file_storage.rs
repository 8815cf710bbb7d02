//! File-based storage implementation
//!
//! Treats the torrent's files as one logical byte stream. A piece that
//! straddles a file boundary is split and written into each file at its own
//! offset.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{Storage, StorageError};
use crate::torrent::{PieceIndex, TorrentMetadata};

/// One file's slice of the logical byte stream.
#[derive(Debug, Clone, PartialEq)]
struct FileSpan {
    path: PathBuf,
    offset: u64,
    length: u64,
}

/// Part of a byte range that lands in a single file.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub file_index: usize,
    pub file_offset: u64,
    pub buffer_start: usize,
    pub length: usize,
}

/// Maps stream offsets to files under a download directory.
#[derive(Debug, Clone)]
pub struct FileLayout {
    files: Vec<FileSpan>,
    piece_length: u64,
    total_length: u64,
}

impl FileLayout {
    pub fn new(metadata: &TorrentMetadata, download_dir: &Path) -> Self {
        let mut offset = 0;
        let files = metadata
            .relative_file_paths()
            .into_iter()
            .zip(&metadata.files)
            .map(|(relative, file)| {
                let span = FileSpan {
                    path: download_dir.join(relative),
                    offset,
                    length: file.length,
                };
                offset += file.length;
                span
            })
            .collect();

        Self {
            files,
            piece_length: u64::from(metadata.piece_length),
            total_length: metadata.total_length,
        }
    }

    pub fn file_paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|span| span.path.as_path())
    }

    /// Splits `length` bytes at stream offset `start` into per-file segments.
    ///
    /// # Errors
    ///
    /// - `StorageError::InvalidRange` - Range extends past the end of the torrent
    pub fn segments(&self, start: u64, length: u64) -> Result<Vec<Segment>, StorageError> {
        let end = start
            .checked_add(length)
            .filter(|end| *end <= self.total_length)
            .ok_or(StorageError::InvalidRange {
                offset: start,
                length,
            })?;

        let segments = self
            .files
            .iter()
            .enumerate()
            .filter(|(_, span)| span.length > 0)
            .filter_map(|(file_index, span)| {
                let overlap_start = start.max(span.offset);
                let overlap_end = end.min(span.offset + span.length);
                (overlap_start < overlap_end).then(|| Segment {
                    file_index,
                    file_offset: overlap_start - span.offset,
                    buffer_start: (overlap_start - start) as usize,
                    length: (overlap_end - overlap_start) as usize,
                })
            })
            .collect();
        Ok(segments)
    }

    fn piece_start(&self, index: PieceIndex) -> u64 {
        u64::from(index.as_u32()) * self.piece_length
    }
}

/// File system-based storage for a single torrent.
pub struct FileStorage {
    layout: FileLayout,
    empty_files_created: bool,
}

impl FileStorage {
    /// Creates storage placing the torrent's files under `download_dir`.
    pub fn new(metadata: &TorrentMetadata, download_dir: &Path) -> Self {
        Self {
            layout: FileLayout::new(metadata, download_dir),
            empty_files_created: false,
        }
    }

    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }

    async fn create_empty_files(&mut self) -> Result<(), StorageError> {
        for span in self.layout.files.iter().filter(|span| span.length == 0) {
            ensure_parent(&span.path).await?;
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&span.path)
                .await
                .map_err(|source| file_error(&span.path, source))?;
        }
        self.empty_files_created = true;
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn write_piece(
        &mut self,
        index: PieceIndex,
        piece_bytes: &[u8],
    ) -> Result<(), StorageError> {
        if !self.empty_files_created {
            self.create_empty_files().await?;
        }

        let start = self.layout.piece_start(index);
        for segment in self.layout.segments(start, piece_bytes.len() as u64)? {
            let path = &self.layout.files[segment.file_index].path;
            ensure_parent(path).await?;

            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .await
                .map_err(|source| file_error(path, source))?;
            let chunk = &piece_bytes[segment.buffer_start..segment.buffer_start + segment.length];
            file.seek(SeekFrom::Start(segment.file_offset))
                .await
                .map_err(|source| file_error(path, source))?;
            file.write_all(chunk)
                .await
                .map_err(|source| file_error(path, source))?;
            file.flush().await.map_err(|source| file_error(path, source))?;
        }

        tracing::trace!("Wrote piece {} ({} bytes)", index, piece_bytes.len());
        Ok(())
    }

    async fn read(
        &self,
        index: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<Vec<u8>, StorageError> {
        let start = self.layout.piece_start(index) + u64::from(offset);
        let mut buffer = vec![0u8; length as usize];

        for segment in self.layout.segments(start, u64::from(length))? {
            let path = &self.layout.files[segment.file_index].path;
            let mut file = match fs::File::open(path).await {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(StorageError::PieceNotFound { index });
                }
                Err(source) => return Err(file_error(path, source)),
            };
            file.seek(SeekFrom::Start(segment.file_offset))
                .await
                .map_err(|source| file_error(path, source))?;

            let target = &mut buffer[segment.buffer_start..segment.buffer_start + segment.length];
            match file.read_exact(target).await {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Err(StorageError::PieceNotFound { index });
                }
                Err(source) => return Err(file_error(path, source)),
            }
        }

        Ok(buffer)
    }

    async fn remove_files(&mut self) -> Result<(), StorageError> {
        for path in self.layout.file_paths() {
            match fs::remove_file(path).await {
                Ok(()) => tracing::debug!("Removed {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) => return Err(file_error(path, source)),
            }
        }
        self.empty_files_created = false;
        Ok(())
    }
}

async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| file_error(parent, source))?;
    }
    Ok(())
}

fn file_error(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::FileOperation {
        path: path.to_path_buf(),
        source,
    }
}
