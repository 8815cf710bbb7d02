//! Torrent creation from local files with piece splitting and hashing
//!
//! Produces a bencoded `.torrent` document together with the descriptor parsed
//! back from it, so the info-hash always matches what peers will compute.

use std::path::Path;

use sha1::{Digest, Sha1};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::parsing::bencode::{self, Value};
use super::parsing::parse_torrent_bytes;
use super::parsing::types::{TorrentFile, TorrentMetadata};
use super::TorrentError;

/// Standard BitTorrent piece size (256KB)
pub const DEFAULT_PIECE_SIZE: u32 = 262_144; // 256 * 1024

const READ_CHUNK_SIZE: usize = 64 * 1024;
const CREATED_BY: &str = concat!("shoal/", env!("CARGO_PKG_VERSION"));

/// Encoded torrent plus its parsed descriptor.
#[derive(Debug, Clone)]
pub struct CreatedTorrent {
    pub metadata: TorrentMetadata,
    pub bytes: Vec<u8>,
}

/// Torrent creator for converting local files to torrent format
pub struct TorrentCreator {
    piece_size: u32,
}

impl Default for TorrentCreator {
    fn default() -> Self {
        Self::new()
    }
}

impl TorrentCreator {
    /// Creates torrent creator with default piece size (256KB)
    pub fn new() -> Self {
        Self {
            piece_size: DEFAULT_PIECE_SIZE,
        }
    }

    /// Creates torrent creator with custom piece size
    pub fn with_piece_size(piece_size: u32) -> Self {
        Self { piece_size }
    }

    /// Creates a single-file torrent from bytes held in memory.
    ///
    /// # Errors
    /// - `TorrentError::MalformedTorrent` - Empty data, bad name or piece size
    pub fn create_from_bytes(
        &self,
        name: &str,
        data: &[u8],
        announce_urls: Vec<String>,
    ) -> Result<CreatedTorrent, TorrentError> {
        self.validate_piece_size()?;
        let mut hasher = PieceHasher::new(self.piece_size);
        hasher.update(data);

        let files = vec![TorrentFile {
            path: vec![name.to_string()],
            length: data.len() as u64,
        }];
        self.assemble(name, &files, false, hasher.finish(), announce_urls)
    }

    /// Creates a single-file torrent by hashing a file on disk.
    ///
    /// # Errors
    /// - `TorrentError::Io` - File read error or access denied
    /// - `TorrentError::MalformedTorrent` - Empty file or unusable filename
    pub async fn create_from_file(
        &self,
        file_path: &Path,
        announce_urls: Vec<String>,
    ) -> Result<CreatedTorrent, TorrentError> {
        self.validate_piece_size()?;
        let file_name = file_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| TorrentError::MalformedTorrent {
                reason: format!("Invalid filename: {}", file_path.display()),
            })?
            .to_string();

        let mut hasher = PieceHasher::new(self.piece_size);
        let length = hash_file_into(file_path, &mut hasher).await?;

        let files = vec![TorrentFile {
            path: vec![file_name.clone()],
            length,
        }];
        self.assemble(&file_name, &files, false, hasher.finish(), announce_urls)
    }

    /// Creates a multi-file torrent from every visible file under a directory.
    ///
    /// Files are ordered by path so the piece stream is deterministic.
    ///
    /// # Errors
    /// - `TorrentError::Io` - Directory read error or file access issues
    /// - `TorrentError::MalformedTorrent` - Directory empty or invalid files
    pub async fn create_from_directory(
        &self,
        directory_path: &Path,
        announce_urls: Vec<String>,
    ) -> Result<CreatedTorrent, TorrentError> {
        self.validate_piece_size()?;
        let files = collect_files_recursively(directory_path).await?;
        if files.is_empty() {
            return Err(TorrentError::MalformedTorrent {
                reason: "Directory contains no files".to_string(),
            });
        }

        let directory_name = directory_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("torrent")
            .to_string();

        let mut hasher = PieceHasher::new(self.piece_size);
        for file in &files {
            let path = file
                .path
                .iter()
                .fold(directory_path.to_path_buf(), |path, component| {
                    path.join(component)
                });
            hash_file_into(&path, &mut hasher).await?;
        }

        self.assemble(&directory_name, &files, true, hasher.finish(), announce_urls)
    }

    fn validate_piece_size(&self) -> Result<(), TorrentError> {
        if self.piece_size == 0 {
            return Err(TorrentError::MalformedTorrent {
                reason: "Piece size must be positive".to_string(),
            });
        }
        Ok(())
    }

    fn assemble(
        &self,
        name: &str,
        files: &[TorrentFile],
        multi_file: bool,
        piece_hashes: Vec<[u8; 20]>,
        announce_urls: Vec<String>,
    ) -> Result<CreatedTorrent, TorrentError> {
        let pieces: Vec<u8> = piece_hashes.concat();

        let mut info = vec![
            ("name", bencode::bytes(name)),
            ("piece length", Value::Int(i64::from(self.piece_size))),
            ("pieces", Value::Bytes(pieces)),
        ];
        if multi_file {
            let entries = files
                .iter()
                .map(|file| {
                    bencode::dictionary([
                        ("length", Value::Int(file.length as i64)),
                        (
                            "path",
                            Value::List(
                                file.path
                                    .iter()
                                    .map(|component| bencode::bytes(component.as_str()))
                                    .collect(),
                            ),
                        ),
                    ])
                })
                .collect();
            info.push(("files", Value::List(entries)));
        } else {
            let length = files.iter().map(|file| file.length).sum::<u64>();
            info.push(("length", Value::Int(length as i64)));
        }

        let mut root = vec![
            ("created by", bencode::bytes(CREATED_BY)),
            ("creation date", Value::Int(chrono::Utc::now().timestamp())),
            ("info", bencode::dictionary(info)),
        ];
        if let Some(primary) = announce_urls.first() {
            root.push(("announce", bencode::bytes(primary.as_str())));
        }
        if announce_urls.len() > 1 {
            let tiers = announce_urls
                .iter()
                .map(|url| Value::List(vec![bencode::bytes(url.as_str())]))
                .collect();
            root.push(("announce-list", Value::List(tiers)));
        }

        let bytes = bencode::encode(&bencode::dictionary(root)).map_err(|e| {
            TorrentError::MalformedTorrent {
                reason: format!("Failed to encode torrent: {e}"),
            }
        })?;
        let metadata = parse_torrent_bytes(&bytes)?;
        tracing::debug!(
            "Created torrent {} ({} pieces, {} bytes)",
            metadata.info_hash,
            metadata.piece_count(),
            metadata.total_length
        );
        Ok(CreatedTorrent { metadata, bytes })
    }
}

/// Splits a byte stream into pieces and hashes each one.
struct PieceHasher {
    piece_size: usize,
    current: Vec<u8>,
    hashes: Vec<[u8; 20]>,
}

impl PieceHasher {
    fn new(piece_size: u32) -> Self {
        Self {
            piece_size: piece_size as usize,
            current: Vec::with_capacity(piece_size as usize),
            hashes: Vec::new(),
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (self.piece_size - self.current.len()).min(data.len());
            self.current.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.current.len() == self.piece_size {
                self.flush();
            }
        }
    }

    fn flush(&mut self) {
        let digest = Sha1::digest(&self.current);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        self.hashes.push(hash);
        self.current.clear();
    }

    fn finish(mut self) -> Vec<[u8; 20]> {
        if !self.current.is_empty() {
            self.flush();
        }
        self.hashes
    }
}

async fn hash_file_into(path: &Path, hasher: &mut PieceHasher) -> Result<u64, TorrentError> {
    let mut file = File::open(path).await?;
    let mut buffer = vec![0u8; READ_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }
    Ok(total)
}

/// Collects all files in directory using iterative depth-first traversal
async fn collect_files_recursively(
    directory_path: &Path,
) -> Result<Vec<TorrentFile>, TorrentError> {
    if !directory_path.is_dir() {
        return Err(TorrentError::MalformedTorrent {
            reason: format!("Path is not a directory: {}", directory_path.display()),
        });
    }

    let mut files = Vec::new();
    let mut dirs_to_process = vec![directory_path.to_path_buf()];

    while let Some(current_dir) = dirs_to_process.pop() {
        let mut entries = tokio::fs::read_dir(&current_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = entry.metadata().await?;

            if metadata.is_dir() {
                dirs_to_process.push(path);
                continue;
            }
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_none_or(|name| name.starts_with('.'));
            if !metadata.is_file() || hidden {
                continue;
            }

            let relative_path =
                path.strip_prefix(directory_path)
                    .map_err(|_| TorrentError::MalformedTorrent {
                        reason: "Failed to create relative path".to_string(),
                    })?;
            let path_components: Vec<String> = relative_path
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect();

            files.push(TorrentFile {
                path: path_components,
                length: metadata.len(),
            });
        }
    }

    // Sort files for deterministic ordering
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::PieceIndex;

    #[test]
    fn test_create_from_bytes_round_trips_through_parser() {
        let data: Vec<u8> = (0..36864u32).map(|i| (i % 251) as u8).collect();
        let created = TorrentCreator::with_piece_size(16384)
            .create_from_bytes(
                "reference.bin",
                &data,
                vec!["udp://127.0.0.1:6969/announce".to_string()],
            )
            .unwrap();

        let reparsed = parse_torrent_bytes(&created.bytes).unwrap();
        assert_eq!(reparsed.info_hash, created.metadata.info_hash);
        assert_eq!(created.metadata.piece_count(), 3);
        assert_eq!(created.metadata.piece_size(PieceIndex::new(2)), 4096);

        let expected = Sha1::digest(&data[16384..32768]);
        assert_eq!(
            created.metadata.piece_hashes[1].as_slice(),
            expected.as_slice()
        );
    }

    #[test]
    fn test_announce_list_written_for_multiple_trackers() {
        let created = TorrentCreator::with_piece_size(16)
            .create_from_bytes(
                "a",
                b"hello world",
                vec!["http://one/announce".to_string(), "udp://two:1/announce".to_string()],
            )
            .unwrap();
        assert_eq!(created.metadata.announce_tiers.len(), 2);
        assert_eq!(created.metadata.announce_urls[0], "http://one/announce");
    }

    #[test]
    fn test_rejects_empty_data_and_zero_piece_size() {
        assert!(TorrentCreator::with_piece_size(16).create_from_bytes("a", b"", vec![]).is_err());
        assert!(TorrentCreator::with_piece_size(0).create_from_bytes("a", b"x", vec![]).is_err());
    }

    #[test]
    fn test_piece_hasher_spans_inputs() {
        let mut split = PieceHasher::new(4);
        split.update(b"abc");
        split.update(b"defgh");
        split.update(b"ij");

        let mut whole = PieceHasher::new(4);
        whole.update(b"abcdefghij");

        let split = split.finish();
        assert_eq!(split.len(), 3);
        assert_eq!(split, whole.finish());
    }

    #[tokio::test]
    async fn test_create_from_file_matches_in_memory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("movie.bin");
        let data = vec![7u8; 50_000];
        tokio::fs::write(&path, &data).await.unwrap();

        let creator = TorrentCreator::with_piece_size(16384);
        let from_file = creator.create_from_file(&path, vec![]).await.unwrap();
        let from_bytes = creator.create_from_bytes("movie.bin", &data, vec![]).unwrap();
        assert_eq!(
            from_file.metadata.piece_hashes,
            from_bytes.metadata.piece_hashes
        );
        assert_eq!(from_file.metadata.name, "movie.bin");
    }

    #[tokio::test]
    async fn test_create_from_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("album");
        tokio::fs::create_dir_all(root.join("disc1")).await.unwrap();
        tokio::fs::write(root.join("disc1/track.flac"), vec![1u8; 3000])
            .await
            .unwrap();
        tokio::fs::write(root.join("cover.jpg"), vec![2u8; 1500])
            .await
            .unwrap();
        tokio::fs::write(root.join(".hidden"), b"skip").await.unwrap();

        let created = TorrentCreator::with_piece_size(1024)
            .create_from_directory(&root, vec![])
            .await
            .unwrap();

        let metadata = created.metadata;
        assert!(metadata.multi_file);
        assert_eq!(metadata.name, "album");
        assert_eq!(metadata.total_length, 4500);
        assert_eq!(metadata.piece_count(), 5);
        assert_eq!(metadata.files[0].path, vec!["cover.jpg"]);
        assert_eq!(metadata.files[1].path, vec!["disc1", "track.flac"]);
    }
}
