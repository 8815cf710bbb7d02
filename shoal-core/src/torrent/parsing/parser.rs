//! Torrent metadata extraction from decoded bencode

use std::path::Path;

use async_trait::async_trait;
use sha1::{Digest, Sha1};

use super::super::{InfoHash, TorrentError};
use super::bencode::{self, BencodeValueExt, Value};
use super::types::{TorrentFile, TorrentMetadata, TorrentParser};

type ParseResult<T> = Result<T, TorrentError>;

/// Reference parser for `.torrent` files.
#[derive(Default)]
pub struct BencodeTorrentParser;

impl BencodeTorrentParser {
    /// Creates new bencode parser instance.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TorrentParser for BencodeTorrentParser {
    async fn parse_torrent_data(
        &self,
        torrent_bytes: &[u8],
    ) -> Result<TorrentMetadata, TorrentError> {
        parse_torrent_bytes(torrent_bytes)
    }

    async fn parse_torrent_file(&self, path: &Path) -> Result<TorrentMetadata, TorrentError> {
        let file_contents = tokio::fs::read(path).await?;

        self.parse_torrent_data(&file_contents).await
    }
}

/// Parses a torrent synchronously. Performs no I/O.
///
/// # Errors
///
/// - `TorrentError::MalformedTorrent` - Invalid bencode, missing required
///   keys, bad piece table or a file layout that disagrees with it
pub fn parse_torrent_bytes(torrent_bytes: &[u8]) -> Result<TorrentMetadata, TorrentError> {
    let root = bencode::decode(torrent_bytes)
        .map_err(|e| malformed(format!("Bencode parsing failed: {e}")))?;
    if root.as_dictionary().is_none() {
        return Err(malformed("Root element must be dictionary"));
    }

    let info = root
        .get(b"info")
        .ok_or_else(|| malformed("Missing 'info' field"))?;
    if info.as_dictionary().is_none() {
        return Err(malformed("Info field must be dictionary"));
    }

    let info_hash = calculate_info_hash(torrent_bytes)?;

    let piece_length = extract_integer(info, b"piece length")?;
    if piece_length <= 0 || piece_length > i64::from(u32::MAX) {
        return Err(malformed(format!("Invalid piece length {piece_length}")));
    }
    let piece_length = piece_length as u32;

    let pieces_bytes = extract_bytes(info, b"pieces")?;
    if pieces_bytes.is_empty() || pieces_bytes.len() % 20 != 0 {
        return Err(malformed(format!(
            "Invalid pieces length {}",
            pieces_bytes.len()
        )));
    }
    let piece_hashes: Vec<[u8; 20]> = pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect();

    let name = match info.get(b"name") {
        Some(_) => extract_string(info, b"name")?,
        None => info_hash.to_string(),
    };
    validate_path_component(&name)?;

    let (files, multi_file) = match (info.get(b"length"), info.get(b"files")) {
        (Some(_), _) => {
            let length = extract_length(info)?;
            let files = vec![TorrentFile {
                path: vec![name.clone()],
                length,
            }];
            (files, false)
        }
        (None, Some(Value::List(entries))) => (extract_files_info(entries)?, true),
        (None, Some(_)) => return Err(malformed("Invalid files structure")),
        (None, None) => return Err(malformed("Missing 'files' or 'length' field")),
    };

    let total_length = files
        .iter()
        .try_fold(0u64, |total, file| total.checked_add(file.length))
        .ok_or_else(|| malformed("Total length overflows"))?;
    validate_piece_layout(total_length, piece_length, piece_hashes.len())?;

    let announce_tiers = extract_announce_tiers(&root);
    let mut announce_urls: Vec<String> = Vec::new();
    for url in announce_tiers.iter().flatten() {
        if !announce_urls.contains(url) {
            announce_urls.push(url.clone());
        }
    }

    Ok(TorrentMetadata {
        info_hash,
        name,
        piece_length,
        piece_hashes,
        total_length,
        files,
        announce_urls,
        announce_tiers,
        multi_file,
    })
}

/// SHA-1 over the exact `info` bytes as they appear in the input.
fn calculate_info_hash(torrent_bytes: &[u8]) -> ParseResult<InfoHash> {
    let span = bencode::dictionary_value_span(torrent_bytes, b"info")
        .map_err(|e| malformed(format!("Bencode parsing failed: {e}")))?
        .ok_or_else(|| malformed("Missing 'info' field"))?;

    let digest = Sha1::digest(&torrent_bytes[span]);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&digest);
    Ok(InfoHash::new(hash))
}

fn validate_piece_layout(
    total_length: u64,
    piece_length: u32,
    piece_count: usize,
) -> ParseResult<()> {
    if total_length == 0 {
        return Err(malformed("Torrent contains no data"));
    }
    let expected = total_length.div_ceil(u64::from(piece_length));
    if expected != piece_count as u64 {
        return Err(malformed(format!(
            "File lengths total {total_length} bytes which needs {expected} pieces, but {piece_count} piece hashes are present"
        )));
    }
    Ok(())
}

fn validate_path_component(component: &str) -> ParseResult<()> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('/')
        || component.contains('\\')
    {
        return Err(malformed(format!("Unsafe path component {component:?}")));
    }
    Ok(())
}

fn extract_files_info(entries: &[Value]) -> ParseResult<Vec<TorrentFile>> {
    if entries.is_empty() {
        return Err(malformed("Empty files list"));
    }

    let mut files = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.as_dictionary().is_none() {
            return Err(malformed("Invalid file entry type"));
        }
        let length = extract_length(entry)?;

        let components = entry
            .get(b"path")
            .and_then(Value::as_list)
            .ok_or_else(|| malformed("Missing or invalid path in file"))?;
        if components.is_empty() {
            return Err(malformed("Empty path in file entry"));
        }

        let mut path = Vec::with_capacity(components.len());
        for component in components {
            let component = component
                .as_bytes()
                .ok_or_else(|| malformed("Invalid path component type"))?;
            let component = String::from_utf8(component.to_vec())
                .map_err(|_| malformed("Invalid UTF-8 in file path"))?;
            validate_path_component(&component)?;
            path.push(component);
        }

        files.push(TorrentFile { path, length });
    }

    Ok(files)
}

/// BEP 12 tiers when present, otherwise the single `announce` URL.
fn extract_announce_tiers(root: &Value) -> Vec<Vec<String>> {
    let tiers: Vec<Vec<String>> = root
        .get(b"announce-list")
        .and_then(Value::as_list)
        .map(|tiers| {
            tiers
                .iter()
                .filter_map(Value::as_list)
                .map(|tier| {
                    tier.iter()
                        .filter_map(Value::as_str)
                        .filter(|url| !url.is_empty())
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .filter(|tier| !tier.is_empty())
                .collect()
        })
        .unwrap_or_default();

    if !tiers.is_empty() {
        return tiers;
    }

    root.get(b"announce")
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .map(|url| vec![vec![url.to_string()]])
        .unwrap_or_default()
}

fn extract_length(dict: &Value) -> ParseResult<u64> {
    let length = extract_integer(dict, b"length")?;
    u64::try_from(length).map_err(|_| malformed(format!("Negative file length {length}")))
}

fn extract_string(dict: &Value, key: &[u8]) -> ParseResult<String> {
    let bytes = extract_bytes(dict, key)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| {
        malformed(format!(
            "Invalid UTF-8 in field: {:?}",
            String::from_utf8_lossy(key)
        ))
    })
}

fn extract_bytes<'a>(dict: &'a Value, key: &[u8]) -> ParseResult<&'a [u8]> {
    dict.get(key).and_then(Value::as_bytes).ok_or_else(|| {
        malformed(format!(
            "Missing or invalid field: {:?}",
            String::from_utf8_lossy(key)
        ))
    })
}

fn extract_integer(dict: &Value, key: &[u8]) -> ParseResult<i64> {
    dict.get(key).and_then(Value::as_integer).ok_or_else(|| {
        malformed(format!(
            "Missing or invalid integer field: {:?}",
            String::from_utf8_lossy(key)
        ))
    })
}

fn malformed(reason: impl Into<String>) -> TorrentError {
    TorrentError::MalformedTorrent {
        reason: reason.into(),
    }
}
