//! Torrent file parsing.
//!
//! Bencode decoding plus metadata extraction with validation of the piece
//! table against the declared file layout.

pub mod bencode;
pub mod parser;
pub mod types;

// Re-export public API
pub use bencode::{BencodeDict, BencodeError, BencodeValueExt, Value};
pub use parser::{BencodeTorrentParser, parse_torrent_bytes};
pub use types::{TorrentFile, TorrentMetadata, TorrentParser};
