//! BitTorrent tracker protocol utilities and constants

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

/// BitTorrent tracker protocol constants
pub mod constants {
    /// Compact IPv4 peer entry: 4-byte address plus 2-byte port
    pub const COMPACT_PEER_V4_SIZE: usize = 6;

    /// Compact IPv6 peer entry: 16-byte address plus 2-byte port
    pub const COMPACT_PEER_V6_SIZE: usize = 18;

    /// Protocol ID opening every UDP connect request (BEP 15)
    pub const UDP_PROTOCOL_MAGIC: u64 = 0x0417_2710_1980;

    pub const ACTION_CONNECT: u32 = 0;
    pub const ACTION_ANNOUNCE: u32 = 1;
    pub const ACTION_SCRAPE: u32 = 2;
    pub const ACTION_ERROR: u32 = 3;
}

/// Address family of a compact peer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerFamily {
    V4,
    V6,
}

impl PeerFamily {
    /// Compact format a UDP tracker uses when answered over `tracker`.
    pub fn of(tracker: SocketAddr) -> Self {
        if tracker.is_ipv6() {
            PeerFamily::V6
        } else {
            PeerFamily::V4
        }
    }

    pub fn entry_size(self) -> usize {
        match self {
            PeerFamily::V4 => constants::COMPACT_PEER_V4_SIZE,
            PeerFamily::V6 => constants::COMPACT_PEER_V6_SIZE,
        }
    }
}

/// Compact peer string whose length is not a whole number of entries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("compact peer list of {length} bytes is not a multiple of {entry_size}")]
pub struct CompactPeersError {
    pub length: usize,
    pub entry_size: usize,
}

/// Decodes a compact peer string.
///
/// # Errors
/// - `CompactPeersError` - Length is not a multiple of the entry size
pub fn parse_compact_peers(
    bytes: &[u8],
    family: PeerFamily,
) -> Result<Vec<SocketAddr>, CompactPeersError> {
    let entry_size = family.entry_size();
    if bytes.len() % entry_size != 0 {
        return Err(CompactPeersError {
            length: bytes.len(),
            entry_size,
        });
    }

    Ok(bytes
        .chunks_exact(entry_size)
        .map(|entry| {
            let (address, port) = entry.split_at(entry_size - 2);
            let port = u16::from_be_bytes([port[0], port[1]]);
            match family {
                PeerFamily::V4 => {
                    let octets: [u8; 4] = [address[0], address[1], address[2], address[3]];
                    SocketAddr::from((Ipv4Addr::from(octets), port))
                }
                PeerFamily::V6 => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(address);
                    SocketAddr::from((Ipv6Addr::from(octets), port))
                }
            }
        })
        .collect())
}
