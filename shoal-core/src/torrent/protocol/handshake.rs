//! BitTorrent handshake serialization and deserialization

use super::messages::WireError;
use super::types::{PeerHandshake, PeerId};
use crate::torrent::InfoHash;

/// Protocol identifier sent after the length byte.
pub const PROTOCOL_ID: &[u8; 19] = b"BitTorrent protocol";

/// 1 + 19 + 8 + 20 + 20
pub const HANDSHAKE_LEN: usize = 68;

/// Handshake serialization utilities for BitTorrent wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes handshake message following BEP 3
    pub fn serialize_handshake(handshake: &PeerHandshake) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_ID.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_ID);
        buf[20..28].copy_from_slice(&handshake.reserved);
        buf[28..48].copy_from_slice(handshake.info_hash.as_bytes());
        buf[48..68].copy_from_slice(handshake.peer_id.as_bytes());
        buf
    }

    /// Deserializes handshake message following BEP 3
    ///
    /// # Errors
    /// - `WireError::BadHandshake` - Wrong protocol identifier
    pub fn deserialize_handshake(data: &[u8; HANDSHAKE_LEN]) -> Result<PeerHandshake, WireError> {
        if data[0] as usize != PROTOCOL_ID.len() || &data[1..20] != PROTOCOL_ID {
            return Err(WireError::BadHandshake {
                reason: format!(
                    "unexpected protocol identifier {:?}",
                    String::from_utf8_lossy(&data[1..20])
                ),
            });
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(PeerHandshake {
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::new(peer_id),
        })
    }
}
