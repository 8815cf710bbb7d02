//! BitTorrent wire protocol abstractions and message types.
//!
//! BitTorrent peer-to-peer protocol implementation following BEP 3.
//! Defines message types, handshake procedures, and connection state management
//! for communicating with remote peers.

pub mod connection;
pub mod handshake;
pub mod messages;
pub mod types;

// Re-export public API
pub use connection::{
    MessageReader, MessageWriter, PeerConnection, read_handshake, validate_remote_handshake,
};
pub use handshake::{HANDSHAKE_LEN, HandshakeCodec};
pub use messages::{MessageCodec, WireError};
pub use types::{ConnectionState, PeerHandshake, PeerId, PeerMessage};

/// Largest block a peer may request from us.
pub const MAX_REQUEST_LENGTH: u32 = 1 << 17;

/// Default ceiling on a single wire frame.
pub const DEFAULT_MAX_FRAME_LENGTH: u32 = 1 << 18;
