//! BitTorrent wire protocol message serialization and deserialization

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::super::PieceIndex;
use super::types::PeerMessage;

/// Framing and decoding failures on the peer wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame of {length} bytes exceeds limit of {max}")]
    FrameTooLarge { length: u32, max: u32 },

    #[error("{message} message has invalid length {length}")]
    InvalidLength { message: &'static str, length: usize },

    #[error("bad handshake: {reason}")]
    BadHandshake { reason: String },
}

/// Message serialization utilities for BitTorrent wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes a message as a complete length-prefixed frame.
    pub fn serialize_message(message: &PeerMessage) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode_into(message, &mut buf);
        buf.freeze()
    }

    pub fn encode_into(message: &PeerMessage, buf: &mut BytesMut) {
        match message {
            PeerMessage::KeepAlive => {
                buf.put_u32(0); // Length = 0
            }
            PeerMessage::Choke => put_signal(buf, 0),
            PeerMessage::Unchoke => put_signal(buf, 1),
            PeerMessage::Interested => put_signal(buf, 2),
            PeerMessage::NotInterested => put_signal(buf, 3),
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5); // Length = 1 + 4
                buf.put_u8(4);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32(1 + bitfield.len() as u32);
                buf.put_u8(5);
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => put_block_reference(buf, 6, *piece_index, *offset, *length),
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.reserve(13 + data.len());
                buf.put_u32(9 + data.len() as u32); // Length = 1 + 4 + 4 + data.len()
                buf.put_u8(7);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => put_block_reference(buf, 8, *piece_index, *offset, *length),
            PeerMessage::Port { port } => {
                buf.put_u32(3); // Length = 1 + 2
                buf.put_u8(9);
                buf.put_u16(*port);
            }
            PeerMessage::Unknown { id } => put_signal(buf, *id),
        }
    }

    /// Decodes a frame body (message ID plus payload, no length prefix).
    ///
    /// An empty body is a keep-alive.
    ///
    /// # Errors
    /// - `WireError::InvalidLength` - Payload size wrong for the message ID
    pub fn deserialize_payload(mut body: Bytes) -> Result<PeerMessage, WireError> {
        if body.is_empty() {
            return Ok(PeerMessage::KeepAlive);
        }

        let length = body.len();
        let message_id = body.get_u8();

        let expect = |message: &'static str, expected: usize| {
            if length == expected {
                Ok(())
            } else {
                Err(WireError::InvalidLength { message, length })
            }
        };

        match message_id {
            0 => expect("choke", 1).map(|_| PeerMessage::Choke),
            1 => expect("unchoke", 1).map(|_| PeerMessage::Unchoke),
            2 => expect("interested", 1).map(|_| PeerMessage::Interested),
            3 => expect("not interested", 1).map(|_| PeerMessage::NotInterested),
            4 => {
                expect("have", 5)?;
                Ok(PeerMessage::Have {
                    piece_index: PieceIndex::new(body.get_u32()),
                })
            }
            5 => Ok(PeerMessage::Bitfield { bitfield: body }),
            6 | 8 => {
                expect(if message_id == 6 { "request" } else { "cancel" }, 13)?;
                let piece_index = PieceIndex::new(body.get_u32());
                let offset = body.get_u32();
                let length = body.get_u32();
                Ok(if message_id == 6 {
                    PeerMessage::Request {
                        piece_index,
                        offset,
                        length,
                    }
                } else {
                    PeerMessage::Cancel {
                        piece_index,
                        offset,
                        length,
                    }
                })
            }
            7 => {
                if length < 9 {
                    return Err(WireError::InvalidLength {
                        message: "piece",
                        length,
                    });
                }
                let piece_index = PieceIndex::new(body.get_u32());
                let offset = body.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: body,
                })
            }
            9 => {
                expect("port", 3)?;
                Ok(PeerMessage::Port {
                    port: body.get_u16(),
                })
            }
            id => Ok(PeerMessage::Unknown { id }),
        }
    }

    /// Decodes one complete frame including its length prefix.
    ///
    /// # Errors
    /// - `WireError::InvalidLength` - Frame truncated or payload malformed
    pub fn deserialize_message(frame: &[u8]) -> Result<PeerMessage, WireError> {
        if frame.len() < 4 {
            return Err(WireError::InvalidLength {
                message: "frame",
                length: frame.len(),
            });
        }
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if frame.len() - 4 != declared {
            return Err(WireError::InvalidLength {
                message: "frame",
                length: frame.len(),
            });
        }
        Self::deserialize_payload(Bytes::copy_from_slice(&frame[4..]))
    }
}

fn put_signal(buf: &mut BytesMut, id: u8) {
    buf.put_u32(1);
    buf.put_u8(id);
}

fn put_block_reference(
    buf: &mut BytesMut,
    id: u8,
    piece_index: PieceIndex,
    offset: u32,
    length: u32,
) {
    buf.put_u32(13); // Length = 1 + 4 + 4 + 4
    buf.put_u8(id);
    buf.put_u32(piece_index.as_u32());
    buf.put_u32(offset);
    buf.put_u32(length);
}
