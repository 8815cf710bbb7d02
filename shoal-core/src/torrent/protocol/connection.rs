//! Peer connection state machine over any byte stream.
//!
//! `PeerConnection` owns the socket through the handshake. Once connected it
//! is split into a `MessageReader` and `MessageWriter` so the read and write
//! halves can be driven independently by the peer task.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use super::super::TorrentError;
use super::handshake::{HANDSHAKE_LEN, HandshakeCodec};
use super::messages::{MessageCodec, WireError};
use super::types::{ConnectionState, PeerHandshake, PeerId, PeerMessage};

/// One peer's wire connection.
pub struct PeerConnection<S> {
    address: SocketAddr,
    stream: S,
    state: ConnectionState,
    max_frame_length: u32,
    remote_peer_id: Option<PeerId>,
}

impl PeerConnection<TcpStream> {
    /// Opens a TCP connection, leaving the connection in `Handshaking`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - Connect failed or timed out
    pub async fn connect(
        address: SocketAddr,
        connect_timeout: Duration,
        max_frame_length: u32,
    ) -> Result<Self, TorrentError> {
        tracing::trace!("Connecting to peer {}", address);
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(address)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TorrentError::PeerConnectionError {
                    reason: format!("Failed to connect to {address}: {e}"),
                });
            }
            Err(_) => {
                return Err(TorrentError::PeerConnectionError {
                    reason: format!("Connecting to {address} timed out"),
                });
            }
        };
        // Latency matters more than packet count for request pipelining.
        let _ = stream.set_nodelay(true);

        Ok(Self::from_stream(address, stream, max_frame_length))
    }
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps an established stream that has not yet exchanged handshakes.
    pub fn from_stream(address: SocketAddr, stream: S, max_frame_length: u32) -> Self {
        Self {
            address,
            stream,
            state: ConnectionState::Handshaking,
            max_frame_length,
            remote_peer_id: None,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn remote_peer_id(&self) -> Option<PeerId> {
        self.remote_peer_id
    }

    /// Outbound handshake: sends ours, then reads and validates the remote's.
    ///
    /// # Errors
    ///
    /// - `TorrentError::HandshakeMismatch` - Wrong info-hash, wrong protocol
    ///   or a connection to ourselves
    /// - `TorrentError::PeerConnectionError` - Socket failure or timeout
    pub async fn handshake(
        &mut self,
        ours: &PeerHandshake,
        handshake_timeout: Duration,
    ) -> Result<PeerHandshake, TorrentError> {
        let address = self.address;
        let exchange = async {
            self.stream
                .write_all(&HandshakeCodec::serialize_handshake(ours))
                .await?;
            read_handshake(&mut self.stream).await
        };

        let result = match tokio::time::timeout(handshake_timeout, exchange).await {
            Ok(Ok(Ok(theirs))) => validate_remote_handshake(address, ours, &theirs).map(|_| theirs),
            Ok(Ok(Err(wire))) => Err(TorrentError::HandshakeMismatch {
                address,
                reason: wire.to_string(),
            }),
            Ok(Err(io)) => Err(socket_error(address, &io)),
            Err(_) => Err(TorrentError::PeerConnectionError {
                reason: format!("Handshake with {address} timed out"),
            }),
        };
        self.finish_handshake(result)
    }

    /// Inbound handshake: the remote's handshake was already read by the
    /// listener; validates it and replies with ours.
    ///
    /// # Errors
    ///
    /// - `TorrentError::HandshakeMismatch` - Remote handshake is unacceptable
    /// - `TorrentError::PeerConnectionError` - Reply could not be written
    pub async fn accept_handshake(
        &mut self,
        ours: &PeerHandshake,
        theirs: PeerHandshake,
    ) -> Result<PeerHandshake, TorrentError> {
        let address = self.address;
        let result = match validate_remote_handshake(address, ours, &theirs) {
            Ok(()) => self
                .stream
                .write_all(&HandshakeCodec::serialize_handshake(ours))
                .await
                .map(|_| theirs)
                .map_err(|e| socket_error(address, &e)),
            Err(e) => Err(e),
        };
        self.finish_handshake(result)
    }

    fn finish_handshake(
        &mut self,
        result: Result<PeerHandshake, TorrentError>,
    ) -> Result<PeerHandshake, TorrentError> {
        match result {
            Ok(theirs) => {
                self.state = ConnectionState::Connected;
                self.remote_peer_id = Some(theirs.peer_id);
                Ok(theirs)
            }
            Err(e) => {
                self.state = ConnectionState::Closed;
                Err(e)
            }
        }
    }

    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - Not connected or write failed
    pub async fn send_message(&mut self, message: &PeerMessage) -> Result<(), TorrentError> {
        self.ensure_connected()?;
        let result = write_message(&mut self.stream, self.address, message).await;
        if result.is_err() {
            self.state = ConnectionState::Closed;
        }
        result
    }

    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - Not connected or read failed
    /// - `TorrentError::ProtocolViolation` - Malformed or oversized frame
    pub async fn receive_message(&mut self) -> Result<PeerMessage, TorrentError> {
        self.ensure_connected()?;
        let result = read_message(&mut self.stream, self.address, self.max_frame_length).await;
        if result.is_err() {
            self.state = ConnectionState::Closed;
        }
        result
    }

    /// Marks the connection closed and releases the socket.
    pub fn close(mut self) -> ConnectionState {
        self.state = ConnectionState::Closed;
        self.state
    }

    /// Splits a connected stream into independent read and write halves.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - Handshake has not completed
    pub fn into_split(
        self,
    ) -> Result<(MessageReader<ReadHalf<S>>, MessageWriter<WriteHalf<S>>), TorrentError> {
        self.ensure_connected()?;
        let (reader, writer) = tokio::io::split(self.stream);
        Ok((
            MessageReader {
                address: self.address,
                reader,
                max_frame_length: self.max_frame_length,
            },
            MessageWriter {
                address: self.address,
                writer,
            },
        ))
    }

    fn ensure_connected(&self) -> Result<(), TorrentError> {
        if self.state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(TorrentError::PeerConnectionError {
                reason: format!("Peer {} is {:?}, not connected", self.address, self.state),
            })
        }
    }
}

/// Read half of a connected peer.
pub struct MessageReader<R> {
    address: SocketAddr,
    reader: R,
    max_frame_length: u32,
}

impl<R: AsyncRead + Unpin + Send> MessageReader<R> {
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - Socket closed or failed
    /// - `TorrentError::ProtocolViolation` - Malformed or oversized frame
    pub async fn next_message(&mut self) -> Result<PeerMessage, TorrentError> {
        read_message(&mut self.reader, self.address, self.max_frame_length).await
    }
}

/// Write half of a connected peer.
pub struct MessageWriter<W> {
    address: SocketAddr,
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> MessageWriter<W> {
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - Socket closed or failed
    pub async fn send(&mut self, message: &PeerMessage) -> Result<(), TorrentError> {
        write_message(&mut self.writer, self.address, message).await
    }

    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Reads the fixed 68-byte handshake from a fresh stream.
///
/// The outer `Result` carries socket failures, the inner one a malformed
/// handshake.
pub async fn read_handshake<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Result<PeerHandshake, WireError>> {
    let mut buffer = [0u8; HANDSHAKE_LEN];
    reader.read_exact(&mut buffer).await?;
    Ok(HandshakeCodec::deserialize_handshake(&buffer))
}

/// Checks a remote handshake against the torrent we expect and our own identity.
///
/// # Errors
///
/// - `TorrentError::HandshakeMismatch` - Info-hash differs or the remote is us
pub fn validate_remote_handshake(
    address: SocketAddr,
    ours: &PeerHandshake,
    theirs: &PeerHandshake,
) -> Result<(), TorrentError> {
    if theirs.info_hash != ours.info_hash {
        return Err(TorrentError::HandshakeMismatch {
            address,
            reason: format!(
                "expected info hash {}, got {}",
                ours.info_hash, theirs.info_hash
            ),
        });
    }
    if theirs.peer_id == ours.peer_id {
        return Err(TorrentError::HandshakeMismatch {
            address,
            reason: "connected to ourselves".to_string(),
        });
    }
    Ok(())
}

async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    address: SocketAddr,
    max_frame_length: u32,
) -> Result<PeerMessage, TorrentError> {
    let length = reader
        .read_u32()
        .await
        .map_err(|e| socket_error(address, &e))?;
    if length > max_frame_length {
        return Err(TorrentError::ProtocolViolation {
            address,
            reason: WireError::FrameTooLarge {
                length,
                max: max_frame_length,
            }
            .to_string(),
        });
    }

    let mut body = BytesMut::zeroed(length as usize);
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| socket_error(address, &e))?;

    MessageCodec::deserialize_payload(Bytes::from(body)).map_err(|e| {
        TorrentError::ProtocolViolation {
            address,
            reason: e.to_string(),
        }
    })
}

async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    address: SocketAddr,
    message: &PeerMessage,
) -> Result<(), TorrentError> {
    let frame = MessageCodec::serialize_message(message);
    writer
        .write_all(&frame)
        .await
        .map_err(|e| socket_error(address, &e))
}

fn socket_error(address: SocketAddr, error: &std::io::Error) -> TorrentError {
    TorrentError::PeerConnectionError {
        reason: format!("{address}: {error}"),
    }
}
