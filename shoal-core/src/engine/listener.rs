//! Engine-wide TCP listener for incoming peers.
//!
//! Reads the remote handshake to learn which torrent the peer wants, then
//! hands the socket to that torrent's session. Unknown torrents are closed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::session::SessionCommand;
use crate::torrent::protocol::read_handshake;
use crate::torrent::{InfoHash, TorrentError};

/// Info hash to session command channel, shared with the listener.
pub(crate) type SessionRoutes = Arc<RwLock<HashMap<InfoHash, mpsc::Sender<SessionCommand>>>>;

/// Binds the peer listener on all interfaces.
///
/// # Errors
///
/// - `TorrentError::Io` - Port unavailable
pub(crate) async fn bind(port: u16) -> Result<TcpListener, TorrentError> {
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    tracing::info!("Listening for peers on {}", listener.local_addr()?);
    Ok(listener)
}

/// Accepts connections until the task is aborted.
pub(crate) fn spawn_listener(
    listener: TcpListener,
    routes: SessionRoutes,
    handshake_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, address)) => {
                    let _ = stream.set_nodelay(true);
                    let routes = Arc::clone(&routes);
                    tokio::spawn(route_connection(stream, address, routes, handshake_timeout));
                }
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    })
}

async fn route_connection(
    mut stream: TcpStream,
    address: SocketAddr,
    routes: SessionRoutes,
    handshake_timeout: Duration,
) {
    let handshake = match tokio::time::timeout(handshake_timeout, read_handshake(&mut stream)).await
    {
        Ok(Ok(Ok(handshake))) => handshake,
        Ok(Ok(Err(e))) => {
            tracing::debug!("Bad handshake from {}: {}", address, e);
            return;
        }
        Ok(Err(e)) => {
            tracing::debug!("Incoming peer {} closed during handshake: {}", address, e);
            return;
        }
        Err(_) => {
            tracing::debug!("Incoming peer {} sent no handshake", address);
            return;
        }
    };

    let session = routes.read().get(&handshake.info_hash).cloned();
    let Some(session) = session else {
        tracing::debug!(
            "Incoming peer {} asked for unknown torrent {}",
            address,
            handshake.info_hash
        );
        return;
    };

    let command = SessionCommand::IncomingPeer {
        stream,
        address,
        handshake,
    };
    if session.try_send(command).is_err() {
        tracing::debug!("Session busy; dropping incoming peer {}", address);
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::torrent::protocol::{HandshakeCodec, PeerHandshake, PeerId};

    async fn listening(routes: SessionRoutes) -> (SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let task = spawn_listener(listener, routes, Duration::from_secs(1));
        (address, task)
    }

    #[tokio::test]
    async fn test_routes_by_info_hash() {
        let routes = SessionRoutes::default();
        let (sender, mut receiver) = mpsc::channel(4);
        routes.write().insert(InfoHash::new([3; 20]), sender);
        let (address, task) = listening(Arc::clone(&routes)).await;

        let mut client = TcpStream::connect(address).await.unwrap();
        let handshake = PeerHandshake::new(InfoHash::new([3; 20]), PeerId::new([8; 20]));
        client
            .write_all(&HandshakeCodec::serialize_handshake(&handshake))
            .await
            .unwrap();

        let Some(SessionCommand::IncomingPeer {
            address: from,
            handshake: received,
            ..
        }) = receiver.recv().await
        else {
            panic!("expected routed peer");
        };
        assert_eq!(from, client.local_addr().unwrap());
        assert_eq!(received, handshake);
        task.abort();
    }

    #[tokio::test]
    async fn test_unknown_info_hash_is_closed() {
        let (address, task) = listening(SessionRoutes::default()).await;

        let mut client = TcpStream::connect(address).await.unwrap();
        let handshake = PeerHandshake::new(InfoHash::new([4; 20]), PeerId::new([8; 20]));
        client
            .write_all(&HandshakeCodec::serialize_handshake(&handshake))
            .await
            .unwrap();

        let mut buffer = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buffer))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        task.abort();
    }
}
