//! Peer connection pool for one torrent.
//!
//! Each live connection runs as its own task split into a reader and a
//! writer. The reader forwards decoded messages to the owning session over
//! a bounded channel, so a slow session throttles socket reads. The writer
//! drains a small per-peer queue; a peer whose queue fills up is dropped
//! rather than buffered without bound.
//!
//! The manager itself is owned by the session task and never shared, so
//! all bookkeeping here is plain `&mut self`.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::protocol::{PeerConnection, PeerHandshake, PeerId, PeerMessage};
use super::{Bitfield, InfoHash, TorrentMetadata};
use crate::config::NetworkConfig;

/// Identifies one connection attempt. Never reused within a session, so
/// events from a connection that has since been dropped are recognisable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

#[cfg(test)]
impl ConnectionId {
    pub(crate) fn for_tests(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where we learned about a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    Incoming,
}

/// Reports from connection tasks to the session.
#[derive(Debug)]
pub enum PeerEvent {
    Handshaked { id: ConnectionId, peer_id: PeerId },
    Message { id: ConnectionId, message: PeerMessage },
    Closed { id: ConnectionId, reason: String },
}

/// Snapshot of one connection for status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub address: SocketAddr,
    pub source: PeerSource,
    pub peer_id: Option<PeerId>,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub pieces: usize,
    pub downloaded: u64,
    pub uploaded: u64,
}

/// Live connection state as seen by the session.
pub struct PeerLink {
    pub address: SocketAddr,
    pub source: PeerSource,
    pub peer_id: Option<PeerId>,
    pub bitfield: Bitfield,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub downloaded: u64,
    pub uploaded: u64,
    outbound: mpsc::Sender<PeerMessage>,
    task: JoinHandle<()>,
}

impl PeerLink {
    /// True once the handshake completed.
    pub fn is_connected(&self) -> bool {
        self.peer_id.is_some()
    }

    fn status(&self) -> PeerStatus {
        PeerStatus {
            address: self.address,
            source: self.source,
            peer_id: self.peer_id,
            am_choking: self.am_choking,
            am_interested: self.am_interested,
            peer_choking: self.peer_choking,
            peer_interested: self.peer_interested,
            pieces: self.bitfield.count(),
            downloaded: self.downloaded,
            uploaded: self.uploaded,
        }
    }
}

#[derive(Debug, Clone)]
struct KnownPeer {
    source: PeerSource,
    last_announced: Option<Instant>,
    retry_after: Option<Instant>,
    banned: bool,
}

#[derive(Debug, Clone)]
struct ConnectionSettings {
    connect_timeout: Duration,
    handshake_timeout: Duration,
    idle_timeout: Duration,
    keep_alive_interval: Duration,
    max_frame_length: u32,
}

/// Connection pool and peer bookkeeping for one session.
pub struct PeerManager {
    handshake: PeerHandshake,
    piece_count: usize,
    config: NetworkConfig,
    known: HashMap<SocketAddr, KnownPeer>,
    links: HashMap<ConnectionId, PeerLink>,
    next_id: u64,
    events: mpsc::Sender<PeerEvent>,
}

impl PeerManager {
    /// Creates an empty pool and the event channel its tasks report on.
    pub fn new(
        info_hash: InfoHash,
        local_peer_id: PeerId,
        piece_count: usize,
        config: NetworkConfig,
    ) -> (Self, mpsc::Receiver<PeerEvent>) {
        // Bounded: a session that falls behind stalls socket readers.
        let (events, receiver) = mpsc::channel(config.peer_queue_capacity.max(1) * 4);
        let manager = Self {
            handshake: PeerHandshake::new(info_hash, local_peer_id),
            piece_count,
            config,
            known: HashMap::new(),
            links: HashMap::new(),
            next_id: 0,
            events,
        };
        (manager, receiver)
    }

    /// Records addresses returned by a tracker.
    pub fn add_candidates(&mut self, addresses: impl IntoIterator<Item = SocketAddr>) {
        let now = Instant::now();
        for address in addresses {
            let known = self.known.entry(address).or_insert(KnownPeer {
                source: PeerSource::Tracker,
                last_announced: None,
                retry_after: None,
                banned: false,
            });
            known.source = PeerSource::Tracker;
            known.last_announced = Some(now);
        }
    }

    /// Dials eligible candidates until the connection cap is reached.
    /// Announced addresses past their retention are forgotten first.
    ///
    /// Returns the number of new connection attempts.
    pub fn fill_connections(&mut self) -> usize {
        let now = Instant::now();
        let retention = self.config.announced_peer_retention;
        self.known.retain(|_, known| {
            known.banned
                || known.source != PeerSource::Tracker
                || known
                    .last_announced
                    .is_some_and(|at| now.duration_since(at) <= retention)
        });

        let budget = self
            .config
            .max_peer_connections
            .saturating_sub(self.links.len());
        if budget == 0 {
            return 0;
        }

        let mut candidates: Vec<SocketAddr> = self
            .known
            .iter()
            .filter(|(address, known)| {
                !known.banned
                    && known.source == PeerSource::Tracker
                    && known.retry_after.is_none_or(|at| at <= now)
                    && known
                        .last_announced
                        .is_some_and(|at| now.duration_since(at) <= retention)
                    && self.id_for_address(**address).is_none()
            })
            .map(|(address, _)| *address)
            .collect();
        candidates.sort();
        candidates.truncate(budget);

        for address in &candidates {
            self.connect(*address);
        }
        candidates.len()
    }

    fn connect(&mut self, address: SocketAddr) {
        let id = self.allocate_id();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.peer_queue_capacity.max(1));
        let handshake = self.handshake.clone();
        let settings = self.settings();
        let events = self.events.clone();

        tracing::debug!("Dialling peer {} as {}", address, id);
        let task = tokio::spawn(async move {
            let result = async {
                let mut connection = PeerConnection::connect(
                    address,
                    settings.connect_timeout,
                    settings.max_frame_length,
                )
                .await?;
                let theirs = connection
                    .handshake(&handshake, settings.handshake_timeout)
                    .await?;
                Ok::<_, super::TorrentError>((connection, theirs))
            }
            .await;

            match result {
                Ok((connection, theirs)) => {
                    drive_connection(id, connection, theirs, settings, events, outbound_rx).await
                }
                Err(e) => {
                    let _ = events
                        .send(PeerEvent::Closed {
                            id,
                            reason: e.to_string(),
                        })
                        .await;
                }
            }
        });

        self.insert_link(id, address, PeerSource::Tracker, outbound_tx, task);
    }

    /// Takes over an incoming connection whose handshake the listener read.
    ///
    /// Returns false when the peer is banned, already connected or the
    /// pool is full; the stream is dropped in that case.
    pub fn accept_incoming(
        &mut self,
        stream: TcpStream,
        address: SocketAddr,
        theirs: PeerHandshake,
    ) -> bool {
        if self.links.len() >= self.config.max_peer_connections {
            tracing::debug!("Refusing {}: connection limit reached", address);
            return false;
        }
        if self.known.get(&address).is_some_and(|known| known.banned) {
            tracing::debug!("Refusing banned peer {}", address);
            return false;
        }
        if self.id_for_address(address).is_some() || self.has_peer_id(&theirs.peer_id) {
            tracing::debug!("Refusing duplicate connection from {}", address);
            return false;
        }

        self.known.entry(address).or_insert(KnownPeer {
            source: PeerSource::Incoming,
            last_announced: None,
            retry_after: None,
            banned: false,
        });

        let id = self.allocate_id();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.peer_queue_capacity.max(1));
        let handshake = self.handshake.clone();
        let settings = self.settings();
        let events = self.events.clone();

        tracing::debug!("Accepted incoming peer {} as {}", address, id);
        let task = tokio::spawn(async move {
            let mut connection =
                PeerConnection::from_stream(address, stream, settings.max_frame_length);
            match connection.accept_handshake(&handshake, theirs).await {
                Ok(theirs) => {
                    drive_connection(id, connection, theirs, settings, events, outbound_rx).await
                }
                Err(e) => {
                    let _ = events
                        .send(PeerEvent::Closed {
                            id,
                            reason: e.to_string(),
                        })
                        .await;
                }
            }
        });

        self.insert_link(id, address, PeerSource::Incoming, outbound_tx, task);
        true
    }

    /// Records a completed handshake.
    ///
    /// Returns false (and drops the connection) when another live link
    /// already belongs to the same remote peer ID.
    pub fn on_handshaked(&mut self, id: ConnectionId, peer_id: PeerId) -> bool {
        if self.has_peer_id(&peer_id) {
            self.disconnect(id, "duplicate peer id");
            return false;
        }
        match self.links.get_mut(&id) {
            Some(link) => {
                link.peer_id = Some(peer_id);
                if let Some(known) = self.known.get_mut(&link.address) {
                    known.retry_after = None;
                }
                tracing::debug!("Peer {} connected as {} ({})", link.address, id, peer_id);
                true
            }
            None => false,
        }
    }

    /// Queues a message for a peer without waiting.
    ///
    /// A peer whose queue is full is disconnected. Returns false if the
    /// message was not queued.
    pub fn send(&mut self, id: ConnectionId, message: PeerMessage) -> bool {
        let Some(link) = self.links.get(&id) else {
            return false;
        };
        match link.outbound.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.disconnect(id, "outbound queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queues a message for every connected peer.
    pub fn broadcast(&mut self, message: &PeerMessage) {
        let ids: Vec<_> = self
            .links
            .iter()
            .filter(|(_, link)| link.is_connected())
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.send(id, message.clone());
        }
    }

    /// Closes a connection and schedules a redial if the tracker still
    /// vouches for the address.
    pub fn disconnect(&mut self, id: ConnectionId, reason: &str) -> Option<PeerLink> {
        let link = self.links.remove(&id)?;
        link.task.abort();
        tracing::debug!("Dropping peer {} ({}): {}", link.address, id, reason);
        self.schedule_retry(link.address);
        Some(link)
    }

    /// Handles a `Closed` event; returns the link if it was still live.
    pub fn on_closed(&mut self, id: ConnectionId, reason: &str) -> Option<PeerLink> {
        let link = self.links.remove(&id)?;
        tracing::debug!("Peer {} ({}) closed: {}", link.address, id, reason);
        self.schedule_retry(link.address);
        Some(link)
    }

    /// Disconnects and never redials an address.
    pub fn ban(&mut self, address: SocketAddr) -> Option<(ConnectionId, PeerLink)> {
        let known = self.known.entry(address).or_insert(KnownPeer {
            source: PeerSource::Incoming,
            last_announced: None,
            retry_after: None,
            banned: false,
        });
        known.banned = true;
        tracing::info!("Banned peer {}", address);

        let id = self.id_for_address(address)?;
        self.disconnect(id, "banned").map(|link| (id, link))
    }

    pub fn is_banned(&self, address: &SocketAddr) -> bool {
        self.known.get(address).is_some_and(|known| known.banned)
    }

    /// Closes every connection, keeping the candidate list.
    pub fn disconnect_all(&mut self) -> Vec<(ConnectionId, PeerLink)> {
        let links: Vec<_> = self.links.drain().collect();
        for (_, link) in &links {
            link.task.abort();
        }
        for known in self.known.values_mut() {
            known.retry_after = None;
        }
        links
    }

    pub fn link(&self, id: ConnectionId) -> Option<&PeerLink> {
        self.links.get(&id)
    }

    pub fn link_mut(&mut self, id: ConnectionId) -> Option<&mut PeerLink> {
        self.links.get_mut(&id)
    }

    /// IDs of links whose handshake has completed.
    pub fn connected_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .links
            .iter()
            .filter(|(_, link)| link.is_connected())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn connected_count(&self) -> usize {
        self.links.values().filter(|link| link.is_connected()).count()
    }

    pub fn active_count(&self) -> usize {
        self.links.len()
    }

    pub fn statuses(&self) -> Vec<PeerStatus> {
        self.links.values().map(PeerLink::status).collect()
    }

    pub fn id_for_address(&self, address: SocketAddr) -> Option<ConnectionId> {
        self.links
            .iter()
            .find(|(_, link)| link.address == address)
            .map(|(id, _)| *id)
    }

    fn has_peer_id(&self, peer_id: &PeerId) -> bool {
        self.links
            .values()
            .any(|link| link.peer_id.as_ref() == Some(peer_id))
    }

    fn schedule_retry(&mut self, address: SocketAddr) {
        let now = Instant::now();
        let retention = self.config.announced_peer_retention;
        let Some(known) = self.known.get_mut(&address) else {
            return;
        };
        if known.banned {
            return;
        }
        let recently_announced = known
            .last_announced
            .is_some_and(|at| now.duration_since(at) <= retention);
        if known.source == PeerSource::Tracker && recently_announced {
            known.retry_after = Some(now + self.config.peer_retry_cooldown);
        } else {
            self.known.remove(&address);
        }
    }

    fn insert_link(
        &mut self,
        id: ConnectionId,
        address: SocketAddr,
        source: PeerSource,
        outbound: mpsc::Sender<PeerMessage>,
        task: JoinHandle<()>,
    ) {
        self.links.insert(
            id,
            PeerLink {
                address,
                source,
                peer_id: None,
                bitfield: Bitfield::new(self.piece_count),
                am_choking: true,
                am_interested: false,
                peer_choking: true,
                peer_interested: false,
                downloaded: 0,
                uploaded: 0,
                outbound,
                task,
            },
        );
    }

    fn allocate_id(&mut self) -> ConnectionId {
        self.next_id += 1;
        ConnectionId(self.next_id)
    }

    fn settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: self.config.connect_timeout,
            handshake_timeout: self.config.handshake_timeout,
            idle_timeout: self.config.idle_timeout,
            keep_alive_interval: self.config.keep_alive_interval,
            max_frame_length: self.config.max_frame_length,
        }
    }
}

impl Drop for PeerManager {
    fn drop(&mut self) {
        for link in self.links.values() {
            link.task.abort();
        }
    }
}

/// Runs a handshaked connection until either half fails.
async fn drive_connection<S>(
    id: ConnectionId,
    connection: PeerConnection<S>,
    theirs: PeerHandshake,
    settings: ConnectionSettings,
    events: mpsc::Sender<PeerEvent>,
    mut outbound: mpsc::Receiver<PeerMessage>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if events
        .send(PeerEvent::Handshaked {
            id,
            peer_id: theirs.peer_id,
        })
        .await
        .is_err()
    {
        return;
    }

    let (mut reader, mut writer) = match connection.into_split() {
        Ok(halves) => halves,
        Err(e) => {
            let _ = events
                .send(PeerEvent::Closed {
                    id,
                    reason: e.to_string(),
                })
                .await;
            return;
        }
    };

    let read_events = events.clone();
    let read_loop = async move {
        loop {
            match tokio::time::timeout(settings.idle_timeout, reader.next_message()).await {
                Err(_) => return "idle timeout".to_string(),
                Ok(Err(e)) => return e.to_string(),
                Ok(Ok(PeerMessage::KeepAlive)) => {}
                Ok(Ok(message)) => {
                    if read_events
                        .send(PeerEvent::Message { id, message })
                        .await
                        .is_err()
                    {
                        return "session closed".to_string();
                    }
                }
            }
        }
    };

    let write_loop = async move {
        loop {
            let message =
                match tokio::time::timeout(settings.keep_alive_interval, outbound.recv()).await {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        writer.shutdown().await;
                        return "session closed".to_string();
                    }
                    Err(_) => PeerMessage::KeepAlive,
                };
            if let Err(e) = writer.send(&message).await {
                return e.to_string();
            }
        }
    };

    let reason = tokio::select! {
        reason = read_loop => reason,
        reason = write_loop => reason,
    };
    let _ = events.send(PeerEvent::Closed { id, reason }).await;
}

/// Checks a received message against the torrent's geometry.
///
/// Any error means the peer broke the protocol and should be dropped.
pub fn validate_message(
    message: &PeerMessage,
    metadata: &TorrentMetadata,
    max_request_length: u32,
) -> Result<(), String> {
    let piece_count = metadata.piece_count();
    let check_index = |index: super::PieceIndex| {
        if index.as_usize() < piece_count {
            Ok(())
        } else {
            Err(format!("piece index {index} out of range"))
        }
    };

    match message {
        PeerMessage::Have { piece_index } => check_index(*piece_index),
        PeerMessage::Bitfield { bitfield } => Bitfield::from_bytes(bitfield, piece_count)
            .map(|_| ())
            .ok_or_else(|| format!("invalid bitfield of {} bytes", bitfield.len())),
        PeerMessage::Request {
            piece_index,
            offset,
            length,
        }
        | PeerMessage::Cancel {
            piece_index,
            offset,
            length,
        } => {
            check_index(*piece_index)?;
            if *length == 0 || *length > max_request_length {
                return Err(format!("request length {length} not allowed"));
            }
            let piece_size = metadata.piece_size(*piece_index);
            match offset.checked_add(*length) {
                Some(end) if end <= piece_size => Ok(()),
                _ => Err(format!(
                    "request {offset}+{length} exceeds piece {piece_index} of {piece_size} bytes"
                )),
            }
        }
        PeerMessage::Piece {
            piece_index,
            offset,
            data,
        } => {
            check_index(*piece_index)?;
            let piece_size = u64::from(metadata.piece_size(*piece_index));
            if u64::from(*offset) + data.len() as u64 <= piece_size {
                Ok(())
            } else {
                Err(format!("block at {offset} overruns piece {piece_index}"))
            }
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::torrent::PieceIndex;
    use crate::torrent::protocol::{HandshakeCodec, MessageCodec, read_handshake};
    use crate::torrent::test_data::three_piece_torrent;

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            max_peer_connections: 2,
            connect_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(1),
            peer_retry_cooldown: Duration::from_millis(50),
            ..NetworkConfig::default()
        }
    }

    fn manager(config: NetworkConfig) -> (PeerManager, mpsc::Receiver<PeerEvent>) {
        PeerManager::new(
            InfoHash::new([7; 20]),
            PeerId::new([1; 20]),
            3,
            config,
        )
    }

    /// Accepts one connection, completes the handshake and sends `unchoke`.
    async fn spawn_remote(remote_id: [u8; 20]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let ours = read_handshake(&mut stream).await.unwrap().unwrap();
            let reply = PeerHandshake::new(ours.info_hash, PeerId::new(remote_id));
            stream
                .write_all(&HandshakeCodec::serialize_handshake(&reply))
                .await
                .unwrap();
            stream
                .write_all(&MessageCodec::serialize_message(&PeerMessage::Unchoke))
                .await
                .unwrap();
            // Hold the socket open until the test ends.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        address
    }

    #[tokio::test]
    async fn test_dial_handshake_and_receive() {
        let (mut peers, mut events) = manager(test_config());
        let address = spawn_remote([9; 20]).await;

        peers.add_candidates([address]);
        assert_eq!(peers.fill_connections(), 1);
        // Already connecting; no duplicate dial.
        assert_eq!(peers.fill_connections(), 0);

        let Some(PeerEvent::Handshaked { id, peer_id }) = events.recv().await else {
            panic!("expected handshake");
        };
        assert_eq!(peer_id, PeerId::new([9; 20]));
        assert!(peers.on_handshaked(id, peer_id));
        assert_eq!(peers.connected_count(), 1);

        let Some(PeerEvent::Message { id: from, message }) = events.recv().await else {
            panic!("expected message");
        };
        assert_eq!(from, id);
        assert_eq!(message, PeerMessage::Unchoke);
    }

    #[tokio::test]
    async fn test_refused_dial_reports_closed_and_schedules_retry() {
        let (mut peers, mut events) = manager(test_config());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        peers.add_candidates([address]);
        peers.fill_connections();
        let Some(PeerEvent::Closed { id, .. }) = events.recv().await else {
            panic!("expected close");
        };
        assert!(peers.on_closed(id, "refused").is_some());
        assert!(peers.on_closed(id, "refused").is_none());

        // Cooling down.
        assert_eq!(peers.fill_connections(), 0);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(peers.fill_connections(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_peer_id_is_dropped() {
        let (mut peers, mut events) = manager(test_config());
        let first = spawn_remote([9; 20]).await;
        let second = spawn_remote([9; 20]).await;
        peers.add_candidates([first, second]);
        assert_eq!(peers.fill_connections(), 2);

        let mut accepted = 0;
        for _ in 0..2 {
            if let Some(PeerEvent::Handshaked { id, peer_id }) = events.recv().await {
                if peers.on_handshaked(id, peer_id) {
                    accepted += 1;
                }
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(peers.active_count(), 1);
    }

    #[tokio::test]
    async fn test_connection_cap_and_ban() {
        let (mut peers, _events) = manager(test_config());
        let addresses: Vec<SocketAddr> = (1..=3)
            .map(|port| SocketAddr::from(([127, 0, 0, 1], port)))
            .collect();
        peers.add_candidates(addresses.clone());

        assert_eq!(peers.fill_connections(), 2);
        assert_eq!(peers.active_count(), 2);

        peers.ban(addresses[0]);
        assert!(peers.is_banned(&addresses[0]));
        assert!(peers.id_for_address(addresses[0]).is_none());

        peers.add_candidates([addresses[0]]);
        peers.fill_connections();
        assert!(peers.id_for_address(addresses[0]).is_none());
    }

    #[tokio::test]
    async fn test_stale_announced_peers_are_forgotten() {
        let (mut peers, _events) = manager(NetworkConfig {
            max_peer_connections: 0,
            announced_peer_retention: Duration::from_millis(20),
            ..test_config()
        });
        let stale: Vec<SocketAddr> = (1..=50)
            .map(|port| SocketAddr::from(([10, 0, 0, 1], port)))
            .collect();
        peers.add_candidates(stale.clone());
        peers.ban(stale[0]);
        assert_eq!(peers.known.len(), 50);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let fresh = SocketAddr::from(([10, 0, 0, 2], 6881));
        peers.add_candidates([fresh]);
        assert_eq!(peers.fill_connections(), 0);

        assert_eq!(peers.known.len(), 2);
        assert!(peers.is_banned(&stale[0]));
        assert!(peers.known.contains_key(&fresh));
    }

    #[test]
    fn test_validate_message_ranges() {
        let (metadata, _) = three_piece_torrent();
        let max = 1 << 17;

        let have = |index: u32| PeerMessage::Have {
            piece_index: PieceIndex::new(index),
        };
        assert!(validate_message(&have(2), &metadata, max).is_ok());
        assert!(validate_message(&have(3), &metadata, max).is_err());

        let bitfield = |byte: u8| PeerMessage::Bitfield {
            bitfield: Bytes::from(vec![byte]),
        };
        assert!(validate_message(&bitfield(0xe0), &metadata, max).is_ok());
        assert!(validate_message(&bitfield(0xf0), &metadata, max).is_err());

        let request = |index: u32, offset: u32, length: u32| PeerMessage::Request {
            piece_index: PieceIndex::new(index),
            offset,
            length,
        };
        assert!(validate_message(&request(2, 0, 4096), &metadata, max).is_ok());
        // Last piece is only 4 KiB.
        assert!(validate_message(&request(2, 0, 16384), &metadata, max).is_err());
        assert!(validate_message(&request(0, 0, 0), &metadata, max).is_err());
        assert!(validate_message(&request(0, u32::MAX, 2), &metadata, max).is_err());
        assert!(validate_message(&request(0, 0, 16384), &metadata, 8192).is_err());

        let piece = PeerMessage::Piece {
            piece_index: PieceIndex::new(1),
            offset: 16000,
            data: Bytes::from(vec![0u8; 1000]),
        };
        assert!(validate_message(&piece, &metadata, max).is_err());
    }
}
