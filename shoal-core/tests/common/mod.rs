//! Shared fixtures for engine integration tests: a fake UDP tracker and
//! simulated peers speaking the real wire protocol over loopback.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes};
use parking_lot::Mutex;
use shoal_core::config::ShoalConfig;
use shoal_core::engine::{EngineEvent, SessionState};
use shoal_core::torrent::protocol::read_handshake;
use shoal_core::torrent::tracker::protocol::constants::{
    ACTION_ANNOUNCE, ACTION_CONNECT, UDP_PROTOCOL_MAGIC,
};
use shoal_core::torrent::{
    Bitfield, InfoHash, PeerConnection, PeerHandshake, PeerId, PeerMessage, TorrentCreator,
    TorrentMetadata,
};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const PIECE_LENGTH: u32 = 16384;
pub const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Deterministic content for a torrent of `length` bytes.
pub fn reference_data(length: usize) -> Vec<u8> {
    (0..length).map(|i| (i * 7 % 251) as u8).collect()
}

/// Single-file torrent over `data` announcing to `tracker`.
pub fn torrent_for(name: &str, data: &[u8], tracker: &str) -> TorrentMetadata {
    TorrentCreator::with_piece_size(PIECE_LENGTH)
        .create_from_bytes(name, data, vec![tracker.to_string()])
        .unwrap()
        .metadata
}

/// Three 16 KiB pieces, the last one 4 KiB.
pub fn three_piece_data() -> Vec<u8> {
    reference_data(2 * PIECE_LENGTH as usize + 4096)
}

pub fn engine_config() -> ShoalConfig {
    let mut config = ShoalConfig::for_testing();
    config.tracker.udp_base_timeout = Duration::from_millis(200);
    config
}

pub fn piece_range(metadata: &TorrentMetadata, index: usize) -> std::ops::Range<usize> {
    let start = index * metadata.piece_length as usize;
    let end = (start + metadata.piece_length as usize).min(metadata.total_length as usize);
    start..end
}

/// Waits for a state change of `info_hash` to `wanted`.
pub async fn wait_for_state(
    events: &mut broadcast::Receiver<EngineEvent>,
    info_hash: InfoHash,
    wanted: SessionState,
) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(EngineEvent::StateChanged { info_hash: hash, state })
                    if hash == info_hash && state == wanted =>
                {
                    return;
                }
                Ok(EngineEvent::Error { message, .. }) => panic!("session failed: {message}"),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("engine closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {wanted}"));
}

/// Minimal BEP 15 tracker that hands out a fixed peer list.
pub struct FakeUdpTracker {
    address: SocketAddr,
    peers: Arc<Mutex<Vec<SocketAddrV4>>>,
    announces: Arc<Mutex<Vec<u32>>>,
    silent: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl FakeUdpTracker {
    pub async fn start(peers: Vec<SocketAddr>) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = socket.local_addr().unwrap();
        let peers = Arc::new(Mutex::new(
            peers
                .into_iter()
                .map(|peer| match peer {
                    SocketAddr::V4(v4) => v4,
                    SocketAddr::V6(_) => panic!("fake tracker only serves IPv4 peers"),
                })
                .collect(),
        ));
        let announces = Arc::new(Mutex::new(Vec::new()));
        let silent = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(serve_tracker(
            socket,
            Arc::clone(&peers),
            Arc::clone(&announces),
            Arc::clone(&silent),
        ));
        Self {
            address,
            peers,
            announces,
            silent,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("udp://{}", self.address)
    }

    pub fn set_peers(&self, peers: Vec<SocketAddrV4>) {
        *self.peers.lock() = peers;
    }

    /// While silent, every request is dropped unanswered and unrecorded.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Event codes of every announce received (0 none, 1 completed,
    /// 2 started, 3 stopped).
    pub fn announce_events(&self) -> Vec<u32> {
        self.announces.lock().clone()
    }
}

impl Drop for FakeUdpTracker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_tracker(
    socket: UdpSocket,
    peers: Arc<Mutex<Vec<SocketAddrV4>>>,
    announces: Arc<Mutex<Vec<u32>>>,
    silent: Arc<AtomicBool>,
) {
    let mut buffer = [0u8; 2048];
    loop {
        let Ok((received, from)) = socket.recv_from(&mut buffer).await else {
            return;
        };
        if silent.load(Ordering::SeqCst) {
            continue;
        }
        let mut request = &buffer[..received];
        if request.len() < 16 {
            continue;
        }
        let connection_id = request.get_u64();
        let action = request.get_u32();
        let transaction_id = request.get_u32();

        let mut reply = Vec::new();
        if action == ACTION_CONNECT && connection_id == UDP_PROTOCOL_MAGIC {
            reply.put_u32(ACTION_CONNECT);
            reply.put_u32(transaction_id);
            reply.put_u64(0x5eed_5eed);
        } else if action == ACTION_ANNOUNCE && request.len() >= 82 {
            // info_hash, peer_id, downloaded, left, uploaded
            request.advance(20 + 20 + 8 + 8 + 8);
            announces.lock().push(request.get_u32());

            let peers = peers.lock().clone();
            reply.put_u32(ACTION_ANNOUNCE);
            reply.put_u32(transaction_id);
            reply.put_u32(1); // interval, floored by the client
            reply.put_u32(0);
            reply.put_u32(peers.len() as u32);
            for peer in peers {
                reply.put_slice(&peer.ip().octets());
                reply.put_u16(peer.port());
            }
        } else {
            continue;
        }
        let _ = socket.send_to(&reply, from).await;
    }
}

/// How a simulated seeder answers block requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeederBehavior {
    Honest,
    /// Flips every byte it serves.
    Corrupt,
}

/// A peer that owns some pieces of a torrent and serves them to anyone.
pub struct SimulatedSeeder {
    address: SocketAddrV4,
    served: Arc<AtomicUsize>,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

struct SeederState {
    metadata: Arc<TorrentMetadata>,
    data: Arc<Vec<u8>>,
    owned: BTreeSet<usize>,
    behavior: SeederBehavior,
    peer_id: PeerId,
    served: Arc<AtomicUsize>,
    connections: Arc<AtomicUsize>,
}

impl SimulatedSeeder {
    pub async fn start(
        metadata: &TorrentMetadata,
        data: &[u8],
        owned: impl IntoIterator<Item = usize>,
        behavior: SeederBehavior,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(address) = listener.local_addr().unwrap() else {
            unreachable!("bound to an IPv4 address");
        };
        let served = Arc::new(AtomicUsize::new(0));
        let connections = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(SeederState {
            metadata: Arc::new(metadata.clone()),
            data: Arc::new(data.to_vec()),
            owned: owned.into_iter().collect(),
            behavior,
            peer_id: PeerId::generate("-SIM001-"),
            served: Arc::clone(&served),
            connections: Arc::clone(&connections),
        });

        let task = tokio::spawn(async move {
            while let Ok((stream, remote)) = listener.accept().await {
                tokio::spawn(serve_peer(Arc::clone(&state), stream, remote));
            }
        });

        Self {
            address,
            served,
            connections,
            task,
        }
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    /// Blocks sent so far.
    pub fn blocks_served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    /// Connections that completed a handshake.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for SimulatedSeeder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_peer(state: Arc<SeederState>, mut stream: TcpStream, remote: SocketAddr) {
    let Ok(Ok(theirs)) = read_handshake(&mut stream).await else {
        return;
    };
    let ours = PeerHandshake::new(state.metadata.info_hash, state.peer_id);
    let mut connection = PeerConnection::from_stream(remote, stream, 1 << 18);
    if connection.accept_handshake(&ours, theirs).await.is_err() {
        return;
    }
    state.connections.fetch_add(1, Ordering::SeqCst);

    let mut bitfield = Bitfield::new(state.metadata.piece_count());
    for index in &state.owned {
        bitfield.set(*index);
    }
    let greeting = [
        PeerMessage::Bitfield {
            bitfield: bitfield.to_bytes(),
        },
        PeerMessage::Unchoke,
    ];
    for message in &greeting {
        if connection.send_message(message).await.is_err() {
            return;
        }
    }

    while let Ok(message) = connection.receive_message().await {
        let PeerMessage::Request {
            piece_index,
            offset,
            length,
        } = message
        else {
            continue;
        };
        if !state.owned.contains(&piece_index.as_usize()) {
            continue;
        }
        let start = piece_index.as_usize() * state.metadata.piece_length as usize + offset as usize;
        let mut block = state.data[start..start + length as usize].to_vec();
        if state.behavior == SeederBehavior::Corrupt {
            block.iter_mut().for_each(|byte| *byte = !*byte);
        }
        let reply = PeerMessage::Piece {
            piece_index,
            offset,
            data: Bytes::from(block),
        };
        if connection.send_message(&reply).await.is_err() {
            return;
        }
        state.served.fetch_add(1, Ordering::SeqCst);
    }
}

/// A remote peer that dials the engine and downloads from it.
pub struct Leecher {
    connection: PeerConnection<TcpStream>,
}

impl Leecher {
    pub async fn connect(address: SocketAddr, info_hash: InfoHash) -> Self {
        let mut connection = PeerConnection::connect(address, Duration::from_secs(2), 1 << 18)
            .await
            .unwrap();
        let ours = PeerHandshake::new(info_hash, PeerId::generate("-LCH001-"));
        connection
            .handshake(&ours, Duration::from_secs(2))
            .await
            .unwrap();
        Self { connection }
    }

    pub async fn send(&mut self, message: PeerMessage) {
        self.connection.send_message(&message).await.unwrap();
    }

    /// Next message other than keep-alives and `have` announcements.
    pub async fn next(&mut self) -> PeerMessage {
        tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                match self.connection.receive_message().await.unwrap() {
                    PeerMessage::KeepAlive | PeerMessage::Have { .. } => {}
                    message => return message,
                }
            }
        })
        .await
        .expect("peer went quiet")
    }
}

/// Socket address the engine's listener is reachable on from loopback.
pub fn loopback(listen: SocketAddr) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], listen.port()))
}
