//! UDP tracker client (BEP 15).
//!
//! Every request round gets a fresh transaction ID. Datagrams that do not
//! carry the outstanding transaction ID are dropped and the wait continues,
//! so late replies to an earlier attempt can never satisfy a newer one.
//! Round `n` waits `base * 2^n` before the next attempt; after the attempt
//! cap the tracker is reported unreachable.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use url::Url;

use super::protocol::constants::{
    ACTION_ANNOUNCE, ACTION_CONNECT, ACTION_ERROR, ACTION_SCRAPE, UDP_PROTOCOL_MAGIC,
};
use super::protocol::{PeerFamily, parse_compact_peers};
use super::types::{
    AnnounceRequest, AnnounceResponse, ScrapeRequest, ScrapeResponse, ScrapeStats, TrackerClient,
};
use crate::config::TrackerConfig;
use crate::torrent::TorrentError;

const MAX_DATAGRAM: usize = 65_536;

/// BEP 15 caps a single scrape at roughly 74 hashes.
const MAX_SCRAPE_HASHES: usize = 74;

#[derive(Debug, Clone, Copy)]
struct CachedConnection {
    id: u64,
    obtained_at: Instant,
}

/// UDP tracker client implementation
pub struct UdpTrackerClient {
    announce_url: String,
    host: String,
    port: u16,
    base_timeout: Duration,
    max_attempts: u32,
    connection_lifetime: Duration,
    key: u32,
    connection: Mutex<Option<CachedConnection>>,
}

impl UdpTrackerClient {
    /// # Errors
    ///
    /// - `TorrentError::UrlParsing` - URL could not be parsed
    /// - `TorrentError::TrackerError` - URL is not `udp://host:port`
    pub fn new(announce_url: String, config: &TrackerConfig) -> Result<Self, TorrentError> {
        let url = Url::parse(&announce_url)?;
        let invalid = |reason: &str| TorrentError::TrackerError {
            url: announce_url.clone(),
            reason: reason.to_string(),
        };
        if url.scheme() != "udp" {
            return Err(invalid("not a udp:// tracker"));
        }
        let host = match url.host() {
            Some(url::Host::Domain(domain)) => domain.to_string(),
            Some(url::Host::Ipv4(ip)) => ip.to_string(),
            Some(url::Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(invalid("missing host")),
        };
        let port = url.port().ok_or_else(|| invalid("missing port"))?;

        Ok(Self {
            announce_url,
            host,
            port,
            base_timeout: config.udp_base_timeout,
            max_attempts: config.udp_max_attempts.max(1),
            connection_lifetime: config.connection_id_lifetime,
            key: rand::random(),
            connection: Mutex::new(None),
        })
    }

    async fn open_socket(&self) -> Result<(UdpSocket, SocketAddr), TorrentError> {
        let address = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| self.tracker_error(format!("failed to resolve host: {e}")))?
            .next()
            .ok_or_else(|| self.tracker_error("host resolved to no addresses"))?;

        let bind_address: SocketAddr = if address.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind_address).await?;
        // Connected sockets only deliver datagrams from the tracker's address.
        socket.connect(address).await?;
        Ok((socket, address))
    }

    fn cached_connection_id(&self) -> Option<u64> {
        let cached = (*self.connection.lock())?;
        (cached.obtained_at.elapsed() < self.connection_lifetime).then_some(cached.id)
    }

    fn forget_connection(&self) {
        *self.connection.lock() = None;
    }

    fn attempt_timeout(&self, attempt: u32) -> Duration {
        self.base_timeout.saturating_mul(1u32 << attempt.min(16))
    }

    /// Runs one request through connect + action rounds with retries.
    ///
    /// Returns the response body following the 8-byte header, and the
    /// address the tracker name resolved to.
    async fn execute<F>(
        &self,
        action: u32,
        build: F,
    ) -> Result<(Vec<u8>, SocketAddr), TorrentError>
    where
        F: Fn(u64, u32) -> Vec<u8> + Send + Sync,
    {
        let (socket, address) = self.open_socket().await?;

        let mut attempt = 0;
        while attempt < self.max_attempts {
            let timeout = self.attempt_timeout(attempt);

            let connection_id = match self.cached_connection_id() {
                Some(id) => id,
                None => match self.connect_round(&socket, timeout).await? {
                    Some(id) => id,
                    None => {
                        tracing::debug!(
                            "UDP connect to {} timed out after {:?} (attempt {})",
                            self.announce_url,
                            timeout,
                            attempt + 1
                        );
                        attempt += 1;
                        continue;
                    }
                },
            };

            let transaction_id: u32 = rand::random();
            let packet = build(connection_id, transaction_id);
            if let Err(e) = socket.send(&packet).await {
                return Err(self.tracker_error(format!("send to {address} failed: {e}")));
            }

            match self
                .await_response(&socket, transaction_id, action, timeout)
                .await?
            {
                Some(body) => return Ok((body, address)),
                None => {
                    tracing::debug!(
                        "UDP tracker {} did not answer within {:?} (attempt {})",
                        self.announce_url,
                        timeout,
                        attempt + 1
                    );
                    attempt += 1;
                }
            }
        }

        Err(TorrentError::TrackerUnreachable {
            url: self.announce_url.clone(),
            attempts: self.max_attempts,
        })
    }

    async fn connect_round(
        &self,
        socket: &UdpSocket,
        timeout: Duration,
    ) -> Result<Option<u64>, TorrentError> {
        let transaction_id: u32 = rand::random();
        let mut packet = Vec::with_capacity(16);
        packet.put_u64(UDP_PROTOCOL_MAGIC);
        packet.put_u32(ACTION_CONNECT);
        packet.put_u32(transaction_id);
        socket
            .send(&packet)
            .await
            .map_err(|e| self.tracker_error(format!("send failed: {e}")))?;

        let Some(body) = self
            .await_response(socket, transaction_id, ACTION_CONNECT, timeout)
            .await?
        else {
            return Ok(None);
        };
        if body.len() < 8 {
            return Err(self.tracker_error("short connect response"));
        }

        let id = (&body[..8]).get_u64();
        *self.connection.lock() = Some(CachedConnection {
            id,
            obtained_at: Instant::now(),
        });
        Ok(Some(id))
    }

    /// Waits for the datagram answering `transaction_id`.
    ///
    /// `Ok(None)` means the wait expired.
    async fn await_response(
        &self,
        socket: &UdpSocket,
        transaction_id: u32,
        action: u32,
        wait: Duration,
    ) -> Result<Option<Vec<u8>>, TorrentError> {
        let deadline = Instant::now() + wait;
        let mut buffer = vec![0u8; MAX_DATAGRAM];

        loop {
            let received = match tokio::time::timeout_at(deadline, socket.recv(&mut buffer)).await
            {
                Err(_) => return Ok(None),
                Ok(Err(e)) => {
                    // ICMP errors surface here; treat them like silence.
                    tracing::debug!("UDP receive from {} failed: {}", self.announce_url, e);
                    tokio::time::sleep_until(deadline).await;
                    return Ok(None);
                }
                Ok(Ok(received)) => received,
            };

            let datagram = &buffer[..received];
            if datagram.len() < 8 {
                continue;
            }
            let mut header = &datagram[..8];
            let response_action = header.get_u32();
            let response_transaction = header.get_u32();

            if response_transaction != transaction_id {
                tracing::trace!(
                    "Discarding UDP datagram with transaction {:#x}, expected {:#x}",
                    response_transaction,
                    transaction_id
                );
                continue;
            }
            if response_action == ACTION_ERROR {
                self.forget_connection();
                return Err(self.tracker_error(String::from_utf8_lossy(&datagram[8..])));
            }
            if response_action != action {
                continue;
            }
            return Ok(Some(datagram[8..].to_vec()));
        }
    }

    /// Peers are 6-byte entries from an IPv4 tracker and 18-byte entries
    /// from an IPv6 one, whatever the announce URL looked like.
    fn parse_announce_body(
        &self,
        body: &[u8],
        tracker: SocketAddr,
    ) -> Result<AnnounceResponse, TorrentError> {
        if body.len() < 12 {
            return Err(self.tracker_error("short announce response"));
        }
        let mut cursor = body;
        let interval = cursor.get_u32();
        let incomplete = cursor.get_u32();
        let complete = cursor.get_u32();
        let peers = parse_compact_peers(cursor, PeerFamily::of(tracker))
            .map_err(|e| self.tracker_error(e.to_string()))?;

        Ok(AnnounceResponse {
            interval,
            min_interval: None,
            tracker_id: None,
            complete,
            incomplete,
            peers,
        })
    }

    fn tracker_error(&self, reason: impl Into<String>) -> TorrentError {
        TorrentError::TrackerError {
            url: self.announce_url.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl TrackerClient for UdpTrackerClient {
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError> {
        tracing::debug!(
            "Announcing {:?} to UDP tracker: {}",
            request.event,
            self.announce_url
        );
        let key = self.key;
        let (body, tracker) = self
            .execute(ACTION_ANNOUNCE, |connection_id, transaction_id| {
                let mut packet = Vec::with_capacity(98);
                packet.put_u64(connection_id);
                packet.put_u32(ACTION_ANNOUNCE);
                packet.put_u32(transaction_id);
                packet.put_slice(request.info_hash.as_bytes());
                packet.put_slice(request.peer_id.as_bytes());
                packet.put_u64(request.downloaded);
                packet.put_u64(request.left);
                packet.put_u64(request.uploaded);
                packet.put_u32(request.event.udp_code());
                packet.put_u32(0); // IP address: use the sender's
                packet.put_u32(key);
                packet.put_i32(i32::try_from(request.numwant).unwrap_or(-1));
                packet.put_u16(request.port);
                packet
            })
            .await?;

        self.parse_announce_body(&body, tracker)
    }

    async fn scrape(&self, request: ScrapeRequest) -> Result<ScrapeResponse, TorrentError> {
        let info_hashes: Vec<_> = request
            .info_hashes
            .into_iter()
            .take(MAX_SCRAPE_HASHES)
            .collect();

        let (body, _) = self
            .execute(ACTION_SCRAPE, |connection_id, transaction_id| {
                let mut packet = Vec::with_capacity(16 + 20 * info_hashes.len());
                packet.put_u64(connection_id);
                packet.put_u32(ACTION_SCRAPE);
                packet.put_u32(transaction_id);
                for info_hash in &info_hashes {
                    packet.put_slice(info_hash.as_bytes());
                }
                packet
            })
            .await?;

        if body.len() < 12 * info_hashes.len() {
            return Err(self.tracker_error("short scrape response"));
        }
        let mut cursor = body.as_slice();
        let mut response = ScrapeResponse::default();
        for info_hash in info_hashes {
            let complete = cursor.get_u32();
            let downloaded = cursor.get_u32();
            let incomplete = cursor.get_u32();
            response.files.insert(
                info_hash,
                ScrapeStats {
                    complete,
                    downloaded,
                    incomplete,
                },
            );
        }
        Ok(response)
    }

    fn tracker_url(&self) -> &str {
        &self.announce_url
    }
}
