//! HTTP tracker client implementation with URL building and response parsing

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;

use super::protocol::{PeerFamily, parse_compact_peers};
use super::types::{
    AnnounceRequest, AnnounceResponse, ScrapeRequest, ScrapeResponse, ScrapeStats, TrackerClient,
};
use crate::config::TrackerConfig;
use crate::torrent::parsing::{BencodeValueExt, Value, bencode};
use crate::torrent::{InfoHash, TorrentError};

/// HTTP tracker client implementation
pub struct HttpTrackerClient {
    pub(super) announce_url: String,
    pub(super) scrape_url: Option<String>,
    pub(super) default_interval: u32,
    pub(super) client: reqwest::Client,
}

impl HttpTrackerClient {
    /// Creates HTTP tracker client with automatic scrape URL derivation.
    ///
    /// The scrape URL replaces the final `announce` path segment with
    /// `scrape`; trackers whose path does not end that way cannot be scraped.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Http` - HTTP client could not be constructed
    pub fn new(announce_url: String, config: &TrackerConfig) -> Result<Self, TorrentError> {
        let scrape_url = derive_scrape_url(&announce_url);
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()?;

        Ok(Self {
            announce_url,
            scrape_url,
            default_interval: config.default_announce_interval.as_secs() as u32,
            client,
        })
    }

    /// Build announce URL with query parameters
    pub(super) fn build_announce_url(&self, request: &AnnounceRequest) -> String {
        // Binary values are percent-encoded by hand so reqwest does not re-encode them.
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
            urlencoding::encode_binary(request.info_hash.as_bytes()),
            urlencoding::encode_binary(request.peer_id.as_bytes()),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
            request.numwant,
        );
        if let Some(event) = request.event.as_query_value() {
            query.push_str("&event=");
            query.push_str(event);
        }

        append_query(&self.announce_url, &query)
    }

    /// Build scrape URL from announce URL
    ///
    /// # Errors
    /// - `TorrentError::TrackerError` - Tracker has no scrape URL
    pub(super) fn build_scrape_url(&self, request: &ScrapeRequest) -> Result<String, TorrentError> {
        let scrape_url = self
            .scrape_url
            .as_ref()
            .ok_or_else(|| self.tracker_error("tracker does not support scrape"))?;

        let query = request
            .info_hashes
            .iter()
            .map(|info_hash| {
                format!(
                    "info_hash={}",
                    urlencoding::encode_binary(info_hash.as_bytes())
                )
            })
            .collect::<Vec<_>>()
            .join("&");
        Ok(append_query(scrape_url, &query))
    }

    /// Parse tracker response from bencode data
    ///
    /// # Errors
    /// - `TorrentError::TrackerError` - Body is not a valid announce response
    ///   or carries a `failure reason`
    pub(super) fn parse_announce_response(
        &self,
        response_bytes: &[u8],
    ) -> Result<AnnounceResponse, TorrentError> {
        let root = self.decode_body(response_bytes)?;

        let interval = match root.get(b"interval").and_then(Value::as_integer) {
            Some(seconds) if seconds > 0 => clamp_u32(seconds),
            _ => self.default_interval,
        };
        let min_interval = root
            .get(b"min interval")
            .and_then(Value::as_integer)
            .filter(|seconds| *seconds > 0)
            .map(clamp_u32);
        let tracker_id = root
            .get(b"tracker id")
            .and_then(Value::as_bytes)
            .map(|id| String::from_utf8_lossy(id).into_owned());
        let complete = integer_field(&root, b"complete");
        let incomplete = integer_field(&root, b"incomplete");

        let mut peers = match root.get(b"peers") {
            Some(Value::Bytes(compact)) => parse_compact_peers(compact, PeerFamily::V4)
                .map_err(|e| self.tracker_error(e.to_string()))?,
            Some(Value::List(entries)) => entries.iter().filter_map(dictionary_peer).collect(),
            Some(_) => return Err(self.tracker_error("peers has an unexpected type")),
            None => Vec::new(),
        };
        if let Some(compact) = root.get(b"peers6").and_then(Value::as_bytes) {
            peers.extend(
                parse_compact_peers(compact, PeerFamily::V6)
                    .map_err(|e| self.tracker_error(e.to_string()))?,
            );
        }

        Ok(AnnounceResponse {
            interval,
            min_interval,
            tracker_id,
            complete,
            incomplete,
            peers,
        })
    }

    /// Parse tracker scrape response from bencode data
    ///
    /// # Errors
    /// - `TorrentError::TrackerError` - Body is not a valid scrape response
    pub(super) fn parse_scrape_response(
        &self,
        response_bytes: &[u8],
    ) -> Result<ScrapeResponse, TorrentError> {
        let root = self.decode_body(response_bytes)?;

        let mut response = ScrapeResponse::default();
        let Some(files) = root.get(b"files").and_then(Value::as_dictionary) else {
            return Ok(response);
        };

        for (key, stats) in files {
            let Ok(hash) = <[u8; 20]>::try_from(key.as_slice()) else {
                continue;
            };
            response.files.insert(
                InfoHash::new(hash),
                ScrapeStats {
                    complete: integer_field(stats, b"complete"),
                    downloaded: integer_field(stats, b"downloaded"),
                    incomplete: integer_field(stats, b"incomplete"),
                },
            );
        }
        Ok(response)
    }

    fn decode_body(&self, response_bytes: &[u8]) -> Result<Value, TorrentError> {
        let root = bencode::decode(response_bytes)
            .map_err(|e| self.tracker_error(format!("unparsable response: {e}")))?;
        if root.as_dictionary().is_none() {
            return Err(self.tracker_error("response is not a dictionary"));
        }
        if let Some(reason) = root.get(b"failure reason").and_then(Value::as_bytes) {
            return Err(self.tracker_error(String::from_utf8_lossy(reason)));
        }
        Ok(root)
    }

    async fn fetch(&self, url: &str) -> Result<bytes::Bytes, TorrentError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            tracing::warn!("HTTP request to {} failed: {}", self.announce_url, e);
            self.tracker_error(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                "Tracker {} returned error status: {}",
                self.announce_url,
                status
            );
            return Err(self.tracker_error(format!("HTTP status {status}")));
        }

        response.bytes().await.map_err(|e| {
            tracing::warn!(
                "Failed to read response body from {}: {}",
                self.announce_url,
                e
            );
            self.tracker_error(format!("failed to read response body: {e}"))
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
impl TrackerClient for HttpTrackerClient {
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError> {
        let url = self.build_announce_url(&request);
        tracing::debug!(
            "Announcing {:?} to tracker: {}",
            request.event,
            self.announce_url
        );

        let body = self.fetch(&url).await?;
        let response = self.parse_announce_response(&body)?;
        tracing::debug!(
            "Tracker {} returned {} peers, interval {}s",
            self.announce_url,
            response.peers.len(),
            response.interval
        );
        Ok(response)
    }

    async fn scrape(&self, request: ScrapeRequest) -> Result<ScrapeResponse, TorrentError> {
        let url = self.build_scrape_url(&request)?;
        let body = self.fetch(&url).await?;
        self.parse_scrape_response(&body)
    }

    fn tracker_url(&self) -> &str {
        &self.announce_url
    }
}

fn derive_scrape_url(announce_url: &str) -> Option<String> {
    let (path, query) = match announce_url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (announce_url, None),
    };
    let slash = path.rfind('/')?;
    let segment = &path[slash + 1..];
    let rest = segment.strip_prefix("announce")?;

    let mut scrape = format!("{}scrape{}", &path[..=slash], rest);
    if let Some(query) = query {
        scrape.push('?');
        scrape.push_str(query);
    }
    Some(scrape)
}

fn append_query(base: &str, query: &str) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}{query}")
}

fn integer_field(dictionary: &Value, key: &[u8]) -> u32 {
    dictionary
        .get(key)
        .and_then(Value::as_integer)
        .map(clamp_u32)
        .unwrap_or(0)
}

fn clamp_u32(value: i64) -> u32 {
    value.clamp(0, i64::from(u32::MAX)) as u32
}

/// Non-compact peer entry: `{ip, port, peer id?}`.
fn dictionary_peer(entry: &Value) -> Option<SocketAddr> {
    let ip: IpAddr = entry.get(b"ip")?.as_str()?.parse().ok()?;
    let port = u16::try_from(entry.get(b"port")?.as_integer()?).ok()?;
    Some(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tracker_client_tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::torrent::PeerId;
    use crate::torrent::tracker::AnnounceEvent;

    /// Answers one HTTP request on loopback and returns its request line.
    async fn serve_once(status: &'static str, body: Vec<u8>) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/announce", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buffer = [0u8; 1024];
            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                let read = stream.read(&mut buffer).await.unwrap();
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buffer[..read]);
            }
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).await.unwrap();
            stream.write_all(&body).await.unwrap();
            stream.shutdown().await.unwrap();
            let request = String::from_utf8_lossy(&request).into_owned();
            request.lines().next().unwrap_or_default().to_string()
        });
        (url, task)
    }

    fn client(url: &str) -> HttpTrackerClient {
        HttpTrackerClient::new(url.to_string(), &TrackerConfig::default()).unwrap()
    }

    fn request(event: AnnounceEvent) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash::new([0x11; 20]),
            peer_id: PeerId::new([0x22; 20]),
            port: 6881,
            uploaded: 1000,
            downloaded: 500,
            left: 2000,
            event,
            numwant: 50,
        }
    }

    #[test]
    fn test_scrape_url_derivation() {
        let client1 = client("http://tracker.example.com/announce");
        assert_eq!(
            client1.scrape_url.as_deref(),
            Some("http://tracker.example.com/scrape")
        );

        let client2 = client("http://tracker.example.com/x/announce.php?passkey=abc");
        assert_eq!(
            client2.scrape_url.as_deref(),
            Some("http://tracker.example.com/x/scrape.php?passkey=abc")
        );

        let client3 = client("http://tracker.example.com/tracker");
        assert_eq!(client3.scrape_url, None);
        assert!(matches!(
            client3.build_scrape_url(&ScrapeRequest {
                info_hashes: vec![InfoHash::new([0; 20])]
            }),
            Err(TorrentError::TrackerError { .. })
        ));
    }

    #[test]
    fn test_build_announce_url() {
        let client = client("http://tracker.example.com/announce");
        let url = client.build_announce_url(&request(AnnounceEvent::Started));

        assert!(url.starts_with("http://tracker.example.com/announce?"));
        assert!(
            url.contains("info_hash=%11%11%11%11%11%11%11%11%11%11%11%11%11%11%11%11%11%11%11%11")
        );
        assert!(url.contains("peer_id=%22%22%22"));
        assert!(url.contains("port=6881"));
        assert!(url.contains("uploaded=1000"));
        assert!(url.contains("downloaded=500"));
        assert!(url.contains("left=2000"));
        assert!(url.contains("compact=1"));
        assert!(url.contains("numwant=50"));
        assert!(url.contains("event=started"));

        let regular = client.build_announce_url(&request(AnnounceEvent::Regular));
        assert!(!regular.contains("event="));
    }

    #[test]
    fn test_announce_url_keeps_existing_query() {
        let client = client("http://tracker.example.com/announce?passkey=abc");
        let url = client.build_announce_url(&request(AnnounceEvent::Regular));
        assert!(url.starts_with("http://tracker.example.com/announce?passkey=abc&info_hash="));
    }

    #[test]
    fn test_parse_compact_announce_response() {
        let body =
            b"d8:intervali1800e12:min intervali60e8:completei10e10:incompletei5e5:peers6:\x7f\x00\x00\x01\x1a\x09e";
        let response = client("http://example.com/announce")
            .parse_announce_response(body)
            .unwrap();

        assert_eq!(response.interval, 1800);
        assert_eq!(response.min_interval, Some(60));
        assert_eq!(response.complete, 10);
        assert_eq!(response.incomplete, 5);
        assert_eq!(response.peers, vec!["127.0.0.1:6665".parse().unwrap()]);
    }

    #[test]
    fn test_parse_dictionary_peer_list() {
        let body = b"d8:intervali900e5:peersld2:ip8:10.0.0.17:peer id20:aaaaaaaaaaaaaaaaaaaa4:porti6881eed2:ip3:::14:porti51413eed2:ip4:nope4:porti1eeee";
        let response = client("http://example.com/announce")
            .parse_announce_response(body)
            .unwrap();

        assert_eq!(
            response.peers,
            vec![
                "10.0.0.1:6881".parse::<SocketAddr>().unwrap(),
                "[::1]:51413".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn test_parse_peers6_appends_ipv6_peers() {
        let mut body = b"d8:intervali900e5:peers0:6:peers618:".to_vec();
        body.extend_from_slice(&[0u8; 15]);
        body.push(1);
        body.extend_from_slice(&[0x1a, 0xe1]);
        body.push(b'e');

        let response = client("http://example.com/announce")
            .parse_announce_response(&body)
            .unwrap();
        assert_eq!(response.peers, vec!["[::1]:6881".parse().unwrap()]);
    }

    #[test]
    fn test_parse_rejects_truncated_compact_peers() {
        let body = b"d8:intervali900e5:peers5:\x7f\x00\x00\x01\x1ae";
        assert!(matches!(
            client("http://example.com/announce").parse_announce_response(body),
            Err(TorrentError::TrackerError { .. })
        ));
    }

    #[test]
    fn test_parse_announce_response_failure_reason() {
        let body = b"d14:failure reason12:unregisterede";
        let result = client("http://example.com/announce").parse_announce_response(body);
        assert!(matches!(
            result,
            Err(TorrentError::TrackerError { reason, .. }) if reason == "unregistered"
        ));
    }

    #[test]
    fn test_parse_garbage_body() {
        let client = client("http://example.com/announce");
        assert!(client.parse_announce_response(b"<html>").is_err());
        assert!(client.parse_announce_response(b"li1ee").is_err());
    }

    #[test]
    fn test_missing_interval_uses_default() {
        let response = client("http://example.com/announce")
            .parse_announce_response(b"d5:peers0:e")
            .unwrap();
        assert_eq!(response.interval, 1800);
        assert!(response.peers.is_empty());
    }

    #[test]
    fn test_parse_scrape_response_success() {
        let info_hash = InfoHash::new([0x11; 20]);
        let mut body = Vec::new();
        body.extend_from_slice(b"d5:filesd20:");
        body.extend_from_slice(info_hash.as_bytes());
        body.extend_from_slice(b"d8:completei10e10:downloadedi20e10:incompletei5eeee");

        let response = client("http://example.com/announce")
            .parse_scrape_response(&body)
            .unwrap();
        assert_eq!(
            response.files.get(&info_hash),
            Some(&ScrapeStats {
                complete: 10,
                downloaded: 20,
                incomplete: 5
            })
        );
    }

    #[test]
    fn test_build_scrape_url() {
        let url = client("http://tracker.example.com/announce")
            .build_scrape_url(&ScrapeRequest {
                info_hashes: vec![InfoHash::new([0xAA; 20]), InfoHash::new([0xBB; 20])],
            })
            .unwrap();
        assert!(url.starts_with("http://tracker.example.com/scrape?info_hash=%AA"));
        assert!(url.contains("&info_hash=%BB"));
    }

    #[tokio::test]
    async fn test_announce_round_trip_over_http() {
        let body =
            b"d8:intervali900e8:completei3e10:incompletei1e5:peers6:\x7f\x00\x00\x01\x1a\xe1e";
        let (url, server) = serve_once("200 OK", body.to_vec()).await;

        let response = client(&url)
            .announce(request(AnnounceEvent::Started))
            .await
            .unwrap();
        assert_eq!(response.interval, 900);
        assert_eq!(response.complete, 3);
        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);

        let request_line = server.await.unwrap();
        assert!(request_line.starts_with("GET /announce?info_hash=%11%11"));
        for parameter in ["peer_id=%22", "port=6881", "left=2000", "compact=1", "event=started"] {
            assert!(request_line.contains(parameter), "{request_line}");
        }
    }

    #[tokio::test]
    async fn test_error_status_is_tracker_error() {
        let (url, server) = serve_once("500 Internal Server Error", b"oops".to_vec()).await;

        match client(&url).announce(request(AnnounceEvent::Regular)).await {
            Err(TorrentError::TrackerError { reason, .. }) => {
                assert!(reason.contains("500"), "{reason}");
            }
            other => panic!("expected a tracker error, got {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unresponsive_tracker_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/announce", listener.local_addr().unwrap());
        // Accepts and then never answers.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });

        let config = TrackerConfig {
            http_timeout: Duration::from_millis(200),
            ..TrackerConfig::default()
        };
        let client = HttpTrackerClient::new(url, &config).unwrap();
        let started = std::time::Instant::now();
        let result = client.announce(request(AnnounceEvent::Regular)).await;

        assert!(matches!(result, Err(TorrentError::TrackerError { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
        server.abort();
    }
}
