//! Centralized configuration for Shoal.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

/// Central configuration for all Shoal components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct ShoalConfig {
    pub torrent: TorrentConfig,
    pub network: NetworkConfig,
    pub tracker: TrackerConfig,
}

/// Piece exchange and integrity settings.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Azureus-style peer ID prefix
    pub client_id: &'static str,
    /// Size of a requested block within a piece
    pub block_size: u32,
    /// Outstanding block requests allowed per peer
    pub pipeline_depth: usize,
    /// How long a requested block may stay unanswered before it is re-requested
    pub block_timeout: Duration,
    /// Peers with more bad-piece strikes than this are banned
    pub hash_strike_threshold: u32,
    /// Interval for progress/stats events and request expiry
    pub status_tick: Duration,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_id: "-SH0001-",
            block_size: 16384, // 16 KiB
            pipeline_depth: 10,
            block_timeout: Duration::from_secs(30),
            hash_strike_threshold: 3,
            status_tick: Duration::from_secs(1),
        }
    }
}

/// Peer connection limits and timeouts.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// TCP port for incoming peers (0 picks an ephemeral port)
    pub listen_port: u16,
    /// Maximum concurrent peer connections per torrent
    pub max_peer_connections: usize,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Time allowed for the handshake exchange
    pub handshake_timeout: Duration,
    /// A peer that sends nothing for this long is dropped
    pub idle_timeout: Duration,
    /// Idle writers send a keep-alive at this interval
    pub keep_alive_interval: Duration,
    /// Delay before a dropped tracker-sourced peer may be redialled
    pub peer_retry_cooldown: Duration,
    /// How long a tracker-sourced address stays eligible for retry
    pub announced_peer_retention: Duration,
    /// Per-peer outbound message queue; a full queue closes the peer
    pub peer_queue_capacity: usize,
    /// Largest accepted wire frame
    pub max_frame_length: u32,
    /// Largest block a peer may request
    pub max_request_length: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            max_peer_connections: 30,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(120),
            keep_alive_interval: Duration::from_secs(60),
            peer_retry_cooldown: Duration::from_secs(60),
            announced_peer_retention: Duration::from_secs(30 * 60),
            peer_queue_capacity: 64,
            max_frame_length: 1 << 18,
            max_request_length: 1 << 17,
        }
    }
}

/// Tracker communication and announce scheduling.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// HTTP request timeout for tracker communication
    pub http_timeout: Duration,
    /// First UDP attempt timeout, doubled on each retry
    pub udp_base_timeout: Duration,
    /// UDP attempts before a tracker is declared unreachable
    pub udp_max_attempts: u32,
    /// How long a UDP connection ID may be reused
    pub connection_id_lifetime: Duration,
    /// Announce interval when the tracker names none
    pub default_announce_interval: Duration,
    /// Floor applied to tracker-provided intervals
    pub min_announce_interval: Duration,
    /// First retry delay after a failed announce round
    pub retry_base: Duration,
    /// Longest retry delay after repeated failures
    pub retry_cap: Duration,
    /// Peers requested per announce
    pub numwant: u32,
    /// Budget for the best-effort stopped announce
    pub stop_timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(30),
            udp_base_timeout: Duration::from_secs(15),
            udp_max_attempts: 4,
            connection_id_lifetime: Duration::from_secs(60),
            default_announce_interval: Duration::from_secs(1800), // 30 minutes
            min_announce_interval: Duration::from_secs(60),
            retry_base: Duration::from_secs(5),
            retry_cap: Duration::from_secs(300),
            numwant: 50,
            stop_timeout: Duration::from_secs(5),
            user_agent: "shoal/0.1.0",
        }
    }
}

impl ShoalConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = env_parse::<u16>("SHOAL_LISTEN_PORT") {
            config.network.listen_port = port;
        }

        if let Some(count) = env_parse::<usize>("SHOAL_MAX_PEERS") {
            config.network.max_peer_connections = count;
        }

        if let Some(seconds) = env_parse::<u64>("SHOAL_TRACKER_TIMEOUT") {
            config.tracker.http_timeout = Duration::from_secs(seconds);
        }

        if let Some(depth) = env_parse::<usize>("SHOAL_PIPELINE_DEPTH") {
            config.torrent.pipeline_depth = depth.max(1);
        }

        if let Some(attempts) = env_parse::<u32>("SHOAL_UDP_ATTEMPTS") {
            config.tracker.udp_max_attempts = attempts.max(1);
        }

        config
    }

    /// Creates a configuration with short timeouts for tests.
    pub fn for_testing() -> Self {
        Self {
            torrent: TorrentConfig {
                block_timeout: Duration::from_secs(2),
                status_tick: Duration::from_millis(100),
                ..Default::default()
            },
            network: NetworkConfig {
                listen_port: 0,
                connect_timeout: Duration::from_secs(1),
                handshake_timeout: Duration::from_secs(1),
                idle_timeout: Duration::from_secs(10),
                keep_alive_interval: Duration::from_secs(5),
                peer_retry_cooldown: Duration::from_millis(200),
                ..Default::default()
            },
            tracker: TrackerConfig {
                http_timeout: Duration::from_secs(2),
                udp_base_timeout: Duration::from_millis(100),
                udp_max_attempts: 3,
                min_announce_interval: Duration::from_millis(200),
                retry_base: Duration::from_millis(100),
                retry_cap: Duration::from_secs(1),
                stop_timeout: Duration::from_millis(500),
                ..Default::default()
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = ShoalConfig::default();

        assert_eq!(config.torrent.client_id, "-SH0001-");
        assert_eq!(config.torrent.block_size, 16384);
        assert_eq!(config.torrent.hash_strike_threshold, 3);
        assert_eq!(config.network.max_peer_connections, 30);
        assert_eq!(config.network.max_frame_length, 262_144);
        assert_eq!(config.tracker.udp_base_timeout, Duration::from_secs(15));
        assert_eq!(config.tracker.connection_id_lifetime, Duration::from_secs(60));
        assert_eq!(config.tracker.http_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_testing_preset_shortens_timeouts() {
        let config = ShoalConfig::for_testing();
        let defaults = ShoalConfig::default();

        assert_eq!(config.network.listen_port, 0);
        assert!(config.tracker.udp_base_timeout < defaults.tracker.udp_base_timeout);
        assert!(config.torrent.status_tick < defaults.torrent.status_tick);
        assert_eq!(config.torrent.block_size, defaults.torrent.block_size);
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("SHOAL_TRACKER_TIMEOUT", "60");
            std::env::set_var("SHOAL_MAX_PEERS", "100");
            std::env::set_var("SHOAL_LISTEN_PORT", "7000");
            std::env::set_var("SHOAL_PIPELINE_DEPTH", "not-a-number");
        }

        let config = ShoalConfig::from_env();

        assert_eq!(config.tracker.http_timeout, Duration::from_secs(60));
        assert_eq!(config.network.max_peer_connections, 100);
        assert_eq!(config.network.listen_port, 7000);
        assert_eq!(config.torrent.pipeline_depth, 10);

        // Cleanup
        unsafe {
            std::env::remove_var("SHOAL_TRACKER_TIMEOUT");
            std::env::remove_var("SHOAL_MAX_PEERS");
            std::env::remove_var("SHOAL_LISTEN_PORT");
            std::env::remove_var("SHOAL_PIPELINE_DEPTH");
        }
    }
}
