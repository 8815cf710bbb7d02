//! Tracker management for handling multiple tracker URLs per torrent

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;

use super::{
    AnnounceRequest, AnnounceResponse, HttpTrackerClient, ScrapeRequest, ScrapeResponse,
    TrackerClient, UdpTrackerClient,
};
use crate::config::TrackerConfig;
use crate::torrent::TorrentError;

/// Tracker list for one torrent, organised into BEP 12 tiers.
///
/// Tiers are tried in order and trackers within a tier front to back. A
/// tracker that answers moves to the front of its tier so later announces
/// go to it first.
pub struct TrackerManager {
    tiers: Vec<Vec<Arc<dyn TrackerClient>>>,
}

impl TrackerManager {
    /// Builds clients for every supported URL and shuffles each tier once.
    ///
    /// Unsupported schemes and unparsable URLs are skipped with a warning.
    pub fn new(announce_tiers: &[Vec<String>], config: &TrackerConfig) -> Self {
        let mut rng = rand::rng();
        let tiers = announce_tiers
            .iter()
            .map(|tier| {
                let mut clients: Vec<Arc<dyn TrackerClient>> = tier
                    .iter()
                    .filter_map(|url| match Self::client_for_url(url, config) {
                        Ok(client) => Some(client),
                        Err(e) => {
                            tracing::warn!("Skipping tracker {}: {}", url, e);
                            None
                        }
                    })
                    .collect();
                clients.shuffle(&mut rng);
                clients
            })
            .filter(|tier| !tier.is_empty())
            .collect();

        Self { tiers }
    }

    /// Uses prepared clients as-is, without shuffling.
    pub fn from_clients(tiers: Vec<Vec<Arc<dyn TrackerClient>>>) -> Self {
        Self {
            tiers: tiers.into_iter().filter(|tier| !tier.is_empty()).collect(),
        }
    }

    fn client_for_url(
        url: &str,
        config: &TrackerConfig,
    ) -> Result<Arc<dyn TrackerClient>, TorrentError> {
        let scheme = url::Url::parse(url)?.scheme().to_string();
        match scheme.as_str() {
            "http" | "https" => Ok(Arc::new(HttpTrackerClient::new(url.to_string(), config)?)),
            "udp" => Ok(Arc::new(UdpTrackerClient::new(url.to_string(), config)?)),
            other => Err(TorrentError::TrackerError {
                url: url.to_string(),
                reason: format!("unsupported scheme {other}"),
            }),
        }
    }

    /// Tracker URLs in current try order.
    pub fn tracker_urls(&self) -> Vec<Vec<String>> {
        self.tiers
            .iter()
            .map(|tier| {
                tier.iter()
                    .map(|client| client.tracker_url().to_string())
                    .collect()
            })
            .collect()
    }

    fn no_trackers() -> TorrentError {
        TorrentError::TrackerError {
            url: String::new(),
            reason: "no usable trackers".to_string(),
        }
    }
}

/// Trait for tracker management abstraction.
///
/// Lets the announcer run against real trackers or a scripted stand-in.
#[async_trait]
pub trait TrackerManagement: Send + Sync {
    /// Announces through the tier list until one tracker answers.
    ///
    /// # Errors
    ///
    /// - The last tracker's error when every tracker failed
    async fn announce(&mut self, request: AnnounceRequest)
    -> Result<AnnounceResponse, TorrentError>;

    /// Scrapes the first tracker that supports it.
    ///
    /// # Errors
    ///
    /// - The last tracker's error when every tracker failed
    async fn scrape(&mut self, request: ScrapeRequest) -> Result<ScrapeResponse, TorrentError>;

    /// True when there is nobody to announce to.
    fn is_empty(&self) -> bool;
}

#[async_trait]
impl TrackerManagement for TrackerManager {
    async fn announce(
        &mut self,
        request: AnnounceRequest,
    ) -> Result<AnnounceResponse, TorrentError> {
        let mut last_error = None;

        for tier in &mut self.tiers {
            for position in 0..tier.len() {
                let client = Arc::clone(&tier[position]);
                match client.announce(request.clone()).await {
                    Ok(response) => {
                        tracing::info!(
                            "Tracker {} responded with {} peers, complete: {}, incomplete: {}",
                            client.tracker_url(),
                            response.peers.len(),
                            response.complete,
                            response.incomplete
                        );
                        let answered = tier.remove(position);
                        tier.insert(0, answered);
                        return Ok(response);
                    }
                    Err(e) => {
                        tracing::warn!("Tracker {} failed: {}", client.tracker_url(), e);
                        last_error = Some(e);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(Self::no_trackers))
    }

    async fn scrape(&mut self, request: ScrapeRequest) -> Result<ScrapeResponse, TorrentError> {
        let mut last_error = None;

        for client in self.tiers.iter().flatten() {
            match client.scrape(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::debug!("Tracker scrape {} failed: {}", client.tracker_url(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(Self::no_trackers))
    }

    fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}
