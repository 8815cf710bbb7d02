//! BitTorrent tracker communication abstractions and implementations.
//!
//! HTTP (BEP 3) and UDP (BEP 15) tracker clients behind one trait, a
//! tier-aware manager (BEP 12) and the per-session announce loop.

pub mod announcer;
pub mod http;
pub mod manager;
pub mod protocol;
pub mod types;
pub mod udp;

// Re-export public API
pub use announcer::{
    AnnounceIdentity, AnnounceOutcome, Announcer, AnnouncerHandle, TransferTotals,
};
pub use http::HttpTrackerClient;
pub use manager::{TrackerManagement, TrackerManager};
pub use types::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, ScrapeRequest, ScrapeResponse, ScrapeStats,
    TrackerClient,
};
pub use udp::UdpTrackerClient;
