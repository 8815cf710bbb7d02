//! Swarm engine: an actor that owns one session task per torrent.
//!
//! Callers talk to the engine through [`EngineHandle`]; the engine routes
//! commands and incoming peers to sessions and publishes [`EngineEvent`]s.

pub mod actor;
pub mod commands;
mod core;
pub mod events;
pub mod handle;
mod listener;
mod session;
pub mod snapshot;

pub use actor::spawn_engine;
pub use commands::{AddTorrentParams, SessionState, SessionStatus, format_bytes_per_second};
pub use events::{EVENT_CHANNEL_CAPACITY, EngineEvent};
pub use handle::EngineHandle;
pub use snapshot::{EngineSnapshot, SNAPSHOT_VERSION, SnapshotError, TorrentSnapshot};
