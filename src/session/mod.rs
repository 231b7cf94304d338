//! Download sessions
//!
//! `TorrentSession` is the handle callers hold; the `Coordinator` behind it
//! runs as its own task and owns all per-torrent state.

pub mod commands;
pub mod config;
pub mod coordinator;
pub mod handle;
pub mod stats;

pub use config::SessionConfig;
pub use coordinator::{CompletionCallback, Coordinator};
pub use handle::TorrentSession;
pub use stats::{SessionState, SpeedMeter, TorrentStatus};
