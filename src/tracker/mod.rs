//! Tracker clients
//!
//! Resolves an announce URL plus session counters into a peer list over the
//! HTTP (bencoded) or UDP (binary connect/announce) tracker protocols.

pub mod client;
#[cfg(feature = "http-tracker")]
pub mod http;
pub mod response;
pub mod udp;

pub use client::{Announcer, TrackerClient};
#[cfg(feature = "http-tracker")]
pub use http::HttpTracker;
pub use response::{parse_compact_peers, AnnounceRequest, AnnounceResponse, TrackerEvent};
pub use udp::UdpTracker;
