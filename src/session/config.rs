//! Session policy and timing knobs

use std::time::Duration;

use crate::peer::TransportConfig;

/// Everything the coordinator needs to decide when and how much to do
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Port reported to trackers
    pub port: u16,
    /// Peers connected at start and after a fresh announce
    pub max_connections: usize,
    pub max_unchoked: usize,
    pub unchoke_interval: Duration,
    /// Re-announce period until a tracker suggests one
    pub announce_interval: Duration,
    /// Shortest gap between announces triggered by a peer shortfall
    pub min_announce_gap: Duration,
    /// Below this many connected peers, disconnects recruit replacements
    pub peer_floor: usize,
    /// New connections opened after a disconnect
    pub recruit_batch: usize,
    /// New connections opened on resume or after a tracker answer
    pub fresh_batch: usize,
    pub endgame_threshold: usize,
    pub max_pipeline: usize,
    /// Blocks queued when a piece is first assigned
    pub block_batch: usize,
    /// Blocks added after each arrival for a still-incomplete piece
    pub top_up_batch: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub keepalive_interval: Duration,
    pub resume_every_pieces: usize,
    pub resume_every: Duration,
    /// Wait after resume before re-issuing endgame requests
    pub endgame_grace: Duration,
    pub numwant: u32,
    pub udp_tracker_timeout: Duration,
    pub http_tracker_timeout: Duration,
    /// Largest block a remote may ask us for
    pub max_request_len: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: 6881,
            max_connections: 50,
            max_unchoked: 4,
            unchoke_interval: Duration::from_secs(30),
            announce_interval: Duration::from_secs(1800),
            min_announce_gap: Duration::from_secs(60),
            peer_floor: 50,
            recruit_batch: 20,
            fresh_batch: 50,
            endgame_threshold: 20,
            max_pipeline: 15,
            block_batch: 15,
            top_up_batch: 5,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(90),
            resume_every_pieces: 50,
            resume_every: Duration::from_secs(30),
            endgame_grace: Duration::from_secs(3),
            numwant: 50,
            udp_tracker_timeout: Duration::from_secs(5),
            http_tracker_timeout: Duration::from_secs(15),
            max_request_len: 128 * 1024,
        }
    }
}

impl SessionConfig {
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: self.connect_timeout,
            handshake_timeout: self.handshake_timeout,
            idle_timeout: self.idle_timeout,
            keepalive_interval: self.keepalive_interval,
        }
    }
}
