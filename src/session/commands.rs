//! Messages accepted by the coordinator task

use std::net::SocketAddr;

use anyhow::Result;
use tokio::sync::oneshot;

use super::stats::TorrentStatus;

/// Requests from a `TorrentSession` handle; each carries its reply channel
pub enum Command {
    Pause {
        responder: oneshot::Sender<Result<()>>,
    },
    Resume {
        responder: oneshot::Sender<Result<()>>,
    },
    Status {
        responder: oneshot::Sender<TorrentStatus>,
    },
    /// Shut down, then delete either the whole output folder or just the resume record
    Remove {
        delete_data: bool,
        responder: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        responder: oneshot::Sender<()>,
    },
}

/// Posted back to the coordinator by tasks it spawned
#[derive(Debug)]
pub enum Internal {
    /// A tracker round finished; `peers` may be empty
    PeersDiscovered {
        peers: Vec<SocketAddr>,
        interval: Option<u32>,
    },
    /// Grace period after resume elapsed; ignored if `epoch` is stale
    EndgameKick { epoch: u64 },
}
