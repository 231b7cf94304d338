//! bitleech
//!
//! A BitTorrent download engine: descriptor parsing, UDP/HTTP tracker
//! announces, the peer wire protocol, rarest-first piece selection with
//! endgame, SHA-1 verification and resumable multi-file storage.

pub mod bencode;
pub mod cli;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use error::TorrentError;

pub use cli::{CliArgs, Config, ProgressDisplay};
pub use peer::{Bitfield, PeerConnection, PeerState};
pub use protocol::{Handshake, Message, MessageId};
pub use session::{CompletionCallback, SessionConfig, SessionState, TorrentSession, TorrentStatus};
pub use storage::{FileManager, PieceManager};
pub use torrent::{TorrentInfo, TorrentParser};
pub use tracker::{AnnounceRequest, AnnounceResponse, Announcer, TrackerClient, TrackerEvent};
