//! Events flowing from peer transports to the coordinator

use crate::peer::Bitfield;
use crate::protocol::Message;

/// Coordinator-assigned identifier of a connection; never reused within a session
pub type PeerKey = u64;

/// Raised by a transport task
#[derive(Debug)]
pub struct PeerEvent {
    pub key: PeerKey,
    pub kind: PeerEventKind,
}

#[derive(Debug)]
pub enum PeerEventKind {
    /// TCP connection established, our handshake is about to go out
    Connected,
    /// Remote handshake arrived and matched our info hash
    Handshaken { peer_id: [u8; 20], extensions: bool },
    /// A framed message from the remote
    Message(Message),
    /// Socket error, timeout, handshake failure or remote close
    Disconnected { reason: String },
}

/// What a message means to the coordinator once the connection has applied it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerNotification {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// A newly announced piece
    Have(u32),
    /// Bitfield replaced; `previous` must be withdrawn from availability
    BitfieldReceived { previous: Bitfield },
    /// Remote asks us for a block
    Request { index: u32, offset: u32, length: u32 },
    Piece { index: u32, offset: u32, block: Vec<u8> },
}
