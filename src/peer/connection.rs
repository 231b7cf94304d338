//! Peer connection module
//!
//! Coordinator-side half of a connection: protocol state, the remote's
//! bitfield and the outgoing request pipeline. Bytes never pass through here;
//! outgoing messages are handed to the transport task over a channel.

use std::collections::VecDeque;
use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::peer::{Bitfield, Peer, PeerKey, PeerNotification, PeerState};
use crate::protocol::Message;

/// A block request, either queued or in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub index: u32,
    pub offset: u32,
    pub length: u32,
}

/// Represents a connected peer
pub struct PeerConnection {
    pub key: PeerKey,
    pub peer: Peer,
    outbound: mpsc::UnboundedSender<Message>,
    /// FIFO of requests not yet sent
    request_queue: VecDeque<BlockRequest>,
    /// Requests sent and not yet answered
    pending: Vec<BlockRequest>,
    max_pipeline: usize,
}

impl PeerConnection {
    pub fn new(
        key: PeerKey,
        addr: SocketAddr,
        num_pieces: usize,
        max_pipeline: usize,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            key,
            peer: Peer::new(addr, num_pieces),
            outbound,
            request_queue: VecDeque::new(),
            pending: Vec::new(),
            max_pipeline,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.peer.addr
    }

    pub fn is_ready(&self) -> bool {
        self.peer.state.is_ready()
    }

    /// Queued plus in-flight requests
    pub fn outstanding(&self) -> usize {
        self.request_queue.len() + self.pending.len()
    }

    pub fn has_work(&self) -> bool {
        self.outstanding() > 0
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    fn send(&self, message: Message) -> bool {
        trace!("-> {} {:?}", self.peer.addr, message.message_id());
        if self.outbound.send(message).is_err() {
            debug!("Transport for {} already gone", self.peer.addr);
            return false;
        }
        true
    }

    /// Socket is up; the handshake exchange is under way
    pub fn on_connected(&mut self) {
        if self.peer.state == PeerState::Connecting {
            self.peer.state = PeerState::Handshaking;
        }
    }

    /// Verified handshake: advertise what we have, then declare interest
    pub fn on_handshake(&mut self, peer_id: [u8; 20], extensions: bool, ours: &Bitfield) {
        self.peer.peer_id = Some(peer_id);
        self.peer.supports_extensions = extensions;
        self.peer.state = PeerState::Ready;
        debug!(
            "Handshake complete with {} ({})",
            self.peer.addr,
            self.peer.peer_id_hex().unwrap_or_default()
        );

        if ours.count() > 0 {
            self.send(Message::Bitfield { bitfield: ours.to_bytes() });
        }
        self.send(Message::Interested);
        self.peer.am_interested = true;
    }

    /// Whether a block is already queued or in flight on this connection
    pub fn is_requested(&self, index: u32, offset: u32) -> bool {
        self.request_queue
            .iter()
            .chain(self.pending.iter())
            .any(|r| r.index == index && r.offset == offset)
    }

    /// Queue a block and push the pipeline forward
    pub fn request_block(&mut self, index: u32, offset: u32, length: u32) {
        if self.is_requested(index, offset) {
            return;
        }
        self.request_queue.push_back(BlockRequest { index, offset, length });
        self.fill_pipeline();
    }

    /// Move queued requests onto the wire while the pipeline has room
    pub fn fill_pipeline(&mut self) {
        if !self.peer.can_request() {
            return;
        }
        while self.pending.len() < self.max_pipeline {
            let Some(request) = self.request_queue.pop_front() else {
                break;
            };
            if !self.send(Message::Request {
                index: request.index,
                begin: request.offset,
                length: request.length,
            }) {
                self.request_queue.push_front(request);
                break;
            }
            self.pending.push(request);
        }
    }

    /// Drop every request for a piece, sending `cancel` for those in flight
    pub fn cancel_piece(&mut self, index: u32) -> usize {
        let queued = self.request_queue.len();
        self.request_queue.retain(|r| r.index != index);
        let mut cancelled = queued - self.request_queue.len();

        let (dropped, kept): (Vec<_>, Vec<_>) = self.pending.drain(..).partition(|r| r.index == index);
        self.pending = kept;
        for request in dropped {
            self.send(Message::Cancel {
                index: request.index,
                begin: request.offset,
                length: request.length,
            });
            cancelled += 1;
        }
        if cancelled > 0 {
            debug!("Cancelled {} requests for piece {} on {}", cancelled, index, self.peer.addr);
        }
        self.fill_pipeline();
        cancelled
    }

    /// Apply a message to connection state and report what the coordinator must act on
    pub fn handle_message(&mut self, message: Message) -> Option<PeerNotification> {
        match message {
            Message::KeepAlive => None,
            Message::Choke => {
                self.peer.peer_choking = true;
                // in-flight requests are void; resend them first after unchoke
                for request in self.pending.drain(..).rev() {
                    self.request_queue.push_front(request);
                }
                Some(PeerNotification::Choke)
            }
            Message::Unchoke => {
                self.peer.peer_choking = false;
                self.fill_pipeline();
                Some(PeerNotification::Unchoke)
            }
            Message::Interested => {
                self.peer.peer_interested = true;
                Some(PeerNotification::Interested)
            }
            Message::NotInterested => {
                self.peer.peer_interested = false;
                Some(PeerNotification::NotInterested)
            }
            Message::Have { piece_index } => {
                if piece_index as usize >= self.peer.bitfield.len() {
                    warn!("{} announced out-of-range piece {}", self.peer.addr, piece_index);
                    return None;
                }
                self.peer
                    .bitfield
                    .set(piece_index as usize)
                    .then_some(PeerNotification::Have(piece_index))
            }
            Message::Bitfield { bitfield } => {
                let incoming = Bitfield::from_bytes(&bitfield, self.peer.bitfield.len());
                let previous = std::mem::replace(&mut self.peer.bitfield, incoming);
                debug!("{} has {}/{} pieces", self.peer.addr, self.peer.bitfield.count(), self.peer.bitfield.len());
                Some(PeerNotification::BitfieldReceived { previous })
            }
            Message::Request { index, begin, length } => Some(PeerNotification::Request {
                index,
                offset: begin,
                length,
            }),
            Message::Piece { index, begin, block } => {
                if let Some(pos) = self.pending.iter().position(|r| r.index == index && r.offset == begin) {
                    self.pending.remove(pos);
                } else {
                    trace!("Unsolicited block {}:{} from {}", index, begin, self.peer.addr);
                }
                self.peer.blocks_received += 1;
                self.fill_pipeline();
                Some(PeerNotification::Piece { index, offset: begin, block })
            }
            Message::Cancel { index, begin, .. } => {
                // requests are answered as they arrive, nothing is queued to withdraw
                trace!("{} cancelled {}:{}", self.peer.addr, index, begin);
                None
            }
            Message::Extension { id, .. } => {
                trace!("Ignoring extension message {} from {}", id, self.peer.addr);
                None
            }
        }
    }

    pub fn send_have(&self, index: u32) {
        self.send(Message::Have { piece_index: index });
    }

    pub fn send_piece(&mut self, index: u32, offset: u32, block: Vec<u8>) {
        let len = block.len() as u64;
        if self.send(Message::Piece { index, begin: offset, block }) {
            self.peer.bytes_uploaded += len;
        }
    }

    pub fn choke(&mut self) {
        if !self.peer.am_choking {
            self.peer.am_choking = true;
            self.send(Message::Choke);
        }
    }

    pub fn unchoke(&mut self) {
        if self.peer.am_choking {
            self.peer.am_choking = false;
            self.send(Message::Unchoke);
        }
    }

    pub fn send_not_interested(&mut self) {
        if self.peer.am_interested {
            self.peer.am_interested = false;
            self.send(Message::NotInterested);
        }
    }

    /// Forget all requests; dropping the connection afterwards ends the transport
    pub fn close(&mut self) {
        self.request_queue.clear();
        self.pending.clear();
        self.peer.state = PeerState::Closed;
        debug!("Closed connection to {}", self.peer.addr);
    }
}
