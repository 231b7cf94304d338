//! BitTorrent protocol module
//!
//! Implements the BitTorrent peer wire codec.

pub mod handshake;
pub mod message;
pub mod wire;

// Re-export main types
pub use handshake::{Handshake, HANDSHAKE_LEN, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::{next_message, BitTorrentWire, WireProtocol};
