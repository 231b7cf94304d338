//! Peer module
//!
//! Per-peer protocol state driven by the coordinator, plus the transport task
//! that owns each socket.

pub mod connection;
pub mod event;
pub mod state;
pub mod transport;

pub use connection::{BlockRequest, PeerConnection};
pub use event::{PeerEvent, PeerEventKind, PeerKey, PeerNotification};
pub use state::{Bitfield, Peer, PeerState};
pub use transport::{spawn_transport, LocalIdentity, TransportConfig};
