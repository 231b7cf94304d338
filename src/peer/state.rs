//! Peer state module
//!
//! Connection lifecycle, choke/interest flags and the remote's bitfield.

use std::net::SocketAddr;

/// Lifecycle of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// TCP connect in flight
    #[default]
    Connecting,
    /// Handshake sent, waiting for the remote's
    Handshaking,
    /// Handshake verified, messages flow
    Ready,
    /// Torn down; never reused
    Closed,
}

impl PeerState {
    pub fn is_ready(&self) -> bool {
        matches!(self, PeerState::Ready)
    }
}

/// One bit per piece, index 0 is the most significant bit of byte 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    num_pieces: usize,
}

impl Bitfield {
    /// Empty bitfield for `num_pieces` pieces
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bits: vec![0u8; num_pieces.div_ceil(8)],
            num_pieces,
        }
    }

    /// Adopt a wire bitfield; short input is zero-padded, spare bits are cleared
    pub fn from_bytes(bytes: &[u8], num_pieces: usize) -> Self {
        let mut bits = vec![0u8; num_pieces.div_ceil(8)];
        let n = bits.len().min(bytes.len());
        bits[..n].copy_from_slice(&bytes[..n]);
        let spare = bits.len() * 8 - num_pieces;
        if spare > 0 {
            if let Some(last) = bits.last_mut() {
                *last &= 0xFFu8 << spare;
            }
        }
        Self { bits, num_pieces }
    }

    /// Bitfield with exactly the given pieces set
    pub fn from_completed<I: IntoIterator<Item = u32>>(completed: I, num_pieces: usize) -> Self {
        let mut bitfield = Self::new(num_pieces);
        for index in completed {
            bitfield.set(index as usize);
        }
        bitfield
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Set a bit; returns false if it was already set or out of range
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.num_pieces || self.has(index) {
            return false;
        }
        self.bits[index / 8] |= 1 << (7 - index % 8);
        true
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    pub fn len(&self) -> usize {
        self.num_pieces
    }

    pub fn is_empty(&self) -> bool {
        self.num_pieces == 0
    }

    /// Indices of every set bit, ascending
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_pieces).filter(move |&i| self.has(i))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.clone()
    }
}

/// Per-connection flags and counters
#[derive(Debug, Clone)]
pub struct Peer {
    pub addr: SocketAddr,
    pub peer_id: Option<[u8; 20]>,
    pub state: PeerState,
    /// We're choking them
    pub am_choking: bool,
    /// We're interested
    pub am_interested: bool,
    /// They're choking us
    pub peer_choking: bool,
    /// They're interested
    pub peer_interested: bool,
    /// Remote extension protocol bit from the handshake
    pub supports_extensions: bool,
    pub bitfield: Bitfield,
    pub blocks_received: u64,
    pub bytes_uploaded: u64,
}

impl Peer {
    pub fn new(addr: SocketAddr, num_pieces: usize) -> Self {
        Self {
            addr,
            peer_id: None,
            state: PeerState::Connecting,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            supports_extensions: false,
            bitfield: Bitfield::new(num_pieces),
            blocks_received: 0,
            bytes_uploaded: 0,
        }
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has(index as usize)
    }

    /// Whether block requests may be sent now
    pub fn can_request(&self) -> bool {
        self.state.is_ready() && !self.peer_choking
    }

    pub fn peer_id_hex(&self) -> Option<String> {
        self.peer_id.map(hex::encode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitfield_msb_first() {
        let bitfield = Bitfield::from_bytes(&[0b1100_0000, 0b0000_0001], 16);
        assert!(bitfield.has(0));
        assert!(bitfield.has(1));
        assert!(!bitfield.has(2));
        assert!(bitfield.has(15));
        assert_eq!(bitfield.count(), 3);
        assert_eq!(bitfield.iter_set().collect::<Vec<_>>(), vec![0, 1, 15]);
    }

    #[test]
    fn test_bitfield_spare_bits_cleared() {
        let bitfield = Bitfield::from_bytes(&[0xFF, 0xFF, 0xFF], 10);
        assert_eq!(bitfield.to_bytes(), vec![0xFF, 0b1100_0000]);
        assert_eq!(bitfield.count(), 10);
        assert!(!bitfield.has(10));
    }

    #[test]
    fn test_bitfield_short_input_padded() {
        let bitfield = Bitfield::from_bytes(&[0x80], 20);
        assert_eq!(bitfield.to_bytes().len(), 3);
        assert!(bitfield.has(0));
        assert_eq!(bitfield.count(), 1);
    }

    #[test]
    fn test_bitfield_from_completed() {
        let bitfield = Bitfield::from_completed([0, 2, 9], 10);
        assert_eq!(bitfield.to_bytes(), vec![0b1010_0000, 0b0100_0000]);
    }

    #[test]
    fn test_bitfield_set() {
        let mut bitfield = Bitfield::new(4);
        assert!(bitfield.set(3));
        assert!(!bitfield.set(3));
        assert!(!bitfield.set(4));
        assert_eq!(bitfield.count(), 1);
    }

    #[test]
    fn test_peer_new() {
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let peer = Peer::new(addr, 8);

        assert_eq!(peer.state, PeerState::Connecting);
        assert!(peer.am_choking);
        assert!(peer.peer_choking);
        assert!(!peer.am_interested);
        assert!(!peer.can_request());
        assert_eq!(peer.bitfield.count(), 0);
    }

    #[test]
    fn test_can_request() {
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let mut peer = Peer::new(addr, 8);

        peer.state = PeerState::Ready;
        assert!(!peer.can_request());
        peer.peer_choking = false;
        assert!(peer.can_request());
    }
}
