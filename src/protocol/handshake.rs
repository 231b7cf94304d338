//! BitTorrent handshake protocol
//!
//! Handles the fixed 68-byte handshake exchanged before any other message.

use bytes::{BufMut, BytesMut};
use anyhow::Result;
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total size of a handshake on the wire
pub const HANDSHAKE_LEN: usize = 68;

/// Client prefix used for generated peer ids
pub const PEER_ID_PREFIX: &[u8; 8] = b"-BL0100-";

/// Reserved byte and bit that advertise extension protocol support
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

const PROTOCOL_ID: [u8; 19] = *b"BitTorrent protocol";

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol identifier (19 bytes)
    pub protocol_id: [u8; 19],
    /// Reserved bytes carrying extension bits
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create our handshake; it always advertises the extension protocol
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        debug!("Creating new handshake for info_hash: {}", hex::encode(info_hash));
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        Self {
            protocol_id: PROTOCOL_ID,
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Generate a random peer ID: fixed 8-byte client prefix plus 12 random bytes
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        info!("Generated new peer ID: {}", hex::encode(peer_id));
        peer_id
    }

    /// Whether the sender set the extension protocol bit
    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }

    /// Serialize the handshake to bytes
    pub fn serialize(&self) -> Vec<u8> {
        trace!("Serializing handshake");
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(&self.protocol_id);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.to_vec()
    }

    /// Deserialize a handshake from bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        trace!("Deserializing handshake from {} bytes", data.len());

        if data.len() < HANDSHAKE_LEN {
            error!("Handshake data too short: expected {} bytes, got {}", HANDSHAKE_LEN, data.len());
            return Err(TorrentError::protocol_error_with_source(
                "Handshake data too short",
                format!("expected {} bytes, got {}", HANDSHAKE_LEN, data.len()),
            )
            .into());
        }

        let protocol_length = data[0];
        if protocol_length != PROTOCOL_LENGTH {
            debug!("Invalid protocol length: expected {}, got {}", PROTOCOL_LENGTH, protocol_length);
            return Err(TorrentError::protocol_error_with_source(
                "Invalid protocol length",
                format!("expected {}, got {}", PROTOCOL_LENGTH, protocol_length),
            )
            .into());
        }

        if data[1..20] != PROTOCOL_ID {
            debug!("Invalid protocol string");
            return Err(TorrentError::protocol_error("Invalid protocol string").into());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        trace!(
            "Handshake info_hash: {}, peer_id: {}",
            hex::encode(info_hash),
            hex::encode(peer_id)
        );
        Ok(Self {
            protocol_id: PROTOCOL_ID,
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Validate the handshake against the session's info hash
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> bool {
        if self.info_hash != *expected_info_hash {
            warn!(
                "Handshake validation failed: info hash mismatch (expected {}, got {})",
                hex::encode(expected_info_hash),
                hex::encode(self.info_hash)
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_serialize_deserialize() {
        for _ in 0..8 {
            let info_hash: [u8; 20] = rand::random();
            let peer_id: [u8; 20] = rand::random();
            let handshake = Handshake::new(info_hash, peer_id);

            let serialized = handshake.serialize();
            assert_eq!(serialized.len(), 68);
            assert_eq!(serialized[0], 19);

            let deserialized = Handshake::deserialize(&serialized).unwrap();
            assert_eq!(deserialized.info_hash, info_hash);
            assert_eq!(deserialized.peer_id, peer_id);
        }
    }

    #[test]
    fn test_extension_bit_is_byte_five() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let serialized = handshake.serialize();
        assert_eq!(serialized[20 + 5], 0x10);
        assert!(Handshake::deserialize(&serialized).unwrap().supports_extensions());

        let mut plain = serialized.clone();
        plain[25] = 0;
        assert!(!Handshake::deserialize(&plain).unwrap().supports_extensions());
    }

    #[test]
    fn test_generate_peer_id() {
        let peer_id = Handshake::generate_peer_id();
        assert_eq!(&peer_id[..8], b"-BL0100-");
        assert_ne!(peer_id, Handshake::generate_peer_id());
    }

    #[test]
    fn test_handshake_validate() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(handshake.validate(&[1u8; 20]));
        assert!(!handshake.validate(&[3u8; 20]));
    }

    #[test]
    fn test_rejects_bad_prefix() {
        let mut data = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        data[0] = 18;
        assert!(Handshake::deserialize(&data).is_err());

        let mut data = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        data[1] = b'b';
        assert!(Handshake::deserialize(&data).is_err());

        assert!(Handshake::deserialize(&[19u8; 40]).is_err());
    }
}
