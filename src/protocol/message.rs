//! BitTorrent protocol messages
//!
//! Defines the length-prefixed messages exchanged after the handshake.

use bytes::{Buf, BufMut, BytesMut};
use anyhow::Result;
use tracing::{debug, error, trace};

use crate::error::TorrentError;

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Extension = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            20 => Ok(MessageId::Extension),
            _ => {
                error!("Invalid message ID: {}", value);
                Err(TorrentError::protocol_error_with_source(
                    "Invalid message ID",
                    format!("value: {}", value)
                ).into())
            }
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    /// Extension protocol message; only carried, never interpreted
    Extension { id: u8, payload: Vec<u8> },
}

impl Message {
    /// Get the message ID (returns None for KeepAlive)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Extension { .. } => Some(MessageId::Extension),
            Message::KeepAlive => None,
        }
    }

    /// Get the message length (excluding the length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Extension { payload, .. } => 2 + payload.len() as u32,
        }
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Vec<u8> {
        trace!("Serializing message: {:?}", self.message_id());
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());

        if let Some(id) = self.message_id() {
            buf.put_u8(id as u8);
        }

        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have { piece_index } => {
                buf.put_u32(*piece_index);
            }
            Message::Bitfield { bitfield } => {
                buf.put_slice(bitfield);
            }
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Extension { id, payload } => {
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }

        buf.to_vec()
    }

    /// Deserialize a message from bytes (including length prefix)
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        trace!("Deserializing message from {} bytes", data.len());
        let mut buf = data;

        if buf.remaining() < 4 {
            return Err(TorrentError::protocol_error_with_source(
                "Message too short",
                "missing length prefix"
            ).into());
        }

        let length = buf.get_u32() as usize;
        if length == 0 {
            trace!("Received KeepAlive message");
            return Ok(Message::KeepAlive);
        }
        if buf.remaining() < length {
            return Err(TorrentError::protocol_error_with_source(
                "Message truncated",
                format!("declared {} bytes, got {}", length, buf.remaining())
            ).into());
        }
        let mut buf = &buf[..length];

        let message_id = MessageId::try_from(buf.get_u8())?;
        let need = |n: usize, what: &str, buf: &[u8]| -> Result<()> {
            if buf.len() < n {
                return Err(TorrentError::protocol_error_with_source(
                    format!("{} message too short", what),
                    format!("expected {} bytes, got {}", n, buf.len())
                ).into());
            }
            Ok(())
        };

        let message = match message_id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                need(4, "Have", buf)?;
                Message::Have { piece_index: buf.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: buf.to_vec() },
            MessageId::Request => {
                need(12, "Request", buf)?;
                Message::Request { index: buf.get_u32(), begin: buf.get_u32(), length: buf.get_u32() }
            }
            MessageId::Piece => {
                need(8, "Piece", buf)?;
                let index = buf.get_u32();
                let begin = buf.get_u32();
                Message::Piece { index, begin, block: buf.to_vec() }
            }
            MessageId::Cancel => {
                need(12, "Cancel", buf)?;
                Message::Cancel { index: buf.get_u32(), begin: buf.get_u32(), length: buf.get_u32() }
            }
            MessageId::Extension => {
                need(1, "Extension", buf)?;
                let id = buf.get_u8();
                Message::Extension { id, payload: buf.to_vec() }
            }
        };

        debug!("Decoded {:?} message ({} bytes)", message_id, length);
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) -> Message {
        Message::deserialize(&message.serialize()).unwrap()
    }

    #[test]
    fn test_keepalive_is_four_zero_bytes() {
        assert_eq!(Message::KeepAlive.serialize(), vec![0, 0, 0, 0]);
        assert_eq!(round_trip(Message::KeepAlive), Message::KeepAlive);
    }

    #[test]
    fn test_framing_recovers_fields() {
        let messages = vec![
            Message::Choke,
            Message::Interested,
            Message::Have { piece_index: 42 },
            Message::Bitfield { bitfield: vec![0b1010_0000, 0xff] },
            Message::Request { index: 1, begin: 16384, length: 16384 },
            Message::Piece { index: 10, begin: 32768, block: vec![1, 2, 3, 4, 5] },
            Message::Cancel { index: 7, begin: 0, length: 9 },
            Message::Extension { id: 0, payload: b"d1:mdee".to_vec() },
        ];
        for message in messages {
            assert_eq!(round_trip(message.clone()), message);
        }
    }

    #[test]
    fn test_request_wire_layout() {
        let bytes = Message::Request { index: 1, begin: 2, length: 3 }.serialize();
        assert_eq!(bytes, vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]);
    }

    #[test]
    fn test_message_length() {
        assert_eq!(Message::KeepAlive.length(), 0);
        assert_eq!(Message::Choke.length(), 1);
        assert_eq!(Message::Have { piece_index: 0 }.length(), 5);
        assert_eq!(Message::Request { index: 0, begin: 0, length: 0 }.length(), 13);
        assert_eq!(Message::Piece { index: 0, begin: 0, block: vec![1, 2, 3] }.length(), 12);
        assert_eq!(Message::Extension { id: 1, payload: vec![9] }.length(), 3);
    }

    #[test]
    fn test_short_payloads_rejected() {
        assert!(Message::deserialize(&[0, 0, 0, 3, 4, 0, 0]).is_err());
        assert!(Message::deserialize(&[0, 0, 0, 5, 6, 0, 0, 0, 1]).is_err());
        assert!(Message::deserialize(&[0, 0, 0, 9, 7]).is_err());
    }

    #[test]
    fn test_message_id_from_u8() {
        assert_eq!(MessageId::try_from(0).unwrap(), MessageId::Choke);
        assert_eq!(MessageId::try_from(8).unwrap(), MessageId::Cancel);
        assert_eq!(MessageId::try_from(20).unwrap(), MessageId::Extension);
        assert!(MessageId::try_from(9).is_err());
        assert!(MessageId::try_from(13).is_err());
    }
}
