//! Wire protocol utilities
//!
//! Stream helpers for the handshake and the rolling-buffer message framer used
//! by peer transports. TCP reads arrive in arbitrary chunks; bytes accumulate in
//! a `BytesMut` and a message is only cut once `4 + length` bytes are present.

use bytes::BytesMut;
use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use super::handshake::HANDSHAKE_LEN;
use super::{Handshake, Message};
use crate::error::TorrentError;

/// Upper bound on a single framed message
pub const MAX_MESSAGE_LEN: usize = 1 << 21;

/// WireProtocol trait for protocol utilities
#[allow(async_fn_in_trait)]
pub trait WireProtocol {
    /// Write a message to the stream
    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()>;

    /// Read a handshake from the stream
    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake>;

    /// Write a handshake to the stream
    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()>;
}

/// Default implementation of WireProtocol
pub struct BitTorrentWire;

impl WireProtocol for BitTorrentWire {
    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()> {
        writer.write_all(&message.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads exactly one handshake; the remote's first bytes must have this shape
    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader.read_exact(&mut buf).await?;
        Handshake::deserialize(&buf)
    }

    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()> {
        writer.write_all(&handshake.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Cut the next complete message off the front of `buf`.
///
/// Returns `Ok(None)` while the message is still incomplete, leaving the bytes
/// buffered for the next read.
pub fn next_message(buf: &mut BytesMut) -> Result<Option<Message>> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length > MAX_MESSAGE_LEN {
        return Err(TorrentError::protocol_error_with_source(
            "Message too large",
            format!("{} bytes exceeds {}", length, MAX_MESSAGE_LEN),
        )
        .into());
    }

    if buf.len() < 4 + length {
        trace!("Buffered {} of {} bytes for next message", buf.len(), 4 + length);
        return Ok(None);
    }

    let frame = buf.split_to(4 + length);
    let message = Message::deserialize(&frame)?;
    Ok(Some(message))
}
