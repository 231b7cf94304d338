//! Socket side of a peer connection
//!
//! One spawned task per peer owns the `TcpStream`. It connects, exchanges
//! handshakes, then shuttles framed messages between the socket and the
//! coordinator until either side gives up. Every exit is reported as a
//! single `Disconnected` event.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout, Instant};
use tracing::{debug, trace};

use crate::error::TorrentError;
use crate::peer::{PeerEvent, PeerEventKind, PeerKey};
use crate::protocol::{next_message, BitTorrentWire, Handshake, Message, WireProtocol};

/// Timing knobs for a single transport
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Close the connection after this long without inbound bytes
    pub idle_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(90),
        }
    }
}

/// Identity presented in our handshake
#[derive(Debug, Clone, Copy)]
pub struct LocalIdentity {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

/// Spawn the transport task for `addr`.
///
/// Returns the sender the coordinator writes outgoing messages to. Dropping
/// it closes the connection.
pub fn spawn_transport(
    key: PeerKey,
    addr: SocketAddr,
    identity: LocalIdentity,
    config: TransportConfig,
    events: mpsc::UnboundedSender<PeerEvent>,
) -> (mpsc::UnboundedSender<Message>, JoinHandle<()>) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let reason = match run(key, addr, identity, config, outbound_rx, &events).await {
            Ok(()) => "closed locally".to_string(),
            Err(e) => e.to_string(),
        };
        debug!("Peer {} disconnected: {}", addr, reason);
        let _ = events.send(PeerEvent {
            key,
            kind: PeerEventKind::Disconnected { reason },
        });
    });
    (outbound_tx, handle)
}

async fn run(
    key: PeerKey,
    addr: SocketAddr,
    identity: LocalIdentity,
    config: TransportConfig,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: &mpsc::UnboundedSender<PeerEvent>,
) -> Result<()> {
    let mut stream = timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TorrentError::network_error_full("Connection timeout", addr.to_string(), "connect"))?
        .map_err(|e| TorrentError::network_error_full("Failed to connect", addr.to_string(), e.to_string()))?;
    trace!("TCP connected to {}", addr);
    let _ = events.send(PeerEvent {
        key,
        kind: PeerEventKind::Connected,
    });

    let mut wire = BitTorrentWire;
    let ours = Handshake::new(identity.info_hash, identity.peer_id);
    let theirs = timeout(config.handshake_timeout, async {
        wire.write_handshake(&mut stream, &ours).await?;
        let theirs = wire.read_handshake(&mut stream).await?;
        Ok::<_, anyhow::Error>(theirs)
    })
    .await
    .map_err(|_| TorrentError::peer_error_full("Handshake timeout", addr.to_string(), "handshake"))?
    .map_err(|e| TorrentError::peer_error_full("Handshake failed", addr.to_string(), e.to_string()))?;

    if !theirs.validate(&identity.info_hash) {
        return Err(TorrentError::peer_error_with_peer("Info hash mismatch", addr.to_string()).into());
    }
    let _ = events.send(PeerEvent {
        key,
        kind: PeerEventKind::Handshaken {
            peer_id: theirs.peer_id,
            extensions: theirs.supports_extensions(),
        },
    });

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut keepalive = interval_at(Instant::now() + config.keepalive_interval, config.keepalive_interval);
    let mut idle_deadline = Instant::now() + config.idle_timeout;

    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else {
                    return Ok(());
                };
                wire.write_message(&mut writer, &message).await?;
                keepalive.reset();
            }
            read = reader.read_buf(&mut buf) => {
                if read? == 0 {
                    return Err(TorrentError::peer_error_with_peer("Connection closed by peer", addr.to_string()).into());
                }
                idle_deadline = Instant::now() + config.idle_timeout;
                while let Some(message) = next_message(&mut buf)? {
                    trace!("<- {} {:?}", addr, message.message_id());
                    if events.send(PeerEvent { key, kind: PeerEventKind::Message(message) }).is_err() {
                        return Ok(());
                    }
                }
            }
            _ = keepalive.tick() => {
                wire.write_message(&mut writer, &Message::KeepAlive).await?;
            }
            _ = sleep_until(idle_deadline) => {
                return Err(TorrentError::peer_error_with_peer("Idle timeout", addr.to_string()).into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const INFO_HASH: [u8; 20] = [3u8; 20];

    fn identity() -> LocalIdentity {
        LocalIdentity { info_hash: INFO_HASH, peer_id: [1u8; 20] }
    }

    #[tokio::test]
    async fn test_handshake_then_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut wire = BitTorrentWire;
            let theirs = wire.read_handshake(&mut socket).await.unwrap();
            assert_eq!(theirs.info_hash, INFO_HASH);
            wire.write_handshake(&mut socket, &Handshake::new(INFO_HASH, [2u8; 20])).await.unwrap();
            // bitfield split across two writes
            let bytes = Message::Bitfield { bitfield: vec![0xC0] }.serialize();
            socket.write_all(&bytes[..3]).await.unwrap();
            socket.flush().await.unwrap();
            socket.write_all(&bytes[3..]).await.unwrap();
            let mut sink = [0u8; 64];
            let n = socket.read(&mut sink).await.unwrap();
            assert_eq!(&sink[..n], &Message::Interested.serialize()[..]);
        });

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (outbound, _handle) = spawn_transport(7, addr, identity(), TransportConfig::default(), events_tx);

        let event = events_rx.recv().await.unwrap();
        assert_eq!(event.key, 7);
        assert!(matches!(event.kind, PeerEventKind::Connected));

        let event = events_rx.recv().await.unwrap();
        assert_eq!(event.key, 7);
        assert!(matches!(event.kind, PeerEventKind::Handshaken { peer_id, .. } if peer_id == [2u8; 20]));

        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event.kind, PeerEventKind::Message(Message::Bitfield { ref bitfield }) if bitfield == &vec![0xC0]));

        outbound.send(Message::Interested).unwrap();
        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event.kind, PeerEventKind::Disconnected { .. }));
    }

    #[tokio::test]
    async fn test_info_hash_mismatch_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut wire = BitTorrentWire;
            wire.read_handshake(&mut socket).await.unwrap();
            wire.write_handshake(&mut socket, &Handshake::new([9u8; 20], [2u8; 20])).await.unwrap();
            let mut sink = [0u8; 8];
            let _ = socket.read(&mut sink).await;
        });

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (_outbound, _handle) = spawn_transport(1, addr, identity(), TransportConfig::default(), events_tx);
        assert!(matches!(events_rx.recv().await.unwrap().kind, PeerEventKind::Connected));
        match events_rx.recv().await.unwrap().kind {
            PeerEventKind::Disconnected { reason } => assert!(reason.contains("Info hash mismatch")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refused_connection_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (_outbound, _handle) = spawn_transport(2, addr, identity(), TransportConfig::default(), events_tx);
        let event = events_rx.recv().await.unwrap();
        assert_eq!(event.key, 2);
        assert!(matches!(event.kind, PeerEventKind::Disconnected { .. }));
    }
}
