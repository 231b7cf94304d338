//! UDP tracker protocol
//!
//! Two request/response phases over a single socket: connect (16 bytes each
//! way) yields a connection id, announce (98 bytes out) yields the interval
//! and a compact peer list from byte 20 onward.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use url::Url;

use super::response::{parse_compact_peers, AnnounceRequest, AnnounceResponse};
use crate::error::TorrentError;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// Port assumed when a udp:// URL omits one
pub const DEFAULT_UDP_PORT: u16 = 6969;

pub const CONNECT_REQUEST_LEN: usize = 16;
pub const ANNOUNCE_REQUEST_LEN: usize = 98;

/// Build the 16-byte connect request
pub fn connect_request(transaction_id: u32) -> Vec<u8> {
    let mut request = Vec::with_capacity(CONNECT_REQUEST_LEN);
    request.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    request.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    request.extend_from_slice(&transaction_id.to_be_bytes());
    request
}

/// Extract the connection id, rejecting a wrong action or transaction id
pub fn parse_connect_response(buf: &[u8], transaction_id: u32) -> Result<u64> {
    if buf.len() < 16 {
        return Err(TorrentError::tracker_error(format!("connect response too short: {} bytes", buf.len())).into());
    }
    let action = read_u32(buf, 0);
    let tid = read_u32(buf, 4);
    if tid != transaction_id {
        return Err(TorrentError::tracker_error(format!(
            "transaction id mismatch: sent {:#010x}, got {:#010x}",
            transaction_id, tid
        ))
        .into());
    }
    if action != ACTION_CONNECT {
        return Err(TorrentError::tracker_error(format!("unexpected connect action {}", action)).into());
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&buf[8..16]);
    Ok(u64::from_be_bytes(id))
}

/// Build the 98-byte announce request
pub fn announce_request(connection_id: u64, transaction_id: u32, key: u32, req: &AnnounceRequest) -> Vec<u8> {
    let mut request = Vec::with_capacity(ANNOUNCE_REQUEST_LEN);
    request.extend_from_slice(&connection_id.to_be_bytes());
    request.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    request.extend_from_slice(&transaction_id.to_be_bytes());
    request.extend_from_slice(&req.info_hash);
    request.extend_from_slice(&req.peer_id);
    request.extend_from_slice(&req.downloaded.to_be_bytes());
    request.extend_from_slice(&req.left.to_be_bytes());
    request.extend_from_slice(&req.uploaded.to_be_bytes());
    request.extend_from_slice(&req.event.as_udp_id().to_be_bytes());
    request.extend_from_slice(&0u32.to_be_bytes()); // ip: let the tracker use the source address
    request.extend_from_slice(&key.to_be_bytes());
    request.extend_from_slice(&req.numwant.to_be_bytes());
    request.extend_from_slice(&req.port.to_be_bytes());
    request
}

/// Decode an announce response; action 3 carries the tracker's error text
pub fn parse_announce_response(buf: &[u8], transaction_id: u32) -> Result<AnnounceResponse> {
    if buf.len() < 8 {
        return Err(TorrentError::tracker_error(format!("announce response too short: {} bytes", buf.len())).into());
    }
    let action = read_u32(buf, 0);
    let tid = read_u32(buf, 4);
    if tid != transaction_id {
        return Err(TorrentError::tracker_error("announce transaction id mismatch").into());
    }
    if action == ACTION_ERROR {
        let message = String::from_utf8_lossy(&buf[8..]).into_owned();
        return Err(TorrentError::tracker_error(format!("tracker error: {}", message)).into());
    }
    if action != ACTION_ANNOUNCE || buf.len() < 20 {
        return Err(TorrentError::tracker_error(format!(
            "malformed announce response (action {}, {} bytes)",
            action,
            buf.len()
        ))
        .into());
    }

    let interval = read_u32(buf, 8);
    let leechers = read_u32(buf, 12);
    let seeders = read_u32(buf, 16);
    let peers = parse_compact_peers(&buf[20..]);
    debug!(
        "UDP announce: interval {}s, {} seeders, {} leechers, {} peers",
        interval,
        seeders,
        leechers,
        peers.len()
    );

    Ok(AnnounceResponse {
        interval: (interval > 0).then_some(interval),
        peers,
    })
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Resolve a udp:// announce URL to an IPv4 socket address
pub async fn resolve(url: &str) -> Result<SocketAddr> {
    let parsed = Url::parse(url)
        .map_err(|e| TorrentError::tracker_error_full("Invalid tracker URL", url, e.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| TorrentError::tracker_error_with_url("Tracker URL has no host", url))?;
    let port = parsed.port().unwrap_or(DEFAULT_UDP_PORT);

    let addr = lookup_host((host, port))
        .await
        .map_err(|e| TorrentError::tracker_error_full("Failed to resolve tracker", url, e.to_string()))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| TorrentError::tracker_error_with_url("Tracker has no IPv4 address", url))?;
    Ok(addr)
}

/// UDP tracker client; every phase is bounded by `phase_timeout`
#[derive(Debug, Clone)]
pub struct UdpTracker {
    phase_timeout: Duration,
}

impl UdpTracker {
    pub fn new(phase_timeout: Duration) -> Self {
        Self { phase_timeout }
    }

    pub async fn announce(&self, url: &str, req: &AnnounceRequest) -> Result<AnnounceResponse> {
        let addr = resolve(url).await?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;
        debug!("UDP tracker {} resolved to {}", url, addr);

        let transaction_id: u32 = rand::random();
        let response = self.exchange(&socket, &connect_request(transaction_id)).await?;
        let connection_id = parse_connect_response(&response, transaction_id)
            .map_err(|e| TorrentError::tracker_error_full("Connect failed", url, e.to_string()))?;
        trace!("UDP tracker connection id {:#018x}", connection_id);

        let transaction_id: u32 = rand::random();
        let key: u32 = rand::random();
        let packet = announce_request(connection_id, transaction_id, key, req);
        let response = self.exchange(&socket, &packet).await?;
        parse_announce_response(&response, transaction_id)
            .map_err(|e| TorrentError::tracker_error_full("Announce failed", url, e.to_string()).into())
    }

    async fn exchange(&self, socket: &UdpSocket, packet: &[u8]) -> Result<Vec<u8>> {
        socket.send(packet).await?;
        let mut buf = vec![0u8; 2048];
        let n = match timeout(self.phase_timeout, socket.recv(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => {
                warn!("UDP tracker did not answer within {:?}", self.phase_timeout);
                return Err(TorrentError::network_error("UDP tracker timed out").into());
            }
        };
        buf.truncate(n);
        Ok(buf)
    }
}
