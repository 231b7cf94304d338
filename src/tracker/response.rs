use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Announce event reported to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    None,
    Started,
    Stopped,
    Completed,
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }

    pub fn as_udp_id(&self) -> u32 {
        match self {
            TrackerEvent::None => 0,
            TrackerEvent::Completed => 1,
            TrackerEvent::Started => 2,
            TrackerEvent::Stopped => 3,
        }
    }
}

/// Everything a tracker needs to know about this session
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
    pub numwant: u32,
}

/// Peers and re-announce interval returned by a tracker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Tracker-suggested seconds between announces
    pub interval: Option<u32>,
    pub peers: Vec<SocketAddr>,
}

/// Parse the compact peer format: 4 bytes IPv4 plus 2 bytes big-endian port each.
///
/// Trailing bytes that do not form a whole entry and entries with port 0 are dropped.
pub fn parse_compact_peers(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .filter_map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            (port != 0).then(|| SocketAddr::new(IpAddr::V4(ip), port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact_peers() {
        let bytes = [127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x00, 0x50, 1, 2, 3];
        let peers = parse_compact_peers(&bytes);
        assert_eq!(peers, vec![
            "127.0.0.1:6881".parse::<SocketAddr>().unwrap(),
            "10.0.0.2:80".parse::<SocketAddr>().unwrap(),
        ]);
    }

    #[test]
    fn test_zero_port_dropped() {
        assert!(parse_compact_peers(&[1, 1, 1, 1, 0, 0]).is_empty());
    }

    #[test]
    fn test_event_ids() {
        assert_eq!(TrackerEvent::Started.as_udp_id(), 2);
        assert_eq!(TrackerEvent::Completed.as_str(), "completed");
        assert_eq!(TrackerEvent::None.as_str(), "");
    }
}
