//! HTTP tracker protocol
//!
//! A GET announce with percent-encoded binary `info_hash`/`peer_id` and a
//! bencoded dictionary in the body.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use tracing::{debug, trace};
use urlencoding::encode_binary;

use super::response::{parse_compact_peers, AnnounceRequest, AnnounceResponse};
use crate::bencode::{self, Value};
use crate::error::TorrentError;

#[derive(Debug, Clone)]
pub struct HttpTracker {
    client: Client,
}

impl HttpTracker {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TorrentError::config_error(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub async fn announce(&self, url: &str, req: &AnnounceRequest) -> Result<AnnounceResponse> {
        let full_url = announce_url(url, req);
        trace!("HTTP announce: {}", full_url);

        let response = self.client.get(&full_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TorrentError::tracker_error_with_url(format!("HTTP status {}", status), url).into());
        }
        let body = response.bytes().await?;
        parse_announce_body(url, &body)
    }
}

/// Append the announce query to `base`, respecting any query it already has
pub fn announce_url(base: &str, req: &AnnounceRequest) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
        base,
        separator,
        encode_binary(&req.info_hash),
        encode_binary(&req.peer_id),
        req.port,
        req.uploaded,
        req.downloaded,
        req.left,
        req.numwant
    );
    let event = req.event.as_str();
    if !event.is_empty() {
        url.push_str("&event=");
        url.push_str(event);
    }
    url
}

/// Decode a tracker response body into peers and interval
pub fn parse_announce_body(url: &str, body: &[u8]) -> Result<AnnounceResponse> {
    let (value, _) = bencode::decode(body, 0)
        .map_err(|e| TorrentError::tracker_error_full("Malformed tracker response", url, e.to_string()))?;
    if value.as_dict().is_none() {
        return Err(TorrentError::tracker_error_with_url("Tracker response is not a dictionary", url).into());
    }

    if let Some(reason) = value.get("failure reason") {
        let reason = reason.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned()).unwrap_or_default();
        return Err(TorrentError::tracker_error_full("Tracker refused announce", url, reason).into());
    }

    let interval = value
        .get("interval")
        .and_then(Value::as_int)
        .and_then(|i| u32::try_from(i).ok())
        .filter(|i| *i > 0);

    let peers = match value.get("peers") {
        Some(Value::Bytes(compact)) => parse_compact_peers(compact),
        Some(Value::List(entries)) => entries.iter().filter_map(dict_peer).collect(),
        _ => Vec::new(),
    };
    if peers.is_empty() {
        return Err(TorrentError::tracker_error_with_url("Tracker returned no peers", url).into());
    }

    debug!("HTTP tracker {} returned {} peers (interval {:?})", url, peers.len(), interval);
    Ok(AnnounceResponse { interval, peers })
}

/// Non-compact form: a dictionary with `ip` and `port`
fn dict_peer(entry: &Value) -> Option<SocketAddr> {
    let ip: IpAddr = entry.get("ip")?.as_str()?.parse().ok()?;
    let port = u16::try_from(entry.get("port")?.as_int()?).ok()?;
    (ip.is_ipv4() && port != 0).then(|| SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackerEvent;

    fn request(event: TrackerEvent) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [0x12; 20],
            peer_id: *b"-BL0100-abcdefghijkl",
            port: 6881,
            uploaded: 0,
            downloaded: 10,
            left: 20,
            event,
            numwant: 50,
        }
    }

    #[test]
    fn test_announce_url_encodes_raw_bytes() {
        let url = announce_url("http://t.local/announce", &request(TrackerEvent::Started));
        assert!(url.starts_with("http://t.local/announce?info_hash=%12%12"));
        assert!(url.contains("&peer_id=-BL0100-abcdefghijkl"));
        assert!(url.contains("&compact=1&numwant=50"));
        assert!(url.ends_with("&event=started"));
    }

    #[test]
    fn test_announce_url_existing_query() {
        let url = announce_url("http://t.local/announce?passkey=x", &request(TrackerEvent::None));
        assert!(url.starts_with("http://t.local/announce?passkey=x&info_hash="));
        assert!(!url.contains("event="));
    }

    #[test]
    fn test_parse_compact_body() {
        let mut body = b"d8:intervali1800e5:peers6:".to_vec();
        body.extend_from_slice(&[192, 168, 1, 2, 0x1A, 0xE1]);
        body.push(b'e');
        let parsed = parse_announce_body("http://t", &body).unwrap();
        assert_eq!(parsed.interval, Some(1800));
        assert_eq!(parsed.peers, vec!["192.168.1.2:6881".parse().unwrap()]);
    }

    #[test]
    fn test_parse_dict_peers() {
        let body = b"d5:peersld2:ip8:10.0.0.74:porti51413eeee";
        let parsed = parse_announce_body("http://t", body).unwrap();
        assert_eq!(parsed.interval, None);
        assert_eq!(parsed.peers, vec!["10.0.0.7:51413".parse().unwrap()]);
    }

    #[test]
    fn test_failure_reason_and_empty_peers_fail() {
        let err = parse_announce_body("http://t", b"d14:failure reason9:not founde").unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert!(parse_announce_body("http://t", b"d8:intervali60e5:peers0:e").is_err());
        assert!(parse_announce_body("http://t", b"li1ee").is_err());
    }
}
