//! Multi-tracker announce with fall-through

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

#[cfg(feature = "http-tracker")]
use super::http::HttpTracker;
use super::response::{AnnounceRequest, AnnounceResponse};
use super::udp::UdpTracker;
use crate::error::TorrentError;

/// Source of peers for a session.
///
/// Never fails: a tracker outage is an empty response, and the session keeps
/// whatever peers it already has.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, req: &AnnounceRequest) -> AnnounceResponse;
}

/// Tries every tracker URL in order until one yields peers
pub struct TrackerClient {
    urls: Vec<String>,
    #[cfg(feature = "http-tracker")]
    http: HttpTracker,
    udp: UdpTracker,
}

impl TrackerClient {
    pub fn new(urls: Vec<String>, udp_timeout: Duration, http_timeout: Duration) -> Result<Self> {
        #[cfg(not(feature = "http-tracker"))]
        let _ = http_timeout;
        Ok(Self {
            urls,
            #[cfg(feature = "http-tracker")]
            http: HttpTracker::new(http_timeout)?,
            udp: UdpTracker::new(udp_timeout),
        })
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// First non-empty answer wins; every failure falls through to the next URL
    pub async fn get_peer_list(&self, req: &AnnounceRequest) -> AnnounceResponse {
        for url in &self.urls {
            match self.announce_one(url, req).await {
                Ok(response) if !response.peers.is_empty() => {
                    info!("Tracker {} returned {} peers", url, response.peers.len());
                    return response;
                }
                Ok(_) => warn!("Tracker {} returned no peers", url),
                Err(e) => warn!("Tracker {} failed: {:#}", url, e),
            }
        }
        debug!("No tracker produced peers ({} tried)", self.urls.len());
        AnnounceResponse::default()
    }

    async fn announce_one(&self, url: &str, req: &AnnounceRequest) -> Result<AnnounceResponse> {
        if url.starts_with("udp://") {
            return self.udp.announce(url, req).await;
        }
        #[cfg(feature = "http-tracker")]
        if url.starts_with("http://") || url.starts_with("https://") {
            return self.http.announce(url, req).await;
        }
        Err(TorrentError::tracker_error_with_url("Unsupported tracker scheme", url).into())
    }
}

#[async_trait]
impl Announcer for TrackerClient {
    async fn announce(&self, req: &AnnounceRequest) -> AnnounceResponse {
        self.get_peer_list(req).await
    }
}
