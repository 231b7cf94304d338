//! Public handle to a running download

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::TorrentError;
use crate::session::commands::Command;
use crate::session::config::SessionConfig;
use crate::session::coordinator::{CompletionCallback, Coordinator};
use crate::session::stats::TorrentStatus;
use crate::torrent::{TorrentInfo, TorrentParser};
use crate::tracker::{Announcer, TrackerClient};

/// Controls one torrent's coordinator task.
///
/// Cloning is cheap; the task keeps running until `shutdown` or `remove` is
/// called or every clone is dropped.
#[derive(Clone)]
pub struct TorrentSession {
    name: String,
    info_hash: [u8; 20],
    sender: mpsc::UnboundedSender<Command>,
}

impl TorrentSession {
    /// Load `descriptor`, open the output under `destination` and start downloading.
    ///
    /// Fails only if the descriptor cannot be read or parsed, or the output
    /// files cannot be created. Later problems are logged by the session.
    pub async fn start(
        descriptor: &Path,
        destination: &Path,
        config: SessionConfig,
        on_complete: Option<CompletionCallback>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let info = TorrentParser::parse_file(descriptor)?;
        let trackers = TrackerClient::new(info.tracker_urls(), config.udp_tracker_timeout, config.http_tracker_timeout)?;
        Self::start_with(info, destination, config, Arc::new(trackers), on_complete).await
    }

    /// Start from an already parsed descriptor with a caller-supplied announcer
    pub async fn start_with(
        info: TorrentInfo,
        destination: &Path,
        config: SessionConfig,
        announcer: Arc<dyn Announcer>,
        on_complete: Option<CompletionCallback>,
    ) -> Result<(Self, JoinHandle<()>)> {
        info!(
            "Starting {} ({} bytes, {} pieces, info hash {})",
            info.name,
            info.total_size(),
            info.piece_count(),
            info.info_hash_hex()
        );
        let name = info.name.clone();
        let info_hash = info.info_hash;
        let (coordinator, inbox) = Coordinator::new(info, destination, config, announcer, on_complete).await?;

        let (sender, commands) = mpsc::unbounded_channel();
        let task = tokio::spawn(coordinator.run(inbox, commands));
        Ok((Self { name, info_hash, sender }, task))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    /// Drop every peer and stop requesting; verified pieces are persisted
    pub async fn pause(&self) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.send(Command::Pause { responder })?;
        rx.await.map_err(|_| closed())?
    }

    /// Reconnect and announce again after `pause`
    pub async fn resume(&self) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.send(Command::Resume { responder })?;
        rx.await.map_err(|_| closed())?
    }

    pub async fn status(&self) -> Result<TorrentStatus> {
        let (responder, rx) = oneshot::channel();
        self.send(Command::Status { responder })?;
        Ok(rx.await.map_err(|_| closed())?)
    }

    /// Stop the session, then delete the downloaded data or only the resume record
    pub async fn remove(&self, delete_data: bool) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.send(Command::Remove { delete_data, responder })?;
        rx.await.map_err(|_| closed())?
    }

    /// Stop the session, keeping data and resume record
    pub async fn shutdown(&self) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.send(Command::Shutdown { responder })?;
        Ok(rx.await.map_err(|_| closed())?)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.sender.send(command).map_err(|_| closed())?;
        Ok(())
    }
}

fn closed() -> anyhow::Error {
    TorrentError::session_error("session is no longer running").into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::torrent::parser::tests::single_file_torrent;
    use crate::tracker::{AnnounceRequest, AnnounceResponse};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Silent;

    #[async_trait]
    impl Announcer for Silent {
        async fn announce(&self, _req: &AnnounceRequest) -> AnnounceResponse {
            AnnounceResponse::default()
        }
    }

    async fn session(dir: &TempDir) -> (TorrentSession, JoinHandle<()>) {
        let bytes = single_file_torrent("clip.bin", 16384, &[5u8; 40000]);
        let info = TorrentParser::parse_bytes(&bytes).unwrap();
        TorrentSession::start_with(info, dir.path(), SessionConfig::default(), Arc::new(Silent), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_descriptor_is_fatal() {
        let dir = TempDir::new().unwrap();
        let result = TorrentSession::start(&dir.path().join("nope.torrent"), dir.path(), SessionConfig::default(), None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_commands_round_trip() {
        let dir = TempDir::new().unwrap();
        let (session, task) = session(&dir).await;
        assert_eq!(session.name(), "clip.bin");

        let status = session.status().await.unwrap();
        assert_eq!(status.state, SessionState::Active);
        assert_eq!(status.total, 40000);
        assert_eq!(status.total_pieces, 3);

        session.pause().await.unwrap();
        assert_eq!(session.status().await.unwrap().state, SessionState::Paused);
        session.resume().await.unwrap();
        assert_eq!(session.status().await.unwrap().state, SessionState::Active);

        session.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(session.status().await.is_err());
        assert!(dir.path().join("clip").join("clip.bin").exists());
    }

    #[tokio::test]
    async fn test_remove_deletes_data() {
        let dir = TempDir::new().unwrap();
        let (session, task) = session(&dir).await;
        session.remove(true).await.unwrap();
        task.await.unwrap();
        assert!(!dir.path().join("clip").exists());
    }
}
