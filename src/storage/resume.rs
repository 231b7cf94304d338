//! Resume module
//!
//! Persists the set of verified piece indices as a JSON array next to the
//! downloaded data, so a restarted session skips pieces it already has.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tokio::fs;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::TorrentError;

/// File name of the sidecar inside the torrent's output folder
pub const RESUME_FILE_NAME: &str = ".resume.json";

/// Throttled writer for the resume sidecar
#[derive(Debug)]
pub struct ResumeStore {
    path: PathBuf,
    every_pieces: usize,
    every: Duration,
    unsaved: usize,
    last_write: Instant,
}

impl ResumeStore {
    /// Write after `every_pieces` new pieces or `every` elapsed, whichever comes first
    pub fn new(path: PathBuf, every_pieces: usize, every: Duration) -> Self {
        Self {
            path,
            every_pieces,
            every,
            unsaved: 0,
            last_write: Instant::now(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Note a newly verified piece that is not on disk yet
    pub fn piece_completed(&mut self) {
        self.unsaved += 1;
    }

    pub fn has_unsaved(&self) -> bool {
        self.unsaved > 0
    }

    /// Persist `completed` if the throttle allows it (or `force`); true if written
    pub async fn save(&mut self, completed: &[u32], force: bool) -> Result<bool> {
        let due = self.unsaved >= self.every_pieces || self.last_write.elapsed() >= self.every;
        if !force && !(self.has_unsaved() && due) {
            trace!("Resume write deferred ({} unsaved)", self.unsaved);
            return Ok(false);
        }

        let data = serde_json::to_vec(completed)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.path, data).await.map_err(|e| {
            TorrentError::storage_error_full("Failed to write resume file", self.path.display().to_string(), e.to_string())
        })?;

        debug!("Saved resume record with {} pieces", completed.len());
        self.unsaved = 0;
        self.last_write = Instant::now();
        Ok(true)
    }

    /// Load the recorded piece indices; a missing or corrupt file means none
    pub async fn load(&self) -> Vec<u32> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("Failed to read resume file {}: {}", self.path.display(), e);
                return Vec::new();
            }
        };
        match serde_json::from_slice::<Vec<u32>>(&data) {
            Ok(pieces) => {
                debug!("Loaded {} pieces from {}", pieces.len(), self.path.display());
                pieces
            }
            Err(e) => {
                warn!("Ignoring corrupt resume file {}: {}", self.path.display(), e);
                Vec::new()
            }
        }
    }

    pub async fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let mut store = ResumeStore::new(dir.path().join(RESUME_FILE_NAME), 50, Duration::from_secs(30));
        assert!(store.load().await.is_empty());

        store.piece_completed();
        assert!(store.save(&[0, 1, 2], true).await.unwrap());
        assert_eq!(store.load().await, vec![0, 1, 2]);
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), "[0,1,2]");
    }

    #[tokio::test]
    async fn test_throttle() {
        let dir = TempDir::new().unwrap();
        let mut store = ResumeStore::new(dir.path().join(RESUME_FILE_NAME), 2, Duration::from_secs(3600));

        store.piece_completed();
        assert!(!store.save(&[0], false).await.unwrap());
        store.piece_completed();
        assert!(store.save(&[0, 1], false).await.unwrap());
        assert!(!store.save(&[0, 1], false).await.unwrap());
        assert!(store.save(&[0, 1], true).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_file_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(RESUME_FILE_NAME);
        std::fs::write(&path, b"{not json").unwrap();
        let store = ResumeStore::new(path, 50, Duration::from_secs(30));
        assert!(store.load().await.is_empty());
        store.delete().await.unwrap();
        store.delete().await.unwrap();
    }
}
