//! File storage module
//!
//! Maps the torrent's linear piece-address space onto one or more files and
//! keeps every file open for the session's lifetime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;
use crate::storage::resume::{ResumeStore, RESUME_FILE_NAME};
use crate::torrent::TorrentInfo;

/// One target file and where it sits in the piece-address space
#[derive(Debug)]
pub struct FileEntry {
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
    handle: Option<fs::File>,
}

impl FileEntry {
    fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Disk side of a session
#[derive(Debug)]
pub struct FileManager {
    output_dir: PathBuf,
    files: Vec<FileEntry>,
    piece_length: u64,
    total_size: u64,
    resume: ResumeStore,
    closed: bool,
}

impl FileManager {
    /// Create the output tree under `destination` and open every file.
    ///
    /// Existing files are reopened without truncation so a resumed session
    /// keeps its verified data.
    pub async fn open(
        info: &TorrentInfo,
        destination: &Path,
        resume_every_pieces: usize,
        resume_every: Duration,
    ) -> Result<Self> {
        let output_dir = destination.join(info.output_folder_name());
        info!("Output folder: {}", output_dir.display());
        fs::create_dir_all(&output_dir).await.map_err(|e| {
            error!("Failed to create output folder '{}': {}", output_dir.display(), e);
            TorrentError::storage_error_full("Failed to create output folder", output_dir.display().to_string(), e.to_string())
        })?;

        let mut files = Vec::new();
        let mut offset = 0u64;
        for (relative, length) in info.file_layout() {
            let path = output_dir.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    TorrentError::storage_error_full("Failed to create directory", parent.display().to_string(), e.to_string())
                })?;
            }
            let handle = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .await
                .map_err(|e| {
                    error!("Failed to open file '{}': {}", path.display(), e);
                    TorrentError::storage_error_full("Failed to open file", path.display().to_string(), e.to_string())
                })?;
            if handle.metadata().await?.len() != length {
                handle.set_len(length).await.map_err(|e| {
                    TorrentError::storage_error_full("Failed to set file length", path.display().to_string(), e.to_string())
                })?;
            }
            debug!("Opened {} ({} bytes at offset {})", path.display(), length, offset);
            files.push(FileEntry {
                path,
                offset,
                length,
                handle: Some(handle),
            });
            offset += length;
        }

        let resume = ResumeStore::new(output_dir.join(RESUME_FILE_NAME), resume_every_pieces, resume_every);
        Ok(Self {
            output_dir,
            files,
            piece_length: info.piece_length,
            total_size: info.total_size(),
            resume,
            closed: false,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Write a verified piece, splitting it across every file it overlaps
    pub async fn write_piece_to_file(&mut self, index: u32, data: &[u8]) -> Result<()> {
        if self.closed {
            debug!("Ignoring write of piece {} after close", index);
            return Ok(());
        }
        let start = index as u64 * self.piece_length;
        if start + data.len() as u64 > self.total_size {
            return Err(TorrentError::storage_error(format!("piece {} runs past the end of the torrent", index)).into());
        }

        for file in self.files.iter_mut() {
            let Some((file_offset, range)) = overlap(file, start, data.len()) else {
                continue;
            };
            let Some(handle) = file.handle.as_mut() else {
                continue;
            };
            trace!("Piece {}: {} bytes to {} at {}", index, range.len(), file.path.display(), file_offset);
            let write = async {
                handle.seek(std::io::SeekFrom::Start(file_offset)).await?;
                handle.write_all(&data[range]).await?;
                handle.flush().await
            };
            write.await.map_err(|e| {
                error!("Failed to write to file '{}': {}", file.path.display(), e);
                TorrentError::storage_error_full("Failed to write to file", file.path.display().to_string(), e.to_string())
            })?;
        }
        Ok(())
    }

    /// Read `length` bytes at `offset` within piece `index`
    pub async fn read_file_piece(&mut self, index: u32, offset: u32, length: u32) -> Result<Vec<u8>> {
        if self.closed {
            return Err(TorrentError::storage_error("files are closed").into());
        }
        let start = index as u64 * self.piece_length + offset as u64;
        if start + length as u64 > self.total_size {
            return Err(TorrentError::storage_error(format!("read {}+{} out of range", start, length)).into());
        }

        let mut buffer = vec![0u8; length as usize];
        for file in self.files.iter_mut() {
            let Some((file_offset, range)) = overlap(file, start, buffer.len()) else {
                continue;
            };
            let Some(handle) = file.handle.as_mut() else {
                continue;
            };
            let chunk = &mut buffer[range];
            let read = async {
                handle.seek(std::io::SeekFrom::Start(file_offset)).await?;
                handle.read_exact(chunk).await
            };
            read.await.map_err(|e| {
                TorrentError::storage_error_full("Failed to read from file", file.path.display().to_string(), e.to_string())
            })?;
        }
        Ok(buffer)
    }

    /// Persist the completed set through the throttle
    pub async fn write_to_resume(&mut self, completed: &[u32], force: bool) -> Result<bool> {
        self.resume.save(completed, force).await
    }

    pub fn note_piece_completed(&mut self) {
        self.resume.piece_completed();
    }

    /// Completed pieces recorded by an earlier session
    pub async fn get_resume_json_file(&self) -> Vec<u32> {
        self.resume.load().await
    }

    pub async fn delete_resume(&self) -> Result<()> {
        self.resume.delete().await
    }

    /// Flush and close every file; later writes are ignored
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        for file in self.files.iter_mut() {
            if let Some(mut handle) = file.handle.take() {
                handle.flush().await?;
                handle.sync_all().await.map_err(|e| {
                    TorrentError::storage_error_full("Failed to sync file", file.path.display().to_string(), e.to_string())
                })?;
            }
        }
        info!("Closed {} files in {}", self.files.len(), self.output_dir.display());
        Ok(())
    }
}

/// Where `[start, start+len)` meets `file`: offset inside the file and the
/// matching range of the caller's buffer
fn overlap(file: &FileEntry, start: u64, len: usize) -> Option<(u64, std::ops::Range<usize>)> {
    let end = start + len as u64;
    let lo = start.max(file.offset);
    let hi = end.min(file.end());
    if lo >= hi {
        return None;
    }
    let range = (lo - start) as usize..(hi - start) as usize;
    Some((lo - file.offset, range))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentFile;
    use tempfile::TempDir;

    fn single(name: &str, length: u64, piece_length: u64) -> TorrentInfo {
        TorrentInfo {
            announce: "http://t.local/announce".to_string(),
            announce_list: Vec::new(),
            info_hash: [0u8; 20],
            piece_length,
            pieces: vec![[0u8; 20]; length.div_ceil(piece_length) as usize],
            name: name.to_string(),
            length: Some(length),
            files: None,
            raw_info: Vec::new(),
        }
    }

    fn multi() -> TorrentInfo {
        TorrentInfo {
            announce: "http://t.local/announce".to_string(),
            announce_list: Vec::new(),
            info_hash: [0u8; 20],
            piece_length: 8,
            pieces: vec![[0u8; 20]; 3],
            name: "album".to_string(),
            length: None,
            files: Some(vec![
                TorrentFile { path: vec!["a.txt".to_string()], length: 5 },
                TorrentFile { path: vec!["sub".to_string(), "b.txt".to_string()], length: 10 },
                TorrentFile { path: vec!["c.txt".to_string()], length: 5 },
            ]),
            raw_info: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_single_file_layout() {
        let dir = TempDir::new().unwrap();
        let info = single("movie.mkv", 20, 16);
        let mut files = FileManager::open(&info, dir.path(), 50, Duration::from_secs(30)).await.unwrap();

        let expected = dir.path().join("movie").join("movie.mkv");
        assert_eq!(files.files()[0].path, expected);
        assert_eq!(std::fs::metadata(&expected).unwrap().len(), 20);

        files.write_piece_to_file(1, &[7u8; 4]).await.unwrap();
        assert_eq!(files.read_file_piece(1, 0, 4).await.unwrap(), vec![7u8; 4]);
        assert!(files.read_file_piece(1, 0, 5).await.is_err());
    }

    #[tokio::test]
    async fn test_piece_straddles_files() {
        let dir = TempDir::new().unwrap();
        let mut files = FileManager::open(&multi(), dir.path(), 50, Duration::from_secs(30)).await.unwrap();

        let content: Vec<u8> = (0u8..20).collect();
        for (index, piece) in content.chunks(8).enumerate() {
            files.write_piece_to_file(index as u32, piece).await.unwrap();
        }

        let root = dir.path().join("album");
        assert_eq!(std::fs::read(root.join("a.txt")).unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(std::fs::read(root.join("sub").join("b.txt")).unwrap(), (5u8..15).collect::<Vec<_>>());
        assert_eq!(std::fs::read(root.join("c.txt")).unwrap(), vec![15, 16, 17, 18, 19]);

        // block spanning all three files
        assert_eq!(files.read_file_piece(0, 3, 14).await.unwrap(), (3u8..17).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        let info = single("data.bin", 16, 16);
        {
            let mut files = FileManager::open(&info, dir.path(), 50, Duration::from_secs(30)).await.unwrap();
            files.write_piece_to_file(0, &[9u8; 16]).await.unwrap();
            files.close().await.unwrap();
        }
        let mut files = FileManager::open(&info, dir.path(), 50, Duration::from_secs(30)).await.unwrap();
        assert_eq!(files.read_file_piece(0, 0, 16).await.unwrap(), vec![9u8; 16]);
    }

    #[tokio::test]
    async fn test_writes_after_close_ignored() {
        let dir = TempDir::new().unwrap();
        let info = single("data.bin", 16, 16);
        let mut files = FileManager::open(&info, dir.path(), 50, Duration::from_secs(30)).await.unwrap();
        files.close().await.unwrap();
        files.write_piece_to_file(0, &[1u8; 16]).await.unwrap();
        assert!(files.read_file_piece(0, 0, 16).await.is_err());
        assert_eq!(std::fs::read(dir.path().join("data").join("data.bin")).unwrap(), vec![0u8; 16]);
    }

    #[tokio::test]
    async fn test_resume_sidecar_in_output_folder() {
        let dir = TempDir::new().unwrap();
        let mut files = FileManager::open(&multi(), dir.path(), 50, Duration::from_secs(30)).await.unwrap();
        files.note_piece_completed();
        files.write_to_resume(&[0, 2], true).await.unwrap();
        assert!(dir.path().join("album").join(".resume.json").exists());
        assert_eq!(files.get_resume_json_file().await, vec![0, 2]);
    }
}
