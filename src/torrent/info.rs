//! Torrent information structures
//!
//! Provides high-level information about a decoded torrent descriptor.

use std::path::PathBuf;

use sha1::{Digest, Sha1};
use anyhow::Result;

use crate::error::TorrentError;

/// Represents a file in a multi-file torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// File path components (e.g., ["folder", "subfolder", "file.txt"])
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
}

/// High-level torrent information
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// Primary tracker announce URL (empty when only `announce-list` is present)
    pub announce: String,
    /// Announce-list tiers flattened in order
    pub announce_list: Vec<String>,
    /// SHA1 hash of the raw info dictionary
    pub info_hash: [u8; 20],
    /// Size of each piece in bytes
    pub piece_length: u64,
    /// List of piece hashes (each is a 20-byte SHA1 hash)
    pub pieces: Vec<[u8; 20]>,
    /// Torrent name
    pub name: String,
    /// Single file size (None for multi-file torrents)
    pub length: Option<u64>,
    /// Files in multi-file torrents (None for single-file torrents)
    pub files: Option<Vec<TorrentFile>>,
    /// The `info` dictionary exactly as it appeared in the descriptor
    pub raw_info: Vec<u8>,
}

impl TorrentInfo {
    /// Calculate total size of all files in torrent
    pub fn total_size(&self) -> u64 {
        if let Some(length) = self.length {
            length
        } else if let Some(files) = &self.files {
            files.iter().map(|f| f.length).sum()
        } else {
            0
        }
    }

    /// Get number of pieces in torrent
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Byte length of a piece; only the last piece may be short
    pub fn piece_size(&self, index: u32) -> u64 {
        self.piece_range(index as usize)
            .map(|(start, end)| end - start)
            .unwrap_or(0)
    }

    /// Get an iterator over all files in torrent
    pub fn files_iter(&self) -> impl Iterator<Item = TorrentFile> + '_ {
        let single = match (&self.files, self.length) {
            (None, Some(length)) => Some(TorrentFile {
                path: vec![self.name.clone()],
                length,
            }),
            _ => None,
        };
        self.files
            .iter()
            .flat_map(|files| files.iter().cloned())
            .chain(single)
    }

    /// Check if this is a multi-file torrent
    pub fn is_multi_file(&self) -> bool {
        self.files.is_some()
    }

    /// Get info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Generate info hash from info dictionary bytes
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        hasher.finalize().into()
    }

    /// Parse piece hashes from concatenated bytes in torrent file
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::parse_error_with_source(
                "Pieces field length must be a multiple of 20",
                format!("got {}", pieces_bytes.len()),
            )
            .into());
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    /// Get piece hash for a specific piece index
    pub fn piece_hash(&self, index: usize) -> Option<[u8; 20]> {
        self.pieces.get(index).copied()
    }

    /// Get byte range for a specific piece
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.pieces.len() {
            return None;
        }

        let start = (index as u64) * self.piece_length;
        let total = self.total_size();
        let end = std::cmp::min(start + self.piece_length, total);

        Some((start, end))
    }

    /// Tracker URLs in the order they should be tried.
    ///
    /// `announce` first, then every announce-list entry; only http, https and
    /// udp URLs are kept and duplicates are dropped.
    pub fn tracker_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        let candidates = std::iter::once(&self.announce).chain(self.announce_list.iter());
        for url in candidates {
            let supported = url.starts_with("http://") || url.starts_with("https://") || url.starts_with("udp://");
            if supported && !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }

    /// Folder, relative to the destination, that holds this torrent's files
    /// and its resume sidecar.
    pub fn output_folder_name(&self) -> String {
        if self.is_multi_file() {
            return self.name.clone();
        }
        match self.name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => self.name.clone(),
        }
    }

    /// Relative path of each file inside the output folder, with its length
    pub fn file_layout(&self) -> Vec<(PathBuf, u64)> {
        self.files_iter()
            .map(|file| (file.path.iter().collect::<PathBuf>(), file.length))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file() -> TorrentInfo {
        TorrentInfo {
            announce: "http://tracker.example.com/announce".to_string(),
            announce_list: vec![],
            info_hash: [1u8; 20],
            piece_length: 1024,
            pieces: vec![[2u8; 20], [3u8; 20]],
            name: "movie.mkv".to_string(),
            length: Some(1500),
            files: None,
            raw_info: Vec::new(),
        }
    }

    #[test]
    fn test_torrent_info_single_file() {
        let info = single_file();
        assert_eq!(info.total_size(), 1500);
        assert_eq!(info.piece_count(), 2);
        assert!(!info.is_multi_file());
        assert_eq!(info.info_hash_hex(), hex::encode([1u8; 20]));
    }

    #[test]
    fn test_piece_size_last_piece_short() {
        let info = single_file();
        assert_eq!(info.piece_size(0), 1024);
        assert_eq!(info.piece_size(1), 476);
        assert_eq!(info.piece_size(2), 0);
    }

    #[test]
    fn test_torrent_info_multi_file() {
        let info = TorrentInfo {
            files: Some(vec![
                TorrentFile { path: vec!["dir".to_string(), "file1.txt".to_string()], length: 500 },
                TorrentFile { path: vec!["file2.txt".to_string()], length: 524 },
            ]),
            length: None,
            name: "bundle".to_string(),
            ..single_file()
        };

        assert_eq!(info.total_size(), 1024);
        assert!(info.is_multi_file());
        assert_eq!(info.output_folder_name(), "bundle");
        let layout = info.file_layout();
        assert_eq!(layout[0], (PathBuf::from("dir").join("file1.txt"), 500));
        assert_eq!(layout[1], (PathBuf::from("file2.txt"), 524));
    }

    #[test]
    fn test_files_iter_single_file() {
        let files: Vec<_> = single_file().files_iter().collect();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, vec!["movie.mkv"]);
        assert_eq!(files[0].length, 1500);
    }

    #[test]
    fn test_output_folder_strips_extension() {
        assert_eq!(single_file().output_folder_name(), "movie");
        let info = TorrentInfo { name: "README".to_string(), ..single_file() };
        assert_eq!(info.output_folder_name(), "README");
    }

    #[test]
    fn test_tracker_urls_order_and_dedup() {
        let info = TorrentInfo {
            announce: "udp://a.example:6969".to_string(),
            announce_list: vec![
                "udp://a.example:6969".to_string(),
                "wss://ignored.example".to_string(),
                "http://b.example/announce".to_string(),
            ],
            ..single_file()
        };
        assert_eq!(info.tracker_urls(), vec!["udp://a.example:6969", "http://b.example/announce"]);
    }

    #[test]
    fn test_parse_piece_hashes() {
        assert_eq!(TorrentInfo::parse_piece_hashes(&[7u8; 40]).unwrap().len(), 2);
        assert!(TorrentInfo::parse_piece_hashes(&[7u8; 41]).is_err());
    }
}
