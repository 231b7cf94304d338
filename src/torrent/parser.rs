//! Torrent file parser
//!
//! Handles parsing of .torrent files and extracting metadata.

use std::path::Path;

use anyhow::Result;
use tracing::{debug, error, info, trace, warn};

use crate::bencode::{self, Value};
use crate::error::TorrentError;
use crate::torrent::info::{TorrentFile, TorrentInfo};

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        info!("Parsing torrent file from {} bytes", data.len());
        trace!("Torrent data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let decoded = bencode::decode_with_info(data, 0)?;
        if decoded.next != data.len() {
            warn!("Parsed {}/{} bytes of torrent file", decoded.next, data.len());
        }

        let info_span = decoded
            .info_span
            .ok_or_else(|| TorrentError::parse_error("Missing info dictionary"))?;
        let raw_info = data[info_span].to_vec();

        Self::convert_to_torrent_info(&decoded.value, raw_info)
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &Path) -> Result<TorrentInfo> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
        })?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data).map_err(|e| match e.downcast::<TorrentError>() {
            Ok(err) => err.with_context(path.display().to_string()).into(),
            Err(other) => other,
        })
    }

    fn convert_to_torrent_info(root: &Value, raw_info: Vec<u8>) -> Result<TorrentInfo> {
        if root.as_dict().is_none() {
            return Err(TorrentError::parse_error("Root must be a dictionary").into());
        }

        let announce = match root.get("announce") {
            Some(value) => value
                .as_bytes()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .ok_or_else(|| TorrentError::parse_error_with_source("Expected a byte string", "announce"))?,
            None => String::new(),
        };

        let mut announce_list = Vec::new();
        if let Some(tiers) = root.get("announce-list").and_then(Value::as_list) {
            for tier in tiers.iter().filter_map(Value::as_list) {
                for url in tier.iter().filter_map(Value::as_bytes) {
                    announce_list.push(String::from_utf8_lossy(url).into_owned());
                }
            }
        }

        if announce.is_empty() && announce_list.is_empty() {
            return Err(TorrentError::parse_error("Missing announce").into());
        }

        let info = root.field("info")?;
        let name = info.string_field("name")?;
        Self::check_path(std::slice::from_ref(&name), "name")?;

        let piece_length = info.int_field("piece length")?;
        if piece_length <= 0 {
            return Err(TorrentError::validation_error_with_field(
                format!("piece length must be positive, got {}", piece_length),
                "piece length",
            )
            .into());
        }
        let piece_length = piece_length as u64;

        let pieces = TorrentInfo::parse_piece_hashes(info.bytes_field("pieces")?)?;

        let (length, files) = if info.get("length").is_some() {
            (Some(Self::non_negative(info.int_field("length")?, "length")?), None)
        } else if info.get("files").is_some() {
            let mut torrent_files = Vec::new();
            for entry in info.list_field("files")? {
                let length = Self::non_negative(entry.int_field("length")?, "files.length")?;
                let path = entry
                    .list_field("path")?
                    .iter()
                    .map(|segment| {
                        segment
                            .as_bytes()
                            .map(|b| String::from_utf8_lossy(b).into_owned())
                            .ok_or_else(|| TorrentError::parse_error_with_source("Expected a byte string", "files.path"))
                    })
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Self::check_path(&path, "files.path")?;
                torrent_files.push(TorrentFile { path, length });
            }
            torrent_files
                .iter()
                .try_fold(0u64, |total, file| total.checked_add(file.length))
                .ok_or_else(|| TorrentError::validation_error_with_field("total length overflows", "files.length"))?;
            (None, Some(torrent_files))
        } else {
            return Err(TorrentError::parse_error("Neither length nor files found in info dict").into());
        };

        let torrent = TorrentInfo {
            announce,
            announce_list,
            info_hash: TorrentInfo::generate_info_hash(&raw_info),
            piece_length,
            pieces,
            name,
            length,
            files,
            raw_info,
        };

        let total = torrent.total_size();
        if total == 0 {
            return Err(TorrentError::validation_error_with_field("torrent has no content", "length").into());
        }
        let expected_pieces = total.div_ceil(piece_length);
        if expected_pieces != torrent.piece_count() as u64 {
            return Err(TorrentError::validation_error_with_field(
                format!(
                    "piece count mismatch: {} bytes at {} per piece needs {} hashes, found {}",
                    total,
                    piece_length,
                    expected_pieces,
                    torrent.piece_count()
                ),
                "pieces",
            )
            .into());
        }

        info!(
            "Parsed torrent '{}' ({} pieces, info hash {})",
            torrent.name,
            torrent.piece_count(),
            torrent.info_hash_hex()
        );
        Ok(torrent)
    }

    fn non_negative(value: i64, field: &str) -> Result<u64> {
        u64::try_from(value).map_err(|_| {
            TorrentError::validation_error_with_field(format!("negative value {}", value), field).into()
        })
    }

    /// Reject path segments that would escape the output folder
    fn check_path(path: &[String], field: &str) -> Result<()> {
        let bad = path.is_empty()
            || path
                .iter()
                .any(|s| s.is_empty() || s == "." || s == ".." || s.contains('/') || s.contains('\\'));
        if bad {
            return Err(TorrentError::validation_error_with_field(
                format!("unsafe file path {:?}", path),
                field,
            )
            .into());
        }
        Ok(())
    }
}
