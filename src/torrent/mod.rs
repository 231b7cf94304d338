//! Torrent descriptors
//!
//! Decoding `.torrent` files into `TorrentInfo` and deriving the file layout
//! and tracker list from them.

pub mod info;
pub mod parser;

pub use info::{TorrentFile, TorrentInfo};
pub use parser::TorrentParser;
