//! Piece tracking module
//!
//! Owns piece selection, block accounting and hash verification. A piece is
//! `needed` until its hash verifies; while peers are assigned to it, it is also
//! `in progress`. Received blocks are kept in a per-piece buffer sized to the
//! piece's real length and only leave it as a whole, verified piece.

use std::collections::{BTreeSet, HashMap, HashSet};

use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};
use tracing::{debug, info, trace, warn};

use crate::peer::{Bitfield, PeerKey};
use crate::torrent::TorrentInfo;

/// Maximum size of a requested block
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// A block to request: byte range within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpec {
    pub offset: u32,
    pub length: u32,
}

/// A verified piece ready for disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPiece {
    pub index: u32,
    pub data: Vec<u8>,
    pub size: u64,
    /// Other peers still assigned to this piece; their requests must be cancelled
    pub cancel_peers: Vec<PeerKey>,
    /// This completion pushed the session into endgame mode
    pub entered_endgame: bool,
}

/// Result of feeding one block to the piece manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Accepted (or duplicate); more blocks are missing
    Incomplete,
    Complete(CompletedPiece),
    /// Every block arrived but the hash did not match; the piece is needed again
    Failed,
    /// Block for a piece we no longer need, or with an impossible range
    Stale,
}

#[derive(Debug, Default)]
struct PieceProgress {
    /// Allocated on the first block
    buffer: Vec<u8>,
    received: HashSet<u32>,
    assigned: HashSet<PeerKey>,
}

/// Tracks which pieces are needed, who works on what and how rare each piece is
#[derive(Debug)]
pub struct PieceManager {
    hashes: Vec<[u8; 20]>,
    piece_length: u64,
    total_size: u64,
    needed: BTreeSet<u32>,
    completed: BTreeSet<u32>,
    progress: HashMap<u32, PieceProgress>,
    availability: Vec<u32>,
    endgame: bool,
    endgame_threshold: usize,
    block_batch: usize,
    hash_failures: u64,
}

impl PieceManager {
    pub fn new(info: &TorrentInfo, endgame_threshold: usize, block_batch: usize) -> Self {
        let count = info.piece_count();
        debug!("Tracking {} pieces of {} bytes", count, info.piece_length);
        Self {
            hashes: info.pieces.clone(),
            piece_length: info.piece_length,
            total_size: info.total_size(),
            needed: (0..count as u32).collect(),
            completed: BTreeSet::new(),
            progress: HashMap::new(),
            availability: vec![0; count],
            endgame: false,
            endgame_threshold,
            block_batch,
            hash_failures: 0,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.hashes.len()
    }

    /// Byte length of a piece; the last one holds the remainder
    pub fn piece_size(&self, index: u32) -> u64 {
        let start = index as u64 * self.piece_length;
        if index as usize >= self.hashes.len() {
            return 0;
        }
        self.piece_length.min(self.total_size - start)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn needed(&self) -> impl Iterator<Item = u32> + '_ {
        self.needed.iter().copied()
    }

    pub fn needed_count(&self) -> usize {
        self.needed.len()
    }

    pub fn completed(&self) -> impl Iterator<Item = u32> + '_ {
        self.completed.iter().copied()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn is_piece_complete(&self, index: u32) -> bool {
        self.completed.contains(&index)
    }

    /// No piece is needed any more
    pub fn is_done(&self) -> bool {
        self.needed.is_empty()
    }

    /// Bytes covered by verified pieces
    pub fn bytes_completed(&self) -> u64 {
        self.completed.iter().map(|&i| self.piece_size(i)).sum()
    }

    pub fn completed_bitfield(&self) -> Bitfield {
        Bitfield::from_completed(self.completed.iter().copied(), self.hashes.len())
    }

    pub fn is_in_progress(&self, index: u32) -> bool {
        self.progress.get(&index).is_some_and(|p| !p.assigned.is_empty())
    }

    pub fn hash_failures(&self) -> u64 {
        self.hash_failures
    }

    pub fn is_endgame_mode(&self) -> bool {
        self.endgame
    }

    pub fn set_endgame_mode(&mut self, enabled: bool) {
        if self.endgame != enabled {
            info!("Endgame mode {}", if enabled { "on" } else { "off" });
        }
        self.endgame = enabled;
    }

    /// Enter endgame once few enough pieces remain; true on the transition
    fn check_endgame(&mut self) -> bool {
        if !self.endgame && !self.needed.is_empty() && self.needed.len() <= self.endgame_threshold {
            self.set_endgame_mode(true);
            return true;
        }
        false
    }

    /// Record a piece as verified without downloading it (resume replay)
    pub fn mark_piece_complete(&mut self, index: u32) -> bool {
        if !self.needed.remove(&index) {
            return false;
        }
        self.completed.insert(index);
        self.progress.remove(&index);
        self.check_endgame();
        true
    }

    /// Add or withdraw a peer's pieces from the rarity counts
    pub fn update_availability(&mut self, bitfield: &Bitfield, add: bool) {
        for index in bitfield.iter_set() {
            if let Some(count) = self.availability.get_mut(index) {
                *count = if add { count.saturating_add(1) } else { count.saturating_sub(1) };
            }
        }
    }

    pub fn increment_piece_availability(&mut self, index: u32) {
        if let Some(count) = self.availability.get_mut(index as usize) {
            *count = count.saturating_add(1);
        }
    }

    pub fn availability(&self, index: u32) -> u32 {
        self.availability.get(index as usize).copied().unwrap_or(0)
    }

    /// Choose the next piece for a peer holding `bitfield`.
    ///
    /// Rarest first among needed pieces the peer has; pieces in progress are
    /// excluded outside endgame. Before anything is owned the pick is uniform.
    pub fn get_piece_to_download(&self, bitfield: &Bitfield) -> Option<u32> {
        let candidates: Vec<u32> = self
            .needed
            .iter()
            .copied()
            .filter(|&i| bitfield.has(i as usize))
            .filter(|&i| self.endgame || !self.is_in_progress(i))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let mut rng = rand::thread_rng();
        if self.completed.is_empty() {
            return candidates.choose(&mut rng).copied();
        }

        let rarest = candidates.iter().map(|&i| self.availability(i)).min()?;
        let tied: Vec<u32> = candidates
            .into_iter()
            .filter(|&i| self.availability(i) == rarest)
            .collect();
        tied.choose(&mut rng).copied()
    }

    pub fn track_peer_assignment(&mut self, index: u32, peer: PeerKey) {
        if self.needed.contains(&index) {
            self.progress.entry(index).or_default().assigned.insert(peer);
        }
    }

    pub fn assigned_peers(&self, index: u32) -> Vec<PeerKey> {
        self.progress
            .get(&index)
            .map(|p| p.assigned.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Pieces this peer was assigned to; it is unassigned from all of them
    pub fn release_peer(&mut self, peer: PeerKey) -> Vec<u32> {
        let mut released: Vec<u32> = self
            .progress
            .iter_mut()
            .filter_map(|(&index, p)| p.assigned.remove(&peer).then_some(index))
            .collect();
        released.sort_unstable();
        if !released.is_empty() {
            trace!("Released peer {} from pieces {:?}", peer, released);
        }
        released
    }

    /// Drop every assignment; received blocks are kept
    pub fn release_all_assignments(&mut self) {
        for progress in self.progress.values_mut() {
            progress.assigned.clear();
        }
    }

    fn block_count(&self, index: u32) -> u32 {
        self.piece_size(index).div_ceil(BLOCK_SIZE as u64) as u32
    }

    fn block_length(&self, index: u32, offset: u32) -> u32 {
        (self.piece_size(index) - offset as u64).min(BLOCK_SIZE as u64) as u32
    }

    /// Every block of a needed piece not received yet
    pub fn missing_blocks(&self, index: u32) -> Vec<BlockSpec> {
        if !self.needed.contains(&index) {
            return Vec::new();
        }
        let received = self.progress.get(&index).map(|p| &p.received);
        (0..self.block_count(index))
            .map(|b| b * BLOCK_SIZE)
            .filter(|offset| received.map_or(true, |r| !r.contains(offset)))
            .map(|offset| BlockSpec {
                offset,
                length: self.block_length(index, offset),
            })
            .collect()
    }

    /// Blocks to request when a piece is assigned; all of them in endgame
    pub fn piece_blocks(&self, index: u32) -> Vec<BlockSpec> {
        let mut blocks = self.missing_blocks(index);
        if !self.endgame {
            blocks.truncate(self.block_batch);
        }
        blocks
    }

    /// Accept one block and verify the piece once it is fully covered
    pub fn on_block_received(&mut self, index: u32, offset: u32, data: &[u8], from: PeerKey) -> BlockOutcome {
        if !self.needed.contains(&index) {
            trace!("Stale block {}:{} from peer {}", index, offset, from);
            return BlockOutcome::Stale;
        }
        let size = self.piece_size(index);
        if offset % BLOCK_SIZE != 0 || offset as u64 >= size || data.len() as u32 != self.block_length(index, offset) {
            warn!("Peer {} sent malformed block {}:{} ({} bytes)", from, index, offset, data.len());
            return BlockOutcome::Stale;
        }

        let expected_blocks = self.block_count(index) as usize;
        let progress = self.progress.entry(index).or_default();
        if !progress.received.insert(offset) {
            trace!("Duplicate block {}:{}", index, offset);
            return BlockOutcome::Incomplete;
        }
        if progress.buffer.is_empty() {
            progress.buffer = vec![0u8; size as usize];
        }
        let start = offset as usize;
        progress.buffer[start..start + data.len()].copy_from_slice(data);

        if progress.received.len() < expected_blocks {
            return BlockOutcome::Incomplete;
        }

        let Some(progress) = self.progress.remove(&index) else {
            return BlockOutcome::Stale;
        };
        let digest: [u8; 20] = Sha1::digest(&progress.buffer).into();
        if digest != self.hashes[index as usize] {
            self.hash_failures += 1;
            warn!("Piece {} failed hash check ({} failures so far)", index, self.hash_failures);
            return BlockOutcome::Failed;
        }

        self.needed.remove(&index);
        self.completed.insert(index);
        let entered_endgame = self.check_endgame();
        let mut cancel_peers: Vec<PeerKey> = progress.assigned.into_iter().filter(|&p| p != from).collect();
        cancel_peers.sort_unstable();
        debug!(
            "Piece {} verified ({}/{} complete)",
            index,
            self.completed.len(),
            self.hashes.len()
        );

        BlockOutcome::Complete(CompletedPiece {
            index,
            data: progress.buffer,
            size,
            cancel_peers,
            entered_endgame,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn torrent(content: &[u8], piece_length: usize) -> TorrentInfo {
        let pieces = content
            .chunks(piece_length)
            .map(TorrentInfo::generate_info_hash)
            .collect();
        TorrentInfo {
            announce: "udp://tracker.example:6969".to_string(),
            announce_list: Vec::new(),
            info_hash: [0u8; 20],
            piece_length: piece_length as u64,
            pieces,
            name: "test.bin".to_string(),
            length: Some(content.len() as u64),
            files: None,
            raw_info: Vec::new(),
        }
    }

    fn full(n: usize) -> Bitfield {
        Bitfield::from_completed(0..n as u32, n)
    }

    #[test]
    fn test_piece_sizes() {
        let content = vec![1u8; 40000];
        let manager = PieceManager::new(&torrent(&content, 16384), 20, 15);
        assert_eq!(manager.piece_count(), 3);
        assert_eq!(manager.piece_size(0), 16384);
        assert_eq!(manager.piece_size(2), 40000 - 32768);
        assert_eq!(manager.piece_size(3), 0);
    }

    #[test]
    fn test_piece_blocks_last_block_remainder() {
        let content = vec![1u8; 40000];
        let manager = PieceManager::new(&torrent(&content, 40000), 20, 15);
        let blocks = manager.piece_blocks(0);
        assert_eq!(blocks, vec![
            BlockSpec { offset: 0, length: 16384 },
            BlockSpec { offset: 16384, length: 16384 },
            BlockSpec { offset: 32768, length: 40000 - 32768 },
        ]);
    }

    #[test]
    fn test_completion_needs_every_block_once() {
        let content: Vec<u8> = (0..32768u32).map(|i| (i % 251) as u8).collect();
        let mut manager = PieceManager::new(&torrent(&content, 32768), 20, 15);

        assert_eq!(manager.on_block_received(0, 0, &content[..16384], 1), BlockOutcome::Incomplete);
        // duplicate offset does not advance
        assert_eq!(manager.on_block_received(0, 0, &content[..16384], 1), BlockOutcome::Incomplete);
        assert!(!manager.is_done());

        match manager.on_block_received(0, 16384, &content[16384..], 1) {
            BlockOutcome::Complete(piece) => {
                assert_eq!(piece.index, 0);
                assert_eq!(piece.size, 32768);
                assert_eq!(piece.data, content);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(manager.is_done());
        assert_eq!(manager.on_block_received(0, 0, &content[..16384], 1), BlockOutcome::Stale);
    }

    #[test]
    fn test_hash_mismatch_returns_piece_to_pool() {
        let content = vec![5u8; 32768];
        let mut manager = PieceManager::new(&torrent(&content, 32768), 20, 15);
        manager.track_peer_assignment(0, 1);
        assert_eq!(manager.get_piece_to_download(&full(1)), None);

        manager.on_block_received(0, 0, &content[..16384], 1);
        let corrupted = vec![6u8; 16384];
        assert_eq!(manager.on_block_received(0, 16384, &corrupted, 1), BlockOutcome::Failed);

        assert_eq!(manager.hash_failures(), 1);
        assert_eq!(manager.needed().collect::<Vec<_>>(), vec![0]);
        assert_eq!(manager.get_piece_to_download(&full(1)), Some(0));
        assert_eq!(manager.missing_blocks(0).len(), 2);
    }

    #[test]
    fn test_malformed_blocks_are_stale() {
        let content = vec![5u8; 32768];
        let mut manager = PieceManager::new(&torrent(&content, 32768), 20, 15);
        assert_eq!(manager.on_block_received(0, 100, &[0u8; 16384], 1), BlockOutcome::Stale);
        assert_eq!(manager.on_block_received(0, 0, &[0u8; 10], 1), BlockOutcome::Stale);
        assert_eq!(manager.on_block_received(1, 0, &[0u8; 16384], 1), BlockOutcome::Stale);
    }

    #[test]
    fn test_endgame_below_threshold_requests_all_blocks() {
        // 25 pieces of 64 KiB, four blocks each
        let content = vec![0u8; 25 * 65536];
        let mut manager = PieceManager::new(&torrent(&content, 65536), 20, 2);
        assert_eq!(manager.piece_blocks(24).len(), 2);

        for index in 0..4 {
            manager.mark_piece_complete(index);
        }
        assert_eq!(manager.needed_count(), 21);
        assert!(!manager.is_endgame_mode());

        manager.mark_piece_complete(4);
        assert_eq!(manager.needed_count(), 20);
        assert!(manager.is_endgame_mode());
        assert_eq!(manager.piece_blocks(24).len(), 4);
    }

    #[test]
    fn test_in_progress_excluded_until_endgame() {
        let content = vec![0u8; 2 * 16384];
        let mut manager = PieceManager::new(&torrent(&content, 16384), 20, 15);
        manager.track_peer_assignment(0, 1);
        manager.track_peer_assignment(1, 2);
        assert_eq!(manager.get_piece_to_download(&full(2)), None);

        manager.set_endgame_mode(true);
        assert!(manager.get_piece_to_download(&full(2)).is_some());
    }

    #[test]
    fn test_rarest_first_after_first_piece() {
        let content = vec![0u8; 4 * 16384];
        let mut manager = PieceManager::new(&torrent(&content, 16384), 0, 15);
        manager.mark_piece_complete(0);
        manager.update_availability(&full(4), true);
        manager.update_availability(&full(4), true);
        manager.update_availability(&Bitfield::from_completed([1, 2], 4), true);
        // piece 3 has two holders, 1 and 2 have three
        for _ in 0..10 {
            assert_eq!(manager.get_piece_to_download(&full(4)), Some(3));
        }

        manager.update_availability(&full(4), false);
        manager.increment_piece_availability(3);
        assert_eq!(manager.availability(3), 2);
        assert_eq!(manager.availability(1), 2);
    }

    #[test]
    fn test_peer_without_pieces_gets_nothing() {
        let content = vec![0u8; 16384];
        let manager = PieceManager::new(&torrent(&content, 16384), 20, 15);
        assert_eq!(manager.get_piece_to_download(&Bitfield::new(1)), None);
    }

    #[test]
    fn test_release_keeps_received_blocks() {
        let content = vec![9u8; 32768];
        let mut manager = PieceManager::new(&torrent(&content, 32768), 20, 15);
        manager.track_peer_assignment(0, 7);
        manager.on_block_received(0, 0, &content[..16384], 7);

        assert_eq!(manager.release_peer(7), vec![0]);
        assert!(!manager.is_in_progress(0));
        assert_eq!(manager.missing_blocks(0), vec![BlockSpec { offset: 16384, length: 16384 }]);
        assert_eq!(manager.get_piece_to_download(&full(1)), Some(0));
    }

    #[test]
    fn test_endgame_completion_reports_other_peers() {
        let content = vec![3u8; 16384];
        let mut manager = PieceManager::new(&torrent(&content, 16384), 20, 15);
        manager.set_endgame_mode(true);
        manager.track_peer_assignment(0, 1);
        manager.track_peer_assignment(0, 2);
        manager.track_peer_assignment(0, 3);

        match manager.on_block_received(0, 0, &content, 2) {
            BlockOutcome::Complete(piece) => assert_eq!(piece.cancel_peers, vec![1, 3]),
            other => panic!("unexpected {:?}", other),
        }
    }
}
