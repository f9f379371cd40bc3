//! Piece manager
//!
//! Owns the piece inventory for one torrent. Every piece is in exactly one
//! of three states: complete (bit set in our bitfield), in progress (a
//! download record exists), or missing (neither). Download records collect
//! 16 KiB blocks keyed by offset; when the last block lands the piece is
//! assembled, SHA-1 verified, and written through to storage. A digest
//! mismatch discards the record so the piece returns to missing and can be
//! re-attempted by any peer.
//!
//! All state transitions happen under one mutex, so concurrent sessions can
//! never be handed the same block offset twice. Disk writes happen after
//! the critical section.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use crate::bitfield::Bitfield;
use crate::error::{ClientError, ProtocolErrorKind, Result};
use crate::metainfo::{Metainfo, Sha1Hash};
use crate::storage::FileStorage;

/// Request/response unit on the peer wire (16 KiB)
pub const BLOCK_SIZE: u32 = 16_384;

/// Coordinates of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    /// Piece index
    pub piece: u32,
    /// Byte offset within the piece
    pub offset: u32,
    /// Block length (shorter for the final block of a piece)
    pub length: u32,
}

/// Result of feeding a block into the inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// More blocks outstanding for this piece
    InProgress,
    /// The piece assembled, verified, and was written to storage
    PieceVerified,
}

/// Download progress snapshot
#[derive(Debug, Clone)]
pub struct Progress {
    /// Verified pieces
    pub completed_pieces: usize,
    /// Total pieces
    pub total_pieces: usize,
    /// Completion percentage (0–100)
    pub percentage: f64,
    /// Bytes covered by verified pieces
    pub bytes_verified: u64,
    /// Total content bytes
    pub total_bytes: u64,
}

impl Progress {
    /// Bytes still to download ("left" in tracker announces)
    pub fn bytes_remaining(&self) -> u64 {
        self.total_bytes.saturating_sub(self.bytes_verified)
    }
}

/// In-progress download record for one piece
struct DownloadRecord {
    /// Expected piece length
    length: u32,
    /// Expected digest
    hash: Sha1Hash,
    /// Received blocks keyed by offset; BTreeMap keeps assembly in order
    blocks: BTreeMap<u32, Vec<u8>>,
    /// Offsets currently requested from some peer
    requested: HashSet<u32>,
    /// Sum of buffered block lengths
    received_bytes: u32,
}

impl DownloadRecord {
    fn new(length: u32, hash: Sha1Hash) -> Self {
        Self {
            length,
            hash,
            blocks: BTreeMap::new(),
            requested: HashSet::new(),
            received_bytes: 0,
        }
    }

    /// All grid offsets buffered and the byte count adds up
    fn is_filled(&self) -> bool {
        if self.received_bytes != self.length {
            return false;
        }
        (0..self.length)
            .step_by(BLOCK_SIZE as usize)
            .all(|offset| self.blocks.contains_key(&offset))
    }

    fn assemble(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.length as usize);
        for block in self.blocks.values() {
            data.extend_from_slice(block);
        }
        data
    }
}

struct Inventory {
    have: Bitfield,
    pending: HashMap<u32, DownloadRecord>,
}

/// Shared piece inventory, one per torrent
pub struct PieceManager {
    metainfo: Arc<Metainfo>,
    storage: Arc<FileStorage>,
    inner: Mutex<Inventory>,
}

impl PieceManager {
    /// Create an empty inventory: every piece starts missing.
    pub fn new(metainfo: Arc<Metainfo>, storage: Arc<FileStorage>) -> Self {
        let num_pieces = metainfo.info.num_pieces();
        Self {
            metainfo,
            storage,
            inner: Mutex::new(Inventory {
                have: Bitfield::new(num_pieces),
                pending: HashMap::new(),
            }),
        }
    }

    /// Seed the completion set from a resume scan. Call before any peer
    /// activity; pieces already in progress are left alone.
    pub fn restore(&self, scanned: &Bitfield) {
        let mut inner = self.inner.lock();
        for index in 0..inner.have.len() {
            if scanned.has(index) && !inner.pending.contains_key(&(index as u32)) {
                inner.have.set(index).expect("index in range");
            }
        }
    }

    /// Number of pieces in the torrent
    pub fn num_pieces(&self) -> usize {
        self.metainfo.info.num_pieces()
    }

    /// Transition a piece from missing to in-progress.
    pub fn start(&self, index: u32) -> Result<()> {
        let length = self
            .metainfo
            .piece_length_at(index as usize)
            .ok_or_else(|| {
                ClientError::invalid_input(
                    "piece_index",
                    format!("piece {} out of range", index),
                )
            })?;
        let hash = *self.metainfo.piece_hash(index as usize).expect("checked");

        let mut inner = self.inner.lock();
        if inner.have.has(index as usize) {
            return Err(ClientError::InvalidState {
                action: "start piece",
                current_state: format!("piece {} already complete", index),
            });
        }
        if inner.pending.contains_key(&index) {
            return Err(ClientError::InvalidState {
                action: "start piece",
                current_state: format!("piece {} already in progress", index),
            });
        }

        inner
            .pending
            .insert(index, DownloadRecord::new(length as u32, hash));
        Ok(())
    }

    /// Hand out the lowest-offset block of piece `index` that is neither
    /// buffered nor already requested, marking it requested. `Ok(None)`
    /// means every block is buffered or in flight.
    pub fn next_block_request(&self, index: u32) -> Result<Option<BlockRequest>> {
        let mut inner = self.inner.lock();
        let record = inner.pending.get_mut(&index).ok_or_else(|| {
            ClientError::InvalidState {
                action: "request block",
                current_state: format!("piece {} not in progress", index),
            }
        })?;

        let mut offset = 0u32;
        while offset < record.length {
            if !record.blocks.contains_key(&offset) && !record.requested.contains(&offset) {
                record.requested.insert(offset);
                let length = BLOCK_SIZE.min(record.length - offset);
                return Ok(Some(BlockRequest {
                    piece: index,
                    offset,
                    length,
                }));
            }
            offset += BLOCK_SIZE;
        }

        Ok(None)
    }

    /// Record a received block. When the final block lands the piece is
    /// assembled, verified, and written to storage; a digest mismatch
    /// discards all buffered blocks and returns the piece to missing.
    pub fn add_block(&self, index: u32, offset: u32, data: Vec<u8>) -> Result<BlockOutcome> {
        let verified = {
            let mut inner = self.inner.lock();
            let record = inner.pending.get_mut(&index).ok_or_else(|| {
                ClientError::protocol(
                    ProtocolErrorKind::PeerProtocol,
                    format!("block for piece {} which is not in progress", index),
                )
            })?;

            if offset % BLOCK_SIZE != 0 {
                return Err(ClientError::protocol(
                    ProtocolErrorKind::PeerProtocol,
                    format!("block offset {} not aligned to {}", offset, BLOCK_SIZE),
                ));
            }
            if offset as u64 + data.len() as u64 > record.length as u64 {
                return Err(ClientError::protocol(
                    ProtocolErrorKind::PeerProtocol,
                    format!(
                        "block [{}, {}) extends past piece {} length {}",
                        offset,
                        offset as u64 + data.len() as u64,
                        index,
                        record.length
                    ),
                ));
            }

            record.requested.remove(&offset);
            let added = data.len() as u32;
            if let Some(old) = record.blocks.insert(offset, data) {
                record.received_bytes -= old.len() as u32;
            }
            record.received_bytes += added;

            if !record.is_filled() {
                return Ok(BlockOutcome::InProgress);
            }

            // Last block landed: the record leaves the inventory either way.
            let record = inner.pending.remove(&index).expect("present");
            let data = record.assemble();
            let actual: Sha1Hash = Sha1::digest(&data).into();
            if actual != record.hash {
                return Err(ClientError::protocol(
                    ProtocolErrorKind::HashMismatch,
                    format!("piece {} failed verification", index),
                ));
            }

            inner.have.set(index as usize).expect("index in range");
            data
        };

        // Disk I/O stays outside the inventory critical section.
        self.storage.write_piece(index, &verified)?;
        tracing::debug!("piece {} verified and written", index);
        Ok(BlockOutcome::PieceVerified)
    }

    /// Release request marks after a peer disconnects with blocks in flight,
    /// so those offsets can be re-issued. Offsets that were buffered in the
    /// meantime, or whole pieces no longer in progress, are ignored.
    pub fn release_requests(&self, index: u32, offsets: &[u32]) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.pending.get_mut(&index) {
            for offset in offsets {
                if !record.blocks.contains_key(offset) {
                    record.requested.remove(offset);
                }
            }
        }
    }

    /// Destroy an in-progress record without writing anything.
    pub fn cancel(&self, index: u32) {
        self.inner.lock().pending.remove(&index);
    }

    /// Pieces that are neither complete nor in progress
    pub fn missing_indices(&self) -> Vec<u32> {
        let inner = self.inner.lock();
        inner
            .have
            .missing_indices()
            .into_iter()
            .filter(|index| !inner.pending.contains_key(index))
            .collect()
    }

    /// Pieces currently in progress, ascending
    pub fn pending_indices(&self) -> Vec<u32> {
        let inner = self.inner.lock();
        let mut indices: Vec<u32> = inner.pending.keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Copy of our completion bitfield
    pub fn bitfield(&self) -> Bitfield {
        self.inner.lock().have.clone()
    }

    /// True once every piece has verified
    pub fn is_complete(&self) -> bool {
        self.inner.lock().have.is_complete()
    }

    /// Progress snapshot
    pub fn progress(&self) -> Progress {
        let inner = self.inner.lock();
        let total_pieces = inner.have.len();
        let completed_pieces = inner.have.count_complete();

        let mut bytes_verified = 0u64;
        for index in 0..total_pieces {
            if inner.have.has(index) {
                bytes_verified += self.metainfo.piece_length_at(index).unwrap_or(0);
            }
        }

        let percentage = if total_pieces == 0 {
            100.0
        } else {
            completed_pieces as f64 / total_pieces as f64 * 100.0
        };

        Progress {
            completed_pieces,
            total_pieces,
            percentage,
            bytes_verified,
            total_bytes: self.metainfo.info.total_length(),
        }
    }
}
