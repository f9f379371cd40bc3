//! Piece selection strategies
//!
//! A strategy answers one question: given the pieces we still need and what
//! one peer advertises, which piece should that peer work on next? Rarest
//! first additionally tracks how many known peers advertise each piece, fed
//! by the scheduler whenever a session learns a peer's bitfield.

use parking_lot::Mutex;
use rand::prelude::IndexedRandom;

use crate::bitfield::Bitfield;

/// Pluggable piece selection
pub trait PieceStrategy: Send + Sync {
    /// Pick a piece from `candidates` that `peer` advertises, or `None` if
    /// the peer has nothing we need.
    fn select(&self, candidates: &[u32], peer: &Bitfield) -> Option<u32>;

    /// Notification hook: a session learned a peer's bitfield. Called once
    /// per session. The default does nothing.
    fn observe_bitfield(&self, _peer: &Bitfield) {}
}

/// Uniform random choice among the pieces the peer can serve.
#[derive(Debug, Default)]
pub struct RandomStrategy;

impl PieceStrategy for RandomStrategy {
    fn select(&self, candidates: &[u32], peer: &Bitfield) -> Option<u32> {
        let valid: Vec<u32> = candidates
            .iter()
            .copied()
            .filter(|&index| peer.has(index as usize))
            .collect();
        valid.choose(&mut rand::rng()).copied()
    }
}

/// Prefer the piece advertised by the fewest currently-known peers. Ties go
/// to the lowest index.
pub struct RarestFirstStrategy {
    /// Per-piece count of peers advertising it
    counts: Mutex<Vec<u32>>,
}

impl RarestFirstStrategy {
    pub fn new(num_pieces: usize) -> Self {
        Self {
            counts: Mutex::new(vec![0; num_pieces]),
        }
    }
}

impl PieceStrategy for RarestFirstStrategy {
    fn select(&self, candidates: &[u32], peer: &Bitfield) -> Option<u32> {
        let counts = self.counts.lock();
        candidates
            .iter()
            .copied()
            .filter(|&index| peer.has(index as usize))
            .min_by_key(|&index| (counts.get(index as usize).copied().unwrap_or(0), index))
    }

    fn observe_bitfield(&self, peer: &Bitfield) {
        let mut counts = self.counts.lock();
        for (index, count) in counts.iter_mut().enumerate() {
            if peer.has(index) {
                *count += 1;
            }
        }
    }
}
