//! Piece presence bitfield
//!
//! Compact bit vector over piece indices, stored MSB-first within each byte
//! so that `to_bytes` matches the peer-wire `bitfield` payload directly:
//! bit 0 is the high bit of byte 0. Used for our own completion set, for
//! each peer's advertised availability, and as the rarity aggregator input.

use bitvec::prelude::*;

use crate::error::{ClientError, Result};

/// Fixed-length piece presence set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: BitVec<u8, Msb0>,
}

impl Bitfield {
    /// Create an all-zero bitfield for `num_pieces` pieces
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bits: bitvec![u8, Msb0; 0; num_pieces],
        }
    }

    /// Build from wire bytes. Short input is padded with zero bytes; spare
    /// bits beyond `num_pieces` are ignored.
    pub fn from_bytes(data: &[u8], num_pieces: usize) -> Self {
        let mut bits = BitVec::<u8, Msb0>::from_slice(data);
        bits.resize(num_pieces, false);
        Self { bits }
    }

    /// Serialize to `ceil(num_pieces / 8)` bytes with zero padding bits
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bits = self.bits.clone();
        bits.set_uninitialized(false);
        bits.into_vec()
    }

    /// Number of pieces this bitfield covers
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// True when covering zero pieces
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Mark piece `index` present
    pub fn set(&mut self, index: usize) -> Result<()> {
        self.check_range(index)?;
        self.bits.set(index, true);
        Ok(())
    }

    /// Mark piece `index` absent
    pub fn clear(&mut self, index: usize) -> Result<()> {
        self.check_range(index)?;
        self.bits.set(index, false);
        Ok(())
    }

    /// Presence of piece `index`; out-of-range reads as absent
    pub fn has(&self, index: usize) -> bool {
        self.bits.get(index).map(|b| *b).unwrap_or(false)
    }

    /// Number of present pieces
    pub fn count_complete(&self) -> usize {
        self.bits.count_ones()
    }

    /// True when every piece is present
    pub fn is_complete(&self) -> bool {
        self.bits.all()
    }

    /// Indices of absent pieces, ascending
    pub fn missing_indices(&self) -> Vec<u32> {
        self.bits.iter_zeros().map(|i| i as u32).collect()
    }

    /// Extend with absent pieces so that `index` is addressable. Used when a
    /// peer's `have` names a piece beyond its advertised bitfield.
    pub fn grow_to(&mut self, len: usize) {
        if len > self.bits.len() {
            self.bits.resize(len, false);
        }
    }

    fn check_range(&self, index: usize) -> Result<()> {
        if index >= self.bits.len() {
            return Err(ClientError::invalid_input(
                "piece_index",
                format!("index {} out of range [0, {})", index, self.bits.len()),
            ));
        }
        Ok(())
    }
}
