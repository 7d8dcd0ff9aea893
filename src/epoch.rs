//! Epoch bookkeeping for a job's blocks.
//!
//! A job with `n` blocks is walked through in epochs of `mask_size * 8` blocks. Only the
//! current epoch's bitmask is kept; finishing it advances the epoch counter and clears
//! the mask. When the final epoch is only partially used its unused tail bits are set up
//! front, so a full mask always means "epoch done".

use crate::bitmask::Bitmask;
use crate::codec::{put_prefixed, Reader};
use crate::error::{EpochError, ProtocolError};
use crate::util::{from_signed_le_bytes, to_signed_le_bytes};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochState {
    pub epoch_number: u128,
    pub bitmask: Bitmask,
}

/// Mask size used for a job with `number_of_blocks` blocks: one bit per block, capped.
pub fn mask_size_for(number_of_blocks: u128, max_mask_size: u32) -> u32 {
    let needed = number_of_blocks.div_ceil(8).max(1);
    needed.min(u128::from(max_mask_size.max(1))) as u32
}

/// Number of epochs needed to cover `number_of_blocks` with `mask_size`-byte masks.
pub fn number_of_epochs(number_of_blocks: u128, mask_size: u32) -> u128 {
    let bits = u128::from(mask_size) * 8;
    if bits == 0 {
        return 0;
    }
    number_of_blocks.div_ceil(bits)
}

impl EpochState {
    pub fn new(mask_size: u32) -> Self {
        EpochState {
            epoch_number: 0,
            bitmask: Bitmask::new(mask_size),
        }
    }

    fn bits(&self) -> u128 {
        self.bitmask.bit_count() as u128
    }

    /// Blocks of the final epoch that are never calculated.
    fn filler_bits(&self, number_of_blocks: u128) -> u128 {
        let rem = number_of_blocks % self.bits().max(1);
        if rem == 0 {
            0
        } else {
            self.bits() - rem
        }
    }

    pub fn is_last_epoch(&self, number_of_blocks: u128) -> bool {
        self.epoch_number.saturating_add(1) >= number_of_epochs(number_of_blocks, self.bitmask.mask_size())
    }

    /// Advances a full non-final epoch and pre-fills the unused tail of the final one.
    ///
    /// Returns `true` when the state changed.
    pub fn check_and_update(&mut self, number_of_blocks: u128) -> bool {
        let mut changed = false;
        if !self.is_last_epoch(number_of_blocks) && self.bitmask.free_bits() == 0 {
            self.bitmask.clear();
            self.epoch_number = self.epoch_number.saturating_add(1);
            changed = true;
        }
        if self.is_last_epoch(number_of_blocks) {
            let first_unused = (number_of_blocks % self.bits().max(1)) as usize;
            if first_unused != 0 {
                for bit in first_unused..self.bitmask.bit_count() {
                    if !self.bitmask.is_bit_set(bit) {
                        // index is in range by construction
                        let _ = self.bitmask.set_bit(bit);
                        changed = true;
                    }
                }
            }
        }
        changed
    }

    /// Blocks done so far across all epochs, excluding final-epoch filler.
    pub fn calculated_blocks(&self, number_of_blocks: u128) -> u128 {
        let done = self
            .epoch_number
            .saturating_mul(self.bits())
            .saturating_add(self.bitmask.set_bits_count() as u128);
        let done = if self.is_last_epoch(number_of_blocks) {
            done.saturating_sub(self.filler_bits(number_of_blocks))
        } else {
            done
        };
        done.min(number_of_blocks)
    }

    /// Global id of a bit in the current epoch.
    pub fn block_id(&self, bit: usize) -> u128 {
        self.epoch_number.saturating_mul(self.bits()).saturating_add(bit as u128)
    }

    /// A random not-yet-calculated block of the current epoch.
    pub fn free_block_id(&self) -> Option<u128> {
        self.bitmask.get_random_free_bit().map(|bit| self.block_id(bit))
    }

    /// Every not-yet-calculated block of the current epoch.
    pub fn free_blocks(&self) -> Vec<u128> {
        (0..self.bitmask.bit_count())
            .filter(|bit| !self.bitmask.is_bit_set(*bit))
            .map(|bit| self.block_id(bit))
            .collect()
    }

    /// Ors `other` into this state; both must describe the same epoch.
    pub fn merge(&mut self, other: &EpochState) -> Result<bool, EpochError> {
        if self.epoch_number != other.epoch_number {
            return Err(EpochError::EpochMismatch {
                local: self.epoch_number,
                remote: other.epoch_number,
            });
        }
        self.bitmask.merge(&other.bitmask)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::new();
        put_prefixed(&mut out, &to_signed_le_bytes(self.epoch_number), "epoch number")?;
        out.extend_from_slice(&self.bitmask.serialize());
        Ok(out)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(data);
        let epoch_number = from_signed_le_bytes(reader.read_prefixed("epoch number")?, "epoch number")?;
        let bitmask = Bitmask::deserialize(&mut reader)?;
        Ok(EpochState {
            epoch_number,
            bitmask,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_size_for() {
        assert_eq!(mask_size_for(1, 16384), 1);
        assert_eq!(mask_size_for(8, 16384), 1);
        assert_eq!(mask_size_for(1001, 16384), 126);
        assert_eq!(mask_size_for(1_000_000, 1024), 1024);
    }

    #[test]
    fn test_number_of_epochs() {
        assert_eq!(number_of_epochs(16, 1), 2);
        assert_eq!(number_of_epochs(17, 1), 3);
        assert_eq!(number_of_epochs(8, 1), 1);
        assert_eq!(number_of_epochs(1, 1), 1);
    }

    #[test]
    fn test_single_partial_epoch_is_prefilled() {
        // 5 blocks in one byte: bits 5, 6 and 7 are filler
        let mut state = EpochState::new(1);
        assert!(state.check_and_update(5));
        assert_eq!(state.bitmask.as_bytes(), &[0b1110_0000]);
        assert_eq!(state.calculated_blocks(5), 0);
        for bit in 0..5 {
            state.bitmask.set_bit(bit).unwrap();
        }
        assert_eq!(state.calculated_blocks(5), 5);
        assert_eq!(state.free_block_id(), None);
    }

    #[test]
    fn test_epoch_advances_when_full() {
        // 20 blocks, 8 per epoch: epochs 0, 1 and a final epoch with 4 blocks
        let mut state = EpochState::new(1);
        assert!(!state.check_and_update(20));
        state.bitmask.set_mask(&[0xFF]).unwrap();
        assert_eq!(state.calculated_blocks(20), 8);
        assert!(state.check_and_update(20));
        assert_eq!(state.epoch_number, 1);
        assert_eq!(state.bitmask.set_bits_count(), 0);
        assert_eq!(state.calculated_blocks(20), 8);

        state.bitmask.set_mask(&[0xFF]).unwrap();
        assert!(state.check_and_update(20));
        assert_eq!(state.epoch_number, 2);
        // final epoch: bits 4..8 pre-filled
        assert_eq!(state.bitmask.as_bytes(), &[0xF0]);
        assert_eq!(state.calculated_blocks(20), 16);
        assert_eq!(state.free_blocks(), vec![16, 17, 18, 19]);

        state.bitmask.set_mask(&[0xFF]).unwrap();
        assert!(!state.check_and_update(20));
        assert_eq!(state.epoch_number, 2);
        assert_eq!(state.calculated_blocks(20), 20);
    }

    #[test]
    fn test_huge_epoch_number_saturates() {
        let mut state = EpochState::new(2);
        state.epoch_number = 1 << 125;
        assert!(state.is_last_epoch(16));
        assert_eq!(state.calculated_blocks(16), 16);
        assert_eq!(state.block_id(3), u128::MAX);
        state.epoch_number = u128::MAX;
        assert!(state.is_last_epoch(16));
        assert_eq!(state.calculated_blocks(16), 16);
    }

    #[test]
    fn test_block_id() {
        let mut state = EpochState::new(2);
        state.epoch_number = 3;
        assert_eq!(state.block_id(5), 3 * 16 + 5);
    }

    #[test]
    fn test_merge_requires_same_epoch() {
        let mut a = EpochState::new(1);
        let mut b = EpochState::new(1);
        b.epoch_number = 1;
        assert_eq!(
            a.merge(&b),
            Err(EpochError::EpochMismatch { local: 0, remote: 1 })
        );
        b.epoch_number = 0;
        b.bitmask.set_bit(3).unwrap();
        assert!(a.merge(&b).unwrap());
        assert!(a.bitmask.is_bit_set(3));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut a = EpochState::new(2);
        let mut b = EpochState::new(2);
        b.bitmask.set_mask(&[0x0F, 0xF0]).unwrap();
        a.merge(&b).unwrap();
        let snapshot = a.clone();
        assert!(!a.merge(&b).unwrap());
        assert_eq!(a, snapshot);
    }

    #[test]
    fn test_serialize_round_trip() {
        let mut state = EpochState::new(4);
        state.epoch_number = 300;
        state.bitmask.set_mask(&[1, 2, 3, 4]).unwrap();
        let bytes = state.serialize().unwrap();
        assert_eq!(EpochState::deserialize(&bytes).unwrap(), state);
    }

    #[test]
    fn test_deserialize_truncated() {
        let state = EpochState::new(4);
        let bytes = state.serialize().unwrap();
        assert!(EpochState::deserialize(&bytes[..bytes.len() - 1]).is_err());
    }
}
