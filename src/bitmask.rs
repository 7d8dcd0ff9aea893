use rand::Rng;

use crate::codec::Reader;
use crate::error::{EpochError, ProtocolError};

/// Fixed-size bit set tracking which blocks of one epoch are done.
///
/// Bit `i` lives in byte `i / 8` under the value `1 << (i % 8)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmask {
    mask: Vec<u8>,
}

impl Bitmask {
    /// Creates an all-clear mask of `mask_size` bytes.
    pub fn new(mask_size: u32) -> Self {
        Bitmask {
            mask: vec![0u8; mask_size as usize],
        }
    }

    pub fn mask_size(&self) -> u32 {
        self.mask.len() as u32
    }

    /// Number of blocks (bits) the mask covers.
    pub fn bit_count(&self) -> usize {
        self.mask.len() * 8
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.mask
    }

    pub fn set_mask_byte(&mut self, offset: usize, value: u8) -> Result<(), EpochError> {
        let size = self.mask_size();
        let byte = self
            .mask
            .get_mut(offset)
            .ok_or(EpochError::OutOfRange { offset, size })?;
        *byte = value;
        Ok(())
    }

    /// Replaces the whole mask; the new bytes must have the same size.
    pub fn set_mask(&mut self, bytes: &[u8]) -> Result<(), EpochError> {
        if bytes.len() != self.mask.len() {
            return Err(EpochError::MaskSizeMismatch {
                local: self.mask_size(),
                remote: bytes.len() as u32,
            });
        }
        self.mask.copy_from_slice(bytes);
        Ok(())
    }

    pub fn set_bit(&mut self, index: usize) -> Result<(), EpochError> {
        let size = self.mask_size();
        let byte = self
            .mask
            .get_mut(index / 8)
            .ok_or(EpochError::OutOfRange { offset: index / 8, size })?;
        *byte |= 1 << (index % 8);
        Ok(())
    }

    pub fn is_bit_set(&self, index: usize) -> bool {
        self.mask
            .get(index / 8)
            .map(|byte| byte & (1 << (index % 8)) != 0)
            .unwrap_or(false)
    }

    pub fn set_bits_count(&self) -> usize {
        self.mask.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn free_bits(&self) -> usize {
        self.bit_count() - self.set_bits_count()
    }

    pub fn clear(&mut self) {
        self.mask.iter_mut().for_each(|b| *b = 0);
    }

    /// Picks one unset bit uniformly at random, `None` when the mask is full.
    pub fn get_random_free_bit(&self) -> Option<usize> {
        let free = self.free_bits();
        if free == 0 {
            return None;
        }
        let pick = rand::thread_rng().gen_range(0..free);
        (0..self.bit_count())
            .filter(|i| !self.is_bit_set(*i))
            .nth(pick)
    }

    /// Ors `other` into this mask and reports whether any bit changed.
    pub fn merge(&mut self, other: &Bitmask) -> Result<bool, EpochError> {
        if other.mask.len() != self.mask.len() {
            return Err(EpochError::MaskSizeMismatch {
                local: self.mask_size(),
                remote: other.mask_size(),
            });
        }
        let mut changed = false;
        for (mine, theirs) in self.mask.iter_mut().zip(other.mask.iter()) {
            let merged = *mine | *theirs;
            changed |= merged != *mine;
            *mine = merged;
        }
        Ok(changed)
    }

    /// `u32` mask size followed by the mask bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.mask.len());
        out.extend_from_slice(&self.mask_size().to_le_bytes());
        out.extend_from_slice(&self.mask);
        out
    }

    pub fn deserialize(reader: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let size = reader.read_u32("bitmask size")? as usize;
        let mask = reader.read_bytes(size, "bitmask")?.to_vec();
        Ok(Bitmask { mask })
    }
}
