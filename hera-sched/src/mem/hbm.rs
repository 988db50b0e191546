//! The HBM data region.

use crate::consts::HBM_MAX_CAPACITY_WORDS;
use crate::error::MemError;
use crate::mem::variable::VarId;

/// High-bandwidth memory: a word-addressed buffer of variables.
///
/// Access ordering on HBM is implicit in MInstQ program order, so unlike the
/// SPAD there is no per-address tracker.
#[derive(Debug, Clone)]
pub struct Hbm {
    slots: Vec<Option<VarId>>,
}

impl Hbm {
    /// Creates an HBM data region of `capacity_words` words.
    pub fn new(capacity_words: usize) -> Result<Self, MemError> {
        if capacity_words == 0 || capacity_words > HBM_MAX_CAPACITY_WORDS {
            return Err(MemError::CapacityTooLarge {
                unit: "HBM",
                requested: capacity_words,
                max: HBM_MAX_CAPACITY_WORDS,
            });
        }
        Ok(Self {
            slots: vec![None; capacity_words],
        })
    }

    /// Capacity in words.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Occupied word count.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn check(&self, addr: usize) -> Result<(), MemError> {
        if addr >= self.slots.len() {
            return Err(MemError::AddressOutOfRange {
                unit: "HBM",
                addr,
                capacity: self.slots.len(),
            });
        }
        Ok(())
    }

    /// Occupant of `addr`.
    pub fn slot(&self, addr: usize) -> Result<Option<VarId>, MemError> {
        self.check(addr)?;
        Ok(self.slots[addr])
    }

    /// Iterates over `(addr, occupant)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Option<VarId>)> + '_ {
        self.slots.iter().copied().enumerate()
    }

    pub(crate) fn set_slot(&mut self, addr: usize, slot: Option<VarId>) -> Result<(), MemError> {
        self.check(addr)?;
        self.slots[addr] = slot;
        Ok(())
    }

    /// First free address, skipping none for replacement: HBM residents are
    /// only displaced by explicit deallocation.
    pub fn find_available_address(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_bounds() {
        assert!(Hbm::new(0).is_err());
        assert!(Hbm::new(HBM_MAX_CAPACITY_WORDS + 1).is_err());
        let hbm = Hbm::new(8).unwrap();
        assert_eq!(hbm.capacity(), 8);
        assert_eq!(hbm.find_available_address(), Some(0));
    }
}
