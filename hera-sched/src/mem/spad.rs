//! The on-chip scratchpad and its per-address access tracker.

use crate::consts::SPAD_MAX_CAPACITY_WORDS;
use crate::error::MemError;
use crate::inst::InstrRef;
use crate::mem::register::Slot;

/// A stamped access: a monotonic sequence number plus the instruction that
/// performed the access, if one is on record.
///
/// Sequence numbers are comparable across access kinds on the same SPAD:
/// the larger stamp happened later in program order.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessStamp {
    /// Monotonic order of the access among all tracked accesses.
    pub seq: u64,
    /// The instruction, or `None` if the access was cleared or never happened.
    pub instr: Option<InstrRef>,
}

/// Last access to one SPAD address, per direction.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessTracker {
    /// Last `mload` into this address.
    pub last_mload: AccessStamp,
    /// Last `mstore` from this address.
    pub last_mstore: AccessStamp,
    /// Last C-side read of this address (`cload`, `nload`, `bload`, `bones`,
    /// `kg_seed`).
    pub last_cload: AccessStamp,
    /// Last `cstore` into this address.
    pub last_cstore: AccessStamp,
}

/// The scratchpad: a word-addressed buffer with access tracking.
#[derive(Debug, Clone)]
pub struct Spad {
    slots: Vec<Option<Slot>>,
    trackers: Vec<AccessTracker>,
    seq: u64,
}

impl Spad {
    /// Creates a SPAD of `capacity_words` words.
    pub fn new(capacity_words: usize) -> Result<Self, MemError> {
        if capacity_words == 0 || capacity_words > SPAD_MAX_CAPACITY_WORDS {
            return Err(MemError::CapacityTooLarge {
                unit: "SPAD",
                requested: capacity_words,
                max: SPAD_MAX_CAPACITY_WORDS,
            });
        }
        Ok(Self {
            slots: vec![None; capacity_words],
            trackers: vec![AccessTracker::default(); capacity_words],
            seq: 0,
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
                unit: "SPAD",
                addr,
                capacity: self.slots.len(),
            });
        }
        Ok(())
    }

    /// Occupant of `addr`.
    pub fn slot(&self, addr: usize) -> Result<Option<Slot>, MemError> {
        self.check(addr)?;
        Ok(self.slots[addr])
    }

    /// Iterates over `(addr, occupant)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Option<Slot>)> + '_ {
        self.slots.iter().copied().enumerate()
    }

    pub(crate) fn set_slot(&mut self, addr: usize, slot: Option<Slot>) -> Result<(), MemError> {
        self.check(addr)?;
        self.slots[addr] = slot;
        Ok(())
    }

    /// Access tracking for `addr`.
    pub fn tracker(&self, addr: usize) -> Result<&AccessTracker, MemError> {
        self.check(addr)?;
        Ok(&self.trackers[addr])
    }

    fn stamp(&mut self, instr: Option<InstrRef>) -> AccessStamp {
        self.seq += 1;
        AccessStamp {
            seq: self.seq,
            instr,
        }
    }

    /// Records the last `mload` into `addr`.
    pub fn track_mload(&mut self, addr: usize, instr: Option<InstrRef>) -> Result<(), MemError> {
        self.check(addr)?;
        self.trackers[addr].last_mload = self.stamp(instr);
        Ok(())
    }

    /// Records the last `mstore` from `addr`.
    pub fn track_mstore(&mut self, addr: usize, instr: Option<InstrRef>) -> Result<(), MemError> {
        self.check(addr)?;
        self.trackers[addr].last_mstore = self.stamp(instr);
        Ok(())
    }

    /// Records the last C-side read of `addr`.
    pub fn track_cload(&mut self, addr: usize, instr: Option<InstrRef>) -> Result<(), MemError> {
        self.check(addr)?;
        self.trackers[addr].last_cload = self.stamp(instr);
        Ok(())
    }

    /// Records the last `cstore` into `addr`.
    pub fn track_cstore(&mut self, addr: usize, instr: Option<InstrRef>) -> Result<(), MemError> {
        self.check(addr)?;
        self.trackers[addr].last_cstore = self.stamp(instr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_bounds() {
        assert!(Spad::new(0).is_err());
        assert!(Spad::new(SPAD_MAX_CAPACITY_WORDS + 1).is_err());
        let spad = Spad::new(16).unwrap();
        assert_eq!(spad.capacity(), 16);
        assert!(spad.slot(16).is_err());
    }

    #[test]
    fn stamps_are_monotonic_across_kinds() {
        let mut spad = Spad::new(4).unwrap();
        spad.track_mload(0, None).unwrap();
        spad.track_cload(0, None).unwrap();
        spad.track_cstore(1, None).unwrap();
        let t0 = spad.tracker(0).unwrap();
        let t1 = spad.tracker(1).unwrap();
        assert!(t0.last_mload.seq < t0.last_cload.seq);
        assert!(t0.last_cload.seq < t1.last_cstore.seq);
        assert_eq!(t0.last_mstore.seq, 0);
    }
}
