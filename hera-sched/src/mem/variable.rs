//! Variables: polynomial residues tracked across the memory hierarchy.

use std::collections::VecDeque;
use std::fmt;

use crate::consts::NUM_REGISTER_BANKS;
use crate::cycle::Cycle;
use crate::error::MemError;
use crate::inst::InstrRef;
use crate::mem::register::RegId;

/// Arena index of a [`Variable`] in the memory model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub(crate) u32);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// One upcoming XInst access to a variable, in estimated listing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarAccess {
    /// Estimated index of the accessing instruction in the topological order.
    pub index: usize,
    /// The accessing instruction.
    pub instr: InstrRef,
}

/// A polynomial residue and its locations across HBM, SPAD and the register
/// file.
///
/// A variable lives in at most one register at a time; the containing
/// register's slot points back at it. Dirty flags gate write-back: a dirty
/// register has not reached SPAD, a dirty SPAD word has not reached HBM.
#[derive(Debug, Clone)]
pub struct Variable {
    name: String,
    suggested_bank: Option<usize>,
    /// HBM data-region word index, if the variable is stored in HBM.
    pub hbm_address: Option<usize>,
    spad_address: Option<usize>,
    spad_dirty: bool,
    /// Register currently holding the variable.
    pub register: Option<RegId>,
    /// Cycle at which the variable's value is ready at its current location.
    pub cycle_ready: Cycle,
    /// Cycle of the last XInst access, if any.
    pub last_x_access: Option<Cycle>,
    /// Upcoming XInst accesses in estimated order.
    pub accessed_by_xinsts: VecDeque<VarAccess>,
}

impl Variable {
    /// Creates a variable, validating its name and suggested bank.
    pub fn new(name: &str, suggested_bank: Option<usize>) -> Result<Self, MemError> {
        let name = name.trim();
        if !Self::is_valid_name(name) {
            return Err(MemError::InvalidVariableName(name.into()));
        }
        if let Some(bank) = suggested_bank {
            if bank >= NUM_REGISTER_BANKS {
                return Err(MemError::SuggestedBankOutOfRange {
                    name: name.into(),
                    bank,
                });
            }
        }
        Ok(Self {
            name: name.into(),
            suggested_bank,
            hbm_address: None,
            spad_address: None,
            spad_dirty: false,
            register: None,
            cycle_ready: Cycle::ZERO,
            last_x_access: None,
            accessed_by_xinsts: VecDeque::new(),
        })
    }

    /// Whether `name` is an acceptable variable identifier.
    pub fn is_valid_name(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    /// The variable's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The suggested register bank, if any.
    pub fn suggested_bank(&self) -> Option<usize> {
        self.suggested_bank
    }

    /// Records a suggested bank. A `None` suggestion is ignored; a
    /// conflicting one is rejected.
    pub fn set_suggested_bank(&mut self, bank: Option<usize>) -> Result<(), MemError> {
        let Some(bank) = bank else { return Ok(()) };
        if bank >= NUM_REGISTER_BANKS {
            return Err(MemError::SuggestedBankOutOfRange {
                name: self.name.clone(),
                bank,
            });
        }
        match self.suggested_bank {
            None => {
                self.suggested_bank = Some(bank);
                Ok(())
            }
            Some(existing) if existing == bank => Ok(()),
            Some(existing) => Err(MemError::SuggestedBankMismatch {
                name: self.name.clone(),
                existing,
                requested: bank,
            }),
        }
    }

    /// SPAD word index holding the variable, if any.
    pub fn spad_address(&self) -> Option<usize> {
        self.spad_address
    }

    /// Moves the variable to a SPAD address (or out of SPAD). Overwriting the
    /// location clears the dirty flag.
    pub(crate) fn set_spad_address(&mut self, addr: Option<usize>) {
        self.spad_dirty = false;
        self.spad_address = addr;
    }

    /// Whether the SPAD copy is newer than the HBM copy.
    pub fn spad_dirty(&self) -> bool {
        self.spad_address.is_some() && self.spad_dirty
    }

    /// Sets the SPAD dirty flag.
    pub fn set_spad_dirty(&mut self, dirty: bool) {
        self.spad_dirty = dirty;
    }

    /// Removes one upcoming access by instruction, front to back.
    pub(crate) fn remove_access(&mut self, instr: InstrRef) -> bool {
        if let Some(pos) = self.accessed_by_xinsts.iter().position(|a| a.instr == instr) {
            self.accessed_by_xinsts.remove(pos);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(Variable::is_valid_name("a"));
        assert!(Variable::is_valid_name("_tmp_0"));
        assert!(Variable::is_valid_name("outtmp_9_0"));
        assert!(!Variable::is_valid_name(""));
        assert!(!Variable::is_valid_name("9lives"));
        assert!(!Variable::is_valid_name("a-b"));
        assert!(Variable::new("bad name", None).is_err());
    }

    #[test]
    fn suggested_bank_rules() {
        let mut v = Variable::new("a", None).unwrap();
        v.set_suggested_bank(None).unwrap();
        assert_eq!(v.suggested_bank(), None);
        v.set_suggested_bank(Some(2)).unwrap();
        v.set_suggested_bank(Some(2)).unwrap();
        assert_eq!(
            v.set_suggested_bank(Some(1)),
            Err(MemError::SuggestedBankMismatch {
                name: "a".into(),
                existing: 2,
                requested: 1
            })
        );
        assert!(Variable::new("a", Some(NUM_REGISTER_BANKS)).is_err());
    }

    #[test]
    fn spad_overwrite_clears_dirty() {
        let mut v = Variable::new("a", None).unwrap();
        v.set_spad_address(Some(7));
        v.set_spad_dirty(true);
        assert!(v.spad_dirty());
        v.set_spad_address(Some(9));
        assert!(!v.spad_dirty());
        v.set_spad_dirty(true);
        v.set_spad_address(None);
        assert!(!v.spad_dirty());
    }
}
