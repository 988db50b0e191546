//! The accelerator memory model: HBM, SPAD, the banked register file and the
//! store buffer, plus the variable arena and metadata registries.
//!
//! All mutation goes through [`MemoryModel`] so the two-way links between
//! variables and their locations stay consistent: a variable knows its
//! register/SPAD/HBM address, and the owning slot points back at the
//! variable.

use std::collections::HashSet;
use std::io::{self, Write};

use indexmap::{IndexMap, IndexSet};

use crate::consts::{
    NUM_REGISTER_BANKS, TWIDDLE_META_VARS_PER_SEGMENT,
};
use crate::cycle::Cycle;
use crate::error::MemError;

pub mod hbm;
pub mod mem_info;
pub mod register;
pub mod spad;
pub mod variable;

pub use hbm::Hbm;
pub use mem_info::MemInfo;
pub use register::{RegId, Register, RegisterBank, Slot};
pub use spad::{AccessStamp, AccessTracker, Spad};
pub use variable::{VarAccess, VarId, Variable};

/// Victim-selection policy for register-file and SPAD eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplacementPolicy {
    /// Furthest-to-be-used: evict the variable whose next access is furthest
    /// away, breaking ties by least-recently-used, then by remaining uses.
    #[default]
    Ftbu,
    /// Least-recently-used.
    Lru,
}

/// An entry in the CE→SPAD store buffer: the in-flight variable and the SPAD
/// address its matching `cstore` will write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreBufferEntry {
    /// The variable pushed by `xstore`.
    pub var: VarId,
    /// Destination SPAD address.
    pub spad_addr: usize,
}

/// Metadata variable registries populated from the mem-info descriptor.
#[derive(Debug, Clone, Default)]
pub struct MetaRegistry {
    /// Identity metadata, one segment per 64 residuals.
    pub ones_segments: Vec<Vec<VarId>>,
    /// Twiddle metadata, eight variables per 64-residual segment.
    pub twiddle_segments: Vec<Vec<VarId>>,
    /// NTT auxiliary table.
    pub ntt_aux_table: Option<VarId>,
    /// NTT routing table.
    pub ntt_routing_table: Option<VarId>,
    /// iNTT auxiliary table.
    pub intt_aux_table: Option<VarId>,
    /// iNTT routing table.
    pub intt_routing_table: Option<VarId>,
    /// Keygen seed words, in declaration order.
    pub keygen_seeds: IndexSet<VarId>,
}

/// The memory model.
#[derive(Debug)]
pub struct MemoryModel {
    vars: Vec<Variable>,
    names: IndexMap<String, VarId>,
    /// The HBM data region.
    pub hbm: Hbm,
    /// The scratchpad.
    pub spad: Spad,
    banks: Vec<RegisterBank>,
    store_buffer: IndexMap<VarId, StoreBufferEntry>,
    /// Variables declared as kernel outputs, in declaration order.
    pub output_variables: IndexSet<VarId>,
    /// Metadata registries.
    pub meta: MetaRegistry,
    keygen_vars: IndexMap<VarId, (usize, usize)>,
}

impl MemoryModel {
    /// Creates a model with the given HBM and SPAD capacities in words.
    pub fn new(hbm_capacity_words: usize, spad_capacity_words: usize) -> Result<Self, MemError> {
        Ok(Self {
            vars: Vec::new(),
            names: IndexMap::new(),
            hbm: Hbm::new(hbm_capacity_words)?,
            spad: Spad::new(spad_capacity_words)?,
            banks: (0..NUM_REGISTER_BANKS).map(RegisterBank::new).collect(),
            store_buffer: IndexMap::new(),
            output_variables: IndexSet::new(),
            meta: MetaRegistry::default(),
            keygen_vars: IndexMap::new(),
        })
    }

    // Variables
    // ---------

    /// The variable behind `id`.
    pub fn var(&self, id: VarId) -> &Variable {
        &self.vars[id.0 as usize]
    }

    /// Mutable access to the variable behind `id`.
    pub fn var_mut(&mut self, id: VarId) -> &mut Variable {
        &mut self.vars[id.0 as usize]
    }

    /// Looks a variable up by name.
    pub fn find_var(&self, name: &str) -> Option<VarId> {
        self.names.get(name).copied()
    }

    /// Number of variables in the model.
    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    /// Iterates over all variables in creation order.
    pub fn iter_vars(&self) -> impl Iterator<Item = (VarId, &Variable)> {
        self.vars
            .iter()
            .enumerate()
            .map(|(i, v)| (VarId(i as u32), v))
    }

    /// Retrieves the named variable, creating it on first mention. A
    /// suggested bank is recorded on first suggestion and must not conflict
    /// afterwards.
    pub fn retrieve_var_add(
        &mut self,
        name: &str,
        suggested_bank: Option<usize>,
    ) -> Result<VarId, MemError> {
        if let Some(id) = self.find_var(name.trim()) {
            self.var_mut(id).set_suggested_bank(suggested_bank)?;
            return Ok(id);
        }
        let var = Variable::new(name, suggested_bank)?;
        let id = VarId(self.vars.len() as u32);
        self.names.insert(var.name().to_owned(), id);
        self.vars.push(var);
        Ok(id)
    }

    /// Finds a variable name not yet in use.
    pub fn find_unique_var_name(&self) -> String {
        let mut idx = 0usize;
        loop {
            let candidate = format!("_{idx}");
            if !self.names.contains_key(&candidate) {
                return candidate;
            }
            idx += 1;
        }
    }

    /// Whether the variable is materialized anywhere in the hierarchy.
    pub fn is_var_in_mem(&self, id: VarId) -> bool {
        let v = self.var(id);
        v.hbm_address.is_some() || v.spad_address().is_some() || v.register.is_some()
    }

    /// Effective readiness of a variable: its own tracker, or its register's
    /// if that is later.
    pub fn var_cycle_ready(&self, id: VarId) -> Cycle {
        let v = self.var(id);
        let mut ready = v.cycle_ready;
        if let Some(reg) = v.register {
            ready = ready.max(self.register(reg).cycle_ready);
        }
        ready
    }

    // Register file
    // -------------

    /// The register banks.
    pub fn banks(&self) -> &[RegisterBank] {
        &self.banks
    }

    /// The register behind `id`.
    pub fn register(&self, id: RegId) -> &Register {
        self.banks[id.bank].register(id.index)
    }

    /// Mutable access to the register behind `id`.
    pub fn register_mut(&mut self, id: RegId) -> &mut Register {
        self.banks[id.bank].register_mut(id.index)
    }

    /// Whether the register holding the variable is dirty.
    pub fn var_register_dirty(&self, id: VarId) -> bool {
        self.var(id)
            .register
            .map(|r| self.register(r).dirty)
            .unwrap_or(false)
    }

    /// Marks the register holding the variable dirty or clean. No-op when
    /// the variable is not register-resident.
    pub fn set_var_register_dirty(&mut self, id: VarId, dirty: bool) {
        if let Some(reg) = self.var(id).register {
            self.register_mut(reg).dirty = dirty;
        }
    }

    /// Places `slot` into the register, unlinking any previous occupant and
    /// any previous register of an incoming variable. The register comes out
    /// clean.
    pub fn allocate_register(&mut self, reg: RegId, slot: Option<Slot>) {
        if let Some(Slot::Var(old)) = self.register(reg).slot {
            debug_assert!(!self.register(reg).dirty, "deallocating a dirty register");
            let old_var = self.var_mut(old);
            old_var.register = None;
            old_var.last_x_access = None;
        }
        if let Some(Slot::Var(new)) = slot {
            if let Some(prev) = self.var(new).register {
                let prev_reg = self.register_mut(prev);
                prev_reg.slot = None;
                prev_reg.dirty = false;
            }
            let var = self.var_mut(new);
            var.register = Some(reg);
            var.last_x_access = None;
        }
        let register = self.register_mut(reg);
        register.slot = slot;
        register.dirty = false;
    }

    /// Finds a free register in `bank`, or, when a policy is given, the
    /// best occupied victim not in `live`. Dummy occupants are never victims.
    pub fn find_available_register(
        &self,
        bank: usize,
        live: &HashSet<VarId>,
        policy: Option<ReplacementPolicy>,
    ) -> Option<RegId> {
        let mut best: Option<(usize, ReplPriority)> = None;
        for (id, reg) in self.banks[bank].iter() {
            match reg.slot {
                None => return Some(id),
                Some(Slot::Dummy { .. }) => {}
                Some(Slot::Var(v)) => {
                    if let Some(policy) = policy {
                        if !live.contains(&v) {
                            let p = replacement_priority(self.var(v), policy);
                            if best.map(|(_, bp)| p < bp).unwrap_or(true) {
                                best = Some((id.index, p));
                            }
                        }
                    }
                }
            }
        }
        best.map(|(index, _)| RegId { bank, index })
    }

    /// Cleans up a register bank, freeing clean, cycle-ready, non-live
    /// registers by replacement priority until at most `pct` of the bank
    /// remains occupied.
    pub fn flush_register_bank(
        &mut self,
        bank: usize,
        current_cycle: Cycle,
        policy: ReplacementPolicy,
        live: &HashSet<VarId>,
        pct: f64,
    ) {
        let mut candidates: Vec<(ReplPriority, RegId)> = Vec::new();
        let mut occupied = 0usize;
        for (id, reg) in self.banks[bank].iter() {
            let Some(slot) = reg.slot else { continue };
            occupied += 1;
            if reg.dirty {
                continue;
            }
            let Some(v) = slot.var() else { continue };
            if live.contains(&v) || self.var_cycle_ready(v) > current_cycle {
                continue;
            }
            candidates.push((replacement_priority(self.var(v), policy), id));
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.index.cmp(&b.1.index)));
        let total = self.banks[bank].len() as f64;
        for (_, reg) in candidates {
            if occupied as f64 / total <= pct {
                break;
            }
            self.allocate_register(reg, None);
            occupied -= 1;
        }
    }

    // SPAD
    // ----

    /// Places `slot` at a free SPAD address.
    pub fn spad_allocate_force(&mut self, addr: usize, slot: Slot) -> Result<(), MemError> {
        if self.spad.slot(addr)?.is_some() {
            return Err(MemError::SlotOccupied { unit: "SPAD", addr });
        }
        if let Slot::Var(v) = slot {
            match self.var(v).spad_address() {
                None => self.var_mut(v).set_spad_address(Some(addr)),
                Some(existing) if existing == addr => {}
                Some(existing) => {
                    return Err(MemError::DoubleAllocation {
                        unit: "SPAD",
                        name: self.var(v).name().to_owned(),
                        existing,
                        requested: addr,
                    })
                }
            }
        }
        self.spad.set_slot(addr, Some(slot))
    }

    /// Frees the SPAD slot at `addr`, unlinking its variable.
    pub fn spad_deallocate(&mut self, addr: usize) -> Result<Slot, MemError> {
        let Some(slot) = self.spad.slot(addr)? else {
            return Err(MemError::SlotAlreadyFree { unit: "SPAD", addr });
        };
        if let Slot::Var(v) = slot {
            self.var_mut(v).set_spad_address(None);
        }
        self.spad.set_slot(addr, None)?;
        Ok(slot)
    }

    /// Finds a free SPAD address, or, when a policy is given, the best
    /// occupied victim not in `live`.
    pub fn spad_find_available_address(
        &self,
        live: &HashSet<VarId>,
        policy: Option<ReplacementPolicy>,
    ) -> Option<usize> {
        let mut best: Option<(usize, ReplPriority)> = None;
        for (addr, slot) in self.spad.iter() {
            match slot {
                None => return Some(addr),
                Some(Slot::Dummy { .. }) => {}
                Some(Slot::Var(v)) => {
                    if let Some(policy) = policy {
                        if !live.contains(&v) {
                            let p = replacement_priority(self.var(v), policy);
                            if best.map(|(_, bp)| p < bp).unwrap_or(true) {
                                best = Some((addr, p));
                            }
                        }
                    }
                }
            }
        }
        best.map(|(addr, _)| addr)
    }

    // HBM
    // ---

    /// Pins a variable at an HBM address.
    pub fn hbm_allocate_force(&mut self, addr: usize, var: VarId) -> Result<(), MemError> {
        if let Some(existing) = self.var(var).hbm_address {
            return Err(MemError::DoubleAllocation {
                unit: "HBM",
                name: self.var(var).name().to_owned(),
                existing,
                requested: addr,
            });
        }
        if self.hbm.slot(addr)?.is_some() {
            return Err(MemError::SlotOccupied { unit: "HBM", addr });
        }
        self.hbm.set_slot(addr, Some(var))?;
        self.var_mut(var).hbm_address = Some(addr);
        Ok(())
    }

    /// Frees the HBM slot at `addr`, unlinking its variable.
    pub fn hbm_deallocate(&mut self, addr: usize) -> Result<VarId, MemError> {
        let Some(var) = self.hbm.slot(addr)? else {
            return Err(MemError::SlotAlreadyFree { unit: "HBM", addr });
        };
        self.hbm.set_slot(addr, None)?;
        self.var_mut(var).hbm_address = None;
        Ok(var)
    }

    // Store buffer
    // ------------

    /// Pushes a variable onto the store buffer.
    pub fn store_buffer_push(&mut self, var: VarId, spad_addr: usize) {
        self.store_buffer
            .insert(var, StoreBufferEntry { var, spad_addr });
    }

    /// Pops the oldest store-buffer entry.
    pub fn store_buffer_pop(&mut self) -> Option<StoreBufferEntry> {
        self.store_buffer.shift_remove_index(0).map(|(_, e)| e)
    }

    /// The oldest store-buffer entry, if any.
    pub fn store_buffer_peek(&self) -> Option<StoreBufferEntry> {
        self.store_buffer.get_index(0).map(|(_, e)| *e)
    }

    /// Whether the variable is in flight between CE and SPAD.
    pub fn store_buffer_contains(&self, var: VarId) -> bool {
        self.store_buffer.contains_key(&var)
    }

    /// Number of in-flight store-buffer entries.
    pub fn store_buffer_len(&self) -> usize {
        self.store_buffer.len()
    }

    // Metadata registries
    // -------------------

    /// Marks a variable as identity ("ones") metadata; each forms its own
    /// residual segment.
    pub fn add_meta_ones_var(&mut self, var: VarId) {
        self.meta.ones_segments.push(vec![var]);
    }

    /// Marks a variable as twiddle metadata; grouped eight per segment.
    pub fn add_meta_twiddle_var(&mut self, var: VarId) {
        match self.meta.twiddle_segments.last_mut() {
            Some(seg) if seg.len() < TWIDDLE_META_VARS_PER_SEGMENT => seg.push(var),
            _ => self.meta.twiddle_segments.push(vec![var]),
        }
    }

    /// Marks a variable as a keygen seed word.
    pub fn add_meta_keygen_seed_var(&mut self, var: VarId) {
        self.meta.keygen_seeds.insert(var);
    }

    /// Whether the variable is one of the metadata variables.
    pub fn is_meta_var(&self, var: VarId) -> bool {
        self.meta.keygen_seeds.contains(&var)
            || self.meta.twiddle_segments.iter().any(|s| s.contains(&var))
            || self.meta.ones_segments.iter().any(|s| s.contains(&var))
            || [
                self.meta.ntt_aux_table,
                self.meta.ntt_routing_table,
                self.meta.intt_aux_table,
                self.meta.intt_routing_table,
            ]
            .contains(&Some(var))
    }

    /// Registered key material: variable → (seed index, key index).
    pub fn keygen_variables(&self) -> &IndexMap<VarId, (usize, usize)> {
        &self.keygen_vars
    }

    /// Marks a variable as key material produced by `(seed, key)`.
    pub fn add_keygen_variable(
        &mut self,
        var: VarId,
        seed_index: usize,
        key_index: usize,
    ) -> Result<(), MemError> {
        let name = self.var(var).name().to_owned();
        if self.keygen_vars.contains_key(&var) {
            return Err(MemError::AlreadyKeygen(name));
        }
        if self.output_variables.contains(&var) {
            return Err(MemError::OutputAsKeygen(name));
        }
        if seed_index >= self.meta.keygen_seeds.len() {
            return Err(MemError::SeedOutOfRange {
                seed: seed_index,
                available: self.meta.keygen_seeds.len(),
            });
        }
        self.keygen_vars.insert(var, (seed_index, key_index));
        Ok(())
    }

    // Diagnostics
    // -----------

    /// Dumps the model state for post-mortem diagnostics.
    pub fn dump<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "variables")?;
        writeln!(
            out,
            "name, hbm, spad, spad dirty, suggested bank, register, register dirty, pending uses"
        )?;
        for (id, v) in self.iter_vars() {
            writeln!(
                out,
                "{}, {:?}, {:?}, {}, {:?}, {}, {}, {}",
                v.name(),
                v.hbm_address,
                v.spad_address(),
                v.spad_dirty(),
                v.suggested_bank(),
                v.register.map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
                self.var_register_dirty(id),
                v.accessed_by_xinsts.len(),
            )?;
        }
        writeln!(out)?;
        writeln!(out, "HBM: {}/{} words occupied", self.hbm.occupied(), self.hbm.capacity())?;
        for (addr, slot) in self.hbm.iter() {
            if let Some(v) = slot {
                writeln!(out, "{}, {}", addr, self.var(v).name())?;
            }
        }
        writeln!(out)?;
        writeln!(out, "SPAD: {}/{} words occupied", self.spad.occupied(), self.spad.capacity())?;
        for (addr, slot) in self.spad.iter() {
            match slot {
                Some(Slot::Var(v)) => writeln!(out, "{}, {}", addr, self.var(v).name())?,
                Some(Slot::Dummy { tag }) => writeln!(out, "{addr}, <dummy {tag}>")?,
                None => {}
            }
        }
        for bank in &self.banks {
            writeln!(out)?;
            writeln!(out, "register bank {} ({} registers)", bank.index(), bank.len())?;
            for (id, reg) in bank.iter() {
                match reg.slot {
                    Some(Slot::Var(v)) => {
                        writeln!(out, "{}, {}, dirty={}", id, self.var(v).name(), reg.dirty)?
                    }
                    Some(Slot::Dummy { tag }) => writeln!(out, "{id}, <dummy {tag}>")?,
                    None => {}
                }
            }
        }
        Ok(())
    }
}

/// Priority for reusing a variable's location; smaller is replaced first.
type ReplPriority = (i64, Cycle, i64);

fn replacement_priority(var: &Variable, policy: ReplacementPolicy) -> ReplPriority {
    let last = var.last_x_access.unwrap_or(Cycle::ZERO);
    match policy {
        ReplacementPolicy::Ftbu => match var.accessed_by_xinsts.front() {
            // Furthest next access first, then oldest access, then fewest
            // remaining uses.
            Some(next) => (
                -(next.index as i64),
                last,
                var.accessed_by_xinsts.len() as i64,
            ),
            None => (i64::MIN, Cycle::ZERO, 0),
        },
        ReplacementPolicy::Lru => (0, last, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::InstrRef;

    fn model() -> MemoryModel {
        MemoryModel::new(64, 32).unwrap()
    }

    #[test]
    fn retrieve_var_add_dedups_by_name() {
        let mut m = model();
        let a = m.retrieve_var_add("a", Some(1)).unwrap();
        let a2 = m.retrieve_var_add("a", None).unwrap();
        assert_eq!(a, a2);
        assert_eq!(m.var(a).suggested_bank(), Some(1));
        assert!(m.retrieve_var_add("a", Some(2)).is_err());
        assert_eq!(m.var_count(), 1);
    }

    #[test]
    fn register_allocation_links_both_ways() {
        let mut m = model();
        let a = m.retrieve_var_add("a", Some(1)).unwrap();
        let r0 = RegId { bank: 0, index: 0 };
        let r1 = RegId { bank: 1, index: 3 };
        m.allocate_register(r0, Some(Slot::Var(a)));
        assert_eq!(m.var(a).register, Some(r0));
        assert_eq!(m.register(r0).slot, Some(Slot::Var(a)));
        // Moving the variable to another register frees the old one.
        m.allocate_register(r1, Some(Slot::Var(a)));
        assert_eq!(m.var(a).register, Some(r1));
        assert!(m.register(r0).slot.is_none());
        // Clearing unlinks the variable.
        m.allocate_register(r1, None);
        assert_eq!(m.var(a).register, None);
    }

    #[test]
    fn spad_allocation_rules() {
        let mut m = model();
        let a = m.retrieve_var_add("a", None).unwrap();
        m.spad_allocate_force(5, Slot::Var(a)).unwrap();
        assert_eq!(m.var(a).spad_address(), Some(5));
        assert_eq!(
            m.spad_allocate_force(5, Slot::Dummy { tag: 0 }),
            Err(MemError::SlotOccupied { unit: "SPAD", addr: 5 })
        );
        assert_eq!(m.spad_deallocate(5).unwrap(), Slot::Var(a));
        assert_eq!(m.var(a).spad_address(), None);
        assert!(m.spad_deallocate(5).is_err());
    }

    #[test]
    fn hbm_double_allocation_rejected() {
        let mut m = model();
        let a = m.retrieve_var_add("a", None).unwrap();
        m.hbm_allocate_force(3, a).unwrap();
        assert!(matches!(
            m.hbm_allocate_force(4, a),
            Err(MemError::DoubleAllocation { unit: "HBM", .. })
        ));
    }

    #[test]
    fn store_buffer_is_fifo() {
        let mut m = model();
        let a = m.retrieve_var_add("a", None).unwrap();
        let b = m.retrieve_var_add("b", None).unwrap();
        m.store_buffer_push(a, 1);
        m.store_buffer_push(b, 2);
        assert_eq!(m.store_buffer_peek().unwrap().var, a);
        assert_eq!(m.store_buffer_pop().unwrap().spad_addr, 1);
        assert_eq!(m.store_buffer_pop().unwrap().var, b);
        assert!(m.store_buffer_pop().is_none());
    }

    #[test]
    fn ftbu_prefers_furthest_next_use() {
        let mut m = model();
        let near = m.retrieve_var_add("near", Some(1)).unwrap();
        let far = m.retrieve_var_add("far", Some(1)).unwrap();
        m.var_mut(near).accessed_by_xinsts.push_back(VarAccess {
            index: 2,
            instr: InstrRef::new(0),
        });
        m.var_mut(far).accessed_by_xinsts.push_back(VarAccess {
            index: 50,
            instr: InstrRef::new(1),
        });
        m.allocate_register(RegId { bank: 1, index: 0 }, Some(Slot::Var(near)));
        m.allocate_register(RegId { bank: 1, index: 1 }, Some(Slot::Var(far)));
        // Fill the rest of the bank with dummies so only the two candidates
        // are considered.
        for index in 2..m.banks()[1].len() {
            m.allocate_register(RegId { bank: 1, index }, Some(Slot::Dummy { tag: 0 }));
        }
        let victim = m
            .find_available_register(1, &HashSet::new(), Some(ReplacementPolicy::Ftbu))
            .unwrap();
        assert_eq!(m.register(victim).slot, Some(Slot::Var(far)));
        // A variable with no remaining uses wins over both.
        let dead = m.retrieve_var_add("dead", Some(1)).unwrap();
        m.allocate_register(RegId { bank: 1, index: 2 }, Some(Slot::Var(dead)));
        let victim = m
            .find_available_register(1, &HashSet::new(), Some(ReplacementPolicy::Ftbu))
            .unwrap();
        assert_eq!(m.register(victim).slot, Some(Slot::Var(dead)));
    }

    #[test]
    fn bank_zero_without_policy_only_finds_free() {
        let mut m = model();
        let a = m.retrieve_var_add("a", None).unwrap();
        for index in 0..m.banks()[0].len() {
            m.allocate_register(RegId { bank: 0, index }, Some(Slot::Var(a)));
            // Re-allocate `a` each time; fill remaining with dummies instead.
        }
        // After the loop `a` sits in the last register and earlier ones were
        // freed by relocation, so pin them with dummies.
        for index in 0..m.banks()[0].len() - 1 {
            m.allocate_register(RegId { bank: 0, index }, Some(Slot::Dummy { tag: 0 }));
        }
        assert_eq!(m.find_available_register(0, &HashSet::new(), None), None);
    }
}
