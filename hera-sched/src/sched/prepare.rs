//! Operand preparation: the register-bank protocol.
//!
//! Before an XInst can issue, every operand variable must sit in the
//! register file, in its suggested bank. Sources come up through the
//! staging bank: HBM to SPAD (`mload`), SPAD to bank 0 (`cload`), bank 0 to
//! compute bank (`move`). Key material instead enters through the keygen
//! engine (`kg_load`). Destinations just need a register in their
//! bank, evicting by replacement policy when full; eviction of dirty
//! contents goes back out through `xstore`/`cstore`, and SPAD victims
//! through `mstore`.
//!
//! Every step can fail transiently (no free register, no SPAD slot, seed
//! already consumed this bundle); the consuming instruction is then
//! deferred, never errored.

use hera_asm::XOp;

use crate::consts::{NUM_REGISTER_BANKS, STAGING_BANK};
use crate::cycle::Cycle;
use crate::error::ScheduleError;
use crate::inst::{CKind, InstrKind, InstrRef, MKind, Operand, XKind};
use crate::mem::{RegId, Slot, VarAccess, VarId};

use super::Sim;

/// Outcome of preparing an instruction.
pub(super) enum Prepared {
    /// A bundle constraint failed; re-queue for a later bundle.
    Defer,
    /// Ready to schedule: the instruction itself, or a preparation
    /// instruction (`move`/`xstore`) that must go first.
    Ready(InstrRef),
}

/// Outcome of looking for a register.
enum FoundRegister {
    /// A register is free (and holds the destination variable, if one was
    /// given).
    Ready(RegId),
    /// The chosen victim is dirty; this `xstore` evicts it.
    Evict(InstrRef),
    /// Nothing available this bundle.
    Unavailable,
}

impl Sim<'_> {
    /// Makes the operands of `original` register-resident, emitting
    /// preparation instructions as needed.
    pub(super) fn prepare_instruction(
        &mut self,
        original: InstrRef,
    ) -> Result<Prepared, ScheduleError> {
        let client = self.program[original].id.client;
        let sources = self.program[original].sources.clone();
        let mut expanded_dests = self.program[original].dests.clone();
        // NTT stage 0 generates its own twiddles: the twiddle source only
        // needs a register, not a load.
        let stage0_twiddles = matches!(
            &self.program[original].kind,
            InstrKind::X {
                kind: XKind::Ntt { stage: 0 } | XKind::Intt { stage: 0 },
                ..
            }
        );

        for (idx, src) in sources.iter().enumerate() {
            let Some(v) = src.var() else { continue };
            if idx == 2 && stage0_twiddles {
                expanded_dests.push(*src);
                continue;
            }
            if self.live_outs.contains(&v) {
                // Marked for eviction in this bundle.
                return Ok(Prepared::Defer);
            }
            self.add_live_var(v, original);

            if self.model.var(v).register.is_none() {
                let new_keygen = !self.model.is_var_in_mem(v)
                    && self.model.keygen_variables().contains_key(&v);
                if !new_keygen && self.model.var(v).spad_address().is_none() {
                    debug_assert!(
                        !self.model.store_buffer_contains(v),
                        "loading a variable still in transit through the store buffer"
                    );
                    if !self.load_var_hbm_to_spad(original, v)? {
                        return Ok(Prepared::Defer);
                    }
                }
                // Staging-bank registers are never evicted from under live
                // variables.
                match self.find_register(original, STAGING_BANK, true, None)? {
                    FoundRegister::Unavailable => return Ok(Prepared::Defer),
                    FoundRegister::Evict(xstore) => return Ok(Prepared::Ready(xstore)),
                    FoundRegister::Ready(reg) => {
                        if new_keygen {
                            if !self.generate_key_material(client, v, reg)? {
                                // Seed already consumed this bundle.
                                return Ok(Prepared::Defer);
                            }
                            // The key exists nowhere else; keep it flushable.
                            self.model.set_var_register_dirty(v, true);
                        } else {
                            let spad_addr =
                                self.model.var(v).spad_address().expect("loaded into SPAD");
                            self.queue_csyncm_load(client, spad_addr)?;
                            let cload = self.new_cinst(
                                client,
                                CKind::CLoad,
                                vec![Operand::Var(v)],
                                vec![Operand::Reg(reg)],
                                format!("dep id: {}", self.program[original].id),
                            );
                            self.push_cinst(cload)?;
                        }
                    }
                }
            }

            let reg = self
                .model
                .var(v)
                .register
                .expect("source prepared into a register");
            if reg.bank == STAGING_BANK {
                // Bring the variable to its compute bank.
                let target_bank = self
                    .model
                    .var(v)
                    .suggested_bank()
                    .unwrap_or(NUM_REGISTER_BANKS - 1);
                match self.find_register(original, target_bank, false, None)? {
                    FoundRegister::Unavailable => return Ok(Prepared::Defer),
                    FoundRegister::Evict(xstore) => return Ok(Prepared::Ready(xstore)),
                    FoundRegister::Ready(target) => {
                        let tag = self.current_cycle.bundle;
                        self.model
                            .allocate_register(target, Some(Slot::Dummy { tag }));
                        let move_spec = *self.spec.xinst(XOp::Move);
                        let xmove = self.program.push(
                            client,
                            move_spec.default_throughput,
                            move_spec.default_latency,
                            vec![Operand::Var(v)],
                            vec![Operand::Reg(target)],
                            String::new(),
                            InstrKind::X {
                                n: 0,
                                res: None,
                                kind: XKind::Move,
                            },
                        );
                        if self.program[xmove].cycle_ready.bundle < self.current_cycle.bundle {
                            self.program[xmove].cycle_ready =
                                Cycle::new(self.current_cycle.bundle, 0);
                        }
                        if self.has_bank_write_conflict(xmove) {
                            let bumped = self.program[xmove].cycle_ready + 1;
                            self.program[xmove].cycle_ready = bumped;
                            if !self.schedule_xnop(xmove, 1, false)? {
                                return Ok(Prepared::Defer);
                            }
                        }
                        self.model
                            .var_mut(v)
                            .accessed_by_xinsts
                            .push_front(VarAccess {
                                index: 0,
                                instr: xmove,
                            });
                        self.add_dependency(xmove, Some(original));
                        return Ok(Prepared::Ready(xmove));
                    }
                }
            }

            let suggested = self.model.var(v).suggested_bank().unwrap_or(reg.bank);
            if reg.bank != suggested {
                return Err(ScheduleError::BankMismatch {
                    name: self.model.var(v).name().to_owned(),
                    register: reg.to_string(),
                    bank: suggested,
                });
            }
        }

        for dst in expanded_dests {
            let Some(v) = dst.var() else { continue };
            if self.live_outs.contains(&v) {
                return Ok(Prepared::Defer);
            }
            self.add_live_var(v, original);
            if self.model.var(v).register.is_none() {
                let bank = self
                    .model
                    .var(v)
                    .suggested_bank()
                    .unwrap_or(NUM_REGISTER_BANKS - 1);
                match self.find_register(original, bank, false, Some(v))? {
                    FoundRegister::Unavailable => return Ok(Prepared::Defer),
                    FoundRegister::Evict(xstore) => return Ok(Prepared::Ready(xstore)),
                    FoundRegister::Ready(_) => {}
                }
            }
            let reg = self
                .model
                .var(v)
                .register
                .expect("destination allocated a register");
            let suggested = self.model.var(v).suggested_bank().unwrap_or(reg.bank);
            if reg.bank != suggested {
                return Err(ScheduleError::BankMismatch {
                    name: self.model.var(v).name().to_owned(),
                    register: reg.to_string(),
                    bank: suggested,
                });
            }
        }

        if self.has_bank_write_conflict(original) {
            let ready = self.effective_ready(original);
            self.program[original].cycle_ready = Cycle::new(
                self.current_cycle.bundle,
                ready.cycle.max(self.current_cycle.cycle) + 1,
            );
        }
        Ok(Prepared::Ready(original))
    }

    /// Finds a register in `bank` for an upcoming use, evicting by policy
    /// unless `no_eviction`. When `dest_var` is given and the register comes
    /// up clean, the variable is allocated into it.
    fn find_register(
        &mut self,
        trigger: InstrRef,
        bank: usize,
        no_eviction: bool,
        dest_var: Option<VarId>,
    ) -> Result<FoundRegister, ScheduleError> {
        let global_live = self.live_set();
        let mut live = std::collections::HashSet::new();
        for (_, reg) in self.model.banks()[bank].iter() {
            if let Some(Slot::Var(v)) = reg.slot {
                if global_live.contains(&v) || self.model.var_cycle_ready(v) > self.current_cycle {
                    live.insert(v);
                }
            }
        }
        let policy = if no_eviction {
            None
        } else {
            Some(self.opts.replacement_policy)
        };
        let Some(reg) = self.model.find_available_register(bank, &live, policy) else {
            return Ok(FoundRegister::Unavailable);
        };

        if let Some(Slot::Var(victim)) = self.model.register(reg).slot {
            if self.model.register(reg).dirty {
                let still_used = !self.model.var(victim).accessed_by_xinsts.is_empty()
                    || self.model.output_variables.contains(&victim);
                if still_used {
                    let spad_addr = match self.model.var(victim).spad_address() {
                        Some(addr) => addr,
                        None => self.find_spad_address(trigger)?,
                    };
                    let xstore =
                        self.flush_from_register_file(trigger, spad_addr, victim, dest_var)?;
                    return Ok(FoundRegister::Evict(xstore));
                }
                // Dead value; nothing to preserve.
                self.model.register_mut(reg).dirty = false;
            }
        }
        self.model.allocate_register(reg, dest_var.map(Slot::Var));
        Ok(FoundRegister::Ready(reg))
    }

    /// Finds a SPAD address, evicting a resident by policy when the SPAD is
    /// full. Dirty victims with remaining uses are written back to HBM
    /// first.
    fn find_spad_address(&mut self, trigger: InstrRef) -> Result<usize, ScheduleError> {
        let live: std::collections::HashSet<VarId> = self
            .live_set()
            .into_iter()
            .filter(|&v| {
                self.model.var(v).spad_address().is_some() && self.model.var(v).register.is_none()
            })
            .collect();
        let Some(addr) = self
            .model
            .spad_find_available_address(&live, Some(self.opts.replacement_policy))
        else {
            return Err(self.out_of_spad());
        };

        if let Some(Slot::Var(victim)) = self.model.spad.slot(addr)? {
            debug_assert_eq!(self.model.var(victim).spad_address(), Some(addr));
            if self.model.var(victim).spad_dirty() {
                let still_used = !self.model.var(victim).accessed_by_xinsts.is_empty()
                    || self.model.output_variables.contains(&victim);
                if still_used {
                    if self.model.var(victim).register.is_none() {
                        let hbm_addr = match self.model.var(victim).hbm_address {
                            Some(addr) => addr,
                            None => self
                                .model
                                .hbm
                                .find_available_address()
                                .ok_or_else(|| self.out_of_hbm())?,
                        };
                        // Deallocates the victim from SPAD on schedule.
                        self.flush_variable_from_spad(trigger, hbm_addr, victim)?;
                    } else {
                        // The register copy stays authoritative; flush it
                        // from there when the register is reclaimed.
                        self.model.set_var_register_dirty(victim, true);
                    }
                } else {
                    self.model.var_mut(victim).set_spad_dirty(false);
                }
            }
            if self.model.var(victim).spad_address() == Some(addr) {
                self.model.spad_deallocate(addr)?;
            }
        }
        Ok(addr)
    }

    /// Brings a variable from HBM into SPAD, allocating an HBM home first if
    /// it never had one. Returns false when the variable is still in transit
    /// through the store buffer.
    fn load_var_hbm_to_spad(
        &mut self,
        trigger: InstrRef,
        var: VarId,
    ) -> Result<bool, ScheduleError> {
        if self.model.store_buffer_contains(var) {
            return Ok(false);
        }
        if self.model.var(var).spad_address().is_some() {
            return Ok(true);
        }
        let client = self.program[trigger].id.client;
        let spad_addr = self.find_spad_address(trigger)?;
        self.queue_msyncc_load(client, spad_addr)?;
        if self.model.var(var).hbm_address.is_none() {
            let hbm_addr = self
                .model
                .hbm
                .find_available_address()
                .ok_or_else(|| self.out_of_hbm())?;
            self.model.hbm_allocate_force(hbm_addr, var)?;
        }
        let mload = self.new_minst(
            client,
            MKind::MLoad { spad_addr },
            vec![Operand::Var(var)],
            vec![Operand::Var(var)],
            format!("dep id: {}", self.program[trigger].id),
        );
        self.push_minst(mload)?;
        Ok(true)
    }

    /// Creates an `xstore` that drains `evict` to SPAD, blocking the
    /// destination address with a placeholder so concurrent allocation
    /// cannot take it.
    pub(super) fn create_xstore(
        &mut self,
        client: u64,
        dest_spad_addr: usize,
        evict: VarId,
        assign: Option<VarId>,
        comment: String,
    ) -> Result<InstrRef, ScheduleError> {
        debug_assert!(self.model.var(evict).register.is_some());
        debug_assert!(self
            .model
            .var(evict)
            .spad_address()
            .map_or(true, |addr| addr == dest_spad_addr));
        if self.model.spad.slot(dest_spad_addr)?.is_some() {
            self.model.spad_deallocate(dest_spad_addr)?;
        }
        self.model
            .spad_allocate_force(dest_spad_addr, Slot::Dummy { tag: 0 })?;

        let xstore_spec = *self.spec.xinst(XOp::XStore);
        let xstore = self.program.push(
            client,
            xstore_spec.default_throughput,
            xstore_spec.default_latency,
            vec![Operand::Var(evict)],
            vec![Operand::Var(evict)],
            comment,
            InstrKind::X {
                n: 0,
                res: None,
                kind: XKind::XStore {
                    spad_addr: dest_spad_addr,
                    assign,
                },
            },
        );
        self.model
            .var_mut(evict)
            .accessed_by_xinsts
            .push_front(VarAccess {
                index: 0,
                instr: xstore,
            });
        Ok(xstore)
    }

    /// Evicts a dirty register to SPAD: the `xstore` replaces the
    /// triggering instruction's scheduling slot and the trigger becomes
    /// dependent on it.
    fn flush_from_register_file(
        &mut self,
        trigger: InstrRef,
        dest_spad_addr: usize,
        evict: VarId,
        assign: Option<VarId>,
    ) -> Result<InstrRef, ScheduleError> {
        let comment = format!("dep id: {} - flushing", self.program[trigger].id);
        let xstore =
            self.create_xstore(self.program[trigger].id.client, dest_spad_addr, evict, assign, comment)?;
        self.add_dependency(xstore, Some(trigger));
        Ok(xstore)
    }

    /// Writes a dirty SPAD resident back to HBM, synchronizing with the last
    /// `cstore` of its address.
    fn flush_variable_from_spad(
        &mut self,
        trigger: InstrRef,
        hbm_addr: usize,
        victim: VarId,
    ) -> Result<(), ScheduleError> {
        let client = self.program[trigger].id.client;
        let comment = format!("id: {} - flushing", self.program[trigger].id);
        let spad_addr = self
            .model
            .var(victim)
            .spad_address()
            .expect("SPAD victim is SPAD-resident");
        if let Some(last_cstore) = self.model.spad.tracker(spad_addr)?.last_cstore.instr {
            debug_assert!(self.program[last_cstore].is_scheduled());
            let msyncc = self.new_minst(
                client,
                MKind::MSyncC { target: last_cstore },
                Vec::new(),
                Vec::new(),
                comment.clone(),
            );
            self.push_minst(msyncc)?;
        }
        let mstore = self.new_minst(
            client,
            MKind::MStore {
                hbm_addr,
                spad_addr: None,
            },
            vec![Operand::Var(victim)],
            vec![Operand::Var(victim)],
            comment,
        );
        self.push_minst(mstore)?;
        Ok(())
    }

    /// Queues an `xstore` for a finished output variable still dirty in the
    /// register file.
    pub(super) fn flush_output_variable(
        &mut self,
        var: VarId,
        trigger: Option<InstrRef>,
    ) -> Result<bool, ScheduleError> {
        let trigger = trigger
            .or_else(|| self.last_xinstr())
            .expect("an xinstruction exists once outputs complete");
        if self.model.var_register_dirty(var) {
            let dest_spad_addr = match self.model.var(var).spad_address() {
                Some(addr) => addr,
                None => self.find_spad_address(trigger)?,
            };
            let xstore = self.create_xstore(
                self.program[trigger].id.client,
                dest_spad_addr,
                var,
                None,
                "flushing output".into(),
            )?;
            self.add_dependency(xstore, None);
            self.add_to_topo_window(xstore);
        }
        Ok(true)
    }

    /// Generates the next key word for `var` into `reg`, switching seeds
    /// when allowed. Returns false when the active seed was already consumed
    /// this bundle and the consumer must wait for the next one.
    fn generate_key_material(
        &mut self,
        client: u64,
        var: VarId,
        reg: RegId,
    ) -> Result<bool, ScheduleError> {
        let name = self.model.var(var).name().to_owned();
        let Some(&(seed, key)) = self.model.keygen_variables().get(&var) else {
            return Err(ScheduleError::NotKeygen(name));
        };
        if self.model.is_var_in_mem(var) {
            return Err(ScheduleError::KeygenAlreadyGenerated(name));
        }

        if self.current_kgseed != Some(seed) {
            if self
                .kgseed_used_bundle
                .map_or(false, |b| b >= self.current_cycle.bundle)
            {
                return Ok(false);
            }
            let offset = self
                .meta_spad_kgseed
                .expect("keygen seed metadata is loaded when key material exists");
            self.load_keygen_seed(offset, seed)?;
        }

        let expected = self.last_keygen_index.map_or(0, |i| i + 1);
        if key != expected {
            return Err(ScheduleError::KeygenOutOfOrder {
                name,
                expected,
                got: key,
                seed,
            });
        }

        let kg_load = self.new_cinst(
            client,
            CKind::KgLoad,
            vec![Operand::Var(var)],
            vec![Operand::Reg(reg)],
            String::new(),
        );
        // The keygen engine needs its full latency between kg_start/kg_load
        // pairs.
        let wait = self.program[kg_load].latency;
        let cnop = self.new_cnop(
            client,
            wait,
            format!("kg_load {} wait period", self.program[kg_load].id),
        );
        self.push_cinst(cnop)?;
        self.push_cinst(kg_load)?;

        self.kgseed_used_bundle = Some(self.current_cycle.bundle);
        self.last_keygen_index = Some(key);
        Ok(true)
    }
}
