//! Per-instruction schedule simulation and freezing.
//!
//! Scheduling an instruction stamps its timing, applies its effects to the
//! memory model (register movement, store-buffer traffic, SPAD access
//! stamps) and freezes its emitted text, because the registers and
//! variables it references keep changing as later instructions schedule.
//! Sync instructions freeze in the second pass, once the final queue
//! indices exist.

use itertools::Itertools;

use crate::consts::{MAX_RESIDUALS, NUM_BLOCKS_PER_TWID_META_WORD, STAGING_BANK};
use crate::cycle::Cycle;
use crate::error::ScheduleError;
use crate::inst::{CKind, InstrId, InstrKind, InstrRef, MKind, Operand, ScheduleTiming, XKind};
use crate::mem::{RegId, Slot};

use hera_asm::ShuffleKind;

use super::Sim;

fn format_comment(id: InstrId, comment: &str) -> String {
    if comment.is_empty() {
        format!(" # id: {id}")
    } else {
        format!(" # id: {id}; {comment}")
    }
}

impl Sim<'_> {
    /// Schedules an instruction at the current cycle with the given 1-based
    /// listing index, simulating its effects and freezing its text. Returns
    /// the throughput by which the issuing queue's clock advances.
    pub(super) fn schedule_instr(
        &mut self,
        r: InstrRef,
        index: usize,
    ) -> Result<u64, ScheduleError> {
        if self.program[r].is_scheduled() {
            return Err(ScheduleError::AlreadyScheduled(self.program[r].describe()));
        }
        if matches!(self.program[r].kind, InstrKind::X { .. }) {
            let ready = self.effective_ready(r);
            if self.current_cycle < ready {
                return Err(ScheduleError::NotReady {
                    instr: self.program[r].describe(),
                    ready,
                    current: self.current_cycle,
                });
            }
        }
        self.program[r].timing = Some(ScheduleTiming {
            cycle: self.current_cycle,
            index,
        });

        let kind = self.program[r].kind.clone();
        match kind {
            InstrKind::X { kind, .. } => self.exec_xinst(r, kind),
            InstrKind::C(kind) => self.exec_cinst(r, kind),
            InstrKind::M(kind) => self.exec_minst(r, kind),
        }
    }

    // XInstQ
    // ------

    fn exec_xinst(&mut self, r: InstrRef, kind: XKind) -> Result<u64, ScheduleError> {
        let throughput = self.program[r].throughput;
        match kind {
            XKind::Nop => {
                // Idle cycles are encoded minus one.
                let cycles = throughput - 1;
                self.freeze_x_plain(r, vec![cycles.to_string()]);
                Ok(throughput)
            }
            XKind::BExit => {
                self.freeze_x_plain(r, Vec::new());
                Ok(throughput)
            }
            XKind::Move => self.exec_move(r),
            XKind::XStore { spad_addr, assign } => self.exec_xstore(r, spad_addr, assign),
            XKind::Shuffle { kind, wait_cyc } => {
                self.touch_operands(r)?;
                self.settle_dests(r);
                let op = match kind {
                    ShuffleKind::Ntt => hera_asm::XOp::RShuffle,
                    ShuffleKind::Intt => hera_asm::XOp::IrShuffle,
                };
                let inc = self.spec.xinst(op).special_latency_increment;
                let same = Cycle::new(
                    self.current_cycle.bundle,
                    self.current_cycle.cycle + inc,
                );
                let other = Cycle::new(self.current_cycle.bundle + 1, 0);
                match kind {
                    ShuffleKind::Ntt => {
                        self.ntt_shuffle_floor = self.ntt_shuffle_floor.max(same);
                        self.intt_shuffle_floor = self.intt_shuffle_floor.max(other);
                    }
                    ShuffleKind::Intt => {
                        self.intt_shuffle_floor = self.intt_shuffle_floor.max(same);
                        self.ntt_shuffle_floor = self.ntt_shuffle_floor.max(other);
                    }
                }
                self.freeze_x_registers(r)?;
                Ok(throughput + wait_cyc)
            }
            _ => {
                self.touch_operands(r)?;
                self.settle_dests(r);
                self.freeze_x_registers(r)?;
                Ok(throughput)
            }
        }
    }

    /// Updates operand access bookkeeping: every variable must be
    /// register-resident, records the access cycle and consumes this
    /// instruction's entry in each access list.
    fn touch_operands(&mut self, r: InstrRef) -> Result<(), ScheduleError> {
        let cycle = self.current_cycle;
        for v in self.operand_vars(r) {
            if self.model.var(v).register.is_none() {
                return Err(ScheduleError::VariableNotInRegister {
                    instr: self.program[r].describe(),
                    name: self.model.var(v).name().to_owned(),
                });
            }
            let var = self.model.var_mut(v);
            var.last_x_access = Some(cycle);
            let removed = var.remove_access(r);
            debug_assert!(removed, "missing access entry for {r}");
        }
        Ok(())
    }

    /// Marks destinations written: ready after the latency, register dirty.
    fn settle_dests(&mut self, r: InstrRef) {
        let cycle = self.current_cycle;
        let latency = self.program[r].latency;
        for dst in self.program[r].dests.clone() {
            if let Some(v) = dst.var() {
                self.model.var_mut(v).cycle_ready =
                    Cycle::new(cycle.bundle, cycle.cycle + latency);
                self.model.set_var_register_dirty(v, true);
            }
        }
    }

    fn exec_move(&mut self, r: InstrRef) -> Result<u64, ScheduleError> {
        let throughput = self.program[r].throughput;
        let latency = self.program[r].latency;
        let var = self.program[r].sources[0]
            .var()
            .expect("move source is a variable");
        let target = self.program[r].dests[0]
            .reg()
            .expect("move destination is a register");

        let Some(source_reg) = self.model.var(var).register else {
            return Err(ScheduleError::VariableNotInRegister {
                instr: self.program[r].describe(),
                name: self.model.var(var).name().to_owned(),
            });
        };
        debug_assert_eq!(source_reg.bank, STAGING_BANK);
        if matches!(self.model.register(target).slot, Some(Slot::Var(_))) {
            return Err(ScheduleError::RegisterOccupied(target.to_string()));
        }

        // Move the variable; its value is unchanged, so the dirty state
        // travels with it. The vacated staging register is reserved for the
        // rest of the bundle.
        let was_dirty = self.model.var_register_dirty(var);
        self.model.set_var_register_dirty(var, false);
        self.model.allocate_register(target, Some(Slot::Var(var)));
        self.model.allocate_register(
            source_reg,
            Some(Slot::Dummy {
                tag: self.current_cycle.bundle,
            }),
        );
        let cycle = self.current_cycle;
        let variable = self.model.var_mut(var);
        variable.last_x_access = Some(cycle);
        let removed = variable.remove_access(r);
        debug_assert!(removed, "missing access entry for {r}");
        variable.cycle_ready = Cycle::new(cycle.bundle, cycle.cycle + latency);
        self.model.set_var_register_dirty(var, was_dirty);

        let name = self.model.var(var).name().to_owned();
        let instr = &mut self.program[r];
        if !instr.comment.is_empty() {
            instr.comment.push(';');
        }
        instr.comment.push_str(&format!(" variable \"{name}\""));

        self.freeze_x_plain(r, vec![target.to_string(), source_reg.to_string()]);
        Ok(throughput)
    }

    fn exec_xstore(
        &mut self,
        r: InstrRef,
        spad_addr: usize,
        assign: Option<crate::mem::VarId>,
    ) -> Result<u64, ScheduleError> {
        let throughput = self.program[r].throughput;
        let latency = self.program[r].latency;
        let var = self.program[r].sources[0]
            .var()
            .expect("xstore source is a variable");
        let Some(reg) = self.model.var(var).register else {
            return Err(ScheduleError::VariableNotInRegister {
                instr: self.program[r].describe(),
                name: self.model.var(var).name().to_owned(),
            });
        };

        let cycle = self.current_cycle;
        {
            let variable = self.model.var_mut(var);
            variable.last_x_access = Some(cycle);
            let removed = variable.remove_access(r);
            debug_assert!(removed, "missing access entry for {r}");
            variable.cycle_ready = Cycle::new(cycle.bundle, cycle.cycle + latency);
        }

        // The register has been drained onto the store buffer; the matching
        // `cstore` lands the value in SPAD after this bundle's `ifetch`.
        self.model.register_mut(reg).dirty = false;
        self.model
            .allocate_register(reg, assign.map(Slot::Var));
        self.model.store_buffer_push(var, spad_addr);

        self.xstore_ready = self
            .xstore_ready
            .max(Cycle::new(cycle.bundle, cycle.cycle + latency));

        let name = self.model.var(var).name().to_owned();
        let instr = &mut self.program[r];
        if !instr.comment.is_empty() {
            instr.comment.push(';');
        }
        instr
            .comment
            .push_str(&format!(" variable \"{name}\": SPAD({spad_addr}) <- {reg}"));

        self.freeze_x_plain(r, vec![reg.to_string()]);
        Ok(throughput)
    }

    // CInstQ
    // ------

    fn exec_cinst(&mut self, r: InstrRef, kind: CKind) -> Result<u64, ScheduleError> {
        let throughput = self.program[r].throughput;
        match kind {
            CKind::CLoad => {
                let var = self.program[r].sources[0]
                    .var()
                    .expect("cload source is a variable");
                let target = self.program[r].dests[0]
                    .reg()
                    .expect("cload destination is a register");
                debug_assert_eq!(target.bank, STAGING_BANK);
                let name = self.model.var(var).name().to_owned();
                let Some(spad_addr) = self.model.var(var).spad_address() else {
                    return Err(ScheduleError::VariableNotInSpad(name));
                };
                if self.model.var(var).register.is_some() {
                    return Err(ScheduleError::VariableAlreadyInRegister(name));
                }
                if matches!(self.model.register(target).slot, Some(Slot::Var(_))) {
                    return Err(ScheduleError::RegisterOccupied(target.to_string()));
                }
                self.model.allocate_register(target, Some(Slot::Var(var)));
                self.model.spad.track_cload(spad_addr, Some(r))?;
                // The value is on chip now; earlier mloads are moot.
                self.model.spad.track_mload(spad_addr, None)?;
                self.append_comment(r, &format!(" {name}"));
                self.freeze_c(r, vec![target.to_string(), spad_addr.to_string()]);
            }
            CKind::CStore { .. } => {
                let Some(entry) = self.model.store_buffer_pop() else {
                    return Err(ScheduleError::StoreBufferEmpty);
                };
                let var = entry.var;
                let addr = entry.spad_addr;
                match self.model.spad.slot(addr)? {
                    Some(Slot::Dummy { .. }) => {
                        self.model.spad_deallocate(addr)?;
                    }
                    Some(Slot::Var(occupant)) if occupant != var => {
                        return Err(ScheduleError::SpadSlotOccupied {
                            addr,
                            instr: self.program[r].describe(),
                        });
                    }
                    _ => {}
                }
                if self.model.var(var).spad_address() != Some(addr) {
                    self.model.spad_allocate_force(addr, Slot::Var(var))?;
                }
                self.model.spad.track_cstore(addr, Some(r))?;
                self.model.spad.track_mload(addr, None)?;
                self.model.var_mut(var).set_spad_dirty(true);
                self.program[r].kind = InstrKind::C(CKind::CStore {
                    spad_addr: Some(addr),
                });
                let name = self.model.var(var).name().to_owned();
                self.append_comment(r, &format!(" {name}"));
                self.freeze_c(r, vec![addr.to_string()]);
            }
            CKind::CSyncM { target } => {
                if !self.program[target].is_scheduled() {
                    return Err(ScheduleError::NotScheduled(self.program[target].describe()));
                }
                // Frozen in the second pass with the final MInstQ index.
            }
            CKind::CNop => {
                let cycles = throughput - 1;
                self.freeze_c(r, vec![cycles.to_string()]);
            }
            CKind::IFetch { bundle } => {
                self.freeze_c(r, vec![bundle.to_string()]);
            }
            CKind::NLoad { target } => {
                let spad_addr = self.spad_meta_source(r)?;
                self.model.spad.track_cload(spad_addr, Some(r))?;
                self.model.spad.track_mload(spad_addr, None)?;
                self.freeze_c(r, vec![target.to_string(), spad_addr.to_string()]);
            }
            CKind::BLoad { target, block } => {
                debug_assert!(block < NUM_BLOCKS_PER_TWID_META_WORD);
                let spad_addr = self.spad_meta_source(r)?;
                self.model.spad.track_cload(spad_addr, Some(r))?;
                self.model.spad.track_mload(spad_addr, None)?;
                self.freeze_c(
                    r,
                    vec![target.to_string(), spad_addr.to_string(), block.to_string()],
                );
            }
            CKind::BOnes { target } => {
                let spad_addr = self.spad_meta_source(r)?;
                self.model.spad.track_cload(spad_addr, Some(r))?;
                self.model.spad.track_mload(spad_addr, None)?;
                self.freeze_c(r, vec![target.to_string(), spad_addr.to_string()]);
            }
            CKind::KgLoad => {
                let var = self.program[r].sources[0]
                    .var()
                    .expect("kg_load names its key variable");
                let target = self.program[r].dests[0]
                    .reg()
                    .expect("kg_load destination is a register");
                let name = self.model.var(var).name().to_owned();
                if self.model.is_var_in_mem(var) {
                    return Err(ScheduleError::KeygenAlreadyGenerated(name));
                }
                if matches!(self.model.register(target).slot, Some(Slot::Var(_))) {
                    return Err(ScheduleError::RegisterOccupied(target.to_string()));
                }
                self.model.allocate_register(target, Some(Slot::Var(var)));
                self.append_comment(r, &format!(" {name}"));
                self.freeze_c(r, vec![target.to_string()]);
            }
            CKind::KgSeed { block } => {
                let spad_addr = self.spad_meta_source(r)?;
                self.model.spad.track_cload(spad_addr, Some(r))?;
                self.model.spad.track_mload(spad_addr, None)?;
                self.freeze_c(r, vec![spad_addr.to_string(), block.to_string()]);
            }
            CKind::KgStart => {
                self.freeze_c(r, Vec::new());
            }
            CKind::XInstFetch { xq_dst, hbm_src } => {
                self.freeze_c(r, vec![xq_dst.to_string(), hbm_src.to_string()]);
            }
            CKind::CExit => {
                self.freeze_c(r, Vec::new());
            }
        }
        Ok(throughput)
    }

    /// SPAD address of a metadata CInst's source variable.
    fn spad_meta_source(&self, r: InstrRef) -> Result<usize, ScheduleError> {
        let var = self.program[r].sources[0]
            .var()
            .expect("metadata load names its variable");
        self.model
            .var(var)
            .spad_address()
            .ok_or_else(|| ScheduleError::VariableNotInSpad(self.model.var(var).name().to_owned()))
    }

    // MInstQ
    // ------

    fn exec_minst(&mut self, r: InstrRef, kind: MKind) -> Result<u64, ScheduleError> {
        let throughput = self.program[r].throughput;
        match kind {
            MKind::MLoad { spad_addr } => {
                let var = self.program[r].sources[0]
                    .var()
                    .expect("mload source is a variable");
                let name = self.model.var(var).name().to_owned();
                let Some(hbm_addr) = self.model.var(var).hbm_address else {
                    return Err(ScheduleError::VariableNotInHbm(name));
                };
                self.model.spad_allocate_force(spad_addr, Slot::Var(var))?;
                self.model.spad.track_mload(spad_addr, Some(r))?;
                self.append_comment(r, &format!(" {name}"));
                self.freeze_m(r, vec![spad_addr.to_string(), hbm_addr.to_string()]);
            }
            MKind::MStore { hbm_addr, .. } => {
                let var = self.program[r].sources[0]
                    .var()
                    .expect("mstore source is a variable");
                let name = self.model.var(var).name().to_owned();
                let Some(spad_addr) = self.model.var(var).spad_address() else {
                    return Err(ScheduleError::VariableNotInSpad(name));
                };
                match self.model.var(var).hbm_address {
                    Some(existing) if existing != hbm_addr => {
                        return Err(ScheduleError::Mem(
                            crate::error::MemError::DoubleAllocation {
                                unit: "HBM",
                                name,
                                existing,
                                requested: hbm_addr,
                            },
                        ));
                    }
                    Some(_) => {}
                    None => self.model.hbm_allocate_force(hbm_addr, var)?,
                }
                self.model.spad_deallocate(spad_addr)?;
                self.model.spad.track_mstore(spad_addr, Some(r))?;
                // C-side history for this address is no longer relevant.
                self.model.spad.track_cload(spad_addr, None)?;
                self.model.spad.track_cstore(spad_addr, None)?;
                self.program[r].kind = InstrKind::M(MKind::MStore {
                    hbm_addr,
                    spad_addr: Some(spad_addr),
                });
                self.append_comment(r, &format!(" {name}"));
                self.freeze_m(r, vec![hbm_addr.to_string(), spad_addr.to_string()]);
            }
            MKind::MSyncC { target } => {
                if !self.program[target].is_scheduled() {
                    return Err(ScheduleError::NotScheduled(self.program[target].describe()));
                }
                // Frozen in the second pass with the final CInstQ index.
            }
        }
        Ok(throughput)
    }

    // Freezing
    // --------

    /// Freezes an XInst whose operands are rendered from the given fields.
    fn freeze_x_plain(&mut self, r: InstrRef, operands: Vec<String>) {
        let instr = &self.program[r];
        let InstrKind::X { n, res, kind } = &instr.kind else {
            unreachable!("freeze_x called on a non-X instruction");
        };
        let mut fields = vec![instr.id.client.to_string(), n.to_string(), kind.op().to_string()];
        fields.extend(operands);
        if let Some(res) = res {
            fields.push((res % MAX_RESIDUALS).to_string());
        }
        let line = format!(
            "{}{}",
            fields.iter().join(", "),
            format_comment(instr.id, &instr.comment)
        );
        self.program[r].frozen = Some(line);
    }

    /// Freezes an XInst rendering variable operands through their registers.
    fn freeze_x_registers(&mut self, r: InstrRef) -> Result<(), ScheduleError> {
        let instr = &self.program[r];
        let InstrKind::X { kind, .. } = &instr.kind else {
            unreachable!("freeze_x called on a non-X instruction");
        };
        let kind = kind.clone();
        let mut operands = Vec::with_capacity(instr.dests.len() + instr.sources.len());
        for op in instr.dests.iter().chain(instr.sources.iter()) {
            operands.push(self.render_register(r, op)?);
        }
        match &kind {
            XKind::Muli { imm } | XKind::Maci { imm } => operands.push(imm.clone()),
            XKind::Ntt { stage } | XKind::Intt { stage } => operands.push(stage.to_string()),
            XKind::TwNtt { tw_meta, stage, block } | XKind::TwIntt { tw_meta, stage, block } => {
                operands.extend([tw_meta.to_string(), stage.to_string(), block.to_string()]);
            }
            XKind::Shuffle { kind, wait_cyc } => {
                operands.extend([wait_cyc.to_string(), kind.to_string()]);
            }
            _ => {}
        }
        self.freeze_x_plain(r, operands);
        Ok(())
    }

    fn render_register(&self, r: InstrRef, op: &Operand) -> Result<String, ScheduleError> {
        match op {
            Operand::Reg(reg) => Ok(reg.to_string()),
            Operand::Var(v) => {
                let reg: Option<RegId> = self.model.var(*v).register;
                reg.map(|reg| reg.to_string()).ok_or_else(|| {
                    ScheduleError::VariableNotInRegister {
                        instr: self.program[r].describe(),
                        name: self.model.var(*v).name().to_owned(),
                    }
                })
            }
        }
    }

    /// Freezes a CInst line: `op, fields…  # comment`.
    fn freeze_c(&mut self, r: InstrRef, fields: Vec<String>) {
        let instr = &self.program[r];
        let mut all = vec![instr.kind.op_name()];
        all.extend(fields);
        let line = format!(
            "{}{}",
            all.iter().join(", "),
            format_comment(instr.id, &instr.comment)
        );
        self.program[r].frozen = Some(line);
    }

    /// Freezes an MInst line: `op, dst, src  # comment`.
    fn freeze_m(&mut self, r: InstrRef, fields: Vec<String>) {
        let instr = &self.program[r];
        let mut all = vec![instr.kind.op_name()];
        all.extend(fields);
        let line = format!(
            "{}{}",
            all.iter().join(", "),
            format_comment(instr.id, &instr.comment)
        );
        self.program[r].frozen = Some(line);
    }

    fn append_comment(&mut self, r: InstrRef, text: &str) {
        let instr = &mut self.program[r];
        if !instr.comment.is_empty() {
            instr.comment.push(';');
        }
        instr.comment.push_str(text);
    }

    /// Second scheduling pass: patch every sync instruction with the final
    /// 1-based index of its referent in the opposite queue. An `msyncc`
    /// pointing at `cexit` carries the following index instead.
    pub(super) fn finalize_sync_indices(&mut self) {
        let cpos: std::collections::HashMap<InstrRef, usize> = self
            .cinsts
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i + 1))
            .collect();
        let mpos: std::collections::HashMap<InstrRef, usize> = self
            .minsts
            .iter()
            .enumerate()
            .map(|(i, &m)| (m, i + 1))
            .collect();

        for m in self.minsts.clone() {
            if let InstrKind::M(MKind::MSyncC { target }) = self.program[m].kind {
                let mut index = cpos[&target];
                if matches!(self.program[target].kind, InstrKind::C(CKind::CExit)) {
                    index += 1;
                }
                self.freeze_m(m, vec![index.to_string()]);
            }
        }
        for c in self.cinsts.clone() {
            if let InstrKind::C(CKind::CSyncM { target }) = self.program[c].kind {
                let index = mpos[&target];
                self.freeze_c(c, vec![index.to_string()]);
            }
        }
    }
}
