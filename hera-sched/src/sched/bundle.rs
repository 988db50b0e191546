//! Bundle construction: candidate selection under the per-bundle
//! constraints, write-port tracking, and the flush protocol.
//!
//! A bundle admits at most one shuffle kind and one residual segment, and
//! no two register-file writes may land in the same bank on the same cycle.
//! Candidates that fail a constraint are bumped or deferred, never dropped.
//! Flushing terminates the bundle (`bexit` + `nop` padding), emits the
//! `ifetch` with any cross-queue syncs and metadata swaps it needs, and
//! schedules the post-bundle `cstore`s that drain the store buffer.

use std::collections::HashSet;

use hera_asm::{ShuffleKind, XOp};

use crate::consts::{
    MAX_BUNDLE_SIZE, MAX_RESIDUALS, NUM_REGISTER_BANKS, XINST_QUEUE_CAPACITY_WORDS,
};
use crate::cycle::Cycle;
use crate::error::ScheduleError;
use crate::inst::{CKind, InstrKind, InstrRef, MKind, Operand, XKind};
use crate::mem::Slot;

use super::{Bundle, Sim, WriteCycle, BUNDLE_INSTRUCTION_MIN_LIMIT};

impl Sim<'_> {
    // Bundle bookkeeping
    // ------------------

    pub(super) fn append_to_bundle(&mut self, r: InstrRef) {
        debug_assert!(
            self.bundle_xinsts.len() < MAX_BUNDLE_SIZE,
            "cannot append to a full bundle"
        );
        self.bundle_xinsts.push(r);
        let settled = self.current_cycle.cycle + self.program[r].latency;
        if self.bundle_latency < settled {
            self.bundle_latency = settled;
        }
    }

    pub(super) fn cleanup_pending_writes(&mut self) {
        let current = self.current_cycle;
        self.pending_writes.retain(|w| w.cycle >= current);
    }

    /// Register banks this instruction writes.
    fn write_banks(&self, r: InstrRef) -> HashSet<usize> {
        if matches!(
            self.program[r].kind,
            InstrKind::X {
                kind: XKind::XStore { .. },
                ..
            }
        ) {
            // xstore drains to the store buffer, not the register file.
            return HashSet::new();
        }
        self.program[r]
            .dests
            .iter()
            .map(|op| match op {
                Operand::Reg(reg) => reg.bank,
                Operand::Var(v) => self
                    .model
                    .var(*v)
                    .suggested_bank()
                    .unwrap_or(NUM_REGISTER_BANKS - 1),
            })
            .collect()
    }

    /// Whether issuing `r` now would complete a register write on the same
    /// cycle and bank as an in-flight shuffle.
    pub(super) fn has_bank_write_conflict(&self, r: InstrRef) -> bool {
        let mut ready = self.effective_ready(r);
        if ready.bundle < self.current_cycle.bundle {
            ready = Cycle::new(self.current_cycle.bundle, 0);
        }
        if ready.bundle > self.current_cycle.bundle {
            return false;
        }
        let banks = self.write_banks(r);
        if banks.is_empty() {
            return false;
        }
        let write = Cycle::new(
            self.current_cycle.bundle,
            ready.cycle.max(self.current_cycle.cycle) + self.program[r].latency - 1,
        );
        for pending in &self.pending_writes {
            if write < pending.cycle {
                // Pending writes are ordered; nothing later can collide.
                break;
            }
            if write == pending.cycle && !banks.is_disjoint(&pending.banks) {
                return true;
            }
        }
        false
    }

    /// Earliest cycle a shuffle may issue under the slotting rule: within
    /// the special latency window, same-kind shuffles land on slots of the
    /// special increment after the previous one; an opposite-kind shuffle
    /// waits out the full latency.
    fn shuffle_slot_cycle(&self, r: InstrRef) -> Cycle {
        let eff = self.effective_ready(r);
        let floor = eff.max(self.current_cycle);
        let Some(kind) = self.program[r].kind.shuffle_kind() else {
            return floor;
        };
        let mut slot = floor;
        if eff.bundle <= self.current_cycle.bundle {
            if let Some(last) = self.last_shuffle {
                let last_cycle = self.program[last].timing.expect("shuffle scheduled").cycle;
                debug_assert!(self.current_cycle.bundle >= last_cycle.bundle);
                if self.current_cycle.bundle == last_cycle.bundle {
                    let last_kind = self.program[last]
                        .kind
                        .shuffle_kind()
                        .expect("tracked shuffle");
                    if last_kind == kind {
                        let op = match kind {
                            ShuffleKind::Ntt => XOp::RShuffle,
                            ShuffleKind::Intt => XOp::IrShuffle,
                        };
                        let spec = self.spec.xinst(op);
                        let mut delta = floor.cycle.abs_diff(last_cycle.cycle);
                        if delta < spec.special_latency_max {
                            let rem = delta % spec.special_latency_increment;
                            if rem != 0 {
                                delta += spec.special_latency_increment - rem;
                            }
                            if delta >= spec.special_latency_max {
                                delta = spec.special_latency_max;
                            }
                            slot =
                                Cycle::new(self.current_cycle.bundle, last_cycle.cycle + delta);
                        }
                    } else {
                        slot = Cycle::new(
                            self.current_cycle.bundle,
                            self.current_cycle
                                .cycle
                                .max(last_cycle.cycle + self.program[last].latency),
                        );
                    }
                }
            }
        }
        slot.max(floor)
    }

    /// Whether a shuffle may enter this bundle without an untimely routing
    /// table switch: if the other kind is loaded and shuffles matching it
    /// are still queue-ready, the switch is deferred.
    fn shuffle_type_ok(&self, r: InstrRef) -> bool {
        let Some(kind) = self.program[r].kind.shuffle_kind() else {
            return true;
        };
        let eff = self.effective_ready(r);
        let mut ok = eff.bundle > self.current_cycle.bundle
            || self.needed_shuffle_table.is_none()
            || self.needed_shuffle_table == Some(kind);
        if let (Some(loaded), _) = self.current_shuffle_table {
            if loaded != kind && ok {
                let matching_pending = self.ready.iter().any(|(_, other)| {
                    self.program[other].kind.shuffle_kind() == Some(loaded)
                        && self.effective_ready(other).bundle <= self.current_cycle.bundle
                });
                if matching_pending {
                    ok = false;
                }
            }
        }
        ok
    }

    /// Whether an arithmetic XInst may enter this bundle without an
    /// untimely ones/twiddle segment switch.
    fn arith_segment_ok(&self, r: InstrRef) -> bool {
        let Some(res) = self.program[r].kind.residual() else {
            return true;
        };
        debug_assert_eq!(self.current_ones_segment, self.current_twid_segment);
        debug_assert_eq!(self.needed_ones_segment, self.needed_twid_segment);
        let segment = res / MAX_RESIDUALS;
        let eff = self.effective_ready(r);
        let mut ok = eff.bundle > self.current_cycle.bundle
            || self.needed_ones_segment.is_none()
            || self.needed_ones_segment == Some(segment);
        if let Some(loaded) = self.current_ones_segment {
            if loaded != segment && ok {
                let matching_pending = self.ready.iter().any(|(_, other)| {
                    self.program[other]
                        .kind
                        .residual()
                        .map_or(false, |r2| r2 / MAX_RESIDUALS == loaded)
                        && self.effective_ready(other).bundle <= self.current_cycle.bundle
                });
                if matching_pending {
                    ok = false;
                }
            }
        }
        ok
    }

    // Candidate selection
    // -------------------

    /// Finds the next instruction to schedule: an instruction ready exactly
    /// now if one exists, otherwise the queue head; either must clear the
    /// write-port, slotting, table and segment checks or be bumped and
    /// retried.
    pub(super) fn find_next_instruction(&mut self) -> Result<Option<InstrRef>, ScheduleError> {
        if self.ready.is_empty() {
            return Ok(None);
        }
        loop {
            match self.ready.peek() {
                None => return Ok(None),
                Some((_, head)) => {
                    if self.effective_ready(head).bundle > self.current_cycle.bundle {
                        return Ok(None);
                    }
                }
            }

            let mut candidate: Option<InstrRef> = None;

            // Immediates: anything ready exactly this cycle.
            while candidate.is_none() {
                let Some(imm) = self.ready.find_at(self.current_cycle) else {
                    break;
                };
                let eff = self.effective_ready(imm);
                if eff != self.current_cycle {
                    // Stale priority; restamp and keep looking.
                    self.queue_push(imm);
                    continue;
                }
                if self.has_bank_write_conflict(imm) {
                    self.program[imm].cycle_ready = Cycle::new(
                        self.current_cycle.bundle,
                        eff.cycle.max(self.current_cycle.cycle) + 1,
                    );
                    self.queue_push(imm);
                    continue;
                }
                let slot = self.shuffle_slot_cycle(imm);
                if slot != eff {
                    debug_assert!(slot > eff);
                    self.program[imm].cycle_ready = slot;
                    self.queue_push(imm);
                    continue;
                }
                self.queue_remove(imm);
                candidate = Some(imm);
            }

            // Otherwise the queue head.
            while candidate.is_none() {
                let Some((priority, head)) = self.ready.peek() else {
                    return Ok(None);
                };
                if self.effective_ready(head).bundle < self.current_cycle.bundle {
                    self.program[head].cycle_ready = Cycle::new(self.current_cycle.bundle, 0);
                }
                let eff = self.effective_ready(head);
                if eff != priority {
                    self.queue_push(head);
                    continue;
                }
                if self.has_bank_write_conflict(head) {
                    self.program[head].cycle_ready = Cycle::new(
                        self.current_cycle.bundle,
                        eff.cycle.max(self.current_cycle.cycle) + 1,
                    );
                    self.queue_push(head);
                    continue;
                }
                let slot = self.shuffle_slot_cycle(head);
                if slot != eff {
                    debug_assert!(slot > eff);
                    self.program[head].cycle_ready = slot;
                    self.queue_push(head);
                    continue;
                }
                let popped = self.ready.pop().expect("head just peeked");
                debug_assert_eq!(popped.1, head);
                self.xstores.remove(head);
                candidate = Some(head);
            }

            let c = candidate.expect("selected above");
            if !self.shuffle_type_ok(c) {
                // A table switch is due but work for the loaded table
                // remains; hold this one to the next bundle.
                self.program[c].cycle_ready = Cycle::new(self.current_cycle.bundle + 1, 0);
                self.queue_push(c);
                continue;
            }
            if !self.arith_segment_ok(c) {
                self.program[c].cycle_ready = Cycle::new(self.current_cycle.bundle + 1, 0);
                self.queue_push(c);
                continue;
            }
            return Ok(Some(c));
        }
    }

    /// Schedules a `nop` covering `idle` cycles. Declines (returning false)
    /// when the bundle cannot fit filler plus the instruction it waits for,
    /// unless forced for padding.
    pub(super) fn schedule_xnop(
        &mut self,
        trigger: InstrRef,
        idle: u64,
        force: bool,
    ) -> Result<bool, ScheduleError> {
        debug_assert!(idle > 0);
        if !force && self.bundle_xinsts.len() >= MAX_BUNDLE_SIZE - 1 {
            return Ok(false);
        }
        debug_assert!(self.bundle_xinsts.len() < MAX_BUNDLE_SIZE);
        let comment = if matches!(
            self.program[trigger].kind,
            InstrKind::X {
                kind: XKind::BExit,
                ..
            }
        ) {
            String::new()
        } else {
            format!("nop for not ready instr {}", self.program[trigger].id)
        };
        let client = self.program[trigger].id.client;
        let nop = self.new_xnop(client, idle, comment);
        let index = self.bundle_xinsts.len() + 1;
        let throughput = self.schedule_instr(nop, index)?;
        self.current_cycle += throughput;
        self.append_to_bundle(nop);
        Ok(true)
    }

    /// Applies the bundle-level effects of a freshly scheduled instruction
    /// and reports whether the bundle must be flushed.
    pub(super) fn update_schedule(&mut self, r: InstrRef) -> Result<bool, ScheduleError> {
        debug_assert!(self.graph.contains(r));
        debug_assert!(self.bundle_xinsts.len() < MAX_BUNDLE_SIZE);

        let dependents = self.graph.successors(r);
        self.graph.remove_node(r);
        self.graph_changed = true;

        let is_xstore = matches!(
            self.program[r].kind,
            InstrKind::X {
                kind: XKind::XStore { .. },
                ..
            }
        );
        if is_xstore {
            for d in dependents {
                if self.graph.in_degree(d) == 0 && !self.extracted.contains(&d) {
                    self.queue_push(d);
                }
            }
        } else {
            let free: Vec<InstrRef> = dependents
                .into_iter()
                .filter(|&d| self.graph.in_degree(d) == 0)
                .collect();
            for d in free.into_iter().rev() {
                self.topo_window.push_front(d);
            }
            self.topo_changed = true;
        }
        if self.ready.contains(r) {
            self.queue_remove(r);
        }

        if is_xstore {
            // The matching cstore drains the buffer right after this
            // bundle's ifetch.
            let comment = self.program[r].comment.clone();
            let client = self.program[r].id.client;
            let cstore = self.new_cinst(
                client,
                CKind::CStore { spad_addr: None },
                Vec::new(),
                Vec::new(),
                comment,
            );
            self.post_bundle_cinsts.push(cstore);

            // The cstore overwrites a SPAD address that may still be
            // draining to HBM; sync the bundle fetch past that mstore.
            let InstrKind::X {
                kind: XKind::XStore { spad_addr, .. },
                ..
            } = &self.program[r].kind
            else {
                unreachable!("xstore kind checked above");
            };
            let last_mstore = self.model.spad.tracker(*spad_addr)?.last_mstore;
            if self.pre_bundle_csync.0 <= last_mstore.seq && last_mstore.instr.is_some() {
                self.pre_bundle_csync = (last_mstore.seq, last_mstore.instr);
            }
        }

        if let Some(kind) = self.program[r].kind.shuffle_kind() {
            // Long-latency writes: keep other completions off these banks.
            let scheduled = self.program[r].timing.expect("just scheduled").cycle;
            let write_cycle = Cycle::new(
                scheduled.bundle,
                scheduled.cycle + self.program[r].latency - 1,
            );
            let banks = self.write_banks(r);
            self.pending_writes.push(WriteCycle {
                cycle: write_cycle,
                banks,
            });
            self.last_shuffle = Some(r);

            match self.needed_shuffle_table {
                None => self.needed_shuffle_table = Some(kind),
                Some(needed) if needed != kind => {
                    return Err(ScheduleError::MixedShuffleBundle {
                        allowed: needed.into(),
                        got: kind.into(),
                        bundle: self.current_cycle.bundle,
                    });
                }
                Some(_) => {}
            }
        }

        if let Some(res) = self.program[r].kind.residual() {
            let segment = res / MAX_RESIDUALS;
            debug_assert_eq!(self.needed_ones_segment, self.needed_twid_segment);
            match self.needed_ones_segment {
                None => {
                    self.needed_ones_segment = Some(segment);
                    self.needed_twid_segment = Some(segment);
                }
                Some(locked) if locked != segment => {
                    return Err(ScheduleError::MixedResidualBundle {
                        res,
                        segment: locked,
                        bundle: self.current_cycle.bundle,
                    });
                }
                Some(_) => {}
            }
        }

        self.append_to_bundle(r);

        Ok(matches!(
            self.program[r].kind,
            InstrKind::X {
                kind: XKind::BExit,
                ..
            }
        ) || self.bundle_xinsts.len() >= MAX_BUNDLE_SIZE)
    }

    // Flushing
    // --------

    /// Closes the current bundle: `bexit` and `nop` padding, the pre-fetch
    /// `csyncm`, idle `cnop` covering the previous bundle's tail, metadata
    /// swaps, the `ifetch`, the post-bundle `cstore`s, and `mstore`s for
    /// outputs that just completed.
    pub(super) fn flush_bundle(&mut self) -> Result<(), ScheduleError> {
        if self.empty_bundle && self.bundle_xinsts.is_empty() {
            return Err(ScheduleError::EmptyBundle);
        }
        self.empty_bundle = self.bundle_xinsts.is_empty();
        if self.bundle_xinsts.len() <= BUNDLE_INSTRUCTION_MIN_LIMIT {
            self.short_bundles += 1;
        } else {
            self.short_bundles = 0;
        }

        let mut bexit: Option<InstrRef> = None;
        if self.bundle_xinsts.len() < MAX_BUNDLE_SIZE {
            let mut comment = format!("terminating bundle {}", self.current_cycle.bundle);
            if self.short_bundles > 0 {
                comment.push_str(": short bundle");
            }
            let spec = *self.spec.xinst(XOp::BExit);
            let exit = self.program.push(
                self.bundles.len() as u64,
                spec.default_throughput,
                spec.default_latency,
                Vec::new(),
                Vec::new(),
                comment,
                InstrKind::X {
                    n: 0,
                    res: None,
                    kind: XKind::BExit,
                },
            );
            let index = self.bundle_xinsts.len() + 1;
            let throughput = self.schedule_instr(exit, index)?;
            self.current_cycle += throughput;
            self.append_to_bundle(exit);
            bexit = Some(exit);
        }

        debug_assert!(!matches!(
            self.program[*self.bundle_xinsts.last().expect("non-empty bundle")].kind,
            InstrKind::X {
                kind: XKind::Nop,
                ..
            }
        ));
        let bundle_latency = self.bundle_latency;
        let last_xstore = self
            .bundle_xinsts
            .iter()
            .rev()
            .find(|&&x| {
                matches!(
                    self.program[x].kind,
                    InstrKind::X {
                        kind: XKind::XStore { .. },
                        ..
                    }
                )
            })
            .copied();
        let latency_from_xstore = match last_xstore {
            Some(x) => bundle_latency
                .saturating_sub(self.program[x].timing.expect("scheduled").cycle.cycle),
            None => bundle_latency,
        };

        // Pad to the fetch granule.
        let filler_trigger = bexit
            .or_else(|| self.ready.peek().map(|(_, i)| i))
            .or_else(|| self.bundle_xinsts.last().copied())
            .expect("non-empty bundle");
        while self.bundle_xinsts.len() < MAX_BUNDLE_SIZE {
            let padded = self.schedule_xnop(filler_trigger, 1, true)?;
            debug_assert!(padded);
        }

        // Sync the fetch past any mstore still draining an address this
        // bundle's cstores will overwrite.
        if let Some(minstr) = self.pre_bundle_csync.1 {
            debug_assert!(self.program[minstr].is_scheduled());
            let client = self.program[minstr].id.client;
            let csyncm = self.new_cinst(
                client,
                CKind::CSyncM { target: minstr },
                Vec::new(),
                Vec::new(),
                String::new(),
            );
            self.push_cinst(csyncm)?;
        }
        self.pre_bundle_csync = (0, None);

        let first = self.bundle_xinsts[0];
        let ifetch = self.new_cinst(
            self.program[first].id.nonce,
            CKind::IFetch {
                bundle: self.current_cycle.bundle,
            },
            Vec::new(),
            Vec::new(),
            String::new(),
        );

        // Idle the CInstQ until the previous bundle's tail has drained.
        if !self.bundles.is_empty() {
            let mut cq_throughput = 0u64;
            for &c in self.cinsts.iter().rev() {
                if matches!(
                    self.program[c].kind,
                    InstrKind::C(CKind::IFetch { .. } | CKind::CStore { .. })
                ) {
                    break;
                }
                cq_throughput += self.program[c].throughput;
            }
            let prev_tail = self.bundles.last().expect("checked").latency_from_xstore;
            let idle = prev_tail as i64 - cq_throughput as i64
                + self.program[ifetch].latency as i64;
            if idle > 0 {
                let cnop = self.new_cnop(self.current_cycle.bundle, idle as u64, String::new());
                self.push_cinst(cnop)?;
            }
        }

        // Swap in whatever the flushed bundle needs before fetching it.
        if let Some(needed) = self.needed_shuffle_table {
            if self.current_shuffle_table.0 != Some(needed) {
                self.load_shuffle_routing_table(needed)?;
                self.current_shuffle_table = (Some(needed), self.current_cycle.bundle);
            }
        }
        if let Some(segment) = self.needed_twid_segment {
            if self.current_twid_segment != Some(segment) {
                let offset = self.meta_spad_twid.unwrap_or(0);
                self.load_twiddle_metadata(offset, segment)?;
                self.current_twid_segment = Some(segment);
            }
        }
        if let Some(segment) = self.needed_ones_segment {
            if self.current_ones_segment != Some(segment) {
                let offset = self.meta_spad_ones.unwrap_or(0);
                self.load_ones_metadata(offset, segment)?;
                self.current_ones_segment = Some(segment);
            }
        }

        self.push_cinst(ifetch)?;

        let xinsts = std::mem::take(&mut self.bundle_xinsts);
        self.bundles.push(Bundle {
            xinsts,
            latency: bundle_latency,
            latency_from_xstore,
        });

        // Drain the store buffer: one cstore per xstore, in order, each
        // landing right after the ifetch. Outputs that just completed go on
        // to HBM.
        let post = std::mem::take(&mut self.post_bundle_cinsts);
        for (offset, &cstore) in post.iter().enumerate() {
            let entry = self
                .model
                .store_buffer_peek()
                .ok_or(ScheduleError::StoreBufferEmpty)?;
            let index = self.cinsts.len() + offset + 1;
            self.schedule_instr(cstore, index)?;

            let var = entry.var;
            if self.model.output_variables.contains(&var)
                && self.model.var(var).accessed_by_xinsts.is_empty()
            {
                debug_assert!(self
                    .model
                    .spad
                    .tracker(entry.spad_addr)
                    .map_or(false, |t| t.last_cstore.instr == Some(cstore)));
                let client = self.program[cstore].id.client;
                let msyncc = self.new_minst(
                    client,
                    MKind::MSyncC { target: cstore },
                    Vec::new(),
                    Vec::new(),
                    String::new(),
                );
                self.push_minst(msyncc)?;
                let hbm_addr = match self.model.var(var).hbm_address {
                    Some(addr) => addr,
                    None => self
                        .model
                        .hbm
                        .find_available_address()
                        .ok_or_else(|| self.out_of_hbm())?,
                };
                let mstore = self.new_minst(
                    client,
                    MKind::MStore {
                        hbm_addr,
                        spad_addr: None,
                    },
                    vec![Operand::Var(var)],
                    vec![Operand::Var(var)],
                    format!("id: {} - flushing", self.program[cstore].id),
                );
                self.push_minst(mstore)?;
            }
        }
        self.cinsts.extend(post);

        // Reset per-bundle state.
        self.bundle_latency = 0;
        self.pending_writes.clear();
        self.live_outs.clear();
        self.needed_shuffle_table = None;
        self.needed_ones_segment = None;
        self.needed_twid_segment = None;
        self.xstore_ready = Cycle::ZERO;
        self.ntt_shuffle_floor = Cycle::ZERO;
        self.intt_shuffle_floor = Cycle::ZERO;

        // Reclaim staging registers reserved by earlier bundles.
        for bank in 0..NUM_REGISTER_BANKS {
            for index in 0..self.model.banks()[bank].len() {
                let reg = crate::mem::RegId { bank, index };
                if let Some(Slot::Dummy { tag }) = self.model.register(reg).slot {
                    if tag < self.current_cycle.bundle {
                        self.model.allocate_register(reg, None);
                    }
                }
            }
        }

        self.graph_changed = true;
        debug_assert_eq!(self.bundles.len() as u64, self.current_cycle.bundle + 1);
        self.current_cycle = Cycle::new(self.bundles.len() as u64, 1);
        tracing::debug!(
            bundle = self.bundles.len() - 1,
            latency = bundle_latency,
            latency_from_xstore,
            "flushed bundle"
        );
        Ok(())
    }

    // xinstfetch streaming
    // --------------------

    /// Buffers one `xinstfetch` per fetch granule of bundles; buffered
    /// groups splice into the CInstQ whenever the XInst queue wraps.
    pub(super) fn queue_xinstfetch(&mut self) -> Result<(), ScheduleError> {
        tracing::trace!(
            scheduled = self.scheduled_count,
            remaining = self.graph.node_count(),
            "progress"
        );
        let xfetch = self.new_cinst(
            self.xfetch_buffer.len() as u64,
            CKind::XInstFetch {
                xq_dst: self.xfetch_xq_addr,
                hbm_src: self.xfetch_hbm_addr,
            },
            Vec::new(),
            Vec::new(),
            String::new(),
        );
        let index = self.xfetch_buffer.len() + 1;
        self.schedule_instr(xfetch, index)?;
        self.xfetch_buffer.push(xfetch);

        self.xfetch_xq_addr = (self.xfetch_xq_addr + 1) % XINST_QUEUE_CAPACITY_WORDS;
        self.xfetch_hbm_addr += 1;
        if self.xfetch_xq_addr == 0 {
            if self.opts.use_xinstfetch {
                tracing::debug!("xinst queue filled, wrapping around");
                let buffer = std::mem::take(&mut self.xfetch_buffer);
                let at = self.xfetch_splice_idx;
                self.cinsts.splice(at..at, buffer);
            } else {
                self.xfetch_buffer.clear();
            }
            self.xfetch_splice_idx = self.cinsts.len();
        }
        Ok(())
    }

    /// Splices any trailing `xinstfetch` group at end of scheduling.
    pub(super) fn flush_xinstfetch_buffer(&mut self) {
        if self.opts.use_xinstfetch {
            if !self.xfetch_buffer.is_empty() {
                let buffer = std::mem::take(&mut self.xfetch_buffer);
                let at = self.xfetch_splice_idx;
                self.cinsts.splice(at..at, buffer);
            }
            // TODO: stream xinstfetch as XInsts are consumed; blind
            // placement misbehaves once the XInst queue wraps.
            tracing::warn!(
                "xinstfetch placement does not model XInst queue wrap-around"
            );
        }
        self.xfetch_buffer.clear();
    }
}
