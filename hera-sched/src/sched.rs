//! The ASM-ISA three-queue co-scheduler.
//!
//! Consumes the dependency DAG and the populated memory model and produces
//! three cycle-consistent instruction streams: bundles of XInsts for the
//! compute engine, the CInstQ that feeds it, and the MInstQ moving data
//! between HBM and SPAD. Cross-queue ordering is realized with explicit
//! `csyncm`/`msyncc` instructions, patched with final indices in a second
//! pass once both queues are complete.
//!
//! The scheduler is single-threaded and deterministic. Recoverable
//! conflicts (write-port collisions, shuffle slotting, a keygen seed
//! already consumed this bundle, no free register or SPAD slot) never
//! surface as errors; the affected instruction is deferred to a later cycle
//! or bundle.

use std::collections::{HashMap, HashSet, VecDeque};

use hera_asm::{IsaSpec, ShuffleKind};

use crate::consts::{MAX_BUNDLE_SIZE, MAX_BUNDLES_PER_XINSTFETCH, NUM_REGISTER_BANKS};
use crate::cycle::Cycle;
use crate::error::ScheduleError;
use crate::graph::{self, DepGraph};
use crate::inst::{CKind, InstrKind, InstrRef, MKind, Operand, Program, XKind};
use crate::mem::{MemoryModel, VarId};

mod bundle;
mod exec;
mod metadata;
mod prepare;
pub mod queue;

pub use crate::mem::ReplacementPolicy;
use queue::ReadyQueue;

/// Upcoming instructions drawn from the global topological sort.
const INSTRUCTION_WINDOW_SIZE: usize = 100;
/// Refill threshold for the topological window and the ready queue.
const MIN_INSTRUCTIONS_IN_TOPO_SORT: usize = 10;
/// Bundles at or below this size count as short.
const BUNDLE_INSTRUCTION_MIN_LIMIT: usize = MAX_BUNDLE_SIZE / 4;

/// Scheduler options.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleOptions {
    /// Victim-selection policy for eviction.
    pub replacement_policy: ReplacementPolicy,
    /// Whether to splice `xinstfetch` instructions into the CInstQ.
    pub use_xinstfetch: bool,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            replacement_policy: ReplacementPolicy::Ftbu,
            use_xinstfetch: false,
        }
    }
}

/// A completed bundle.
#[derive(Debug, Clone)]
pub struct Bundle {
    /// Exactly `MAX_BUNDLE_SIZE` XInsts, ending in `bexit` plus `nop`
    /// padding when not full.
    pub xinsts: Vec<InstrRef>,
    /// Total latency of the bundle.
    pub latency: u64,
    /// Latency measured from the last `xstore`, or the total latency when
    /// the bundle stores nothing.
    pub latency_from_xstore: u64,
}

/// The scheduler's output.
#[derive(Debug)]
pub struct ScheduleResult {
    /// Instruction arena, including scheduler-injected plumbing.
    pub program: Program,
    /// Final memory-model state.
    pub model: MemoryModel,
    /// The MInstQ stream.
    pub minsts: Vec<InstrRef>,
    /// The CInstQ stream.
    pub cinsts: Vec<InstrRef>,
    /// The XInstQ stream, in bundles.
    pub bundles: Vec<Bundle>,
    /// Idle cycles covered by `nop`s on the compute engine.
    pub idle_cycles: u64,
}

/// Tracks a register-file write landing at a future cycle.
#[derive(Debug, Clone)]
struct WriteCycle {
    cycle: Cycle,
    banks: HashSet<usize>,
}

/// Schedules the dependency graph into the three ASM-ISA streams.
pub fn schedule_asm(
    program: Program,
    graph: DepGraph,
    model: MemoryModel,
    spec: &IsaSpec,
    opts: ScheduleOptions,
) -> Result<ScheduleResult, ScheduleError> {
    Sim::new(program, graph, model, spec, opts)?.run()
}

pub(crate) struct Sim<'s> {
    spec: &'s IsaSpec,
    opts: ScheduleOptions,
    program: Program,
    model: MemoryModel,
    graph: DepGraph,

    minsts: Vec<InstrRef>,
    cinsts: Vec<InstrRef>,
    bundles: Vec<Bundle>,

    current_cycle: Cycle,
    full_topo: Vec<InstrRef>,
    topo_start: usize,
    topo_window: VecDeque<InstrRef>,
    topo_changed: bool,
    graph_changed: bool,
    ready: ReadyQueue,
    xstores: ReadyQueue,
    extracted: HashSet<InstrRef>,
    idle_cycles: u64,
    scheduled_count: usize,

    last_shuffle: Option<InstrRef>,

    // Per-bundle state.
    bundle_xinsts: Vec<InstrRef>,
    bundle_latency: u64,
    empty_bundle: bool,
    short_bundles: u32,
    pre_bundle_csync: (u64, Option<InstrRef>),
    post_bundle_cinsts: Vec<InstrRef>,
    live_always: HashSet<VarId>,
    live_vars: HashMap<VarId, HashSet<InstrRef>>,
    live_outs: HashSet<VarId>,
    pending_writes: Vec<WriteCycle>,

    // Engine readiness floors, reset at bundle flush.
    xstore_ready: Cycle,
    ntt_shuffle_floor: Cycle,
    intt_shuffle_floor: Cycle,

    // Metadata bookkeeping.
    meta_spad_kgseed: Option<usize>,
    current_kgseed: Option<usize>,
    kgseed_used_bundle: Option<u64>,
    last_keygen_index: Option<usize>,
    meta_spad_ones: Option<usize>,
    current_ones_segment: Option<u64>,
    needed_ones_segment: Option<u64>,
    meta_spad_twid: Option<usize>,
    current_twid_segment: Option<u64>,
    needed_twid_segment: Option<u64>,
    current_shuffle_table: (Option<ShuffleKind>, u64),
    needed_shuffle_table: Option<ShuffleKind>,

    // xinstfetch bookkeeping.
    xfetch_hbm_addr: usize,
    xfetch_xq_addr: usize,
    xfetch_buffer: Vec<InstrRef>,
    xfetch_splice_idx: usize,
}

impl<'s> Sim<'s> {
    fn new(
        mut program: Program,
        graph: DepGraph,
        mut model: MemoryModel,
        spec: &'s IsaSpec,
        opts: ScheduleOptions,
    ) -> Result<Self, ScheduleError> {
        let full_topo = graph::build_var_access_list(&graph, &program, &mut model)?;

        let mut live_always: HashSet<VarId> = HashSet::new();
        for table in [
            model.meta.ntt_aux_table,
            model.meta.ntt_routing_table,
            model.meta.intt_aux_table,
            model.meta.intt_routing_table,
        ]
        .into_iter()
        .flatten()
        {
            live_always.insert(table);
        }
        for seg in model.meta.ones_segments.iter().chain(model.meta.twiddle_segments.iter()) {
            live_always.extend(seg.iter().copied());
        }
        live_always.extend(model.meta.keygen_seeds.iter().copied());

        Ok(Self {
            spec,
            opts,
            program,
            model,
            graph,
            minsts: Vec::new(),
            cinsts: Vec::new(),
            bundles: Vec::new(),
            current_cycle: Cycle::new(0, 1),
            full_topo,
            topo_start: 0,
            topo_window: VecDeque::new(),
            topo_changed: true,
            graph_changed: true,
            ready: ReadyQueue::new(),
            xstores: ReadyQueue::new(),
            extracted: HashSet::new(),
            idle_cycles: 0,
            scheduled_count: 0,
            last_shuffle: None,
            bundle_xinsts: Vec::new(),
            bundle_latency: 0,
            empty_bundle: false,
            short_bundles: 0,
            pre_bundle_csync: (0, None),
            post_bundle_cinsts: Vec::new(),
            live_always,
            live_vars: HashMap::new(),
            live_outs: HashSet::new(),
            pending_writes: Vec::new(),
            xstore_ready: Cycle::ZERO,
            ntt_shuffle_floor: Cycle::ZERO,
            intt_shuffle_floor: Cycle::ZERO,
            meta_spad_kgseed: None,
            current_kgseed: None,
            kgseed_used_bundle: None,
            last_keygen_index: None,
            meta_spad_ones: None,
            current_ones_segment: None,
            needed_ones_segment: None,
            meta_spad_twid: None,
            current_twid_segment: None,
            needed_twid_segment: None,
            current_shuffle_table: (None, 0),
            needed_shuffle_table: None,
            xfetch_hbm_addr: 0,
            xfetch_xq_addr: 0,
            xfetch_buffer: Vec::new(),
            xfetch_splice_idx: 0,
        })
    }

    // Readiness
    // ---------

    /// Effective readiness of an instruction: its own tracker, operand
    /// readiness, and the engine floors for `xstore` and the shuffles.
    fn effective_ready(&self, r: InstrRef) -> Cycle {
        let instr = &self.program[r];
        let InstrKind::X { kind, .. } = &instr.kind else {
            // Control and memory instructions are always ready.
            return Cycle::ZERO;
        };
        let mut ready = instr.cycle_ready;
        for op in &instr.sources {
            ready = ready.max(self.operand_ready(op));
        }
        for op in &instr.dests {
            let mut at = self.operand_ready(op);
            // A writer may issue while its destination settles: its own
            // write lands on the final latency cycle.
            at.cycle = (at.cycle + 1).saturating_sub(instr.latency);
            ready = ready.max(at);
        }
        match kind {
            XKind::XStore { .. } => ready = ready.max(self.xstore_ready),
            XKind::Shuffle {
                kind: ShuffleKind::Ntt,
                ..
            } => ready = ready.max(self.ntt_shuffle_floor),
            XKind::Shuffle {
                kind: ShuffleKind::Intt,
                ..
            } => ready = ready.max(self.intt_shuffle_floor),
            _ => {}
        }
        ready
    }

    fn operand_ready(&self, op: &Operand) -> Cycle {
        match op {
            Operand::Var(v) => self.model.var_cycle_ready(*v),
            Operand::Reg(r) => self.model.register(*r).cycle_ready,
        }
    }

    // Ready-queue plumbing
    // --------------------

    fn queue_push(&mut self, r: InstrRef) {
        debug_assert!(self.graph.contains(r), "{r} not in dependency graph");
        let priority = self.effective_ready(r);
        let tie = match &self.program[r].kind {
            InstrKind::X {
                kind: XKind::Move, ..
            } => -2,
            InstrKind::X {
                kind: XKind::XStore { .. },
                ..
            } => {
                self.xstores.push(r, priority, -1);
                -1
            }
            _ => 0,
        };
        self.ready.push(r, priority, tie);
        self.extracted.insert(r);
    }

    fn queue_remove(&mut self, r: InstrRef) {
        self.ready.remove(r);
        self.xstores.remove(r);
    }

    /// Returns a deferred instruction to wherever it now belongs: the
    /// topological window when it has regained dependencies, the ready queue
    /// otherwise. Its live-variable registrations are dropped.
    fn add_back_into_pipeline(&mut self, r: InstrRef) {
        debug_assert!(
            !matches!(
                self.program[r].kind,
                InstrKind::X {
                    kind: XKind::Move,
                    ..
                }
            ),
            "move instructions cannot re-enter the pipeline"
        );
        debug_assert!(!self.program[r].is_scheduled());
        debug_assert!(self.graph.contains(r));
        if self.graph.in_degree(r) > 0 {
            if self.ready.contains(r) {
                self.queue_remove(r);
            }
            self.add_to_topo_window(r);
        } else {
            self.queue_push(r);
        }

        // Pending xstore variables stay live so they are not flushed twice.
        if !matches!(
            self.program[r].kind,
            InstrKind::X {
                kind: XKind::XStore { .. },
                ..
            }
        ) {
            for v in self.operand_vars(r) {
                if self
                    .live_vars
                    .get(&v)
                    .map(|set| set.contains(&r))
                    .unwrap_or(false)
                {
                    self.add_used_var(v, r);
                }
            }
        }
    }

    /// Inserts an instruction into the topological window, ordered before
    /// the first entry with at least its in-degree; stale duplicates are
    /// dropped.
    fn add_to_topo_window(&mut self, r: InstrRef) {
        debug_assert!(self.graph.contains(r));
        debug_assert!(!self.ready.contains(r));
        let my_degree = self.graph.in_degree(r);
        let mut target = self.topo_window.len();
        let mut duplicates = Vec::new();
        for (idx, &inst) in self.topo_window.iter().enumerate() {
            if inst == r {
                duplicates.push(idx);
            } else if self.graph.contains(inst) && self.graph.in_degree(inst) >= my_degree {
                target = idx;
                break;
            }
        }
        self.topo_window.insert(target, r);
        for (removed, idx) in duplicates.into_iter().enumerate() {
            let idx = if idx < target { idx } else { idx + 1 };
            self.topo_window.remove(idx - removed);
        }
        self.topo_changed = true;
        self.extracted.remove(&r);
    }

    /// Adds a freshly created instruction to the listing as a dependency of
    /// `original`, wiring edges to every upcoming user of its variables
    /// within the lookahead horizon.
    fn add_dependency(&mut self, new_dep: InstrRef, original: Option<InstrRef>) {
        self.graph.add_node(new_dep);
        self.graph_changed = true;
        if let Some(original) = original {
            debug_assert!(self.graph.contains(original));
            self.graph.add_edge(new_dep, original);
            self.add_back_into_pipeline(original);
        }

        let horizon = self.topo_start + 2 * INSTRUCTION_WINDOW_SIZE;
        for v in self.operand_vars(new_dep) {
            let accesses: Vec<_> = self.model.var(v).accessed_by_xinsts.iter().copied().collect();
            let mut deps_added = 0usize;
            for access in accesses {
                if access.index > horizon && deps_added > 0 {
                    break;
                }
                if access.instr == new_dep {
                    continue;
                }
                debug_assert!(self.graph.contains(access.instr));
                self.graph.add_edge(new_dep, access.instr);
                if self.graph.in_degree(access.instr) == 1 {
                    self.add_back_into_pipeline(access.instr);
                }
                deps_added += 1;
            }
            self.add_live_var(v, new_dep);
        }
    }

    // Live-variable bookkeeping
    // -------------------------

    fn add_live_var(&mut self, v: VarId, r: InstrRef) {
        self.live_vars.entry(v).or_default().insert(r);
    }

    fn add_used_var(&mut self, v: VarId, r: InstrRef) {
        if let Some(set) = self.live_vars.get_mut(&v) {
            set.remove(&r);
            if set.is_empty() {
                self.live_vars.remove(&v);
            }
        }
    }

    /// All variables that must not be displaced right now: metadata plus the
    /// live-ins of pending instructions.
    fn live_set(&self) -> HashSet<VarId> {
        let mut live = self.live_always.clone();
        live.extend(self.live_vars.keys().copied());
        live
    }

    /// Distinct variable operands of an instruction.
    fn operand_vars(&self, r: InstrRef) -> Vec<VarId> {
        let instr = &self.program[r];
        let mut vars: Vec<VarId> = instr
            .sources
            .iter()
            .chain(instr.dests.iter())
            .filter_map(Operand::var)
            .collect();
        vars.sort_unstable();
        vars.dedup();
        vars
    }

    /// The most recently appended XInst, searching finished bundles when the
    /// current one is empty.
    fn last_xinstr(&self) -> Option<InstrRef> {
        self.bundle_xinsts.last().copied().or_else(|| {
            self.bundles
                .iter()
                .rev()
                .find_map(|b| b.xinsts.last().copied())
        })
    }

    // Resource exhaustion
    // -------------------

    /// Renders the memory-model state that accompanies a resource-exhaustion
    /// failure.
    fn exhaustion_diagnostics(&self) -> String {
        let mut dump = Vec::new();
        match self.model.dump(&mut dump) {
            Ok(()) => String::from_utf8_lossy(&dump).into_owned(),
            Err(_) => String::new(),
        }
    }

    /// SPAD is full of live variables: fatal, with the model state attached
    /// for post-mortem diagnostics.
    pub(super) fn out_of_spad(&self) -> ScheduleError {
        let diagnostics = self.exhaustion_diagnostics();
        tracing::error!(
            bundle = self.current_cycle.bundle,
            %diagnostics,
            "out of SPAD space"
        );
        ScheduleError::OutOfSpad {
            bundle: self.current_cycle.bundle,
            diagnostics,
        }
    }

    /// No HBM address is free for a live variable: fatal, with the model
    /// state attached for post-mortem diagnostics.
    pub(super) fn out_of_hbm(&self) -> ScheduleError {
        let diagnostics = self.exhaustion_diagnostics();
        tracing::error!(%diagnostics, "out of HBM space");
        ScheduleError::OutOfHbm { diagnostics }
    }

    // Instruction construction
    // ------------------------

    fn new_cinst(
        &mut self,
        client: u64,
        kind: CKind,
        sources: Vec<Operand>,
        dests: Vec<Operand>,
        comment: String,
    ) -> InstrRef {
        let s = self.spec.cinst(kind.op());
        self.program.push(
            client,
            s.default_throughput,
            s.default_latency,
            sources,
            dests,
            comment,
            InstrKind::C(kind),
        )
    }

    fn new_cnop(&mut self, client: u64, idle_cycles: u64, comment: String) -> InstrRef {
        let idle = idle_cycles.max(1);
        self.program.push(
            client,
            idle,
            idle,
            Vec::new(),
            Vec::new(),
            comment,
            InstrKind::C(CKind::CNop),
        )
    }

    fn new_minst(
        &mut self,
        client: u64,
        kind: MKind,
        sources: Vec<Operand>,
        dests: Vec<Operand>,
        comment: String,
    ) -> InstrRef {
        let s = self.spec.minst(kind.op());
        self.program.push(
            client,
            s.default_throughput,
            s.default_latency,
            sources,
            dests,
            comment,
            InstrKind::M(kind),
        )
    }

    fn new_xnop(&mut self, client: u64, idle_cycles: u64, comment: String) -> InstrRef {
        let idle = idle_cycles.max(1);
        self.program.push(
            client,
            idle,
            idle,
            Vec::new(),
            Vec::new(),
            comment,
            InstrKind::X {
                n: 0,
                res: None,
                kind: XKind::Nop,
            },
        )
    }

    /// Schedules a CInst at the end of the CInstQ.
    fn push_cinst(&mut self, r: InstrRef) -> Result<(), ScheduleError> {
        let index = self.cinsts.len() + 1;
        self.schedule_instr(r, index)?;
        self.cinsts.push(r);
        Ok(())
    }

    /// Schedules an MInst at the end of the MInstQ.
    fn push_minst(&mut self, r: InstrRef) -> Result<(), ScheduleError> {
        let index = self.minsts.len() + 1;
        self.schedule_instr(r, index)?;
        self.minsts.push(r);
        Ok(())
    }

    // Main loop
    // ---------

    fn run(mut self) -> Result<ScheduleResult, ScheduleError> {
        tracing::debug!(
            instructions = self.graph.node_count(),
            dependencies = self.graph.edge_count(),
            "scheduling metadata preparation"
        );
        self.load_metadata()?;

        let mut flush_pending = false;
        let mut fixed_last_short_bundle: i64 = -1;
        let mut new_bundle = true;
        while !self.graph.is_empty() {
            if flush_pending {
                self.flush_bundle()?;
                flush_pending = false;
                new_bundle = true;
            }

            if new_bundle && self.bundles.len() % MAX_BUNDLES_PER_XINSTFETCH == 0 {
                self.queue_xinstfetch()?;
            }
            new_bundle = false;

            self.cleanup_pending_writes();

            // Refill the topological window and pull dependency-free
            // instructions into the ready queue.
            let mut candidate;
            loop {
                if self.topo_start < self.full_topo.len()
                    && self.topo_window.len() < MIN_INSTRUCTIONS_IN_TOPO_SORT
                    && self.ready.len() < MIN_INSTRUCTIONS_IN_TOPO_SORT
                {
                    let end = (self.topo_start + INSTRUCTION_WINDOW_SIZE).min(self.full_topo.len());
                    self.topo_window
                        .extend(self.full_topo[self.topo_start..end].iter().copied());
                    self.topo_start = end;
                    self.topo_changed = true;
                }
                if self.ready.is_empty() && self.topo_window.is_empty() {
                    return Err(ScheduleError::Stalled);
                }

                candidate = self.find_next_instruction()?;
                let fill = candidate
                    .map(|c| self.effective_ready(c) > self.current_cycle)
                    .unwrap_or(true);
                if fill && (self.topo_changed || self.graph_changed) {
                    let mut drain_to = 0usize;
                    for idx in 0..self.topo_window.len() {
                        let inst = self.topo_window[idx];
                        if self.extracted.contains(&inst) {
                            drain_to = idx + 1;
                        } else {
                            debug_assert!(self.graph.contains(inst));
                            if self.graph.in_degree(inst) > 0 {
                                break;
                            }
                            self.queue_push(inst);
                        }
                    }
                    if drain_to > 0 {
                        self.topo_window.drain(..drain_to);
                        if let Some(c) = candidate.take() {
                            // The best pick may have changed.
                            self.queue_push(c);
                        }
                    }
                    self.topo_changed = false;
                    self.graph_changed = false;
                }
                if candidate.is_some() || !self.ready.is_empty() {
                    break;
                }
            }
            debug_assert!(self.bundle_xinsts.len() < MAX_BUNDLE_SIZE);

            if candidate.is_none() {
                candidate = self.find_next_instruction()?;
            }
            if candidate.is_none() {
                // Nothing left for this bundle. If it came out short, try to
                // free compute banks and pull next-bundle work forward.
                if self.bundle_xinsts.len() <= BUNDLE_INSTRUCTION_MIN_LIMIT
                    && fixed_last_short_bundle + 1 < self.current_cycle.bundle as i64
                {
                    let bank0_has_room = self.model.banks()[0].iter().any(|(_, r)| r.slot.is_none());
                    if bank0_has_room {
                        tracing::debug!(
                            bundle = self.current_cycle.bundle,
                            "fixing short bundle"
                        );
                        let live = self.live_set();
                        for bank in 1..NUM_REGISTER_BANKS {
                            self.model.flush_register_bank(
                                bank,
                                self.current_cycle,
                                self.opts.replacement_policy,
                                &live,
                                0.5,
                            );
                        }
                        let next_bundle = self.current_cycle.bundle + 1;
                        let pulls: Vec<(Cycle, InstrRef)> = self
                            .ready
                            .iter()
                            .filter(|(p, _)| p.bundle == next_bundle && p.cycle <= 1)
                            .collect();
                        for (p, inst) in pulls {
                            self.program[inst].cycle_ready =
                                Cycle::new(self.current_cycle.bundle, p.cycle);
                            self.queue_push(inst);
                        }
                        candidate = self.find_next_instruction()?;
                        fixed_last_short_bundle = self.current_cycle.bundle as i64;
                    }
                }
                flush_pending = candidate.is_none();
            }

            if !flush_pending {
                let original = candidate.expect("candidate present when not flushing");
                flush_pending = self.prepare_and_schedule(original)?;

                if self.graph.is_empty() {
                    // Completed schedule: push output variables still in
                    // registers towards SPAD.
                    let outputs: Vec<VarId> =
                        self.model.output_variables.iter().copied().collect();
                    for v in outputs {
                        debug_assert!(self.model.var(v).accessed_by_xinsts.is_empty());
                        if !self.flush_output_variable(v, Some(original))? {
                            break;
                        }
                    }
                }
            }
        }

        // Flush the trailing bundle.
        if !self.bundle_xinsts.is_empty() {
            self.flush_bundle()?;
        }
        self.flush_xinstfetch_buffer();

        // End the CInstQ: wait for the MInstQ, then exit.
        if let Some(&last_minst) = self.minsts.last() {
            let client = self.program[last_minst].id.client;
            let csyncm = self.new_cinst(
                client,
                CKind::CSyncM { target: last_minst },
                Vec::new(),
                Vec::new(),
                String::new(),
            );
            self.push_cinst(csyncm)?;
        }
        let cexit = self.new_cinst(
            self.cinsts.len() as u64,
            CKind::CExit,
            Vec::new(),
            Vec::new(),
            String::new(),
        );
        self.push_cinst(cexit)?;

        // The MInstQ must end waiting on `cexit`.
        let last_msyncc = self.new_minst(
            self.program[cexit].id.client,
            MKind::MSyncC { target: cexit },
            Vec::new(),
            Vec::new(),
            "terminating MInstQ".into(),
        );
        self.push_minst(last_msyncc)?;

        self.finalize_sync_indices();

        debug_assert!(self.xstores.is_empty(), "pending xstores after scheduling");
        tracing::debug!(
            bundles = self.bundles.len(),
            cinsts = self.cinsts.len(),
            minsts = self.minsts.len(),
            idle_cycles = self.idle_cycles,
            "schedule complete"
        );

        Ok(ScheduleResult {
            program: self.program,
            model: self.model,
            minsts: self.minsts,
            cinsts: self.cinsts,
            bundles: self.bundles,
            idle_cycles: self.idle_cycles,
        })
    }

    /// Prepares `original`, scheduling preparation instructions as they
    /// arise, and finally `original` itself when it survives the bundle's
    /// constraints. Returns whether the bundle must be flushed.
    fn prepare_and_schedule(&mut self, original: InstrRef) -> Result<bool, ScheduleError> {
        use prepare::Prepared;

        let mut flush_pending = false;
        let mut prep_counter = 0usize;
        let mut keep_going = true;
        while keep_going {
            keep_going = false;
            let prepared = self.prepare_instruction(original)?;
            let instr = match prepared {
                Prepared::Defer => {
                    // One of the bundle constraints failed; try again next
                    // bundle.
                    self.program[original].cycle_ready =
                        Cycle::new(self.current_cycle.bundle + 1, 0);
                    self.add_back_into_pipeline(original);
                    continue;
                }
                Prepared::Ready(instr) => instr,
            };
            if instr != original {
                prep_counter += 1;
            }

            if self.graph.in_degree(instr) > 0 {
                // Preparation added new dependencies on the instruction.
                debug_assert_eq!(instr, original);
                self.add_back_into_pipeline(original);
                continue;
            }

            let eff = self.effective_ready(instr);
            let mut to_schedule = Some(instr);
            if eff > self.current_cycle {
                if prep_counter > 0 {
                    if instr != original {
                        debug_assert!(self.graph.in_degree(instr) == 0);
                        self.add_back_into_pipeline(instr);
                    }
                    to_schedule = None;
                    self.add_back_into_pipeline(original);
                } else {
                    debug_assert_eq!(instr, original);
                    debug_assert_eq!(eff.bundle, self.current_cycle.bundle);
                    let idle = eff.cycle - self.current_cycle.cycle;
                    if self.schedule_xnop(instr, idle, false)? {
                        self.idle_cycles += idle;
                    } else {
                        // No room for the nop: the bundle is nearly full.
                        self.program[instr].cycle_ready =
                            Cycle::new(self.current_cycle.bundle + 1, 1);
                        to_schedule = None;
                        self.add_back_into_pipeline(original);
                    }
                }
            }

            let Some(instr) = to_schedule else { continue };

            debug_assert!(self.current_cycle >= self.effective_ready(instr));
            let index = self.bundle_xinsts.len() + 1;
            let throughput = self.schedule_instr(instr, index)?;
            self.current_cycle += throughput;

            let vars = self.operand_vars(instr);
            if matches!(
                self.program[instr].kind,
                InstrKind::X {
                    kind: XKind::XStore { .. },
                    ..
                }
            ) {
                self.live_outs.extend(vars.iter().copied());
            }
            for v in vars {
                self.add_used_var(v, instr);
            }

            self.extracted.insert(instr);
            flush_pending = self.update_schedule(instr)?;

            if instr == original {
                self.scheduled_count += 1;
                tracing::trace!(
                    instr = %self.program[original].id,
                    cycle = %self.current_cycle,
                    scheduled = self.scheduled_count,
                    "scheduled"
                );
                // Flush any output destinations with no further uses.
                let dests: Vec<VarId> = self.program[original]
                    .dests
                    .iter()
                    .filter_map(Operand::var)
                    .collect();
                for v in dests {
                    if self.model.output_variables.contains(&v)
                        && self.model.var(v).accessed_by_xinsts.is_empty()
                        && !self.model.store_buffer_contains(v)
                    {
                        if !self.flush_output_variable(v, Some(original))? {
                            break;
                        }
                    }
                }
            } else if flush_pending {
                self.add_back_into_pipeline(original);
            } else if self.ready.find_at(self.current_cycle).is_some() {
                // An immediate became ready: stop preparing and take it.
                self.add_back_into_pipeline(original);
            } else {
                keep_going = true;
            }
        }
        Ok(flush_pending)
    }
}
