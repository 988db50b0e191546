//! Single-queue P-ISA scheduler.
//!
//! Times a P-ISA instruction stream for consumers that want a schedule
//! without the three-queue memory machinery: every instruction gets a
//! `(bundle 0, cycle)` timing in a topological order that respects source
//! readiness and throughput, with `nop`s filling unavoidable gaps.

use hera_asm::IsaSpec;
use hera_asm::XOp;

use crate::cycle::Cycle;
use crate::error::ScheduleError;
use crate::graph::DepGraph;
use crate::inst::{InstrKind, InstrRef, Operand, Program, ScheduleTiming, XKind};
use crate::mem::MemoryModel;

/// A timed P-ISA stream.
#[derive(Debug)]
pub struct PisaSchedule {
    /// Scheduled instructions in issue order, including filler `nop`s.
    pub listing: Vec<InstrRef>,
    /// Total idle cycles covered by `nop`s.
    pub idle_cycles: u64,
    /// Number of `nop`s inserted.
    pub nops: u64,
}

/// Effective readiness: the instruction's own tracker, its sources, and its
/// destinations less the write latency.
fn effective_ready(program: &Program, model: &MemoryModel, r: InstrRef) -> Cycle {
    let instr = &program[r];
    let mut ready = instr.cycle_ready;
    for src in &instr.sources {
        if let Some(v) = src.var() {
            ready = ready.max(model.var_cycle_ready(v));
        }
    }
    for dst in &instr.dests {
        if let Some(v) = dst.var() {
            let mut at = model.var_cycle_ready(v);
            // A writer can issue before its destination settles: the write
            // lands on the last latency cycle.
            at.cycle = (at.cycle + 1).saturating_sub(instr.latency);
            ready = ready.max(at);
        }
    }
    ready
}

fn pisa_bank(model: &MemoryModel, v: crate::mem::VarId) -> String {
    match model.var(v).suggested_bank() {
        // Bank hints name compute banks, offset by the staging bank.
        Some(bank) if bank > 0 => format!("{} ({})", model.var(v).name(), bank - 1),
        _ => model.var(v).name().to_owned(),
    }
}

fn operand_pisa(model: &MemoryModel, operand: &Operand) -> String {
    match operand {
        Operand::Var(v) => pisa_bank(model, *v),
        Operand::Reg(r) => r.to_string(),
    }
}

/// Formats an XInst in P-ISA kernel form.
pub(crate) fn format_pisa(program: &Program, model: &MemoryModel, r: InstrRef) -> String {
    let instr = &program[r];
    let InstrKind::X { n, res, kind } = &instr.kind else {
        return String::new();
    };
    let mut fields: Vec<String> = vec![n.to_string(), kind.op().to_string()];
    fields.extend(instr.dests.iter().map(|o| operand_pisa(model, o)));
    fields.extend(instr.sources.iter().map(|o| operand_pisa(model, o)));
    match kind {
        XKind::Muli { imm } | XKind::Maci { imm } => fields.push(imm.clone()),
        XKind::Ntt { stage } | XKind::Intt { stage } => fields.push(stage.to_string()),
        XKind::TwNtt { tw_meta, stage, block } | XKind::TwIntt { tw_meta, stage, block } => {
            fields.extend([tw_meta.to_string(), stage.to_string(), block.to_string()]);
        }
        XKind::Shuffle { wait_cyc, .. } => fields.push(wait_cyc.to_string()),
        XKind::Nop => fields.push(instr.throughput.to_string()),
        _ => {}
    }
    if let Some(res) = res {
        fields.push(res.to_string());
    }
    let mut line = fields.join(", ");
    if !instr.comment.is_empty() {
        line.push_str(" # ");
        line.push_str(&instr.comment);
    }
    line
}

/// Schedules the dependency graph as a single timed P-ISA stream.
pub fn schedule_pisa(
    program: &mut Program,
    graph: &DepGraph,
    model: &mut MemoryModel,
    spec: &IsaSpec,
) -> Result<PisaSchedule, ScheduleError> {
    let mut topo = graph.topological_sort()?;
    let mut graph = graph.clone();
    let mut listing: Vec<InstrRef> = Vec::new();
    let mut idle_cycles = 0u64;
    let mut nops = 0u64;
    let mut current = Cycle::new(0, 1);
    let mut pq: Vec<InstrRef> = Vec::new();
    let mut processed: std::collections::HashSet<InstrRef> = std::collections::HashSet::new();
    let mut changed = true;
    let nop_spec = *spec.xinst(XOp::Nop);

    while !graph.is_empty() {
        if changed {
            // Pull the dependency-free prefix of the topological window.
            let mut consumed = 0;
            for &inst in topo.iter() {
                if !processed.contains(&inst) {
                    if graph.in_degree(inst) > 0 {
                        break;
                    }
                    pq.push(inst);
                    processed.insert(inst);
                }
                consumed += 1;
            }
            topo.drain(..consumed);
        }
        debug_assert!(!pq.is_empty(), "no schedulable instruction");

        // Prefer an instruction that is ready exactly now; otherwise the
        // earliest-ready one.
        let pick = pq
            .iter()
            .position(|&i| effective_ready(program, model, i) == current)
            .unwrap_or_else(|| {
                let mut best = 0;
                let mut best_ready = effective_ready(program, model, pq[0]);
                for (idx, &i) in pq.iter().enumerate().skip(1) {
                    let ready = effective_ready(program, model, i);
                    if ready < best_ready {
                        best = idx;
                        best_ready = ready;
                    }
                }
                best
            });
        let candidate = pq[pick];
        let ready = effective_ready(program, model, candidate);

        let issued = if ready > current {
            // Fill the gap with a nop and retry the candidate afterwards.
            let idle = ready.cycle - current.cycle;
            idle_cycles += idle;
            nops += 1;
            changed = false;
            let client = program[candidate].id.client;
            program.push(
                client,
                idle.max(nop_spec.default_throughput),
                idle.max(nop_spec.default_latency),
                Vec::new(),
                Vec::new(),
                format!("waiting on instruction {}", program[candidate].id),
                InstrKind::X {
                    n: 0,
                    res: None,
                    kind: XKind::Nop,
                },
            )
        } else {
            pq.remove(pick);
            let successors = graph.successors(candidate);
            graph.remove_node(candidate);
            let mut front: Vec<InstrRef> = successors
                .into_iter()
                .filter(|&s| graph.in_degree(s) == 0)
                .collect();
            front.extend(topo.drain(..));
            topo = front;
            changed = true;
            candidate
        };

        // Issue: stamp the timing, settle destinations, freeze the P-ISA
        // form.
        let throughput = program[issued].throughput;
        let latency = program[issued].latency;
        program[issued].timing = Some(ScheduleTiming {
            cycle: current,
            index: listing.len() + 1,
        });
        for dst in program[issued].dests.clone() {
            if let Some(v) = dst.var() {
                model.var_mut(v).cycle_ready = Cycle::new(current.bundle, current.cycle + latency);
            }
        }
        let frozen = format_pisa(program, model, issued);
        program[issued].frozen = Some(frozen);
        listing.push(issued);
        current += throughput;
    }

    Ok(PisaSchedule {
        listing,
        idle_cycles,
        nops,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_dependency_graph;
    use crate::kernel::parse_kernel;

    fn schedule(text: &str) -> (Program, MemoryModel, PisaSchedule) {
        let spec = IsaSpec::builtin();
        let mut program = Program::new();
        let mut model = MemoryModel::new(64, 32).unwrap();
        let listing = parse_kernel(text, &mut program, &mut model, &spec).unwrap();
        let graph = build_dependency_graph(&program, &listing).unwrap();
        let sched = schedule_pisa(&mut program, &graph, &mut model, &spec).unwrap();
        (program, model, sched)
    }

    #[test]
    fn independent_ops_run_back_to_back() {
        let (program, _, sched) = schedule(
            "13, add, c (2), a (0), b (1), 1\n13, add, f (2), d (0), e (1), 1\n",
        );
        assert_eq!(sched.nops, 0);
        assert_eq!(sched.idle_cycles, 0);
        let t0 = program[sched.listing[0]].timing.unwrap();
        let t1 = program[sched.listing[1]].timing.unwrap();
        assert_eq!(t0.cycle, Cycle::new(0, 1));
        assert_eq!(t1.cycle, Cycle::new(0, 2));
    }

    #[test]
    fn dependent_op_waits_for_latency() {
        let (program, _, sched) =
            schedule("13, add, c (2), a (0), b (1), 1\n13, add, d (2), c (2), b (1), 1\n");
        // One nop covers the latency gap between producer and consumer.
        assert_eq!(sched.nops, 1);
        assert_eq!(sched.listing.len(), 3);
        let producer = program[sched.listing[0]].timing.unwrap().cycle;
        let consumer = program[sched.listing[2]].timing.unwrap().cycle;
        assert!(consumer.cycle > producer.cycle + 5);
        assert!(sched.idle_cycles > 0);
        // The filler is a nop and was frozen.
        match &program[sched.listing[1]].kind {
            InstrKind::X { kind: XKind::Nop, .. } => {}
            k => panic!("expected nop, got {k:?}"),
        }
        assert!(program[sched.listing[1]].frozen.is_some());
    }

    #[test]
    fn schedule_respects_every_edge() {
        let text = "\
13, mul, t (1), a (0), b (1), 0
13, add, u (2), t (1), b (1), 0
13, add, v (2), u (2), t (1), 0
";
        let spec = IsaSpec::builtin();
        let mut program = Program::new();
        let mut model = MemoryModel::new(64, 32).unwrap();
        let listing = parse_kernel(text, &mut program, &mut model, &spec).unwrap();
        let graph = build_dependency_graph(&program, &listing).unwrap();
        let edges: Vec<_> = listing
            .iter()
            .flat_map(|&u| graph.successors(u).into_iter().map(move |v| (u, v)))
            .collect();
        let sched = schedule_pisa(&mut program, &graph, &mut model, &spec).unwrap();
        for (u, v) in edges {
            let tu = program[u].timing.unwrap();
            let tv = program[v].timing.unwrap();
            assert!(tu.cycle < tv.cycle, "{u} must precede {v}");
        }
        assert!(sched.listing.len() >= 3);
    }
}
