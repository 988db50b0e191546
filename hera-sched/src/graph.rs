//! Dependency graph over XInsts: def/use edges, keygen ordering, topological
//! order and variable access lists.

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::IndexSet;
use hera_asm::IsaSpec;
use hera_asm::XOp;

use crate::error::ScheduleError;
use crate::inst::{InstrKind, InstrRef, Operand, Program, XKind};
use crate::mem::{MemoryModel, VarAccess, VarId};

/// A directed dependency graph: an edge `u → v` means `u` must complete
/// before `v` is ready.
#[derive(Debug, Clone, Default)]
pub struct DepGraph {
    nodes: IndexSet<InstrRef>,
    preds: HashMap<InstrRef, IndexSet<InstrRef>>,
    succs: HashMap<InstrRef, IndexSet<InstrRef>>,
}

impl DepGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node; a no-op if present.
    pub fn add_node(&mut self, r: InstrRef) {
        if self.nodes.insert(r) {
            self.preds.entry(r).or_default();
            self.succs.entry(r).or_default();
        }
    }

    /// Whether the node is in the graph.
    pub fn contains(&self, r: InstrRef) -> bool {
        self.nodes.contains(&r)
    }

    /// Adds an edge `u → v`. Both endpoints must be nodes; self-edges are
    /// ignored.
    pub fn add_edge(&mut self, u: InstrRef, v: InstrRef) {
        if u == v {
            return;
        }
        debug_assert!(self.contains(u) && self.contains(v));
        if self.succs.entry(u).or_default().insert(v) {
            self.preds.entry(v).or_default().insert(u);
        }
    }

    /// Removes a node and all of its edges.
    pub fn remove_node(&mut self, r: InstrRef) {
        if !self.nodes.shift_remove(&r) {
            return;
        }
        if let Some(succs) = self.succs.remove(&r) {
            for s in succs {
                if let Some(p) = self.preds.get_mut(&s) {
                    p.shift_remove(&r);
                }
            }
        }
        if let Some(preds) = self.preds.remove(&r) {
            for p in preds {
                if let Some(s) = self.succs.get_mut(&p) {
                    s.shift_remove(&r);
                }
            }
        }
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of edges.
    pub fn edge_count(&self) -> usize {
        self.succs.values().map(IndexSet::len).sum()
    }

    /// Whether the graph has no nodes left.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = InstrRef> + '_ {
        self.nodes.iter().copied()
    }

    /// In-degree of a node.
    pub fn in_degree(&self, r: InstrRef) -> usize {
        self.preds.get(&r).map(IndexSet::len).unwrap_or(0)
    }

    /// Direct successors of a node.
    pub fn successors(&self, r: InstrRef) -> Vec<InstrRef> {
        self.succs
            .get(&r)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Direct predecessors of a node.
    pub fn predecessors(&self, r: InstrRef) -> Vec<InstrRef> {
        self.preds
            .get(&r)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Kahn topological sort, deterministic in node insertion order.
    ///
    /// Fails when the graph has a cycle.
    pub fn topological_sort(&self) -> Result<Vec<InstrRef>, ScheduleError> {
        let mut in_deg: HashMap<InstrRef, usize> =
            self.nodes().map(|n| (n, self.in_degree(n))).collect();
        let mut queue: VecDeque<InstrRef> = self
            .nodes()
            .filter(|n| in_deg[n] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.node_count());
        while let Some(n) = queue.pop_front() {
            order.push(n);
            for s in self.successors(n) {
                let d = in_deg.get_mut(&s).expect("successor is a node");
                *d -= 1;
                if *d == 0 {
                    queue.push_back(s);
                }
            }
        }
        if order.len() != self.node_count() {
            return Err(ScheduleError::DependencyCycle);
        }
        Ok(order)
    }
}

/// Builds the dependency DAG of a P-ISA listing from def/use analysis.
///
/// For every source, an edge runs from its last writer; for every
/// destination, edges run from every read since the last write (WAR) and
/// from the last write itself (WAW).
pub fn build_dependency_graph(
    program: &Program,
    listing: &[InstrRef],
) -> Result<DepGraph, ScheduleError> {
    struct VarTracking {
        last_write: Option<InstrRef>,
        reads_after_last_write: Vec<InstrRef>,
    }

    let mut graph = DepGraph::new();
    let mut vars: HashMap<VarId, VarTracking> = HashMap::new();

    for &inst in listing {
        graph.add_node(inst);

        for dst in program[inst].dests.clone() {
            let Some(v) = dst.var() else { continue };
            if let Some(tracking) = vars.get(&v) {
                if tracking.reads_after_last_write.is_empty() {
                    if let Some(w) = tracking.last_write {
                        graph.add_edge(w, inst);
                    }
                } else {
                    for &read in &tracking.reads_after_last_write {
                        graph.add_edge(read, inst);
                    }
                }
            }
            vars.insert(
                v,
                VarTracking {
                    last_write: Some(inst),
                    reads_after_last_write: Vec::new(),
                },
            );
        }

        for src in program[inst].sources.clone() {
            let Some(v) = src.var() else { continue };
            let tracking = vars.entry(v).or_insert(VarTracking {
                last_write: None,
                reads_after_last_write: Vec::new(),
            });
            if let Some(w) = tracking.last_write {
                graph.add_edge(w, inst);
            }
            tracking.reads_after_last_write.push(inst);
        }
    }

    graph.topological_sort()?;
    Ok(graph)
}

/// Orders keygen variables by `(seed, key)` and checks key indices are dense
/// from zero for every seed.
fn order_keygen_vars(model: &MemoryModel) -> Result<Vec<Vec<VarId>>, ScheduleError> {
    let mut ordered: Vec<Vec<Option<VarId>>> = vec![Vec::new(); model.meta.keygen_seeds.len()];
    for (&var, &(seed, key)) in model.keygen_variables() {
        let list = &mut ordered[seed];
        if key >= list.len() {
            list.resize(key + 1, None);
        }
        list[key] = Some(var);
    }
    ordered
        .into_iter()
        .enumerate()
        .map(|(seed, list)| {
            list.into_iter()
                .enumerate()
                .map(|(key, var)| var.ok_or(ScheduleError::KeygenSkipped { seed, key }))
                .collect()
        })
        .collect()
}

/// Whether some direct or transitive dependency of `start` uses `var` as a
/// source (or, when `only_sources` is false, as any operand).
fn var_in_prev_deps(
    graph: &DepGraph,
    program: &Program,
    start: InstrRef,
    var: VarId,
    only_sources: bool,
) -> bool {
    if !graph.contains(start) {
        return false;
    }
    let mut seen: HashSet<InstrRef> = HashSet::new();
    let mut work: VecDeque<InstrRef> = graph.predecessors(start).into();
    while let Some(inst) = work.pop_front() {
        if !seen.insert(inst) {
            continue;
        }
        let instr = &program[inst];
        let mut uses = instr.sources.iter().filter_map(Operand::var);
        if uses.any(|v| v == var) {
            return true;
        }
        if !only_sources && instr.dests.iter().filter_map(Operand::var).any(|v| v == var) {
            return true;
        }
        for p in graph.predecessors(inst) {
            if !seen.contains(&p) {
                work.push_back(p);
            }
        }
    }
    false
}

/// Injects synthetic `copy` XInsts and edges so key material is generated in
/// ascending key-index order per seed.
///
/// Every consumer of a keygen variable becomes dependent on that variable's
/// `copy`; copies of the same seed chain in key order; and the first
/// consumer's own dependencies are replicated onto the `copy` when the
/// consumer does not already depend on a prior use, so the `copy` lands at a
/// sensible position in any topological order.
pub fn enforce_keygen_ordering(
    graph: &mut DepGraph,
    program: &mut Program,
    model: &mut MemoryModel,
    spec: &IsaSpec,
) -> Result<(), ScheduleError> {
    let ordered = order_keygen_vars(model)?;
    if !ordered.is_empty() {
        tracing::debug!(seeds = ordered.len(), "enforcing keygen ordering");
    }

    let copy_spec = *spec.xinst(XOp::Copy);
    for (seed_idx, seed_vars) in ordered.into_iter().enumerate() {
        let mut last_copy: Option<InstrRef> = None;
        let mut copy_deps_found = false;
        for (key_idx, kg_var) in seed_vars.into_iter().enumerate() {
            let kg_name = model.var(kg_var).name().to_owned();
            let bank = model.var(kg_var).suggested_bank();
            let dst_name = model.find_unique_var_name();
            let dst = model.retrieve_var_add(&dst_name, bank)?;
            let copy = program.push(
                0,
                copy_spec.default_throughput,
                copy_spec.default_latency,
                vec![Operand::Var(kg_var)],
                vec![Operand::Var(dst)],
                format!(
                    "copy to generate keygen var {kg_name} (seed = {seed_idx}, key = {key_idx})"
                ),
                InstrKind::X {
                    n: 0,
                    res: None,
                    kind: XKind::Copy,
                },
            );
            graph.add_node(copy);
            if let Some(last) = last_copy {
                graph.add_edge(last, copy);
            }
            last_copy = Some(copy);

            let consumers: Vec<InstrRef> = graph
                .nodes()
                .filter(|&inst| {
                    inst != copy
                        && program[inst]
                            .sources
                            .iter()
                            .filter_map(Operand::var)
                            .any(|v| v == kg_var)
                })
                .collect();
            for inst in consumers {
                if !copy_deps_found && !var_in_prev_deps(graph, program, inst, kg_var, true) {
                    for dep in graph.predecessors(inst) {
                        graph.add_edge(dep, copy);
                    }
                    copy_deps_found = true;
                }
                graph.add_edge(copy, inst);
            }
        }
    }

    graph.topological_sort()?;
    Ok(())
}

/// Topologically sorts the graph and stamps every variable with the
/// estimated order of its upcoming XInst accesses.
///
/// The access lists drive FTBU victim selection; the sort is returned for
/// reuse.
pub fn build_var_access_list(
    graph: &DepGraph,
    program: &Program,
    model: &mut MemoryModel,
) -> Result<Vec<InstrRef>, ScheduleError> {
    let order = graph.topological_sort()?;
    for (idx, &inst) in order.iter().enumerate() {
        let instr = &program[inst];
        let mut vars: Vec<VarId> = instr
            .sources
            .iter()
            .chain(instr.dests.iter())
            .filter_map(Operand::var)
            .collect();
        vars.sort_unstable();
        vars.dedup();
        for v in vars {
            model
                .var_mut(v)
                .accessed_by_xinsts
                .push_back(VarAccess { index: idx, instr: inst });
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::InstrKind;

    fn xinst(program: &mut Program, sources: Vec<VarId>, dests: Vec<VarId>) -> InstrRef {
        program.push(
            0,
            1,
            6,
            sources.into_iter().map(Operand::Var).collect(),
            dests.into_iter().map(Operand::Var).collect(),
            "",
            InstrKind::X {
                n: 13,
                res: Some(0),
                kind: XKind::Add,
            },
        )
    }

    #[test]
    fn raw_war_waw_edges() {
        let mut model = MemoryModel::new(64, 32).unwrap();
        let a = model.retrieve_var_add("a", None).unwrap();
        let b = model.retrieve_var_add("b", None).unwrap();
        let c = model.retrieve_var_add("c", None).unwrap();
        let mut program = Program::new();
        // i0: c = a + b; i1: a = c + b (WAR on a, RAW on c); i2: c = a + a
        // (WAW via read i1, RAW on a).
        let i0 = xinst(&mut program, vec![a, b], vec![c]);
        let i1 = xinst(&mut program, vec![c, b], vec![a]);
        let i2 = xinst(&mut program, vec![a], vec![c]);
        let graph = build_dependency_graph(&program, &[i0, i1, i2]).unwrap();
        assert!(graph.successors(i0).contains(&i1)); // RAW on c
        assert!(graph.successors(i0).contains(&i1)); // WAR on a via read in i0
        assert!(graph.successors(i1).contains(&i2)); // RAW on a
        assert_eq!(graph.in_degree(i0), 0);
        let order = graph.topological_sort().unwrap();
        assert_eq!(order, vec![i0, i1, i2]);
    }

    #[test]
    fn cycle_detection() {
        let mut g = DepGraph::new();
        let a = InstrRef::new(0);
        let b = InstrRef::new(1);
        g.add_node(a);
        g.add_node(b);
        g.add_edge(a, b);
        g.add_edge(b, a);
        assert!(matches!(
            g.topological_sort(),
            Err(ScheduleError::DependencyCycle)
        ));
    }

    #[test]
    fn access_lists_follow_topo_order() {
        let mut model = MemoryModel::new(64, 32).unwrap();
        let a = model.retrieve_var_add("a", None).unwrap();
        let b = model.retrieve_var_add("b", None).unwrap();
        let mut program = Program::new();
        let i0 = xinst(&mut program, vec![a], vec![b]);
        let i1 = xinst(&mut program, vec![b], vec![a]);
        let graph = build_dependency_graph(&program, &[i0, i1]).unwrap();
        let order = build_var_access_list(&graph, &program, &mut model).unwrap();
        assert_eq!(order, vec![i0, i1]);
        let accesses = &model.var(a).accessed_by_xinsts;
        assert_eq!(accesses.len(), 2);
        assert_eq!(accesses[0].index, 0);
        assert_eq!(accesses[1].instr, i1);
    }

    #[test]
    fn keygen_copies_chain_in_key_order() {
        let mut model = MemoryModel::new(64, 32).unwrap();
        let seed = model.retrieve_var_add("seed0", None).unwrap();
        model.add_meta_keygen_seed_var(seed);
        let k0 = model.retrieve_var_add("k0", Some(1)).unwrap();
        let k1 = model.retrieve_var_add("k1", Some(1)).unwrap();
        let o1 = model.retrieve_var_add("o1", Some(2)).unwrap();
        let o2 = model.retrieve_var_add("o2", Some(2)).unwrap();
        model.add_keygen_variable(k0, 0, 0).unwrap();
        model.add_keygen_variable(k1, 0, 1).unwrap();

        let mut program = Program::new();
        // Kernel uses k1 first, then k0, into independent outputs.
        let use1 = xinst(&mut program, vec![k1], vec![o1]);
        let use0 = xinst(&mut program, vec![k0], vec![o2]);
        let mut graph = build_dependency_graph(&program, &[use1, use0]).unwrap();
        let spec = IsaSpec::builtin();
        enforce_keygen_ordering(&mut graph, &mut program, &mut model, &spec).unwrap();

        // Two copies were added.
        assert_eq!(graph.node_count(), 4);
        let copies: Vec<InstrRef> = graph
            .nodes()
            .filter(|&n| matches!(program[n].kind, InstrKind::X { kind: XKind::Copy, .. }))
            .collect();
        assert_eq!(copies.len(), 2);
        let (c0, c1) = (copies[0], copies[1]);
        // copy(k0) → copy(k1), and each consumer depends on its copy.
        assert!(graph.successors(c0).contains(&c1));
        assert!(graph.successors(c0).contains(&use0));
        assert!(graph.successors(c1).contains(&use1));
        // Any topological order generates k0 before k1.
        let order = graph.topological_sort().unwrap();
        let pos = |r: InstrRef| order.iter().position(|&x| x == r).unwrap();
        assert!(pos(c0) < pos(c1));
    }

    #[test]
    fn missing_key_index_rejected() {
        let mut model = MemoryModel::new(64, 32).unwrap();
        let seed = model.retrieve_var_add("seed0", None).unwrap();
        model.add_meta_keygen_seed_var(seed);
        let k1 = model.retrieve_var_add("k1", Some(1)).unwrap();
        let out = model.retrieve_var_add("o1", Some(2)).unwrap();
        model.add_keygen_variable(k1, 0, 1).unwrap();
        let mut program = Program::new();
        let use1 = xinst(&mut program, vec![k1], vec![out]);
        let mut graph = build_dependency_graph(&program, &[use1]).unwrap();
        let spec = IsaSpec::builtin();
        let err = enforce_keygen_ordering(&mut graph, &mut program, &mut model, &spec).unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::KeygenSkipped { seed: 0, key: 0 }
        ));
    }
}
