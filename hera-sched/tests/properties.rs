//! Invariants over complete schedules: dependency order, bundle shape,
//! write-port exclusivity and emission token counts.

use std::collections::{HashMap, HashSet};

use hera_asm::IsaSpec;
use hera_sched::emit::render_streams;
use hera_sched::graph::{build_dependency_graph, enforce_keygen_ordering};
use hera_sched::inst::{InstrKind, InstrRef, Program, XKind};
use hera_sched::kernel::parse_kernel;
use hera_sched::mem::{MemInfo, MemoryModel};
use hera_sched::sched::{schedule_asm, ScheduleOptions};
use hera_sched::{ReplacementPolicy, ScheduleResult};
use rstest::rstest;

const KERNEL: &str = "\
13, mul, t1 (1), a (0), b (1), 2
13, add, t2 (2), t1 (1), c (2), 2
13, sub, t3 (1), t2 (2), a (0), 2
13, add, out (2), t3 (1), t1 (1), 2
";

const MEM_INFO: &str = "\
dload, input, 0, a
dload, input, 1, b
dload, input, 2, c
store, out, 3
";

fn pipeline_with(
    kernel: &str,
    mem_info: &str,
    options: ScheduleOptions,
) -> (Vec<(InstrRef, InstrRef)>, ScheduleResult) {
    let spec = IsaSpec::builtin();
    let mut program = Program::new();
    let mut model = MemoryModel::new(256, 64).unwrap();
    let listing = parse_kernel(kernel, &mut program, &mut model, &spec).unwrap();
    let info = MemInfo::from_text(mem_info).unwrap();
    info.apply(&mut model).unwrap();
    let mut graph = build_dependency_graph(&program, &listing).unwrap();
    enforce_keygen_ordering(&mut graph, &mut program, &mut model, &spec).unwrap();
    let edges: Vec<(InstrRef, InstrRef)> = graph
        .nodes()
        .flat_map(|u| graph.successors(u).into_iter().map(move |v| (u, v)))
        .collect();
    let result = schedule_asm(program, graph, model, &spec, options).unwrap();
    (edges, result)
}

fn pipeline(kernel: &str, mem_info: &str) -> (Vec<(InstrRef, InstrRef)>, ScheduleResult) {
    pipeline_with(kernel, mem_info, ScheduleOptions::default())
}

#[rstest]
#[case::ftbu(ReplacementPolicy::Ftbu)]
#[case::lru(ReplacementPolicy::Lru)]
fn dependency_edges_are_respected(#[case] replacement_policy: ReplacementPolicy) {
    let options = ScheduleOptions {
        replacement_policy,
        use_xinstfetch: false,
    };
    let (edges, result) = pipeline_with(KERNEL, MEM_INFO, options);
    assert!(!edges.is_empty());
    for (u, v) in edges {
        let tu = result.program.get(u).timing.expect("u scheduled");
        let tv = result.program.get(v).timing.expect("v scheduled");
        assert!(
            tu.cycle < tv.cycle,
            "{} scheduled at {} must precede {} at {}",
            result.program.get(u).describe(),
            tu.cycle,
            result.program.get(v).describe(),
            tv.cycle,
        );
    }
}

#[test]
fn bundles_are_full_and_terminated() {
    let (_, result) = pipeline(KERNEL, MEM_INFO);
    assert!(!result.bundles.is_empty());
    for bundle in &result.bundles {
        assert_eq!(bundle.xinsts.len(), 64);
        let bexits: Vec<usize> = bundle
            .xinsts
            .iter()
            .enumerate()
            .filter(|(_, &x)| {
                matches!(
                    result.program.get(x).kind,
                    InstrKind::X {
                        kind: XKind::BExit,
                        ..
                    }
                )
            })
            .map(|(i, _)| i)
            .collect();
        assert_eq!(bexits.len(), 1);
        // Only nop padding may follow the terminator.
        for &x in &bundle.xinsts[bexits[0] + 1..] {
            assert!(matches!(
                result.program.get(x).kind,
                InstrKind::X {
                    kind: XKind::Nop,
                    ..
                }
            ));
        }
        assert!(bundle.latency_from_xstore <= bundle.latency);
    }
}

#[test]
fn single_residual_segment_per_bundle() {
    let (_, result) = pipeline(KERNEL, MEM_INFO);
    for bundle in &result.bundles {
        let segments: HashSet<u64> = bundle
            .xinsts
            .iter()
            .filter_map(|&x| result.program.get(x).kind.residual())
            .map(|res| res / 64)
            .collect();
        assert!(segments.len() <= 1, "mixed residual segments in a bundle");
    }
}

#[test]
fn no_same_cycle_same_bank_writes() {
    let (_, result) = pipeline(KERNEL, MEM_INFO);
    for bundle in &result.bundles {
        let mut writes: HashMap<(u64, String), InstrRef> = HashMap::new();
        for &x in &bundle.xinsts {
            let instr = result.program.get(x);
            if !matches!(
                instr.kind,
                InstrKind::X {
                    kind: XKind::Add
                        | XKind::Sub
                        | XKind::Mul
                        | XKind::Mac
                        | XKind::Copy
                        | XKind::Move
                        | XKind::Shuffle { .. },
                    ..
                }
            ) {
                continue;
            }
            let timing = instr.timing.expect("scheduled");
            let complete = timing.cycle.cycle + instr.latency - 1;
            // Written registers are visible in the frozen text: the
            // destination fields.
            let frozen = instr.frozen.as_ref().expect("frozen");
            let body: Vec<&str> = frozen.split('#').next().unwrap().split(',').collect();
            let bank = body[3].trim().rsplit('b').next().unwrap().to_owned();
            if let Some(previous) = writes.insert((complete, bank.clone()), x) {
                panic!(
                    "{} and {} both write bank {bank} on cycle {complete}",
                    result.program.get(previous).describe(),
                    result.program.get(x).describe(),
                );
            }
        }
    }
}

#[test]
fn emitted_token_counts_match_the_spec() {
    let (_, result) = pipeline(KERNEL, MEM_INFO);
    let streams = render_streams(&result).unwrap();

    let fields = |line: &str| -> Vec<String> {
        line.split('#')
            .next()
            .unwrap()
            .split(',')
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty())
            .collect()
    };

    // XInst lines: id, N, op, dests…, srcs…, extras…, res.
    let expected_xtokens = |op: &str| -> usize {
        match op {
            "add" | "sub" | "mul" | "mac" | "muli" | "maci" => 7,
            "copy" => 5,
            "ntt" | "intt" => 10,
            "twntt" | "twintt" => 9,
            "rshuffle" | "irshuffle" => 9,
            "move" => 5,
            "xstore" | "nop" => 4,
            "bexit" => 3,
            other => panic!("unexpected xinst op {other:?}"),
        }
    };
    for line in streams.xinst.lines() {
        let tokens = fields(line);
        let op = tokens[2].as_str();
        assert_eq!(
            tokens.len(),
            expected_xtokens(op),
            "token count for {line:?}"
        );
    }

    // CInst and MInst lines carry exactly the spec's token count.
    let spec = IsaSpec::builtin();
    let c_tokens: HashMap<&str, usize> = [
        ("cload", spec.cinst(hera_asm::COp::CLoad).num_tokens),
        ("cstore", spec.cinst(hera_asm::COp::CStore).num_tokens),
        ("csyncm", spec.cinst(hera_asm::COp::CSyncM).num_tokens),
        ("cnop", spec.cinst(hera_asm::COp::CNop).num_tokens),
        ("ifetch", spec.cinst(hera_asm::COp::IFetch).num_tokens),
        ("nload", spec.cinst(hera_asm::COp::NLoad).num_tokens),
        ("bload", spec.cinst(hera_asm::COp::BLoad).num_tokens),
        ("bones", spec.cinst(hera_asm::COp::BOnes).num_tokens),
        ("kg_load", spec.cinst(hera_asm::COp::KgLoad).num_tokens),
        ("kg_seed", spec.cinst(hera_asm::COp::KgSeed).num_tokens),
        ("kg_start", spec.cinst(hera_asm::COp::KgStart).num_tokens),
        ("xinstfetch", spec.cinst(hera_asm::COp::XInstFetch).num_tokens),
        ("cexit", spec.cinst(hera_asm::COp::CExit).num_tokens),
    ]
    .into_iter()
    .collect();
    for line in streams.cinst.lines() {
        let tokens = fields(line);
        let expected = c_tokens[tokens[0].as_str()];
        assert_eq!(tokens.len(), expected, "token count for {line:?}");
    }

    let m_tokens: HashMap<&str, usize> = [
        ("mload", spec.minst(hera_asm::MOp::MLoad).num_tokens),
        ("mstore", spec.minst(hera_asm::MOp::MStore).num_tokens),
        ("msyncc", spec.minst(hera_asm::MOp::MSyncC).num_tokens),
    ]
    .into_iter()
    .collect();
    for line in streams.minst.lines() {
        let tokens = fields(line);
        assert_eq!(tokens.len(), m_tokens[tokens[0].as_str()], "token count for {line:?}");
    }
}

#[test]
fn mload_before_cload_is_synchronized() {
    let (_, result) = pipeline(KERNEL, MEM_INFO);
    let streams = render_streams(&result).unwrap();
    // For every cload of a SPAD address, some earlier csyncm references the
    // mload of that address.
    let mlines: Vec<Vec<String>> = streams
        .minst
        .lines()
        .map(|l| {
            l.split('#')
                .next()
                .unwrap()
                .split(',')
                .map(|t| t.trim().to_owned())
                .collect()
        })
        .collect();
    let clines: Vec<Vec<String>> = streams
        .cinst
        .lines()
        .map(|l| {
            l.split('#')
                .next()
                .unwrap()
                .split(',')
                .map(|t| t.trim().to_owned())
                .collect()
        })
        .collect();
    for (idx, cline) in clines.iter().enumerate() {
        if cline[0] != "cload" {
            continue;
        }
        let spad_addr = &cline[2];
        // Last mload of this address before this cload's sync point.
        let synced = clines[..idx].iter().rev().any(|earlier| {
            earlier[0] == "csyncm" && {
                let target: usize = earlier[1].parse().unwrap();
                let target_line = &mlines[target - 1];
                target_line[0] == "mload" && &target_line[1] == spad_addr
            }
        });
        assert!(synced, "cload of SPAD {spad_addr} lacks a csyncm to its mload");
    }
}
