//! End-to-end scheduling scenarios driven through the assembler facade.

use hera_asm::IsaSpec;
use hera_sched::assembler::AssembleError;
use hera_sched::emit::{render_streams, RenderedStreams};
use hera_sched::inst::{InstrKind, XKind};
use hera_sched::{Assembler, ScheduleError, ScheduleResult};

fn assemble(kernel: &str, mem_info: &str) -> (ScheduleResult, RenderedStreams) {
    let spec = IsaSpec::builtin();
    let result = Assembler::new(&spec)
        .assemble(kernel, mem_info)
        .expect("schedule");
    let streams = render_streams(&result).expect("render");
    (result, streams)
}

/// Operation name of an emitted C/M line.
fn line_op(line: &str) -> &str {
    line.split(&[',', '#'][..]).next().unwrap().trim()
}

/// Operation name of an emitted X line (third field).
fn xline_op(line: &str) -> &str {
    line.split('#').next().unwrap().split(',').nth(2).unwrap().trim()
}

/// Comma-separated fields before the comment.
fn fields(line: &str) -> Vec<String> {
    line.split('#')
        .next()
        .unwrap()
        .split(',')
        .map(|t| t.trim().to_owned())
        .filter(|t| !t.is_empty())
        .collect()
}

#[test]
fn trivial_add_schedules_the_three_queues() {
    let kernel = "13, add, out (2), a (0), b (1), 1\n";
    let mem_info = "dload, input, 0, a\ndload, input, 1, b\nstore, out, 2\n";
    let (result, streams) = assemble(kernel, mem_info);

    // MInstQ: both inputs loaded, the output stored to HBM 2 behind its
    // cstore sync, and the terminating sync.
    let mlines: Vec<&str> = streams.minst.lines().collect();
    let mops: Vec<&str> = mlines.iter().map(|l| line_op(l)).collect();
    assert_eq!(mops, ["mload", "mload", "msyncc", "mstore", "msyncc"]);
    assert_eq!(fields(mlines[3])[1], "2", "output lands at its mem-info HBM address");

    // CInstQ: loads into the staging bank behind their mload syncs, the
    // bundle fetch, the post-bundle cstore, and the exit.
    let clines: Vec<&str> = streams.cinst.lines().collect();
    let cops: Vec<&str> = clines.iter().map(|l| line_op(l)).collect();
    assert_eq!(
        cops,
        ["csyncm", "cload", "csyncm", "cload", "ifetch", "cstore", "csyncm", "cexit"]
    );
    // Both cloads target bank 0.
    for line in clines.iter().filter(|l| line_op(l) == "cload") {
        assert!(fields(line)[1].ends_with("b0"), "cload into staging: {line}");
    }

    // The cstore follows the ifetch of the bundle holding the xstore.
    let ifetch_pos = cops.iter().position(|&op| op == "ifetch").unwrap();
    let cstore_pos = cops.iter().position(|&op| op == "cstore").unwrap();
    assert_eq!(cstore_pos, ifetch_pos + 1);

    // XInstQ: one padded bundle.
    let xlines: Vec<&str> = streams.xinst.lines().collect();
    assert_eq!(xlines.len(), 64);
    assert_eq!(result.bundles.len(), 1);
    let count = |op: &str| xlines.iter().filter(|l| xline_op(l) == op).count();
    assert_eq!(count("move"), 2);
    assert_eq!(count("add"), 1);
    assert_eq!(count("xstore"), 1);
    assert_eq!(count("bexit"), 1);
    assert_eq!(count("nop"), 64 - 5);
    // The two moves leave the staging bank for compute banks 1 and 2.
    let moves: Vec<&str> = xlines.iter().copied().filter(|l| xline_op(l) == "move").collect();
    assert_eq!(fields(moves[0])[3], "r0b1");
    assert_eq!(fields(moves[1])[3], "r0b2");
    assert!(fields(moves[0])[4].ends_with("b0"));

    // Cross-queue indices are 1-based; the terminating msyncc points one
    // past cexit.
    let cexit_index = cops.iter().position(|&op| op == "cexit").unwrap() + 1;
    let last_msyncc = fields(mlines[4]);
    assert_eq!(last_msyncc[1], (cexit_index + 1).to_string());
    // The mstore waits on the cstore that landed the output in SPAD.
    let cstore_sync = fields(mlines[2]);
    assert_eq!(cstore_sync[1], (cstore_pos + 1).to_string());
    // Each cload's csyncm references its mload (1-based MInstQ lines).
    assert_eq!(fields(clines[0])[1], "1");
    assert_eq!(fields(clines[2])[1], "2");

    // The model agrees with the mem-info placement.
    let out = result.model.find_var("out").unwrap();
    assert_eq!(result.model.var(out).hbm_address, Some(2));
}

#[test]
fn rshuffle_slotting_and_table_monopoly() {
    let kernel = "\
14, rshuffle, t0 (0), t1 (1), t0 (0), t1 (1), 0
14, rshuffle, t2 (0), t3 (1), t2 (0), t3 (1), 0
14, rshuffle, t4 (0), t5 (1), t4 (0), t5 (1), 0
14, irshuffle, u0 (0), u1 (1), u0 (0), u1 (1), 0
";
    let mem_info = "\
dload, input, 0, t0
dload, input, 1, t1
dload, input, 2, t2
dload, input, 3, t3
dload, input, 4, t4
dload, input, 5, t5
dload, input, 6, u0
dload, input, 7, u1
dload, ntt_aux_table, 8
dload, ntt_routing_table, 9
dload, intt_aux_table, 10
dload, intt_routing_table, 11
";
    let (result, streams) = assemble(kernel, mem_info);

    let mut rshuffles = Vec::new();
    let mut irshuffles = Vec::new();
    for bundle in &result.bundles {
        for &x in &bundle.xinsts {
            if let InstrKind::X {
                kind: XKind::Shuffle { kind, .. },
                ..
            } = &result.program.get(x).kind
            {
                let timing = result.program.get(x).timing.unwrap();
                match kind {
                    hera_asm::ShuffleKind::Ntt => rshuffles.push(timing.cycle),
                    hera_asm::ShuffleKind::Intt => irshuffles.push(timing.cycle),
                }
            }
        }
    }
    assert_eq!(rshuffles.len(), 3);
    assert_eq!(irshuffles.len(), 1);

    // All three same-kind shuffles share a bundle, slotted on the special
    // increment.
    let c0 = rshuffles[0];
    assert!(rshuffles.iter().all(|c| c.bundle == c0.bundle));
    for later in &rshuffles[1..] {
        let delta = later.cycle - c0.cycle;
        assert!(delta > 0);
        assert_eq!(delta % 5, 0, "shuffle at {later} off the slot grid from {c0}");
    }

    // The opposite kind is held back to a later bundle.
    assert!(irshuffles[0].bundle > c0.bundle);

    // Each bundle's routing table loads precede its fetch: NTT tables
    // before the first ifetch, iNTT tables after it.
    let cops: Vec<&str> = streams.cinst.lines().map(line_op).collect();
    let first_ifetch = cops.iter().position(|&op| op == "ifetch").unwrap();
    let nloads: Vec<usize> = cops
        .iter()
        .enumerate()
        .filter(|(_, &op)| op == "nload")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(nloads.len(), 4);
    assert!(nloads[0] < first_ifetch && nloads[1] < first_ifetch);
    assert!(nloads[2] > first_ifetch && nloads[3] > first_ifetch);
}

#[test]
fn keygen_stream_generates_in_key_order() {
    // The kernel consumes key material out of order; generation still runs
    // k0, k1, k2.
    let kernel = "\
13, add, o1 (2), k1 (0), c1 (1), 1
13, add, o2 (2), k2 (0), c2 (1), 1
13, add, o3 (2), k0 (0), c3 (1), 1
";
    let mem_info = "\
dload, input, 0, c1
dload, input, 1, c2
dload, input, 2, c3
store, o1, 3
store, o2, 4
store, o3, 5
dload, keygen_seed, 6
keygen, 0, 0, k0
keygen, 0, 1, k1
keygen, 0, 2, k2
";
    let (_, streams) = assemble(kernel, mem_info);

    let kg_loads: Vec<&str> = streams
        .cinst
        .lines()
        .filter(|l| line_op(l) == "kg_load")
        .collect();
    assert_eq!(kg_loads.len(), 3);
    assert!(kg_loads[0].contains("k0"));
    assert!(kg_loads[1].contains("k1"));
    assert!(kg_loads[2].contains("k2"));

    // One seed for the whole run.
    let cops: Vec<&str> = streams.cinst.lines().map(line_op).collect();
    assert_eq!(cops.iter().filter(|&&op| op == "kg_seed").count(), 1);
    assert_eq!(cops.iter().filter(|&&op| op == "kg_start").count(), 1);
}

#[test]
fn seed_switch_defers_consumer_to_next_bundle() {
    let kernel = "\
13, add, o1 (2), k0 (0), c1 (1), 1
13, add, o2 (2), m0 (0), c2 (1), 1
";
    let mem_info = "\
dload, input, 0, c1
dload, input, 1, c2
store, o1, 2
store, o2, 3
dload, keygen_seed, 4
dload, keygen_seed, 5
keygen, 0, 0, k0
keygen, 1, 0, m0
";
    let (_, streams) = assemble(kernel, mem_info);
    let clines: Vec<&str> = streams.cinst.lines().collect();
    let cops: Vec<&str> = clines.iter().map(|l| line_op(l)).collect();

    let first_ifetch = cops.iter().position(|&op| op == "ifetch").unwrap();
    let kg_seeds: Vec<usize> = cops
        .iter()
        .enumerate()
        .filter(|(_, &op)| op == "kg_seed")
        .map(|(i, _)| i)
        .collect();
    let kg_loads: Vec<usize> = cops
        .iter()
        .enumerate()
        .filter(|(_, &op)| op == "kg_load")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(kg_seeds.len(), 2, "initial seed plus one switch");
    assert_eq!(kg_loads.len(), 2);

    // Seed 0 is consumed in the first bundle.
    assert!(kg_seeds[0] < first_ifetch);
    assert!(kg_loads[0] < first_ifetch);
    // The switch waits for the next bundle, then feeds the deferred
    // consumer: kg_seed + kg_start before its kg_load.
    assert!(kg_seeds[1] > first_ifetch);
    assert!(kg_seeds[1] < kg_loads[1]);
    assert_eq!(cops[kg_seeds[1] + 1], "kg_start");
    assert!(clines[kg_loads[1]].contains("m0"));
}

#[test]
fn spad_pressure_recycles_addresses() {
    let kernel = "\
13, add, o1 (2), a1 (0), b1 (1), 1
13, add, o2 (2), a2 (0), b2 (1), 1
13, add, o3 (2), a3 (0), b3 (1), 1
13, add, o4 (2), a4 (0), b4 (1), 1
";
    let mem_info = "\
dload, input, 0, a1
dload, input, 1, b1
dload, input, 2, a2
dload, input, 3, b2
dload, input, 4, a3
dload, input, 5, b3
dload, input, 6, a4
dload, input, 7, b4
store, o1, 8
store, o2, 9
store, o3, 10
store, o4, 11
";
    let spec = IsaSpec::builtin();
    let result = Assembler::new(&spec)
        .with_spad_capacity(4)
        .assemble(kernel, mem_info)
        .expect("schedules under SPAD pressure");
    let streams = render_streams(&result).expect("render");

    // Every input came through SPAD, within four words.
    let mload_addrs: Vec<String> = streams
        .minst
        .lines()
        .filter(|l| line_op(l) == "mload")
        .map(|l| fields(l)[1].clone())
        .collect();
    assert_eq!(mload_addrs.len(), 8);
    let mut distinct = mload_addrs.clone();
    distinct.sort();
    distinct.dedup();
    assert!(distinct.len() <= 4, "mloads stay within SPAD capacity");
    assert!(mload_addrs.len() > distinct.len(), "addresses are recycled");

    // All four outputs still reach their HBM homes.
    let mstore_addrs: Vec<String> = streams
        .minst
        .lines()
        .filter(|l| line_op(l) == "mstore")
        .map(|l| fields(l)[1].clone())
        .collect();
    assert_eq!(mstore_addrs, ["8", "9", "10", "11"]);
}

#[test]
fn dead_output_is_flushed_through_the_store_chain() {
    // S6: the last use of the output is the add destination; by the end of
    // its bundle the value must be on its way to HBM.
    let kernel = "13, add, o (1), x (0), y (2), 3\n";
    let mem_info = "dload, input, 0, x\ndload, input, 1, y\nstore, o, 7\n";
    let (result, streams) = assemble(kernel, mem_info);

    let mops: Vec<&str> = streams.minst.lines().map(line_op).collect();
    let msyncc_pos = mops.iter().position(|&op| op == "msyncc").unwrap();
    let mstore_pos = mops.iter().position(|&op| op == "mstore").unwrap();
    assert!(msyncc_pos < mstore_pos, "store waits on the cstore");

    let xops: Vec<&str> = streams.xinst.lines().map(xline_op).collect();
    assert!(xops.contains(&"xstore"));
    let cops: Vec<&str> = streams.cinst.lines().map(line_op).collect();
    assert!(cops.contains(&"cstore"));

    let o = result.model.find_var("o").unwrap();
    assert_eq!(result.model.var(o).hbm_address, Some(7));
    // The final SPAD slot was released by the mstore.
    assert_eq!(result.model.var(o).spad_address(), None);
}

#[test]
fn out_of_spad_carries_memory_dump() {
    // Nine metadata words fill a nine-word SPAD; the first input load has
    // nowhere to go.
    let kernel = "13, add, o (1), x (0), y (2), 1\n";
    let mem_info = "\
dload, input, 0, x
dload, input, 1, y
store, o, 2
dload, ones, 3
dload, twiddle, 4
dload, twiddle, 5
dload, twiddle, 6
dload, twiddle, 7
dload, twiddle, 8
dload, twiddle, 9
dload, twiddle, 10
dload, twiddle, 11
";
    let spec = IsaSpec::builtin();
    let err = Assembler::new(&spec)
        .with_spad_capacity(9)
        .assemble(kernel, mem_info)
        .unwrap_err();
    match err {
        AssembleError::Schedule(ScheduleError::OutOfSpad { bundle, diagnostics }) => {
            assert_eq!(bundle, 0);
            assert!(diagnostics.contains("SPAD: 9/9 words occupied"), "{diagnostics}");
            assert!(diagnostics.contains("twiddle_0"), "{diagnostics}");
        }
        other => panic!("expected out-of-SPAD, got {other}"),
    }
}

#[test]
fn out_of_hbm_carries_memory_dump() {
    // Two HBM words are pinned by the mem-info; the undeclared source has
    // no home to be staged from.
    let kernel = "13, add, o (1), x (0), y (2), 1\n";
    let mem_info = "dload, input, 0, x\nstore, o, 1\n";
    let spec = IsaSpec::builtin();
    let err = Assembler::new(&spec)
        .with_hbm_capacity(2)
        .assemble(kernel, mem_info)
        .unwrap_err();
    match err {
        AssembleError::Schedule(ScheduleError::OutOfHbm { diagnostics }) => {
            assert!(diagnostics.contains("HBM: 2/2 words occupied"), "{diagnostics}");
            assert!(diagnostics.contains("variables"), "{diagnostics}");
        }
        other => panic!("expected out-of-HBM, got {other}"),
    }
}

#[test]
fn residual_encoded_modulo_segment_size() {
    let kernel = "13, add, o (1), x (0), y (2), 70\n";
    let mem_info = "\
dload, input, 0, x
dload, input, 1, y
store, o, 2
dload, ones, 3
dload, ones, 4
dload, twiddle, 5
dload, twiddle, 6
dload, twiddle, 7
dload, twiddle, 8
dload, twiddle, 9
dload, twiddle, 10
dload, twiddle, 11
dload, twiddle, 12
dload, twiddle, 13
dload, twiddle, 14
dload, twiddle, 15
dload, twiddle, 16
dload, twiddle, 17
dload, twiddle, 18
dload, twiddle, 19
dload, twiddle, 20
";
    let (_, streams) = assemble(kernel, mem_info);
    let add_line = streams
        .xinst
        .lines()
        .find(|l| xline_op(l) == "add")
        .unwrap();
    // Residual 70 sits in segment 1 and is emitted modulo 64.
    assert_eq!(fields(add_line).last().unwrap(), "6");
    // Segment 1 metadata is loaded for the bundle: the second ones word and
    // the second twiddle segment.
    let cops: Vec<&str> = streams.cinst.lines().map(line_op).collect();
    assert!(cops.contains(&"bones"));
    assert!(cops.contains(&"bload"));
}
