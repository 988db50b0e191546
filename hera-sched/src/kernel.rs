//! P-ISA kernel parsing.
//!
//! A kernel is a line-oriented listing; each line is
//! `N, op, dst0 (bank), …, src0 (bank), …, extras, res  # comment` where the
//! parenthesized bank is an optional compute-bank hint and the trailing
//! comment is optional. Bank hints name the compute banks: hint `b` maps to
//! register bank `b + 1`, since bank 0 is reserved for SPAD staging.

use hera_asm::{IsaSpec, ShuffleKind, XOp};

use crate::consts::{MAX_RING_SIZE_LOG2, NUM_REGISTER_BANKS};
use crate::error::{KernelError, KernelErrorKind};
use crate::inst::{InstrKind, InstrRef, Operand, Program, XKind};
use crate::mem::MemoryModel;

/// Splits a source line into comma-separated tokens and an optional comment.
pub fn tokenize_line(line: &str) -> (Vec<&str>, &str) {
    let (body, comment) = match line.split_once('#') {
        Some((body, comment)) => (body, comment.trim()),
        None => (line, ""),
    };
    let body = body.trim();
    if body.is_empty() {
        return (Vec::new(), comment);
    }
    (body.split(',').map(str::trim).collect(), comment)
}

/// Parses a whole kernel listing into XInst objects, returning them in
/// source order.
pub fn parse_kernel(
    text: &str,
    program: &mut Program,
    model: &mut MemoryModel,
    spec: &IsaSpec,
) -> Result<Vec<InstrRef>, KernelError> {
    let mut listing = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line_no = line_no + 1;
        if let Some(inst) = parse_kernel_line(line, line_no, program, model, spec)? {
            listing.push(inst);
        }
    }
    Ok(listing)
}

/// Parses one kernel line; `Ok(None)` for blank and comment-only lines.
pub fn parse_kernel_line(
    line: &str,
    line_no: usize,
    program: &mut Program,
    model: &mut MemoryModel,
    spec: &IsaSpec,
) -> Result<Option<InstrRef>, KernelError> {
    let err = |kind| KernelError { line: line_no, kind };
    let (tokens, comment) = tokenize_line(line);
    if tokens.is_empty() {
        return Ok(None);
    }
    if tokens.len() < 2 {
        return Err(err(KernelErrorKind::BadOperand(line.trim().into())));
    }

    let n = parse_int(tokens[0]).map_err(err)?;
    if n > MAX_RING_SIZE_LOG2 {
        return Err(err(KernelErrorKind::RingSizeOutOfRange(n)));
    }
    let op = match tokens[1] {
        "add" => XOp::Add,
        "sub" => XOp::Sub,
        "mul" => XOp::Mul,
        "muli" => XOp::Muli,
        "mac" => XOp::Mac,
        "maci" => XOp::Maci,
        "copy" => XOp::Copy,
        "ntt" => XOp::Ntt,
        "intt" => XOp::Intt,
        "twntt" => XOp::TwNtt,
        "twintt" => XOp::TwIntt,
        "rshuffle" => XOp::RShuffle,
        "irshuffle" => XOp::IrShuffle,
        other => return Err(err(KernelErrorKind::UnknownOp(other.into()))),
    };
    let op_spec = spec.xinst(op);
    if tokens.len() != op_spec.num_tokens {
        return Err(err(KernelErrorKind::BadTokenCount {
            op: op.spec_key(),
            expected: op_spec.num_tokens,
            got: tokens.len(),
        }));
    }

    let mut cursor = 2;
    let mut dests = Vec::with_capacity(op_spec.num_dests);
    for _ in 0..op_spec.num_dests {
        dests.push(parse_operand(tokens[cursor], line_no, model)?);
        cursor += 1;
    }
    let mut sources = Vec::with_capacity(op_spec.num_sources);
    for _ in 0..op_spec.num_sources {
        sources.push(parse_operand(tokens[cursor], line_no, model)?);
        cursor += 1;
    }

    let mut res = None;
    let kind = match op {
        XOp::Add => XKind::Add,
        XOp::Sub => XKind::Sub,
        XOp::Mul => XKind::Mul,
        XOp::Mac => XKind::Mac,
        XOp::Copy => XKind::Copy,
        XOp::Muli => XKind::Muli {
            imm: take_token(&tokens, &mut cursor).into(),
        },
        XOp::Maci => XKind::Maci {
            imm: take_token(&tokens, &mut cursor).into(),
        },
        XOp::Ntt => XKind::Ntt {
            stage: parse_int(take_token(&tokens, &mut cursor)).map_err(err)?,
        },
        XOp::Intt => XKind::Intt {
            stage: parse_int(take_token(&tokens, &mut cursor)).map_err(err)?,
        },
        XOp::TwNtt => XKind::TwNtt {
            tw_meta: parse_int(take_token(&tokens, &mut cursor)).map_err(err)?,
            stage: parse_int(take_token(&tokens, &mut cursor)).map_err(err)?,
            block: parse_int(take_token(&tokens, &mut cursor)).map_err(err)?,
        },
        XOp::TwIntt => XKind::TwIntt {
            tw_meta: parse_int(take_token(&tokens, &mut cursor)).map_err(err)?,
            stage: parse_int(take_token(&tokens, &mut cursor)).map_err(err)?,
            block: parse_int(take_token(&tokens, &mut cursor)).map_err(err)?,
        },
        XOp::RShuffle => XKind::Shuffle {
            kind: ShuffleKind::Ntt,
            wait_cyc: parse_int(take_token(&tokens, &mut cursor)).map_err(err)?,
        },
        XOp::IrShuffle => XKind::Shuffle {
            kind: ShuffleKind::Intt,
            wait_cyc: parse_int(take_token(&tokens, &mut cursor)).map_err(err)?,
        },
        XOp::Move | XOp::XStore | XOp::Nop | XOp::BExit => unreachable!("not kernel ops"),
    };
    if op.has_residual() {
        res = Some(parse_int(take_token(&tokens, &mut cursor)).map_err(err)?);
    }
    debug_assert_eq!(cursor, tokens.len());

    let inst = program.push(
        line_no as u64,
        op_spec.default_throughput,
        op_spec.default_latency,
        sources,
        dests,
        comment,
        InstrKind::X { n, res, kind },
    );
    Ok(Some(inst))
}

fn take_token<'a>(tokens: &[&'a str], cursor: &mut usize) -> &'a str {
    let token = tokens[*cursor];
    *cursor += 1;
    token
}

fn parse_int(token: &str) -> Result<u64, KernelErrorKind> {
    token
        .trim()
        .parse()
        .map_err(|_| KernelErrorKind::BadInt(token.into()))
}

/// Parses `name` or `name (bank)` into a variable operand, registering the
/// variable with the memory model.
fn parse_operand(
    token: &str,
    line_no: usize,
    model: &mut MemoryModel,
) -> Result<Operand, KernelError> {
    let err = |kind| KernelError { line: line_no, kind };
    let mut parts = token.split_whitespace();
    let name = parts
        .next()
        .ok_or_else(|| err(KernelErrorKind::BadOperand(token.into())))?;
    let suggested = match parts.next() {
        None => None,
        Some(bank_token) => {
            let digits = bank_token.trim_start_matches('(').trim_end_matches(')');
            let bank: usize = digits
                .parse()
                .map_err(|_| err(KernelErrorKind::BadOperand(token.into())))?;
            // Hints address the compute banks; bank 0 stages SPAD traffic.
            if bank + 1 >= NUM_REGISTER_BANKS {
                return Err(err(KernelErrorKind::BankOutOfRange(bank)));
            }
            Some(bank + 1)
        }
    };
    if parts.next().is_some() {
        return Err(err(KernelErrorKind::BadOperand(token.into())));
    }
    let var = model
        .retrieve_var_add(name, suggested)
        .map_err(|e| err(KernelErrorKind::Mem(e)))?;
    Ok(Operand::Var(var))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::XKind;

    fn setup() -> (Program, MemoryModel, IsaSpec) {
        (
            Program::new(),
            MemoryModel::new(64, 32).unwrap(),
            IsaSpec::builtin(),
        )
    }

    #[test]
    fn parses_simple_add() {
        let (mut program, mut model, spec) = setup();
        let listing = parse_kernel(
            "13, add, out (2), a (0), b (1), 1 # sum\n",
            &mut program,
            &mut model,
            &spec,
        )
        .unwrap();
        assert_eq!(listing.len(), 1);
        let inst = &program[listing[0]];
        assert_eq!(inst.id.client, 1);
        assert_eq!(inst.comment, "sum");
        match &inst.kind {
            InstrKind::X { n, res, kind } => {
                assert_eq!(*n, 13);
                assert_eq!(*res, Some(1));
                assert_eq!(*kind, XKind::Add);
            }
            _ => panic!("expected xinst"),
        }
        // Bank hints name compute banks: hinted bank + 1.
        let out = model.find_var("out").unwrap();
        let a = model.find_var("a").unwrap();
        assert_eq!(model.var(out).suggested_bank(), Some(3));
        assert_eq!(model.var(a).suggested_bank(), Some(1));
        assert_eq!(inst.dests.len(), 1);
        assert_eq!(inst.sources.len(), 2);
    }

    #[test]
    fn parses_ntt_and_shuffle() {
        let (mut program, mut model, spec) = setup();
        let text = "\
14, ntt, t0 (0), t1 (1), s0 (0), s1 (1), tw (2), 3, 12
14, rshuffle, t0 (0), t1 (1), t0 (0), t1 (1), 0
";
        let listing = parse_kernel(text, &mut program, &mut model, &spec).unwrap();
        assert_eq!(listing.len(), 2);
        match &program[listing[0]].kind {
            InstrKind::X { res, kind: XKind::Ntt { stage }, .. } => {
                assert_eq!(*stage, 3);
                assert_eq!(*res, Some(12));
            }
            k => panic!("expected ntt, got {k:?}"),
        }
        match &program[listing[1]].kind {
            InstrKind::X { res: None, kind: XKind::Shuffle { kind, wait_cyc }, .. } => {
                assert_eq!(*kind, ShuffleKind::Ntt);
                assert_eq!(*wait_cyc, 0);
            }
            k => panic!("expected rshuffle, got {k:?}"),
        }
        assert_eq!(program[listing[0]].sources.len(), 3);
    }

    #[test]
    fn blank_lines_and_comments_skipped() {
        let (mut program, mut model, spec) = setup();
        let listing = parse_kernel(
            "\n# header only\n13, copy, b (1), a (0)\n",
            &mut program,
            &mut model,
            &spec,
        )
        .unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(program[listing[0]].id.client, 3);
    }

    #[test]
    fn rejects_unknown_op_and_bad_counts() {
        let (mut program, mut model, spec) = setup();
        let err = parse_kernel("13, frob, a (0)", &mut program, &mut model, &spec).unwrap_err();
        assert!(matches!(err.kind, KernelErrorKind::UnknownOp(_)));
        let err =
            parse_kernel("13, add, out (2), a (0), 1", &mut program, &mut model, &spec).unwrap_err();
        assert!(matches!(err.kind, KernelErrorKind::BadTokenCount { op: "add", .. }));
        let err = parse_kernel("99, add, out (2), a (0), b (1), 1", &mut program, &mut model, &spec)
            .unwrap_err();
        assert!(matches!(err.kind, KernelErrorKind::RingSizeOutOfRange(99)));
        let err = parse_kernel("13, add, out (7), a (0), b (1), 1", &mut program, &mut model, &spec)
            .unwrap_err();
        assert!(matches!(err.kind, KernelErrorKind::BankOutOfRange(7)));
    }

    #[test]
    fn conflicting_bank_hint_rejected() {
        let (mut program, mut model, spec) = setup();
        let text = "13, add, out (2), a (0), b (1), 1\n13, add, out (1), a (0), b (1), 2\n";
        let err = parse_kernel(text, &mut program, &mut model, &spec).unwrap_err();
        assert_eq!(err.line, 2);
        assert!(matches!(err.kind, KernelErrorKind::Mem(_)));
    }
}
