//! Instruction objects for the three queues.
//!
//! Every instruction shares a common header (unique id, throughput, latency,
//! operand lists, schedule timing, frozen text) and carries a queue-specific
//! tagged kind. Instructions live in a [`Program`] arena and are referenced
//! by [`InstrRef`] everywhere: in the dependency graph, in the scheduler
//! queues and in the emitted streams.
//!
//! Once scheduled, an instruction is *frozen*: its final text form is
//! captured immediately, because registers and variables it references keep
//! changing as later instructions schedule. The only re-freeze happens in
//! the second scheduling pass, which patches sync instructions with the
//! final index of their referent in the opposite queue.

use std::fmt;

use hera_asm::{COp, MOp, ShuffleKind, XOp};

use crate::cycle::Cycle;
use crate::mem::{RegId, VarId};

/// Arena index of an instruction in a [`Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrRef(u32);

impl InstrRef {
    /// Creates a reference from a raw arena index.
    pub(crate) fn new(index: usize) -> Self {
        Self(index as u32)
    }

    /// The raw arena index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InstrRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

/// Unique instruction id: the client-assigned part plus a program-wide
/// monotonic nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrId {
    /// Client-assigned id (kernel line number, or the id of the instruction
    /// that caused this one to be created).
    pub client: u64,
    /// Program-wide monotonic nonce.
    pub nonce: u64,
}

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.client, self.nonce)
    }
}

/// Where and in which listing slot an instruction was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleTiming {
    /// Cycle at which the instruction was issued.
    pub cycle: Cycle,
    /// 1-based index in its queue listing. Provisional until the second
    /// scheduling pass.
    pub index: usize,
}

/// An instruction operand: a variable, or a register once plumbing
/// instructions pin one down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// A variable operand.
    Var(VarId),
    /// A register operand.
    Reg(RegId),
}

impl Operand {
    /// The operand's variable, if it is one.
    pub fn var(&self) -> Option<VarId> {
        match self {
            Operand::Var(v) => Some(*v),
            Operand::Reg(_) => None,
        }
    }

    /// The operand's register, if it is one.
    pub fn reg(&self) -> Option<RegId> {
        match self {
            Operand::Reg(r) => Some(*r),
            Operand::Var(_) => None,
        }
    }
}

/// XInstQ operation payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XKind {
    /// `add`
    Add,
    /// `sub`
    Sub,
    /// `mul`
    Mul,
    /// `muli` with its immediate token.
    Muli {
        /// Immediate operand, verbatim from the kernel.
        imm: String,
    },
    /// `mac`
    Mac,
    /// `maci` with its immediate token.
    Maci {
        /// Immediate operand, verbatim from the kernel.
        imm: String,
    },
    /// `ntt` butterfly stage.
    Ntt {
        /// Stage number.
        stage: u64,
    },
    /// `intt` butterfly stage.
    Intt {
        /// Stage number.
        stage: u64,
    },
    /// `twntt` twiddle generation.
    TwNtt {
        /// Twiddle metadata index.
        tw_meta: u64,
        /// Stage number.
        stage: u64,
        /// Block number.
        block: u64,
    },
    /// `twintt` twiddle generation.
    TwIntt {
        /// Twiddle metadata index.
        tw_meta: u64,
        /// Stage number.
        stage: u64,
        /// Block number.
        block: u64,
    },
    /// `rshuffle` / `irshuffle`.
    Shuffle {
        /// Routing-table kind.
        kind: ShuffleKind,
        /// Extra wait cycles folded into the throughput.
        wait_cyc: u64,
    },
    /// `copy`
    Copy,
    /// `move` out of the staging bank.
    Move,
    /// `xstore` onto the store buffer.
    XStore {
        /// Destination SPAD address of the matching `cstore`.
        spad_addr: usize,
        /// Variable to allocate into the freed register, for compound
        /// evict-and-assign stores.
        assign: Option<VarId>,
    },
    /// `nop`; idle cycles are the throughput.
    Nop,
    /// `bexit` bundle terminator.
    BExit,
}

impl XKind {
    /// The opcode of this payload.
    pub fn op(&self) -> XOp {
        match self {
            XKind::Add => XOp::Add,
            XKind::Sub => XOp::Sub,
            XKind::Mul => XOp::Mul,
            XKind::Muli { .. } => XOp::Muli,
            XKind::Mac => XOp::Mac,
            XKind::Maci { .. } => XOp::Maci,
            XKind::Ntt { .. } => XOp::Ntt,
            XKind::Intt { .. } => XOp::Intt,
            XKind::TwNtt { .. } => XOp::TwNtt,
            XKind::TwIntt { .. } => XOp::TwIntt,
            XKind::Shuffle {
                kind: ShuffleKind::Ntt,
                ..
            } => XOp::RShuffle,
            XKind::Shuffle {
                kind: ShuffleKind::Intt,
                ..
            } => XOp::IrShuffle,
            XKind::Copy => XOp::Copy,
            XKind::Move => XOp::Move,
            XKind::XStore { .. } => XOp::XStore,
            XKind::Nop => XOp::Nop,
            XKind::BExit => XOp::BExit,
        }
    }
}

/// CInstQ operation payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CKind {
    /// `cload` into a staging-bank register.
    CLoad,
    /// `cstore` popping the store buffer; the address resolves at schedule
    /// time.
    CStore {
        /// SPAD address written, once scheduled.
        spad_addr: Option<usize>,
    },
    /// `csyncm` waiting on an MInstQ instruction.
    CSyncM {
        /// The awaited instruction.
        target: InstrRef,
    },
    /// `cnop`; idle cycles are the throughput.
    CNop,
    /// `ifetch` of one bundle.
    IFetch {
        /// Bundle index fetched.
        bundle: u64,
    },
    /// `nload` of a shuffle table.
    NLoad {
        /// Target table register.
        target: usize,
    },
    /// `bload` of one twiddle metadata block.
    BLoad {
        /// Target metadata register.
        target: usize,
        /// Block within the metadata word.
        block: usize,
    },
    /// `bones` of identity metadata.
    BOnes {
        /// Target metadata register.
        target: usize,
    },
    /// `kg_load` of the next key word.
    KgLoad,
    /// `kg_seed` feeding a seed word.
    KgSeed {
        /// Seed block within the word.
        block: usize,
    },
    /// `kg_start`.
    KgStart,
    /// `xinstfetch` of one encoded XInst word.
    XInstFetch {
        /// Destination XInst-queue word.
        xq_dst: usize,
        /// Source HBM word in the XInst region.
        hbm_src: usize,
    },
    /// `cexit` queue terminator.
    CExit,
}

impl CKind {
    /// The opcode of this payload.
    pub fn op(&self) -> COp {
        match self {
            CKind::CLoad => COp::CLoad,
            CKind::CStore { .. } => COp::CStore,
            CKind::CSyncM { .. } => COp::CSyncM,
            CKind::CNop => COp::CNop,
            CKind::IFetch { .. } => COp::IFetch,
            CKind::NLoad { .. } => COp::NLoad,
            CKind::BLoad { .. } => COp::BLoad,
            CKind::BOnes { .. } => COp::BOnes,
            CKind::KgLoad => COp::KgLoad,
            CKind::KgSeed { .. } => COp::KgSeed,
            CKind::KgStart => COp::KgStart,
            CKind::XInstFetch { .. } => COp::XInstFetch,
            CKind::CExit => COp::CExit,
        }
    }
}

/// MInstQ operation payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MKind {
    /// `mload` HBM → SPAD.
    MLoad {
        /// Destination SPAD address.
        spad_addr: usize,
    },
    /// `mstore` SPAD → HBM; the source SPAD address resolves at schedule
    /// time.
    MStore {
        /// Destination HBM address.
        hbm_addr: usize,
        /// Source SPAD address, once scheduled.
        spad_addr: Option<usize>,
    },
    /// `msyncc` waiting on a CInstQ instruction.
    MSyncC {
        /// The awaited instruction.
        target: InstrRef,
    },
}

impl MKind {
    /// The opcode of this payload.
    pub fn op(&self) -> MOp {
        match self {
            MKind::MLoad { .. } => MOp::MLoad,
            MKind::MStore { .. } => MOp::MStore,
            MKind::MSyncC { .. } => MOp::MSyncC,
        }
    }
}

/// Queue-tagged payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrKind {
    /// Compute-engine instruction.
    X {
        /// Ring size, `log2(PMD)`; `0` when not known.
        n: u64,
        /// Residual for arithmetic operations.
        res: Option<u64>,
        /// Operation payload.
        kind: XKind,
    },
    /// Control-queue instruction.
    C(CKind),
    /// Memory-queue instruction.
    M(MKind),
}

impl InstrKind {
    /// Display name of the operation.
    pub fn op_name(&self) -> String {
        match self {
            InstrKind::X { kind, .. } => kind.op().to_string(),
            InstrKind::C(kind) => kind.op().to_string(),
            InstrKind::M(kind) => kind.op().to_string(),
        }
    }

    /// The shuffle routing kind, for shuffles.
    pub fn shuffle_kind(&self) -> Option<ShuffleKind> {
        match self {
            InstrKind::X {
                kind: XKind::Shuffle { kind, .. },
                ..
            } => Some(*kind),
            _ => None,
        }
    }

    /// The residual, for arithmetic XInsts.
    pub fn residual(&self) -> Option<u64> {
        match self {
            InstrKind::X { res, .. } => *res,
            _ => None,
        }
    }
}

/// An instruction: shared header plus queue-specific payload.
#[derive(Debug, Clone)]
pub struct Instr {
    /// Unique id.
    pub id: InstrId,
    /// Cycles before the next instruction can issue.
    pub throughput: u64,
    /// Cycles before the results are ready.
    pub latency: u64,
    /// The instruction's own readiness tracker; its effective readiness also
    /// folds in operand and engine readiness, computed by the scheduler.
    pub cycle_ready: Cycle,
    /// Source operands.
    pub sources: Vec<Operand>,
    /// Destination operands.
    pub dests: Vec<Operand>,
    /// Comment carried into the emitted line.
    pub comment: String,
    /// Assigned once scheduled.
    pub timing: Option<ScheduleTiming>,
    /// Final text form, captured at schedule time.
    pub frozen: Option<String>,
    /// Queue-specific payload.
    pub kind: InstrKind,
}

impl Instr {
    /// Whether the instruction has been scheduled.
    pub fn is_scheduled(&self) -> bool {
        self.timing.is_some()
    }

    /// `"name id"` display for diagnostics.
    pub fn describe(&self) -> String {
        format!("{} {}", self.kind.op_name(), self.id)
    }
}

/// The instruction arena.
///
/// Owns every instruction of a scheduling run, including the plumbing the
/// scheduler injects, and hands out the monotonic nonces that make ids
/// unique.
#[derive(Debug, Default)]
pub struct Program {
    instrs: Vec<Instr>,
    nonce: u64,
}

impl Program {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instructions in the arena.
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    /// Whether the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Adds an instruction, assigning the next nonce.
    ///
    /// `throughput` must be at least 1 and `latency` at least the
    /// throughput; both come from the ISA spec, which enforces the same
    /// bounds, so violations are programming errors.
    #[allow(clippy::too_many_arguments)]
    pub fn push(
        &mut self,
        client: u64,
        throughput: u64,
        latency: u64,
        sources: Vec<Operand>,
        dests: Vec<Operand>,
        comment: impl Into<String>,
        kind: InstrKind,
    ) -> InstrRef {
        debug_assert!(throughput >= 1);
        debug_assert!(latency >= throughput);
        let id = InstrId {
            client,
            nonce: self.nonce,
        };
        self.nonce += 1;
        let r = InstrRef::new(self.instrs.len());
        self.instrs.push(Instr {
            id,
            throughput,
            latency,
            cycle_ready: Cycle::ZERO,
            sources,
            dests,
            comment: comment.into(),
            timing: None,
            frozen: None,
            kind,
        });
        r
    }

    /// The instruction behind `r`.
    pub fn get(&self, r: InstrRef) -> &Instr {
        &self.instrs[r.index()]
    }

    /// Mutable access to the instruction behind `r`.
    pub fn get_mut(&mut self, r: InstrRef) -> &mut Instr {
        &mut self.instrs[r.index()]
    }
}

impl std::ops::Index<InstrRef> for Program {
    type Output = Instr;

    fn index(&self, r: InstrRef) -> &Instr {
        self.get(r)
    }
}

impl std::ops::IndexMut<InstrRef> for Program {
    fn index_mut(&mut self, r: InstrRef) -> &mut Instr {
        self.get_mut(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonces_are_monotonic() {
        let mut p = Program::new();
        let a = p.push(7, 1, 1, vec![], vec![], "", InstrKind::X { n: 0, res: None, kind: XKind::Nop });
        let b = p.push(7, 1, 1, vec![], vec![], "", InstrKind::X { n: 0, res: None, kind: XKind::Nop });
        assert_eq!(p[a].id.client, 7);
        assert_eq!(p[a].id.nonce, 0);
        assert_eq!(p[b].id.nonce, 1);
        assert_ne!(p[a].id, p[b].id);
    }

    #[test]
    fn kind_accessors() {
        let k = InstrKind::X {
            n: 13,
            res: Some(70),
            kind: XKind::Shuffle {
                kind: ShuffleKind::Intt,
                wait_cyc: 0,
            },
        };
        assert_eq!(k.op_name(), "irshuffle");
        assert_eq!(k.shuffle_kind(), Some(ShuffleKind::Intt));
        assert_eq!(k.residual(), Some(70));
        assert_eq!(InstrKind::C(CKind::KgStart).op_name(), "kg_start");
        assert_eq!(
            InstrKind::M(MKind::MLoad { spad_addr: 0 }).op_name(),
            "mload"
        );
    }
}
