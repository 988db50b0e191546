//! Error types for parsing, memory-model bookkeeping and scheduling.
//!
//! Recoverable scheduling conflicts (write-port collisions, a seed already
//! consumed this bundle, no free register or SPAD slot) never surface here:
//! the scheduling loop handles them by deferring work to a later cycle or
//! bundle. Everything below is fatal for the run.

use thiserror::Error;

use crate::cycle::Cycle;

/// Memory-model bookkeeping failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemError {
    /// A variable name is not a valid identifier.
    #[error("invalid variable name {0:?}")]
    InvalidVariableName(String),
    /// A suggested bank index is outside the register file.
    #[error("variable {name:?}: suggested bank {bank} out of range")]
    SuggestedBankOutOfRange {
        /// Variable name.
        name: String,
        /// Offending bank index.
        bank: usize,
    },
    /// A variable was re-declared with a different suggested bank.
    #[error("variable {name:?}: suggested bank {requested} conflicts with existing bank {existing}")]
    SuggestedBankMismatch {
        /// Variable name.
        name: String,
        /// Bank recorded on first mention.
        existing: usize,
        /// Conflicting bank.
        requested: usize,
    },
    /// A requested capacity exceeds the hardware maximum.
    #[error("{unit} capacity {requested} words exceeds maximum of {max}")]
    CapacityTooLarge {
        /// Memory unit name.
        unit: &'static str,
        /// Requested capacity in words.
        requested: usize,
        /// Maximum capacity in words.
        max: usize,
    },
    /// An address is outside the memory unit.
    #[error("{unit} address {addr} out of range (capacity {capacity})")]
    AddressOutOfRange {
        /// Memory unit name.
        unit: &'static str,
        /// Offending address.
        addr: usize,
        /// Unit capacity in words.
        capacity: usize,
    },
    /// An allocation targeted an occupied slot.
    #[error("{unit} address {addr} is already occupied")]
    SlotOccupied {
        /// Memory unit name.
        unit: &'static str,
        /// Offending address.
        addr: usize,
    },
    /// A deallocation targeted a free slot.
    #[error("{unit} address {addr} is already free")]
    SlotAlreadyFree {
        /// Memory unit name.
        unit: &'static str,
        /// Offending address.
        addr: usize,
    },
    /// A variable was allocated twice at different addresses.
    #[error("variable {name:?} already allocated in {unit} address {existing}, new allocation requested at {requested}")]
    DoubleAllocation {
        /// Memory unit name.
        unit: &'static str,
        /// Variable name.
        name: String,
        /// Existing address.
        existing: usize,
        /// Conflicting address.
        requested: usize,
    },
    /// A named variable does not exist in the model.
    #[error("variable {0:?} is not in the memory model")]
    VariableNotFound(String),
    /// A variable was marked as key material twice.
    #[error("variable {0:?} is already marked as key material")]
    AlreadyKeygen(String),
    /// An output variable cannot also be key material.
    #[error("variable {0:?} is marked as output and cannot be key material")]
    OutputAsKeygen(String),
    /// A keygen declaration referenced a seed that does not exist.
    #[error("keygen seed index {seed} out of range ({available} seeds declared)")]
    SeedOutOfRange {
        /// Offending seed index.
        seed: usize,
        /// Declared seed count.
        available: usize,
    },
}

/// Errors raised while parsing a P-ISA kernel listing.
#[derive(Debug, Error)]
#[error("kernel line {line}: {kind}")]
pub struct KernelError {
    /// 1-based source line.
    pub line: usize,
    /// What went wrong.
    pub kind: KernelErrorKind,
}

/// Kinds of kernel parse failures.
#[derive(Debug, Error)]
pub enum KernelErrorKind {
    /// The operation name is not a P-ISA operation.
    #[error("unknown operation {0:?}")]
    UnknownOp(String),
    /// The line has the wrong number of comma-separated tokens.
    #[error("`{op}` expects {expected} tokens, got {got}")]
    BadTokenCount {
        /// Operation name.
        op: &'static str,
        /// Token count required by the ISA spec.
        expected: usize,
        /// Tokens found.
        got: usize,
    },
    /// A numeric field did not parse.
    #[error("invalid integer {0:?}")]
    BadInt(String),
    /// A ring size is out of range.
    #[error("ring size {0} out of range")]
    RingSizeOutOfRange(u64),
    /// An operand is not `name` or `name (bank)`.
    #[error("malformed operand {0:?}")]
    BadOperand(String),
    /// A parenthesized bank annotation is outside the compute banks.
    #[error("operand bank {0} out of range")]
    BankOutOfRange(usize),
    /// Memory-model bookkeeping rejected the operand.
    #[error(transparent)]
    Mem(#[from] MemError),
}

/// Errors raised while parsing or ingesting a mem-info descriptor.
#[derive(Debug, Error)]
pub enum MemInfoError {
    /// A line does not start with a recognized directive.
    #[error("mem-info line {line}: unrecognized directive {text:?}")]
    UnknownDirective {
        /// 1-based source line.
        line: usize,
        /// The offending line.
        text: String,
    },
    /// A numeric field did not parse.
    #[error("mem-info line {line}: invalid integer {token:?}")]
    BadInt {
        /// 1-based source line.
        line: usize,
        /// The offending token.
        token: String,
    },
    /// The twiddle registry is not eight entries per ones entry.
    #[error("expected {expected} twiddle metadata entries for {ones} ones entries, got {got}")]
    TwiddleOnesMismatch {
        /// Required twiddle count.
        expected: usize,
        /// Ones entries.
        ones: usize,
        /// Twiddle entries found.
        got: usize,
    },
    /// One name maps to two different HBM addresses.
    #[error("variable {name:?} declared at HBM address {existing} and again at {requested}")]
    ConflictingHbmAddress {
        /// Variable name.
        name: String,
        /// First address.
        existing: usize,
        /// Conflicting address.
        requested: usize,
    },
    /// Inputs, outputs and keygen variables must be used by the kernel.
    #[error("variable {0:?} is not used by the associated kernel")]
    VariableNotInKernel(String),
    /// Key indices for a seed must be dense from zero.
    #[error("key material {key} for seed {seed} was skipped")]
    KeygenSkipped {
        /// Seed index.
        seed: usize,
        /// Missing key index.
        key: usize,
    },
    /// Memory-model bookkeeping rejected a declaration.
    #[error(transparent)]
    Mem(#[from] MemError),
}

/// Fatal scheduling failures.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The instruction listing does not form a DAG.
    #[error("instruction listing must form a directed acyclic dependency graph")]
    DependencyCycle,
    /// Key material was requested out of generation order.
    #[error("keygen variable {name:?} out of order: expected key index {expected}, got {got} for seed {seed}")]
    KeygenOutOfOrder {
        /// Variable name.
        name: String,
        /// Next index the engine will produce.
        expected: usize,
        /// Requested index.
        got: usize,
        /// Active seed.
        seed: usize,
    },
    /// Key material was generated twice.
    #[error("keygen variable {0:?} has already been generated")]
    KeygenAlreadyGenerated(String),
    /// Key indices for a seed are not dense from zero.
    #[error("key material {key} generation skipped for seed {seed}")]
    KeygenSkipped {
        /// Seed index.
        seed: usize,
        /// Missing key index.
        key: usize,
    },
    /// A keygen path was taken for a non-keygen variable.
    #[error("variable {0:?} is not key material")]
    NotKeygen(String),
    /// No HBM address is available for a live variable.
    #[error("out of HBM space")]
    OutOfHbm {
        /// Memory-model dump captured when allocation gave up.
        diagnostics: String,
    },
    /// SPAD is full of live variables.
    #[error("no SPAD address available in bundle {bundle}")]
    OutOfSpad {
        /// Bundle being scheduled when SPAD ran out.
        bundle: u64,
        /// Memory-model dump captured when allocation gave up.
        diagnostics: String,
    },
    /// A metadata segment index is out of range.
    #[error("{kind} metadata segment {segment} out of range ({available} segments)")]
    SegmentOutOfRange {
        /// Metadata kind.
        kind: &'static str,
        /// Requested segment.
        segment: u64,
        /// Segments available.
        available: usize,
    },
    /// A twiddle segment does not hold the required variable count.
    #[error("required {expected} twiddle metadata variables per segment, got {got}")]
    TwiddleSegmentSize {
        /// Required count.
        expected: usize,
        /// Count found.
        got: usize,
    },
    /// A keygen seed index is out of range.
    #[error("keygen seed {seed} out of range ({available} seed blocks)")]
    KeygenSeedOutOfRange {
        /// Requested seed.
        seed: usize,
        /// Seed blocks available.
        available: usize,
    },
    /// A shuffle needs a routing table missing from the metadata.
    #[error("required routing table for `{kind}` not present in metadata")]
    MissingRoutingTable {
        /// Table kind name.
        kind: &'static str,
    },
    /// An aux table was declared without its routing table, or vice versa.
    #[error("both the {kind} auxiliary table and routing table must exist in the memory model")]
    MetadataPairIncomplete {
        /// Table kind name.
        kind: &'static str,
    },
    /// A SPAD-side transfer named a variable that is not SPAD-resident.
    #[error("variable {0:?} not allocated in SPAD")]
    VariableNotInSpad(String),
    /// An HBM-side transfer named a variable that is not HBM-resident.
    #[error("variable {0:?} not allocated in HBM")]
    VariableNotInHbm(String),
    /// A load targeted a variable that is already register-resident.
    #[error("variable {0:?} is already allocated in a register")]
    VariableAlreadyInRegister(String),
    /// An instruction was scheduled with an operand outside the register file.
    #[error("instruction {instr}: variable {name:?} not in register file")]
    VariableNotInRegister {
        /// Instruction id display.
        instr: String,
        /// Variable name.
        name: String,
    },
    /// An instruction was scheduled twice.
    #[error("instruction {0} is already scheduled")]
    AlreadyScheduled(String),
    /// An instruction was scheduled before its ready cycle.
    #[error("instruction {instr} not ready to schedule: ready at {ready}, current cycle {current}")]
    NotReady {
        /// Instruction id display.
        instr: String,
        /// Ready cycle.
        ready: Cycle,
        /// Current cycle.
        current: Cycle,
    },
    /// A register expected to be free holds a variable.
    #[error("register {0} already contains a variable")]
    RegisterOccupied(String),
    /// A `cstore` landed on a SPAD slot held by a live variable.
    #[error("SPAD address {addr} for instruction {instr} is occupied")]
    SpadSlotOccupied {
        /// Offending SPAD address.
        addr: usize,
        /// Instruction id display.
        instr: String,
    },
    /// A `cstore` popped an empty store buffer.
    #[error("store buffer is empty")]
    StoreBufferEmpty,
    /// Two consecutive bundles came out empty.
    #[error("cannot flush an empty bundle")]
    EmptyBundle,
    /// A shuffle of the other kind was admitted into a bundle.
    #[error("attempted to schedule a {got} shuffle in bundle {bundle} that only allows {allowed}")]
    MixedShuffleBundle {
        /// Shuffle kind admitted first.
        allowed: &'static str,
        /// Conflicting kind.
        got: &'static str,
        /// Bundle index.
        bundle: u64,
    },
    /// An arithmetic XInst of another residual segment was admitted.
    #[error("attempted to schedule residual {res} in bundle {bundle} that only allows segment {segment}")]
    MixedResidualBundle {
        /// Offending residual.
        res: u64,
        /// Segment locked for the bundle.
        segment: u64,
        /// Bundle index.
        bundle: u64,
    },
    /// A prepared variable is not in its suggested bank.
    #[error("variable {name:?} is in register {register}, which is not in suggested bank {bank}")]
    BankMismatch {
        /// Variable name.
        name: String,
        /// Register holding the variable.
        register: String,
        /// Suggested bank.
        bank: usize,
    },
    /// The scheduling loop cannot make progress.
    #[error("scheduler stalled: no instruction available and none in flight")]
    Stalled,
    /// An instruction was emitted without being scheduled.
    #[error("instruction {0} was never scheduled")]
    NotScheduled(String),
    /// Memory-model bookkeeping failed.
    #[error(transparent)]
    Mem(#[from] MemError),
}
