//! Opcode enumerations for the three accelerator queues.

use strum::{Display, EnumIter, IntoStaticStr};

/// Routing-table kind used by the data-movement shuffles.
///
/// The compute engine holds exactly one routing table at a time; `rshuffle`
/// requires the NTT table and `irshuffle` the iNTT table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ShuffleKind {
    /// Forward NTT routing.
    Ntt,
    /// Inverse NTT routing.
    Intt,
}

/// Compute-engine (XInstQ) operations.
///
/// Arithmetic operations carry a residual; `rshuffle`/`irshuffle` are the
/// long-latency data movement operations subject to slotting; `move` and
/// `xstore` are the register-file plumbing inserted by the scheduler; `nop`
/// and `bexit` are bundle filler and terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum XOp {
    /// Element-wise polynomial addition.
    Add,
    /// Element-wise polynomial subtraction.
    Sub,
    /// Element-wise polynomial multiplication.
    Mul,
    /// Element-wise multiplication by an immediate.
    Muli,
    /// Element-wise multiply-accumulate.
    Mac,
    /// Multiply-accumulate with an immediate.
    Maci,
    /// One NTT butterfly stage over a register pair.
    Ntt,
    /// One inverse-NTT butterfly stage over a register pair.
    Intt,
    /// Twiddle-factor generation for the next NTT stage.
    TwNtt,
    /// Twiddle-factor generation for the next iNTT stage.
    TwIntt,
    /// NTT-routing data movement across register banks.
    RShuffle,
    /// iNTT-routing data movement across register banks.
    IrShuffle,
    /// Register-to-register copy.
    Copy,
    /// Move a variable out of the staging bank into a compute bank.
    Move,
    /// Push a register onto the store buffer towards SPAD.
    XStore,
    /// Idle cycles.
    Nop,
    /// Terminate the current bundle.
    BExit,
}

impl XOp {
    /// Key naming this operation in the ISA-spec document.
    pub const fn spec_key(self) -> &'static str {
        match self {
            XOp::Add => "add",
            XOp::Sub => "sub",
            XOp::Mul => "mul",
            XOp::Muli => "muli",
            XOp::Mac => "mac",
            XOp::Maci => "maci",
            XOp::Ntt => "ntt",
            XOp::Intt => "intt",
            XOp::TwNtt => "twntt",
            XOp::TwIntt => "twintt",
            XOp::RShuffle => "rshuffle",
            XOp::IrShuffle => "irshuffle",
            XOp::Copy => "copy",
            XOp::Move => "move",
            XOp::XStore => "xstore",
            XOp::Nop => "nop",
            XOp::BExit => "exit",
        }
    }

    /// Whether this operation carries a residual operand.
    pub const fn has_residual(self) -> bool {
        matches!(
            self,
            XOp::Add
                | XOp::Sub
                | XOp::Mul
                | XOp::Muli
                | XOp::Mac
                | XOp::Maci
                | XOp::Ntt
                | XOp::Intt
                | XOp::TwNtt
                | XOp::TwIntt
        )
    }

    /// The routing table this operation monopolizes, if it is a shuffle.
    pub const fn shuffle_kind(self) -> Option<ShuffleKind> {
        match self {
            XOp::RShuffle => Some(ShuffleKind::Ntt),
            XOp::IrShuffle => Some(ShuffleKind::Intt),
            _ => None,
        }
    }
}

/// Control-queue (CInstQ) operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum COp {
    /// Load twiddle metadata from SPAD into a CE metadata register block.
    BLoad,
    /// Load identity ("ones") metadata from SPAD into the CE.
    BOnes,
    /// Load a word from SPAD into a staging-bank register.
    CLoad,
    /// Idle cycles on the control queue.
    CNop,
    /// Pop the store buffer into a SPAD address.
    CStore,
    /// Wait for an MInstQ instruction to complete.
    CSyncM,
    /// Fetch the next bundle into the compute engine.
    IFetch,
    /// Pull the next key word from the keygen engine into a register.
    #[strum(serialize = "kg_load")]
    KgLoad,
    /// Feed a seed word from SPAD to the keygen engine.
    #[strum(serialize = "kg_seed")]
    KgSeed,
    /// Start key material generation for the loaded seed.
    #[strum(serialize = "kg_start")]
    KgStart,
    /// Load a shuffle aux/routing table from SPAD into the CE.
    NLoad,
    /// Copy a word of encoded XInsts from HBM into the XInst queue.
    XInstFetch,
    /// Terminate the control queue.
    CExit,
}

impl COp {
    /// Key naming this operation in the ISA-spec document.
    pub const fn spec_key(self) -> &'static str {
        match self {
            COp::BLoad => "bload",
            COp::BOnes => "bones",
            COp::CLoad => "cload",
            COp::CNop => "nop",
            COp::CStore => "cstore",
            COp::CSyncM => "csyncm",
            COp::IFetch => "ifetch",
            COp::KgLoad => "kgload",
            COp::KgSeed => "kgseed",
            COp::KgStart => "kgstart",
            COp::NLoad => "nload",
            COp::XInstFetch => "xinstfetch",
            COp::CExit => "exit",
        }
    }
}

/// Memory-queue (MInstQ) operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum MOp {
    /// Copy a word from HBM into SPAD.
    MLoad,
    /// Copy a word from SPAD into HBM.
    MStore,
    /// Wait for a CInstQ instruction to complete.
    MSyncC,
}

impl MOp {
    /// Key naming this operation in the ISA-spec document.
    pub const fn spec_key(self) -> &'static str {
        match self {
            MOp::MLoad => "mload",
            MOp::MStore => "mstore",
            MOp::MSyncC => "msyncc",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn asm_names() {
        assert_eq!(XOp::RShuffle.to_string(), "rshuffle");
        assert_eq!(XOp::BExit.to_string(), "bexit");
        assert_eq!(XOp::TwIntt.to_string(), "twintt");
        assert_eq!(COp::KgLoad.to_string(), "kg_load");
        assert_eq!(COp::KgSeed.to_string(), "kg_seed");
        assert_eq!(COp::CSyncM.to_string(), "csyncm");
        assert_eq!(MOp::MSyncC.to_string(), "msyncc");
    }

    #[test]
    fn spec_keys_unique_per_queue() {
        let xkeys: Vec<_> = XOp::iter().map(XOp::spec_key).collect();
        let mut dedup = xkeys.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(xkeys.len(), dedup.len());
    }

    #[test]
    fn shuffle_kinds() {
        assert_eq!(XOp::RShuffle.shuffle_kind(), Some(ShuffleKind::Ntt));
        assert_eq!(XOp::IrShuffle.shuffle_kind(), Some(ShuffleKind::Intt));
        assert_eq!(XOp::Add.shuffle_kind(), None);
        assert_eq!(ShuffleKind::Intt.to_string(), "intt");
    }
}
