//! Memory-model and bundle parameters.

/// Number of register banks in the register file.
pub const NUM_REGISTER_BANKS: usize = 4;

/// Number of registers per bank.
pub const NUM_REGISTERS_PER_BANK: usize = 72;

/// The staging bank: the only bank `cload` may target and the only bank
/// `xstore` drains through the store buffer.
pub const STAGING_BANK: usize = 0;

/// Maximum number of XInsts fetched atomically by `ifetch`.
pub const MAX_BUNDLE_SIZE: usize = 64;

/// Residual segment divisor: arithmetic XInsts with residual `res` belong to
/// segment `res / MAX_RESIDUALS`, and a bundle admits a single segment.
pub const MAX_RESIDUALS: u64 = 64;

/// Identity metadata registers filled per ones segment.
pub const NUM_ONES_META_REGISTERS: usize = 1;

/// Twiddle metadata variables per residual segment.
pub const TWIDDLE_META_VARS_PER_SEGMENT: usize = 8;

/// Blocks spanned by one twiddle metadata word when loaded via `bload`.
pub const NUM_BLOCKS_PER_TWID_META_WORD: usize = 4;

/// Keygen seeds packed in one seed metadata word.
pub const NUM_BLOCKS_PER_KGSEED_META_WORD: usize = 4;

/// Word size in bytes: one polynomial residue.
pub const WORD_SIZE_BYTES: usize = 32 * 1024;

/// Encoded size of one XInst in the HBM XInst region.
pub const XINSTRUCTION_SIZE_BYTES: usize = 8;

/// Bundles covered by a single `xinstfetch` word.
pub const MAX_BUNDLES_PER_XINSTFETCH: usize =
    WORD_SIZE_BYTES / (MAX_BUNDLE_SIZE * XINSTRUCTION_SIZE_BYTES);

/// Capacity of the on-engine XInst queue, in words.
pub const XINST_QUEUE_CAPACITY_WORDS: usize = 32;

/// Largest supported ring size exponent, `log2(PMD)`.
pub const MAX_RING_SIZE_LOG2: u64 = 17;

/// Largest supported HBM data region, in words.
pub const HBM_MAX_CAPACITY_WORDS: usize = 512 * 1024;

/// Largest supported SPAD, in words.
pub const SPAD_MAX_CAPACITY_WORDS: usize = 6144;

/// Default HBM capacity used by the assembler facade.
pub const HBM_DEFAULT_CAPACITY_WORDS: usize = 65536;

/// Default SPAD capacity used by the assembler facade.
pub const SPAD_DEFAULT_CAPACITY_WORDS: usize = 3072;

static_assertions::const_assert!(MAX_BUNDLES_PER_XINSTFETCH == 64);
static_assertions::const_assert!(NUM_REGISTER_BANKS > STAGING_BANK);
static_assertions::const_assert!(SPAD_DEFAULT_CAPACITY_WORDS <= SPAD_MAX_CAPACITY_WORDS);
static_assertions::const_assert!(HBM_DEFAULT_CAPACITY_WORDS <= HBM_MAX_CAPACITY_WORDS);
