//! Instruction scheduler and resource allocator for a HERACLES-class
//! homomorphic-encryption accelerator.
//!
//! The accelerator executes three instruction queues concurrently: the
//! compute engine consumes bundles of XInsts, the control queue moves data
//! between SPAD and the register file and synchronizes with the memory
//! queue, and the memory queue moves data between HBM and SPAD. Given a
//! pre-processed P-ISA kernel and a mem-info descriptor, this crate derives
//! a dependency DAG, co-schedules the three queues against an explicit
//! memory model, and emits the cycle-consistent ASM-ISA streams.
//!
//! The usual entry point is the [`assembler::Assembler`] facade:
//!
//! ```
//! use hera_asm::IsaSpec;
//! use hera_sched::assembler::Assembler;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let spec = IsaSpec::builtin();
//! let result = Assembler::new(&spec).assemble(
//!     "13, add, out (2), a (0), b (1), 1\n",
//!     "dload, input, 0, a\ndload, input, 1, b\nstore, out, 2\n",
//! )?;
//! assert_eq!(result.bundles.len(), 1);
//! # Ok(()) }
//! ```

#![warn(missing_docs)]

pub mod assembler;
pub mod consts;
pub mod cycle;
pub mod emit;
pub mod error;
pub mod graph;
pub mod inst;
pub mod kernel;
pub mod mem;
pub mod pisa;
pub mod sched;

pub use assembler::Assembler;
pub use cycle::Cycle;
pub use error::ScheduleError;
pub use mem::MemoryModel;
pub use sched::{ReplacementPolicy, ScheduleOptions, ScheduleResult};
