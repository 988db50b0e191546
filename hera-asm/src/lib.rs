//! Opcode and ISA-spec types for the HERACLES instruction scheduler.
//!
//! The accelerator executes three concurrent instruction queues: the compute
//! engine queue (XInstQ), the control queue (CInstQ) and the HBM transfer
//! queue (MInstQ). This crate defines the opcode enumerations for all three
//! queues and the per-opcode numeric parameters (operand counts, throughput,
//! latency, shuffle slotting latencies) that the scheduler consumes.
//!
//! The parameters are loaded once at startup, either from the built-in
//! defaults or from a JSON document, and passed around by reference as an
//! immutable [`IsaSpec`] table.

#![warn(missing_docs)]

mod op;
mod spec;

pub use op::{COp, MOp, ShuffleKind, XOp};
pub use spec::{IsaSpec, OpSpec, SpecError};
