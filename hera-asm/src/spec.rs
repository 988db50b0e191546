//! Per-opcode ISA parameters and the spec-document loader.
//!
//! The scheduler never hard-codes timing: every operation's throughput,
//! latency and operand counts come from an [`IsaSpec`] table. The table is
//! either the built-in default ([`IsaSpec::builtin`]) or a JSON document of
//! the shape:
//!
//! ```json
//! { "isa_spec": { "xinst": { "add": { "num_tokens": 6, "num_dests": 1,
//!   "num_sources": 2, "default_throughput": 1, "default_latency": 6 } },
//!   "cinst": { ... }, "minst": { ... } } }
//! ```

use std::collections::HashMap;
use std::io;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use thiserror::Error;

use crate::op::{COp, MOp, XOp};

/// Numeric parameters for a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpSpec {
    /// Number of comma-separated tokens in the operation's source line.
    pub num_tokens: usize,
    /// Number of destination operands.
    pub num_dests: usize,
    /// Number of source operands.
    pub num_sources: usize,
    /// Cycles before the next instruction can be issued.
    pub default_throughput: u64,
    /// Cycles before the results are ready. At least the throughput.
    pub default_latency: u64,
    /// Shuffles only: latency bound beyond which the full latency governs.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub special_latency_max: u64,
    /// Shuffles only: slotting increment within the special latency window.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub special_latency_increment: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Errors raised while loading or validating an ISA-spec document.
#[derive(Debug, Error)]
pub enum SpecError {
    /// The document is not valid JSON.
    #[error("malformed ISA spec document: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The document could not be read.
    #[error("failed to read ISA spec document: {0}")]
    Io(#[from] io::Error),
    /// The top-level `isa_spec` section is missing.
    #[error("ISA spec document does not contain an `isa_spec` section")]
    MissingRoot,
    /// A required operation entry is missing.
    #[error("ISA spec is missing entry `{queue}.{op}`")]
    MissingOp {
        /// Queue section (`xinst`, `cinst` or `minst`).
        queue: &'static str,
        /// Operation key.
        op: &'static str,
    },
    /// Throughput must be at least one cycle.
    #[error("`{queue}.{op}`: throughput must be at least 1, got {throughput}")]
    BadThroughput {
        /// Queue section.
        queue: &'static str,
        /// Operation key.
        op: &'static str,
        /// Offending value.
        throughput: u64,
    },
    /// Latency must be at least the throughput.
    #[error("`{queue}.{op}`: latency {latency} is less than throughput {throughput}")]
    BadLatency {
        /// Queue section.
        queue: &'static str,
        /// Operation key.
        op: &'static str,
        /// Offending latency.
        latency: u64,
        /// Operation throughput.
        throughput: u64,
    },
    /// Shuffle entries must carry both special-latency fields.
    #[error("`{queue}.{op}`: shuffle entry requires non-zero special latency fields")]
    MissingSpecialLatency {
        /// Queue section.
        queue: &'static str,
        /// Operation key.
        op: &'static str,
    },
}

#[derive(Debug, Deserialize, Serialize)]
struct SpecDocument {
    isa_spec: SpecSections,
}

#[derive(Debug, Deserialize, Serialize)]
struct SpecSections {
    xinst: HashMap<String, OpSpec>,
    cinst: HashMap<String, OpSpec>,
    minst: HashMap<String, OpSpec>,
}

/// Immutable per-operation parameter table for all three queues.
///
/// Constructed once at startup and passed by reference to the parser and the
/// schedulers.
#[derive(Debug, Clone)]
pub struct IsaSpec {
    xinst: HashMap<XOp, OpSpec>,
    cinst: HashMap<COp, OpSpec>,
    minst: HashMap<MOp, OpSpec>,
}

impl Default for IsaSpec {
    fn default() -> Self {
        Self::builtin()
    }
}

impl IsaSpec {
    /// The built-in default parameter table.
    pub fn builtin() -> Self {
        fn op(
            num_tokens: usize,
            num_dests: usize,
            num_sources: usize,
            default_throughput: u64,
            default_latency: u64,
        ) -> OpSpec {
            OpSpec {
                num_tokens,
                num_dests,
                num_sources,
                default_throughput,
                default_latency,
                special_latency_max: 0,
                special_latency_increment: 0,
            }
        }

        let mut xinst = HashMap::new();
        xinst.insert(XOp::Add, op(6, 1, 2, 1, 6));
        xinst.insert(XOp::Sub, op(6, 1, 2, 1, 6));
        xinst.insert(XOp::Mul, op(6, 1, 2, 1, 6));
        xinst.insert(XOp::Muli, op(6, 1, 1, 1, 6));
        xinst.insert(XOp::Mac, op(6, 1, 2, 1, 6));
        xinst.insert(XOp::Maci, op(6, 1, 1, 1, 6));
        xinst.insert(XOp::Copy, op(4, 1, 1, 1, 6));
        xinst.insert(XOp::Ntt, op(9, 2, 3, 1, 6));
        xinst.insert(XOp::Intt, op(9, 2, 3, 1, 6));
        xinst.insert(XOp::TwNtt, op(8, 1, 1, 1, 6));
        xinst.insert(XOp::TwIntt, op(8, 1, 1, 1, 6));
        xinst.insert(
            XOp::RShuffle,
            OpSpec {
                num_tokens: 7,
                num_dests: 2,
                num_sources: 2,
                default_throughput: 1,
                default_latency: 23,
                special_latency_max: 17,
                special_latency_increment: 5,
            },
        );
        xinst.insert(
            XOp::IrShuffle,
            OpSpec {
                num_tokens: 7,
                num_dests: 2,
                num_sources: 2,
                default_throughput: 1,
                default_latency: 23,
                special_latency_max: 17,
                special_latency_increment: 5,
            },
        );
        xinst.insert(XOp::Move, op(4, 1, 1, 1, 6));
        xinst.insert(XOp::XStore, op(4, 1, 1, 1, 6));
        xinst.insert(XOp::Nop, op(3, 0, 0, 1, 1));
        xinst.insert(XOp::BExit, op(2, 0, 0, 1, 1));

        let mut cinst = HashMap::new();
        cinst.insert(COp::BLoad, op(4, 0, 1, 1, 5));
        cinst.insert(COp::BOnes, op(3, 0, 1, 1, 5));
        cinst.insert(COp::CLoad, op(3, 1, 1, 4, 4));
        cinst.insert(COp::CNop, op(2, 0, 0, 1, 1));
        cinst.insert(COp::CStore, op(2, 0, 0, 1, 5));
        cinst.insert(COp::CSyncM, op(2, 0, 0, 1, 1));
        cinst.insert(COp::IFetch, op(2, 0, 0, 1, 5));
        cinst.insert(COp::KgLoad, op(2, 1, 0, 4, 40));
        cinst.insert(COp::KgSeed, op(3, 0, 1, 1, 1));
        cinst.insert(COp::KgStart, op(1, 0, 0, 1, 40));
        cinst.insert(COp::NLoad, op(3, 0, 1, 4, 4));
        cinst.insert(COp::XInstFetch, op(3, 0, 0, 1, 1));
        cinst.insert(COp::CExit, op(1, 0, 0, 1, 1));

        let mut minst = HashMap::new();
        minst.insert(MOp::MLoad, op(3, 1, 1, 1, 1));
        minst.insert(MOp::MStore, op(3, 1, 1, 1, 1));
        minst.insert(MOp::MSyncC, op(2, 0, 0, 1, 1));

        let spec = Self {
            xinst,
            cinst,
            minst,
        };
        // The built-in table must satisfy its own validation rules.
        spec.validate().unwrap_or_else(|e| panic!("builtin ISA spec invalid: {e}"));
        spec
    }

    /// Loads a spec table from a JSON document string.
    pub fn from_json_str(doc: &str) -> Result<Self, SpecError> {
        let raw: serde_json::Value = serde_json::from_str(doc)?;
        if raw.get("isa_spec").is_none() {
            return Err(SpecError::MissingRoot);
        }
        let doc: SpecDocument = serde_json::from_value(raw)?;
        Self::from_sections(doc.isa_spec)
    }

    /// Loads a spec table from a JSON document reader.
    pub fn from_reader<R: io::Read>(mut reader: R) -> Result<Self, SpecError> {
        let mut doc = String::new();
        reader.read_to_string(&mut doc)?;
        Self::from_json_str(&doc)
    }

    /// Serializes the table back into the JSON document shape.
    pub fn to_json_string(&self) -> String {
        let sections = SpecSections {
            xinst: self
                .xinst
                .iter()
                .map(|(op, spec)| (op.spec_key().to_owned(), *spec))
                .collect(),
            cinst: self
                .cinst
                .iter()
                .map(|(op, spec)| (op.spec_key().to_owned(), *spec))
                .collect(),
            minst: self
                .minst
                .iter()
                .map(|(op, spec)| (op.spec_key().to_owned(), *spec))
                .collect(),
        };
        let doc = SpecDocument { isa_spec: sections };
        serde_json::to_string_pretty(&doc).expect("spec table serializes")
    }

    fn from_sections(sections: SpecSections) -> Result<Self, SpecError> {
        let mut xinst = HashMap::new();
        for op in XOp::iter() {
            let spec = sections
                .xinst
                .get(op.spec_key())
                .copied()
                .ok_or(SpecError::MissingOp {
                    queue: "xinst",
                    op: op.spec_key(),
                })?;
            xinst.insert(op, spec);
        }
        let mut cinst = HashMap::new();
        for op in COp::iter() {
            let spec = sections
                .cinst
                .get(op.spec_key())
                .copied()
                .ok_or(SpecError::MissingOp {
                    queue: "cinst",
                    op: op.spec_key(),
                })?;
            cinst.insert(op, spec);
        }
        let mut minst = HashMap::new();
        for op in MOp::iter() {
            let spec = sections
                .minst
                .get(op.spec_key())
                .copied()
                .ok_or(SpecError::MissingOp {
                    queue: "minst",
                    op: op.spec_key(),
                })?;
            minst.insert(op, spec);
        }
        let spec = Self {
            xinst,
            cinst,
            minst,
        };
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), SpecError> {
        fn check(queue: &'static str, op: &'static str, spec: &OpSpec) -> Result<(), SpecError> {
            if spec.default_throughput < 1 {
                return Err(SpecError::BadThroughput {
                    queue,
                    op,
                    throughput: spec.default_throughput,
                });
            }
            if spec.default_latency < spec.default_throughput {
                return Err(SpecError::BadLatency {
                    queue,
                    op,
                    latency: spec.default_latency,
                    throughput: spec.default_throughput,
                });
            }
            Ok(())
        }
        for (op, spec) in &self.xinst {
            check("xinst", op.spec_key(), spec)?;
            if op.shuffle_kind().is_some()
                && (spec.special_latency_max == 0 || spec.special_latency_increment == 0)
            {
                return Err(SpecError::MissingSpecialLatency {
                    queue: "xinst",
                    op: op.spec_key(),
                });
            }
        }
        for (op, spec) in &self.cinst {
            check("cinst", op.spec_key(), spec)?;
        }
        for (op, spec) in &self.minst {
            check("minst", op.spec_key(), spec)?;
        }
        Ok(())
    }

    /// Parameters for an XInstQ operation.
    pub fn xinst(&self, op: XOp) -> &OpSpec {
        &self.xinst[&op]
    }

    /// Parameters for a CInstQ operation.
    pub fn cinst(&self, op: COp) -> &OpSpec {
        &self.cinst[&op]
    }

    /// Parameters for an MInstQ operation.
    pub fn minst(&self, op: MOp) -> &OpSpec {
        &self.minst[&op]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(XOp::RShuffle)]
    #[case(XOp::IrShuffle)]
    fn shuffles_carry_special_latencies(#[case] op: XOp) {
        let spec = IsaSpec::builtin();
        assert_eq!(spec.xinst(op).special_latency_max, 17);
        assert_eq!(spec.xinst(op).special_latency_increment, 5);
    }

    #[test]
    fn builtin_is_complete() {
        let spec = IsaSpec::builtin();
        assert_eq!(spec.xinst(XOp::Add).default_latency, 6);
        assert_eq!(spec.xinst(XOp::RShuffle).special_latency_increment, 5);
        assert_eq!(spec.cinst(COp::KgStart).default_latency, 40);
        assert_eq!(spec.minst(MOp::MLoad).num_sources, 1);
    }

    #[test]
    fn json_round_trip() {
        let spec = IsaSpec::builtin();
        let doc = spec.to_json_string();
        let reloaded = IsaSpec::from_json_str(&doc).expect("round trip");
        assert_eq!(spec.xinst(XOp::Ntt), reloaded.xinst(XOp::Ntt));
        assert_eq!(spec.cinst(COp::CLoad), reloaded.cinst(COp::CLoad));
        assert_eq!(spec.minst(MOp::MSyncC), reloaded.minst(MOp::MSyncC));
    }

    #[test]
    fn missing_root_rejected() {
        let err = IsaSpec::from_json_str(r#"{"specs": {}}"#).unwrap_err();
        assert!(matches!(err, SpecError::MissingRoot));
    }

    #[test]
    fn missing_op_rejected() {
        let spec = IsaSpec::builtin();
        let doc = spec.to_json_string().replace("\"mac\"", "\"mack\"");
        let err = IsaSpec::from_json_str(&doc).unwrap_err();
        assert!(matches!(
            err,
            SpecError::MissingOp {
                queue: "xinst",
                op: "mac"
            }
        ));
    }

    #[test]
    fn latency_below_throughput_rejected() {
        let spec = IsaSpec::builtin();
        let mut doc: serde_json::Value = serde_json::from_str(&spec.to_json_string()).unwrap();
        doc["isa_spec"]["xinst"]["add"]["default_latency"] = 0.into();
        let err = IsaSpec::from_json_str(&doc.to_string()).unwrap_err();
        assert!(matches!(err, SpecError::BadLatency { op: "add", .. }));
    }

    #[test]
    fn shuffle_without_special_latency_rejected() {
        let spec = IsaSpec::builtin();
        let mut doc: serde_json::Value = serde_json::from_str(&spec.to_json_string()).unwrap();
        doc["isa_spec"]["xinst"]["rshuffle"]["special_latency_max"] = 0.into();
        let err = IsaSpec::from_json_str(&doc.to_string()).unwrap_err();
        assert!(matches!(
            err,
            SpecError::MissingSpecialLatency { op: "rshuffle", .. }
        ));
    }
}
