//! The mem-info descriptor: inputs, outputs, key material and metadata, with
//! their HBM addresses.
//!
//! One directive per line, keyed by the first token:
//!
//! ```text
//! dload, input, <hbm_addr>, <var_name>
//! store, <var_name>, <hbm_addr>
//! keygen, <seed_index>, <key_index>, <var_name>
//! dload, <meta_kind>, <hbm_addr>[, <var_name>]
//! ```
//!
//! with `meta_kind` one of `ones`, `ntt_aux_table`, `ntt_routing_table`,
//! `intt_aux_table`, `intt_routing_table`, `twiddle`, `keygen_seed`.

use crate::consts::TWIDDLE_META_VARS_PER_SEGMENT;
use crate::error::MemInfoError;
use crate::kernel::tokenize_line;
use crate::mem::MemoryModel;

/// One declared variable: name and HBM address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemInfoVariable {
    /// Variable name.
    pub var_name: String,
    /// HBM word address.
    pub hbm_address: usize,
}

/// One declared keygen variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemInfoKeygenVariable {
    /// Variable name.
    pub var_name: String,
    /// Index of the producing seed.
    pub seed_index: usize,
    /// Generation order under that seed.
    pub key_index: usize,
}

/// Metadata declarations.
#[derive(Debug, Clone, Default)]
pub struct MemInfoMetadata {
    /// Identity metadata words.
    pub ones: Vec<MemInfoVariable>,
    /// NTT auxiliary table.
    pub ntt_aux_table: Vec<MemInfoVariable>,
    /// NTT routing table.
    pub ntt_routing_table: Vec<MemInfoVariable>,
    /// iNTT auxiliary table.
    pub intt_aux_table: Vec<MemInfoVariable>,
    /// iNTT routing table.
    pub intt_routing_table: Vec<MemInfoVariable>,
    /// Twiddle metadata words.
    pub twiddle: Vec<MemInfoVariable>,
    /// Keygen seed words.
    pub keygen_seeds: Vec<MemInfoVariable>,
}

/// A parsed mem-info descriptor.
#[derive(Debug, Clone, Default)]
pub struct MemInfo {
    /// Kernel inputs.
    pub inputs: Vec<MemInfoVariable>,
    /// Kernel outputs.
    pub outputs: Vec<MemInfoVariable>,
    /// Key material.
    pub keygens: Vec<MemInfoKeygenVariable>,
    /// Metadata declarations.
    pub metadata: MemInfoMetadata,
}

const META_KINDS: &[&str] = &[
    "ones",
    "ntt_aux_table",
    "ntt_routing_table",
    "intt_aux_table",
    "intt_routing_table",
    "twiddle",
    "keygen_seed",
];

impl MemInfo {
    /// Parses a descriptor from line-oriented text.
    pub fn from_text(text: &str) -> Result<Self, MemInfoError> {
        let mut info = MemInfo::default();
        for (line_no, line) in text.lines().enumerate() {
            let line_no = line_no + 1;
            let (tokens, _) = tokenize_line(line);
            if tokens.is_empty() {
                continue;
            }
            info.parse_line(&tokens, line_no, line)?;
        }
        info.validate()?;
        Ok(info)
    }

    fn parse_line(
        &mut self,
        tokens: &[&str],
        line_no: usize,
        line: &str,
    ) -> Result<(), MemInfoError> {
        let unknown = || MemInfoError::UnknownDirective {
            line: line_no,
            text: line.trim().into(),
        };
        let int = |token: &str| {
            token.parse::<usize>().map_err(|_| MemInfoError::BadInt {
                line: line_no,
                token: token.into(),
            })
        };
        match tokens[0] {
            "dload" if tokens.len() >= 2 && tokens[1] == "input" => {
                if tokens.len() != 4 {
                    return Err(unknown());
                }
                self.inputs.push(MemInfoVariable {
                    var_name: tokens[3].into(),
                    hbm_address: int(tokens[2])?,
                });
            }
            "dload" if tokens.len() >= 3 && META_KINDS.contains(&tokens[1]) => {
                if tokens.len() > 4 {
                    return Err(unknown());
                }
                let hbm_address = int(tokens[2])?;
                let kind = tokens[1];
                let list = match kind {
                    "ones" => &mut self.metadata.ones,
                    "ntt_aux_table" => &mut self.metadata.ntt_aux_table,
                    "ntt_routing_table" => &mut self.metadata.ntt_routing_table,
                    "intt_aux_table" => &mut self.metadata.intt_aux_table,
                    "intt_routing_table" => &mut self.metadata.intt_routing_table,
                    "twiddle" => &mut self.metadata.twiddle,
                    "keygen_seed" => &mut self.metadata.keygen_seeds,
                    _ => unreachable!(),
                };
                let var_name = match tokens.get(3) {
                    Some(name) if !name.is_empty() => (*name).to_owned(),
                    _ => format!("{}_{}", kind, list.len()),
                };
                list.push(MemInfoVariable {
                    var_name,
                    hbm_address,
                });
            }
            "store" => {
                if tokens.len() != 3 {
                    return Err(unknown());
                }
                self.outputs.push(MemInfoVariable {
                    var_name: tokens[1].into(),
                    hbm_address: int(tokens[2])?,
                });
            }
            "keygen" => {
                if tokens.len() != 4 {
                    return Err(unknown());
                }
                self.keygens.push(MemInfoKeygenVariable {
                    var_name: tokens[3].into(),
                    seed_index: int(tokens[1])?,
                    key_index: int(tokens[2])?,
                });
            }
            _ => return Err(unknown()),
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), MemInfoError> {
        let expected = self.metadata.ones.len() * TWIDDLE_META_VARS_PER_SEGMENT;
        if expected != self.metadata.twiddle.len() {
            return Err(MemInfoError::TwiddleOnesMismatch {
                expected,
                ones: self.metadata.ones.len(),
                got: self.metadata.twiddle.len(),
            });
        }
        let mut seen: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
        let all = self
            .inputs
            .iter()
            .chain(self.outputs.iter())
            .chain(self.metadata.ones.iter())
            .chain(self.metadata.ntt_aux_table.iter())
            .chain(self.metadata.ntt_routing_table.iter())
            .chain(self.metadata.intt_aux_table.iter())
            .chain(self.metadata.intt_routing_table.iter())
            .chain(self.metadata.twiddle.iter());
        for v in all {
            match seen.insert(v.var_name.as_str(), v.hbm_address) {
                Some(existing) if existing != v.hbm_address => {
                    return Err(MemInfoError::ConflictingHbmAddress {
                        name: v.var_name.clone(),
                        existing,
                        requested: v.hbm_address,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Populates the memory model: pins inputs/outputs and metadata at their
    /// HBM addresses and fills the metadata registries.
    ///
    /// Inputs, outputs and keygen variables must already be known to the
    /// model from the kernel; metadata variables are created here.
    pub fn apply(&self, model: &mut MemoryModel) -> Result<(), MemInfoError> {
        let pin = |model: &mut MemoryModel, v: &MemInfoVariable| -> Result<(), MemInfoError> {
            let var = model
                .find_var(&v.var_name)
                .ok_or_else(|| MemInfoError::VariableNotInKernel(v.var_name.clone()))?;
            match model.var(var).hbm_address {
                None => model.hbm_allocate_force(v.hbm_address, var).map_err(MemInfoError::Mem),
                Some(existing) if existing == v.hbm_address => Ok(()),
                Some(existing) => Err(MemInfoError::ConflictingHbmAddress {
                    name: v.var_name.clone(),
                    existing,
                    requested: v.hbm_address,
                }),
            }
        };

        for v in &self.inputs {
            pin(model, v)?;
        }
        for v in &self.outputs {
            pin(model, v)?;
            let var = model.find_var(&v.var_name).expect("pinned above");
            model.output_variables.insert(var);
        }

        for v in &self.metadata.ones {
            model.retrieve_var_add(&v.var_name, None)?;
            pin(model, v)?;
            let var = model.find_var(&v.var_name).expect("pinned above");
            model.add_meta_ones_var(var);
        }
        if let Some(v) = self.metadata.ntt_aux_table.first() {
            model.retrieve_var_add(&v.var_name, None)?;
            pin(model, v)?;
            model.meta.ntt_aux_table = model.find_var(&v.var_name);
        }
        if let Some(v) = self.metadata.ntt_routing_table.first() {
            model.retrieve_var_add(&v.var_name, None)?;
            pin(model, v)?;
            model.meta.ntt_routing_table = model.find_var(&v.var_name);
        }
        if let Some(v) = self.metadata.intt_aux_table.first() {
            model.retrieve_var_add(&v.var_name, None)?;
            pin(model, v)?;
            model.meta.intt_aux_table = model.find_var(&v.var_name);
        }
        if let Some(v) = self.metadata.intt_routing_table.first() {
            model.retrieve_var_add(&v.var_name, None)?;
            pin(model, v)?;
            model.meta.intt_routing_table = model.find_var(&v.var_name);
        }
        for v in &self.metadata.twiddle {
            model.retrieve_var_add(&v.var_name, None)?;
            pin(model, v)?;
            let var = model.find_var(&v.var_name).expect("pinned above");
            model.add_meta_twiddle_var(var);
        }
        for v in &self.metadata.keygen_seeds {
            model.retrieve_var_add(&v.var_name, None)?;
            pin(model, v)?;
            let var = model.find_var(&v.var_name).expect("pinned above");
            model.add_meta_keygen_seed_var(var);
        }

        for kg in &self.keygens {
            let var = model
                .find_var(&kg.var_name)
                .ok_or_else(|| MemInfoError::VariableNotInKernel(kg.var_name.clone()))?;
            model.add_keygen_variable(var, kg.seed_index, kg.key_index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_directives() {
        let info = MemInfo::from_text(
            "dload, input, 0, a\ndload, input, 1, b\nstore, out, 2\nkeygen, 0, 1, k1\n",
        )
        .unwrap();
        assert_eq!(info.inputs.len(), 2);
        assert_eq!(info.outputs[0].var_name, "out");
        assert_eq!(info.outputs[0].hbm_address, 2);
        assert_eq!(info.keygens[0].seed_index, 0);
        assert_eq!(info.keygens[0].key_index, 1);
    }

    #[test]
    fn metadata_names_default_when_omitted() {
        let info = MemInfo::from_text(
            "dload, keygen_seed, 10\ndload, ntt_aux_table, 11, aux\ndload, ntt_routing_table, 12\n",
        )
        .unwrap();
        assert_eq!(info.metadata.keygen_seeds[0].var_name, "keygen_seed_0");
        assert_eq!(info.metadata.ntt_aux_table[0].var_name, "aux");
        assert_eq!(info.metadata.ntt_routing_table[0].var_name, "ntt_routing_table_0");
    }

    #[test]
    fn twiddle_count_must_match_ones() {
        let mut text = String::from("dload, ones, 0\n");
        for i in 0..7 {
            text.push_str(&format!("dload, twiddle, {}\n", i + 1));
        }
        let err = MemInfo::from_text(&text).unwrap_err();
        assert!(matches!(
            err,
            MemInfoError::TwiddleOnesMismatch {
                expected: 8,
                got: 7,
                ..
            }
        ));
    }

    #[test]
    fn conflicting_addresses_rejected() {
        let err =
            MemInfo::from_text("dload, input, 0, a\nstore, a, 5\n").unwrap_err();
        assert!(matches!(err, MemInfoError::ConflictingHbmAddress { .. }));
    }

    #[test]
    fn unknown_directive_reports_line() {
        let err = MemInfo::from_text("dload, input, 0, a\nfrob, 1\n").unwrap_err();
        assert!(matches!(err, MemInfoError::UnknownDirective { line: 2, .. }));
    }

    #[test]
    fn apply_populates_model() {
        let mut model = MemoryModel::new(64, 32).unwrap();
        model.retrieve_var_add("a", Some(1)).unwrap();
        model.retrieve_var_add("out", Some(2)).unwrap();
        model.retrieve_var_add("k0", Some(1)).unwrap();
        let info = MemInfo::from_text(
            "dload, input, 0, a\nstore, out, 2\ndload, keygen_seed, 9\nkeygen, 0, 0, k0\n",
        )
        .unwrap();
        info.apply(&mut model).unwrap();
        let a = model.find_var("a").unwrap();
        let out = model.find_var("out").unwrap();
        assert_eq!(model.var(a).hbm_address, Some(0));
        assert!(model.output_variables.contains(&out));
        let seed = model.find_var("keygen_seed_0").unwrap();
        assert_eq!(model.var(seed).hbm_address, Some(9));
        assert!(model.meta.keygen_seeds.contains(&seed));
        let k0 = model.find_var("k0").unwrap();
        assert_eq!(model.keygen_variables()[&k0], (0, 0));
        assert!(model.is_meta_var(seed));
        assert!(!model.is_meta_var(a));
    }

    #[test]
    fn keygen_var_cannot_be_output() {
        let mut model = MemoryModel::new(64, 32).unwrap();
        model.retrieve_var_add("o", Some(1)).unwrap();
        let info = MemInfo::from_text("store, o, 1\ndload, keygen_seed, 2\nkeygen, 0, 0, o\n")
            .unwrap();
        let err = info.apply(&mut model).unwrap_err();
        assert!(matches!(err, MemInfoError::Mem(crate::error::MemError::OutputAsKeygen(_))));
    }
}
