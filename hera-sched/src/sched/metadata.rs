//! Metadata reload machinery: ones, twiddles, routing tables and keygen
//! seeds.
//!
//! Metadata lives in HBM, stages through reserved low SPAD addresses
//! (`mload`), and lands in the CE's special registers (`bones`, `bload`,
//! `nload`) or the keygen engine (`kg_seed` + `kg_start`). Every SPAD read
//! is guarded by `csyncm` against its pending `mload`, and every SPAD
//! overwrite by `msyncc` against pending C-side reads. Reloads happen
//! between bundles, before the `ifetch` of the bundle that needs them.

use crate::consts::{
    MAX_RESIDUALS, NUM_BLOCKS_PER_KGSEED_META_WORD, NUM_BLOCKS_PER_TWID_META_WORD,
    NUM_ONES_META_REGISTERS, TWIDDLE_META_VARS_PER_SEGMENT,
};
use crate::error::ScheduleError;
use crate::inst::{CKind, MKind, Operand};
use crate::mem::VarId;

use hera_asm::ShuffleKind;

use super::Sim;

/// CE register target for the identity metadata.
const TARGET_ONES: usize = 0;
/// CE register target for the shuffle auxiliary table.
const TARGET_NTT_AUX_TABLE: usize = 0;
/// CE register target for the shuffle routing table.
const TARGET_NTT_ROUTING_TABLE: usize = 1;

impl Sim<'_> {
    /// Queues a `csyncm` when the SPAD address has a pending `mload` that a
    /// C-side read must wait for.
    pub(super) fn queue_csyncm_load(
        &mut self,
        client: u64,
        spad_addr: usize,
    ) -> Result<(), ScheduleError> {
        let last_mload = self.model.spad.tracker(spad_addr)?.last_mload.instr;
        if let Some(mload) = last_mload {
            let csyncm = self.new_cinst(
                client,
                CKind::CSyncM { target: mload },
                Vec::new(),
                Vec::new(),
                String::new(),
            );
            self.push_cinst(csyncm)?;
        }
        Ok(())
    }

    /// Queues an `msyncc` when the SPAD address has a more recent C-side
    /// access that an overwrite from HBM must wait for.
    pub(super) fn queue_msyncc_load(
        &mut self,
        client: u64,
        spad_addr: usize,
    ) -> Result<(), ScheduleError> {
        let tracker = *self.model.spad.tracker(spad_addr)?;
        let last_c_access = if tracker.last_cstore.instr.is_none()
            || (tracker.last_cload.instr.is_some()
                && tracker.last_cload.seq > tracker.last_cstore.seq)
        {
            tracker.last_cload
        } else {
            tracker.last_cstore
        };
        if let Some(cinstr) = last_c_access.instr {
            debug_assert!(self.program[cinstr].is_scheduled());
            let msyncc = self.new_minst(
                client,
                MKind::MSyncC { target: cinstr },
                Vec::new(),
                Vec::new(),
                String::new(),
            );
            self.push_minst(msyncc)?;
        }
        Ok(())
    }

    /// Copies a variable from HBM into the given SPAD address, allocating an
    /// HBM home for it first if needed.
    fn queue_mload(
        &mut self,
        client: u64,
        target_spad_addr: usize,
        var: VarId,
        comment: String,
    ) -> Result<(), ScheduleError> {
        self.queue_msyncc_load(client, target_spad_addr)?;
        if self.model.var(var).hbm_address.is_none() {
            let hbm_addr = self
                .model
                .hbm
                .find_available_address()
                .ok_or_else(|| self.out_of_hbm())?;
            self.model.hbm_allocate_force(hbm_addr, var)?;
        }
        let mload = self.new_minst(
            client,
            MKind::MLoad {
                spad_addr: target_spad_addr,
            },
            vec![Operand::Var(var)],
            vec![Operand::Var(var)],
            comment,
        );
        self.push_minst(mload)?;
        Ok(())
    }

    /// Reclaims a metadata staging address, evicting whatever sits there.
    fn clear_meta_slot(&mut self, addr: usize) -> Result<(), ScheduleError> {
        if self.model.spad.slot(addr)?.is_some() {
            self.model.spad_deallocate(addr)?;
        }
        Ok(())
    }

    /// Loads the aux and routing tables for one shuffle kind from SPAD into
    /// the CE.
    pub(super) fn load_shuffle_routing_table(
        &mut self,
        kind: ShuffleKind,
    ) -> Result<(), ScheduleError> {
        let (aux, routing) = match kind {
            ShuffleKind::Ntt => (self.model.meta.ntt_aux_table, self.model.meta.ntt_routing_table),
            ShuffleKind::Intt => (
                self.model.meta.intt_aux_table,
                self.model.meta.intt_routing_table,
            ),
        };
        let (Some(aux), Some(routing)) = (aux, routing) else {
            return Err(ScheduleError::MissingRoutingTable { kind: kind.into() });
        };
        // Only the NTT-side targets exist in hardware; both kinds load
        // through them.
        for (var, target) in [
            (aux, TARGET_NTT_AUX_TABLE),
            (routing, TARGET_NTT_ROUTING_TABLE),
        ] {
            let name = self.model.var(var).name().to_owned();
            let Some(spad_addr) = self.model.var(var).spad_address() else {
                return Err(ScheduleError::VariableNotInSpad(name));
            };
            self.queue_csyncm_load(0, spad_addr)?;
            let nload = self.new_cinst(
                0,
                CKind::NLoad { target },
                vec![Operand::Var(var)],
                Vec::new(),
                format!("loading routing table for `{kind}`"),
            );
            self.push_cinst(nload)?;
        }
        Ok(())
    }

    /// Loads one segment of identity metadata: HBM → SPAD → CE ones
    /// register. Returns the SPAD offset past the staged words.
    pub(super) fn load_ones_metadata(
        &mut self,
        spad_addr_offset: usize,
        segment: u64,
    ) -> Result<usize, ScheduleError> {
        if self.model.meta.ones_segments.is_empty() {
            return Ok(spad_addr_offset);
        }
        let available = self.model.meta.ones_segments.len();
        let Some(vars) = self.model.meta.ones_segments.get(segment as usize) else {
            return Err(ScheduleError::SegmentOutOfRange {
                kind: "ones",
                segment,
                available,
            });
        };
        let vars = vars.clone();
        debug_assert_eq!(vars.len(), NUM_ONES_META_REGISTERS);
        let residuals = segment * MAX_RESIDUALS..(segment + 1) * MAX_RESIDUALS;
        let comment = format!(
            "loading ones metadata for residuals [{}, {})",
            residuals.start, residuals.end
        );

        let mut addr = 0usize;
        for &var in &vars {
            let target = spad_addr_offset + addr;
            self.clear_meta_slot(target)?;
            self.queue_mload(0, target, var, comment.clone())?;
            addr += 1;
        }
        for &var in &vars {
            let spad_addr = self
                .model
                .var(var)
                .spad_address()
                .expect("ones metadata just staged");
            self.queue_csyncm_load(0, spad_addr)?;
            let bones = self.new_cinst(
                0,
                CKind::BOnes { target: TARGET_ONES },
                vec![Operand::Var(var)],
                Vec::new(),
                comment.clone(),
            );
            self.push_cinst(bones)?;
        }
        self.current_ones_segment = Some(segment);
        Ok(spad_addr_offset + addr)
    }

    /// Loads one segment of twiddle metadata: HBM → SPAD, then every block
    /// of every word into consecutive CE twiddle registers. Returns the
    /// SPAD offset past the staged words.
    pub(super) fn load_twiddle_metadata(
        &mut self,
        spad_addr_offset: usize,
        segment: u64,
    ) -> Result<usize, ScheduleError> {
        if self.model.meta.twiddle_segments.is_empty() {
            return Ok(spad_addr_offset);
        }
        let available = self.model.meta.twiddle_segments.len();
        let Some(vars) = self.model.meta.twiddle_segments.get(segment as usize) else {
            return Err(ScheduleError::SegmentOutOfRange {
                kind: "twiddle",
                segment,
                available,
            });
        };
        let vars = vars.clone();
        if vars.len() != TWIDDLE_META_VARS_PER_SEGMENT {
            return Err(ScheduleError::TwiddleSegmentSize {
                expected: TWIDDLE_META_VARS_PER_SEGMENT,
                got: vars.len(),
            });
        }
        let comment = format!(
            "loading twid metadata for residuals [{}, {})",
            segment * MAX_RESIDUALS,
            (segment + 1) * MAX_RESIDUALS
        );

        let mut addr = 0usize;
        for &var in &vars {
            let target = spad_addr_offset + addr;
            self.clear_meta_slot(target)?;
            self.queue_mload(0, target, var, comment.clone())?;
            addr += 1;
        }
        let mut target_register = 0usize;
        for &var in &vars {
            let spad_addr = self
                .model
                .var(var)
                .spad_address()
                .expect("twiddle metadata just staged");
            for block in 0..NUM_BLOCKS_PER_TWID_META_WORD {
                self.queue_csyncm_load(0, spad_addr)?;
                let bload = self.new_cinst(
                    0,
                    CKind::BLoad {
                        target: target_register,
                        block,
                    },
                    vec![Operand::Var(var)],
                    Vec::new(),
                    comment.clone(),
                );
                self.push_cinst(bload)?;
                target_register += 1;
            }
        }
        self.current_twid_segment = Some(segment);
        Ok(spad_addr_offset + addr)
    }

    /// Switches the keygen engine to another seed: stages the seed word in
    /// SPAD and feeds it with `kg_seed` + `kg_start`. Restarts the key
    /// index. Returns the SPAD offset past the staged word.
    pub(super) fn load_keygen_seed(
        &mut self,
        spad_addr_offset: usize,
        kgseed_idx: usize,
    ) -> Result<usize, ScheduleError> {
        let available = self.model.meta.keygen_seeds.len() * NUM_BLOCKS_PER_KGSEED_META_WORD;
        if kgseed_idx >= available {
            return Err(ScheduleError::KeygenSeedOutOfRange {
                seed: kgseed_idx,
                available,
            });
        }
        if self.current_kgseed == Some(kgseed_idx) {
            return Ok(spad_addr_offset);
        }

        let block = kgseed_idx % NUM_BLOCKS_PER_KGSEED_META_WORD;
        let word = kgseed_idx / NUM_BLOCKS_PER_KGSEED_META_WORD;
        let seed_var = *self
            .model
            .meta
            .keygen_seeds
            .get_index(word)
            .expect("seed word bounds checked");

        let target = spad_addr_offset;
        self.clear_meta_slot(target)?;
        self.queue_mload(
            0,
            target,
            seed_var,
            format!("loading keygen seed ({word}, block = {block})"),
        )?;

        let spad_addr = self
            .model
            .var(seed_var)
            .spad_address()
            .expect("seed word just staged");
        self.queue_csyncm_load(self.cinsts.len() as u64, spad_addr)?;
        let kg_seed = self.new_cinst(
            self.cinsts.len() as u64,
            CKind::KgSeed { block },
            vec![Operand::Var(seed_var)],
            Vec::new(),
            String::new(),
        );
        let kg_start = self.new_cinst(
            self.cinsts.len() as u64 + 1,
            CKind::KgStart,
            Vec::new(),
            Vec::new(),
            format!("seed {kgseed_idx}"),
        );
        self.push_cinst(kg_seed)?;
        self.push_cinst(kg_start)?;

        self.current_kgseed = Some(kgseed_idx);
        self.last_keygen_index = None;
        Ok(spad_addr_offset + 1)
    }

    /// Stages the shuffle tables declared in the metadata into SPAD.
    /// Returns the SPAD offset past the staged words.
    fn prepare_shuffle_metadata(
        &mut self,
        spad_addr_offset: usize,
    ) -> Result<usize, ScheduleError> {
        let mut addr = 0usize;
        for (kind, aux, routing) in [
            (
                ShuffleKind::Ntt,
                self.model.meta.ntt_aux_table,
                self.model.meta.ntt_routing_table,
            ),
            (
                ShuffleKind::Intt,
                self.model.meta.intt_aux_table,
                self.model.meta.intt_routing_table,
            ),
        ] {
            match (aux, routing) {
                (Some(aux), Some(routing)) => {
                    for var in [aux, routing] {
                        self.queue_mload(0, spad_addr_offset + addr, var, String::new())?;
                        addr += 1;
                    }
                }
                (None, None) => {}
                _ => {
                    return Err(ScheduleError::MetadataPairIncomplete { kind: kind.into() });
                }
            }
        }
        Ok(spad_addr_offset + addr)
    }

    /// Loads the initial metadata before the first bundle: shuffle tables,
    /// the first twiddle and ones segments, and the first keygen seed.
    pub(super) fn load_metadata(&mut self) -> Result<(), ScheduleError> {
        let mut offset = 0usize;
        offset = self.prepare_shuffle_metadata(offset)?;
        if !self.model.meta.twiddle_segments.is_empty() {
            self.meta_spad_twid = Some(offset);
            offset = self.load_twiddle_metadata(offset, 0)?;
        }
        if !self.model.meta.ones_segments.is_empty() {
            self.meta_spad_ones = Some(offset);
            offset = self.load_ones_metadata(offset, 0)?;
        }
        if !self.model.meta.keygen_seeds.is_empty() {
            self.meta_spad_kgseed = Some(offset);
            offset = self.load_keygen_seed(offset, 0)?;
        }
        tracing::debug!(spad_words = offset, "metadata staged");
        Ok(())
    }

    /// Metadata staging SPAD cursor for pre-existing state checks in tests.
    #[cfg(test)]
    pub(super) fn meta_spad_cursor(&self) -> (Option<usize>, Option<usize>, Option<usize>) {
        (self.meta_spad_twid, self.meta_spad_ones, self.meta_spad_kgseed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DepGraph;
    use crate::inst::Program;
    use crate::mem::MemoryModel;
    use crate::sched::{ScheduleOptions, Sim};
    use hera_asm::IsaSpec;

    fn sim_with_model(model: MemoryModel, spec: &IsaSpec) -> Sim<'_> {
        Sim::new(
            Program::new(),
            DepGraph::new(),
            model,
            spec,
            ScheduleOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn load_metadata_with_nothing_declared_is_empty() {
        let spec = IsaSpec::builtin();
        let model = MemoryModel::new(64, 32).unwrap();
        let mut sim = sim_with_model(model, &spec);
        sim.load_metadata().unwrap();
        assert!(sim.minsts.is_empty());
        assert!(sim.cinsts.is_empty());
        assert_eq!(sim.meta_spad_cursor(), (None, None, None));
    }

    #[test]
    fn seed_reload_resets_key_index() {
        let spec = IsaSpec::builtin();
        let mut model = MemoryModel::new(64, 32).unwrap();
        let s0 = model.retrieve_var_add("seed_w0", None).unwrap();
        model.hbm_allocate_force(0, s0).unwrap();
        model.add_meta_keygen_seed_var(s0);
        let mut sim = sim_with_model(model, &spec);
        sim.load_metadata().unwrap();
        assert_eq!(sim.current_kgseed, Some(0));
        sim.last_keygen_index = Some(2);
        // Reloading the same seed is a no-op.
        sim.load_keygen_seed(sim.meta_spad_kgseed.unwrap(), 0).unwrap();
        assert_eq!(sim.last_keygen_index, Some(2));
        // Switching seeds restarts the generation index.
        sim.load_keygen_seed(sim.meta_spad_kgseed.unwrap(), 1).unwrap();
        assert_eq!(sim.current_kgseed, Some(1));
        assert_eq!(sim.last_keygen_index, None);
        // kg_seed and kg_start appear in the CInstQ.
        let ops: Vec<String> = sim
            .cinsts
            .iter()
            .map(|&c| sim.program[c].kind.op_name())
            .collect();
        assert!(ops.contains(&"kg_seed".to_owned()));
        assert!(ops.contains(&"kg_start".to_owned()));
    }

    #[test]
    fn incomplete_table_pair_rejected() {
        let spec = IsaSpec::builtin();
        let mut model = MemoryModel::new(64, 32).unwrap();
        let aux = model.retrieve_var_add("ntt_aux", None).unwrap();
        model.hbm_allocate_force(0, aux).unwrap();
        model.meta.ntt_aux_table = Some(aux);
        let mut sim = sim_with_model(model, &spec);
        let err = sim.load_metadata().unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::MetadataPairIncomplete { kind: "ntt" }
        ));
    }
}
