//! Top-level driver tying the pipeline together: parse the kernel and
//! mem-info, build and fix up the dependency graph, co-schedule the three
//! queues.

use hera_asm::IsaSpec;
use thiserror::Error;

use crate::consts::{HBM_DEFAULT_CAPACITY_WORDS, SPAD_DEFAULT_CAPACITY_WORDS};
use crate::error::{KernelError, MemError, MemInfoError, ScheduleError};
use crate::graph;
use crate::kernel;
use crate::mem::{MemInfo, MemoryModel};
use crate::sched::{self, ScheduleOptions, ScheduleResult};
use crate::inst::Program;

/// Any failure along the assembly pipeline.
#[derive(Debug, Error)]
pub enum AssembleError {
    /// The memory model could not be constructed.
    #[error(transparent)]
    Mem(#[from] MemError),
    /// The kernel listing did not parse.
    #[error(transparent)]
    Kernel(#[from] KernelError),
    /// The mem-info descriptor did not parse or apply.
    #[error(transparent)]
    MemInfo(#[from] MemInfoError),
    /// Scheduling failed.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// The assembly pipeline with its configuration.
///
/// The ISA spec must be loaded before any kernel is parsed; constructing an
/// `Assembler` from a loaded spec enforces that order.
#[derive(Debug, Clone)]
pub struct Assembler<'s> {
    spec: &'s IsaSpec,
    hbm_capacity_words: usize,
    spad_capacity_words: usize,
    options: ScheduleOptions,
}

impl<'s> Assembler<'s> {
    /// Creates an assembler over a loaded ISA spec with default capacities
    /// and options.
    pub fn new(spec: &'s IsaSpec) -> Self {
        Self {
            spec,
            hbm_capacity_words: HBM_DEFAULT_CAPACITY_WORDS,
            spad_capacity_words: SPAD_DEFAULT_CAPACITY_WORDS,
            options: ScheduleOptions::default(),
        }
    }

    /// Overrides the HBM capacity in words.
    pub fn with_hbm_capacity(mut self, words: usize) -> Self {
        self.hbm_capacity_words = words;
        self
    }

    /// Overrides the SPAD capacity in words.
    pub fn with_spad_capacity(mut self, words: usize) -> Self {
        self.spad_capacity_words = words;
        self
    }

    /// Overrides the scheduler options.
    pub fn with_options(mut self, options: ScheduleOptions) -> Self {
        self.options = options;
        self
    }

    /// Runs the full pipeline: kernel text and mem-info text in, three
    /// scheduled streams out.
    pub fn assemble(
        &self,
        kernel_text: &str,
        mem_info_text: &str,
    ) -> Result<ScheduleResult, AssembleError> {
        let mut model = MemoryModel::new(self.hbm_capacity_words, self.spad_capacity_words)?;
        let mut program = Program::new();

        let listing = kernel::parse_kernel(kernel_text, &mut program, &mut model, self.spec)?;
        tracing::debug!(instructions = listing.len(), "parsed kernel");

        let mem_info = MemInfo::from_text(mem_info_text)?;
        mem_info.apply(&mut model)?;

        let mut graph = graph::build_dependency_graph(&program, &listing)?;
        graph::enforce_keygen_ordering(&mut graph, &mut program, &mut model, self.spec)?;

        let result = sched::schedule_asm(program, graph, model, self.spec, self.options)?;
        Ok(result)
    }
}
