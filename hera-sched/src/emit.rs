//! Emits the three scheduled instruction streams.
//!
//! Every line is the frozen text captured at schedule time (sync indices
//! patched by the second pass). The XInstQ stream comes out in whole
//! bundles of exactly [`MAX_BUNDLE_SIZE`](crate::consts::MAX_BUNDLE_SIZE)
//! lines each.

use std::io::{self, Write};

use crate::error::ScheduleError;
use crate::inst::{InstrRef, Program};
use crate::sched::ScheduleResult;

fn frozen_line<'p>(program: &'p Program, r: InstrRef) -> Result<&'p str, ScheduleError> {
    program[r]
        .frozen
        .as_deref()
        .ok_or_else(|| ScheduleError::NotScheduled(program[r].describe()))
}

/// Writes the MInstQ stream, one instruction per line.
pub fn write_minst_stream<W: Write>(
    out: &mut W,
    result: &ScheduleResult,
) -> Result<(), EmitError> {
    for &m in &result.minsts {
        writeln!(out, "{}", frozen_line(&result.program, m)?)?;
    }
    Ok(())
}

/// Writes the CInstQ stream, one instruction per line.
pub fn write_cinst_stream<W: Write>(
    out: &mut W,
    result: &ScheduleResult,
) -> Result<(), EmitError> {
    for &c in &result.cinsts {
        writeln!(out, "{}", frozen_line(&result.program, c)?)?;
    }
    Ok(())
}

/// Writes the XInstQ stream, bundle by bundle.
pub fn write_xinst_stream<W: Write>(
    out: &mut W,
    result: &ScheduleResult,
) -> Result<(), EmitError> {
    for bundle in &result.bundles {
        for &x in &bundle.xinsts {
            writeln!(out, "{}", frozen_line(&result.program, x)?)?;
        }
    }
    Ok(())
}

/// The three streams rendered to strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedStreams {
    /// MInstQ text.
    pub minst: String,
    /// CInstQ text.
    pub cinst: String,
    /// XInstQ text.
    pub xinst: String,
}

/// Renders all three streams to strings.
pub fn render_streams(result: &ScheduleResult) -> Result<RenderedStreams, EmitError> {
    let mut minst = Vec::new();
    let mut cinst = Vec::new();
    let mut xinst = Vec::new();
    write_minst_stream(&mut minst, result)?;
    write_cinst_stream(&mut cinst, result)?;
    write_xinst_stream(&mut xinst, result)?;
    Ok(RenderedStreams {
        minst: String::from_utf8(minst).expect("emitted text is UTF-8"),
        cinst: String::from_utf8(cinst).expect("emitted text is UTF-8"),
        xinst: String::from_utf8(xinst).expect("emitted text is UTF-8"),
    })
}

/// Emission failures.
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    /// The sink failed.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// An unscheduled instruction reached the emitter.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}
