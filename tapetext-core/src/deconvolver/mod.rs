//! Deconvolver backends: one captured scanline in, one framed 42-byte
//! teletext line (or a rejection) out.
//!
//! The two backends implement the same [`Deconvolve`] contract and must
//! agree to within floating-point noise; which one runs is a pipeline
//! construction choice, never visible downstream.

pub mod batch;
pub mod cpu;

use std::sync::Arc;

use crate::config::{LineConfig, LINE_BYTES};

pub use batch::BatchDeconvolver;
pub use cpu::CpuDeconvolver;

/// One scanline's worth of raw VBI samples.
#[derive(Debug, Clone)]
pub struct SampleFrame {
    /// Monotonically increasing capture index
    pub index: u64,
    /// Raw unsigned samples, `samples_per_line` long
    pub samples: Vec<u8>,
}

/// A framed teletext line with per-byte confidence in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct RawLine {
    pub frame_index: u64,
    pub bytes: [u8; LINE_BYTES],
    pub confidence: [f32; LINE_BYTES],
}

/// Why a frame produced no line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
    /// No positive correlation peak anywhere in the search window
    CriNotFound,
    /// A peak existed but did not clear the configured rejection ratio
    BelowThreshold { peak_to_sidelobe: f32 },
}

/// Outcome of deconvolving one frame. Rejections are routine signal
/// conditions, reported in-band; they are never zero-filled lines.
#[derive(Debug, Clone, PartialEq)]
pub enum DeconvOutcome {
    Line(RawLine),
    Reject {
        frame_index: u64,
        reason: Rejection,
    },
}

impl DeconvOutcome {
    pub fn frame_index(&self) -> u64 {
        match self {
            DeconvOutcome::Line(line) => line.frame_index,
            DeconvOutcome::Reject { frame_index, .. } => *frame_index,
        }
    }

    pub fn as_line(&self) -> Option<&RawLine> {
        match self {
            DeconvOutcome::Line(line) => Some(line),
            DeconvOutcome::Reject { .. } => None,
        }
    }
}

/// Capability interface over the interchangeable backends.
pub trait Deconvolve: Send + Sync {
    fn deconvolve(&self, frame: &SampleFrame) -> DeconvOutcome;

    /// Largest batch the backend wants to see at once; 1 for per-line
    /// backends.
    fn preferred_batch(&self) -> usize {
        1
    }

    /// Process a batch in input order. The default just loops; the batch
    /// backend overrides this with tiled processing.
    fn deconvolve_batch(&self, frames: &[SampleFrame]) -> Vec<DeconvOutcome> {
        frames.iter().map(|frame| self.deconvolve(frame)).collect()
    }
}

/// Backend selection at pipeline construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Cpu,
    Batch,
}

/// Build the selected backend for a line configuration.
pub fn make_backend(kind: BackendKind, config: Arc<LineConfig>) -> Arc<dyn Deconvolve> {
    match kind {
        BackendKind::Cpu => Arc::new(CpuDeconvolver::new(config)),
        BackendKind::Batch => Arc::new(BatchDeconvolver::new(config)),
    }
}
