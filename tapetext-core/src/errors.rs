//! Error types for the tapetext pipeline, split by failure domain.
//!
//! Signal-quality problems (missing clock run-in, uncorrectable Hamming
//! codewords, parity failures) are *not* errors: they travel in-band as
//! rejection records and zeroed confidences. Only structural and resource
//! failures surface through these types.

use thiserror::Error;

/// Top-level error type for all tapetext operations
#[derive(Debug, Error)]
pub enum TapeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration and device-profile errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown device profile: {name}")]
    UnknownProfile { name: String },

    #[error("Invalid sample rate: {rate} Hz (must be > 0)")]
    InvalidSampleRate { rate: f64 },

    #[error("Invalid bit rate: {rate} Hz (must be > 0 and below the sample rate)")]
    InvalidBitRate { rate: f64 },

    #[error("Clock run-in window {start}..{end} does not fit in a {samples_per_line}-sample line")]
    WindowOutOfRange {
        start: usize,
        end: usize,
        samples_per_line: usize,
    },

    #[error("Line too short: {samples_per_line} samples cannot hold {required} data samples")]
    LineTooShort {
        samples_per_line: usize,
        required: usize,
    },

    #[error("Deconvolution kernel must have odd length, got {len}")]
    EvenKernel { len: usize },

    #[error("Gain curve LUT must have 256 entries, got {len}")]
    BadGainLut { len: usize },
}

/// Input-structure errors, fatal at stage entry
#[derive(Debug, Error)]
pub enum InputError {
    #[error("Packet stream length {len} is not a multiple of 42")]
    BadPacketStreamLength { len: usize },

    #[error("Invalid page spec {spec:?}: expected three hex digits with magazine 1-8")]
    BadPageSpec { spec: String },

    #[error("Frame range is empty: start {start} >= stop {stop}")]
    EmptyFrameRange { start: u64, stop: u64 },
}

/// Resource and scheduling errors inside the pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Requested backend {name:?} is not available")]
    BackendUnavailable { name: String },

    #[error("Queue capacity {capacity} is too small for batch size {batch_size} (needs >= 2x)")]
    QueueTooSmall { capacity: usize, batch_size: usize },

    #[error("Worker thread panicked while deconvolving frame {frame_index}")]
    WorkerPanicked { frame_index: u64 },

    #[error("Output sink failed: {reason}")]
    SinkFailed { reason: String },
}

/// Result type alias for tapetext operations
pub type Result<T> = std::result::Result<T, TapeError>;
