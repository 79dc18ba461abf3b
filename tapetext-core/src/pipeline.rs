//! Multi-threaded deconvolution pipeline.
//!
//! Stages are connected by bounded channels; enqueue and dequeue are the
//! only blocking points. The deconvolver fans frames across a worker pool
//! (or assembles tiles for the batch backend) and a reorder buffer
//! restores frame order before the single-threaded decode stage. A shared
//! cancel flag makes every stage drain and exit on its next queue
//! operation; output is always whole 42-byte records.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use atomic_float::AtomicF64;
use crossbeam::channel::{bounded, Receiver, Sender};

use crate::coding::odd_parity_ok;
use crate::config::LineConfig;
use crate::deconvolver::{
    BackendKind, BatchDeconvolver, CpuDeconvolver, Deconvolve, DeconvOutcome, Rejection,
    SampleFrame,
};
use crate::errors::{PipelineError, Result, TapeError};
use crate::io::FrameReader;
use crate::logging::{LogLevel, SignalLogger, Subsystem};
use crate::packet::{Packet, Payload};

/// Framed lines whose mean confidence falls below this are reported as
/// high-entropy output (emitted regardless, never suppressed)
const LOW_CONFIDENCE_WARN: f32 = 0.25;

/// Construction-time knobs for the deconvolution pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub backend: BackendKind,
    /// Deconvolver workers; 0 means one per available core
    pub workers: usize,
    /// Source-to-deconvolver queue, in frames
    pub frame_queue: usize,
    /// Deconvolver-to-decoder queue, in lines
    pub line_queue: usize,
    /// Tile size for the batch backend
    pub batch_size: usize,
    /// First frame to process
    pub start_frame: u64,
    /// Frame to stop before, if any
    pub stop_frame: Option<u64>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            backend: BackendKind::Cpu,
            workers: 0,
            frame_queue: 1024,
            line_queue: 4096,
            batch_size: 256,
            start_frame: 0,
            stop_frame: None,
        }
    }
}

impl PipelineOptions {
    fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// End-of-run statistics, aggregated across workers.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineStats {
    pub frames_in: u64,
    pub lines_out: u64,
    pub rejects: u64,
    pub hamming_errors: u64,
    pub parity_failures: u64,
    /// Mean per-byte confidence over all framed lines
    pub mean_confidence: f64,
}

#[derive(Default)]
struct SharedStats {
    frames_in: AtomicU64,
    lines_out: AtomicU64,
    rejects: AtomicU64,
    hamming_errors: AtomicU64,
    parity_failures: AtomicU64,
    confidence_sum: AtomicF64,
}

impl SharedStats {
    fn record_outcome(&self, outcome: &DeconvOutcome) {
        match outcome {
            DeconvOutcome::Line(line) => {
                self.lines_out.fetch_add(1, Ordering::Relaxed);
                let mean: f32 =
                    line.confidence.iter().sum::<f32>() / line.confidence.len() as f32;
                self.confidence_sum.fetch_add(mean as f64, Ordering::Relaxed);
            }
            DeconvOutcome::Reject { .. } => {
                self.rejects.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> PipelineStats {
        let lines_out = self.lines_out.load(Ordering::Relaxed);
        let confidence_sum = self.confidence_sum.load(Ordering::Relaxed);
        PipelineStats {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            lines_out,
            rejects: self.rejects.load(Ordering::Relaxed),
            hamming_errors: self.hamming_errors.load(Ordering::Relaxed),
            parity_failures: self.parity_failures.load(Ordering::Relaxed),
            mean_confidence: if lines_out > 0 {
                confidence_sum / lines_out as f64
            } else {
                0.0
            },
        }
    }
}

/// Heap entry keyed by frame index for the reorder buffer.
struct Pending(DeconvOutcome);

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.0.frame_index() == other.0.frame_index()
    }
}
impl Eq for Pending {}
impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Pending {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.frame_index().cmp(&other.0.frame_index())
    }
}

/// Run the deconvolution pipeline from a raw sample stream to a packet
/// sink. Every framed line is decoded and handed to `on_packet` (in frame
/// order) before its raw bytes are written. Signal events (rejections,
/// high-entropy lines, residual errors) go to `logger` in-band; they
/// never abort the run.
pub fn run_deconvolve<R, W, F>(
    input: R,
    output: &mut W,
    config: Arc<LineConfig>,
    options: &PipelineOptions,
    cancel: Arc<AtomicBool>,
    logger: &SignalLogger,
    mut on_packet: F,
) -> Result<PipelineStats>
where
    R: Read + Send,
    W: Write,
    F: FnMut(&Packet),
{
    config.validate().map_err(TapeError::from)?;
    let backend: Arc<dyn Deconvolve> = match options.backend {
        BackendKind::Cpu => Arc::new(CpuDeconvolver::new(config.clone())),
        BackendKind::Batch => Arc::new(BatchDeconvolver::with_batch_size(
            config.clone(),
            options.batch_size,
        )),
    };

    let batch_size = backend.preferred_batch();
    if batch_size > 1 && options.line_queue < 2 * batch_size {
        return Err(PipelineError::QueueTooSmall {
            capacity: options.line_queue,
            batch_size,
        }
        .into());
    }

    let stats = SharedStats::default();
    let workers = match options.backend {
        BackendKind::Cpu => options.effective_workers(),
        // the batch backend parallelizes internally across the tile
        BackendKind::Batch => 1,
    };

    logger.info(
        Subsystem::Pipeline,
        None,
        format!(
            "deconvolving with profile {} ({} workers, batch {})",
            config.name, workers, batch_size
        ),
    );

    let (frame_tx, frame_rx) = bounded::<SampleFrame>(options.frame_queue);
    let (line_tx, line_rx) = bounded::<DeconvOutcome>(options.line_queue);
    let (ordered_tx, ordered_rx) = bounded::<DeconvOutcome>(options.line_queue);

    let reader_result: std::io::Result<()> = std::thread::scope(|scope| {
        // source stage
        let reader_handle = scope.spawn({
            let stats = &stats;
            let cancel = cancel.clone();
            let config = config.clone();
            move || -> std::io::Result<()> {
                let mut frames = FrameReader::new(input, config.samples_per_line);
                while let Some(frame) = frames.next_frame()? {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    if frame.index < options.start_frame {
                        continue;
                    }
                    if let Some(stop) = options.stop_frame {
                        if frame.index >= stop {
                            break;
                        }
                    }
                    stats.frames_in.fetch_add(1, Ordering::Relaxed);
                    if frame_tx.send(frame).is_err() {
                        break;
                    }
                }
                drop(frame_tx);
                Ok(())
            }
        });

        // deconvolver stage: worker pool or batch assembler
        match options.backend {
            BackendKind::Cpu => {
                for _ in 0..workers {
                    let frame_rx = frame_rx.clone();
                    let line_tx = line_tx.clone();
                    let backend = backend.clone();
                    let stats = &stats;
                    scope.spawn(move || {
                        deconvolve_worker(frame_rx, line_tx, backend, stats, logger);
                    });
                }
            }
            BackendKind::Batch => {
                let frame_rx = frame_rx.clone();
                let line_tx = line_tx.clone();
                let backend = backend.clone();
                let stats = &stats;
                scope.spawn(move || {
                    batch_worker(frame_rx, line_tx, backend, batch_size, stats, logger);
                });
            }
        }
        drop(frame_rx);
        drop(line_tx);

        // reorder stage
        scope.spawn({
            let start_frame = options.start_frame;
            move || reorder_worker(line_rx, ordered_tx, start_frame)
        });

        // decode and sink stage, on this thread
        let mut io_error: Option<std::io::Error> = None;
        for outcome in ordered_rx.iter() {
            let line = match outcome {
                DeconvOutcome::Line(line) => line,
                DeconvOutcome::Reject { .. } => continue,
            };
            let packet = Packet::decode(&line);
            let parity_failures = count_parity_failures(&packet);
            stats
                .hamming_errors
                .fetch_add(packet.errors as u64, Ordering::Relaxed);
            stats
                .parity_failures
                .fetch_add(parity_failures, Ordering::Relaxed);
            if logger.is_enabled(LogLevel::Debug, Subsystem::Hamming) {
                if packet.errors > 0 {
                    logger.debug(
                        Subsystem::Hamming,
                        packet.frame_index,
                        format!(
                            "{} residual errors in {} packet",
                            packet.errors,
                            packet.payload.kind_name()
                        ),
                    );
                }
                if parity_failures > 0 {
                    logger.debug(
                        Subsystem::Hamming,
                        packet.frame_index,
                        format!("{} parity failures in display text", parity_failures),
                    );
                }
            }
            on_packet(&packet);
            if let Err(e) = output.write_all(&line.bytes) {
                io_error = Some(e);
                cancel.store(true, Ordering::Relaxed);
                break;
            }
        }
        // drain whatever the cancel left in flight
        for _ in ordered_rx.iter() {}

        let reader_result = reader_handle.join().expect("reader thread panicked");
        if let Some(e) = io_error {
            return Err(e);
        }
        reader_result
    });

    reader_result?;
    output.flush()?;
    let final_stats = stats.snapshot();
    logger.info(
        Subsystem::Pipeline,
        None,
        format!(
            "{} frames in, {} lines out, {} rejects, {} Hamming errors",
            final_stats.frames_in,
            final_stats.lines_out,
            final_stats.rejects,
            final_stats.hamming_errors
        ),
    );
    Ok(final_stats)
}

/// Report one deconvolver outcome in-band: rejections under `CRI`,
/// framed-but-garbled lines under `SLICE`.
fn log_outcome(logger: &SignalLogger, outcome: &DeconvOutcome) {
    match outcome {
        DeconvOutcome::Reject { frame_index, reason } => {
            if logger.is_enabled(LogLevel::Debug, Subsystem::Cri) {
                let message = match reason {
                    Rejection::CriNotFound => {
                        "no run-in peak in the search window".to_string()
                    }
                    Rejection::BelowThreshold { peak_to_sidelobe } => format!(
                        "run-in peak below rejection ratio ({:.2})",
                        peak_to_sidelobe
                    ),
                };
                logger.debug(Subsystem::Cri, *frame_index, message);
            }
        }
        DeconvOutcome::Line(line) => {
            let mean: f32 = line.confidence.iter().sum::<f32>() / line.confidence.len() as f32;
            if mean < LOW_CONFIDENCE_WARN {
                logger.warn(
                    Subsystem::Slice,
                    line.frame_index,
                    format!("high-entropy line, mean confidence {:.2}", mean),
                );
            }
        }
    }
}

fn deconvolve_worker(
    frame_rx: Receiver<SampleFrame>,
    line_tx: Sender<DeconvOutcome>,
    backend: Arc<dyn Deconvolve>,
    stats: &SharedStats,
    logger: &SignalLogger,
) {
    for frame in frame_rx.iter() {
        let outcome = backend.deconvolve(&frame);
        stats.record_outcome(&outcome);
        log_outcome(logger, &outcome);
        if line_tx.send(outcome).is_err() {
            break;
        }
    }
}

fn batch_worker(
    frame_rx: Receiver<SampleFrame>,
    line_tx: Sender<DeconvOutcome>,
    backend: Arc<dyn Deconvolve>,
    batch_size: usize,
    stats: &SharedStats,
    logger: &SignalLogger,
) {
    let mut tile: Vec<SampleFrame> = Vec::with_capacity(batch_size);
    loop {
        // batch assembly is this stage's only suspension point: block for
        // the first frame, then take whatever else is already queued
        match frame_rx.recv() {
            Ok(frame) => tile.push(frame),
            Err(_) => break,
        }
        while tile.len() < batch_size {
            match frame_rx.try_recv() {
                Ok(frame) => tile.push(frame),
                Err(_) => break,
            }
        }
        for outcome in backend.deconvolve_batch(&tile) {
            stats.record_outcome(&outcome);
            log_outcome(logger, &outcome);
            if line_tx.send(outcome).is_err() {
                return;
            }
        }
        tile.clear();
    }
    if !tile.is_empty() {
        for outcome in backend.deconvolve_batch(&tile) {
            stats.record_outcome(&outcome);
            log_outcome(logger, &outcome);
            if line_tx.send(outcome).is_err() {
                return;
            }
        }
    }
}

fn reorder_worker(
    line_rx: Receiver<DeconvOutcome>,
    ordered_tx: Sender<DeconvOutcome>,
    start_frame: u64,
) {
    let mut next_expected = start_frame;
    let mut heap: BinaryHeap<Reverse<Pending>> = BinaryHeap::new();

    for outcome in line_rx.iter() {
        heap.push(Reverse(Pending(outcome)));
        while let Some(Reverse(pending)) = heap.peek() {
            if pending.0.frame_index() != next_expected {
                break;
            }
            let Reverse(Pending(outcome)) = heap.pop().expect("peeked");
            next_expected += 1;
            if ordered_tx.send(outcome).is_err() {
                return;
            }
        }
    }
    // channel closed: flush the tail in index order
    while let Some(Reverse(Pending(outcome))) = heap.pop() {
        if ordered_tx.send(outcome).is_err() {
            return;
        }
    }
}

fn count_parity_failures(packet: &Packet) -> u64 {
    let text_range = match &packet.payload {
        Payload::Header(_) => 10..42,
        Payload::DisplayRow(_) => 2..42,
        _ => return 0,
    };
    packet.bytes[text_range]
        .iter()
        .filter(|&&byte| !odd_parity_ok(byte))
        .count() as u64
}
