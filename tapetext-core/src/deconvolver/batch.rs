//! Batched deconvolver backend.
//!
//! Collects lines into a tile and runs the run-in search as an FFT
//! multiply instead of a sliding dot product, with the tile fanned across
//! cores. This is the accelerator-shaped path: batch assembly is its only
//! suspension point, and its results match the scalar backend to within
//! floating-point noise.

use std::sync::Arc;

use ndarray::Array2;
use num_complex::Complex32;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};

use crate::config::LineConfig;
use crate::signal_processing::{cri_template, evaluate_scores, normalize_line, recover_bytes};

use super::{Deconvolve, DeconvOutcome, RawLine, Rejection, SampleFrame};

/// Largest batch the pipeline will assemble for this backend.
pub const MAX_BATCH: usize = 512;

pub struct BatchDeconvolver {
    config: Arc<LineConfig>,
    batch_size: usize,
    fft_len: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    /// Conjugated spectrum of the zero-padded run-in template
    template_spectrum: Vec<Complex32>,
    template_len: usize,
}

impl BatchDeconvolver {
    pub fn new(config: Arc<LineConfig>) -> Self {
        Self::with_batch_size(config, 256)
    }

    /// `batch_size` is clamped to a power of two no larger than
    /// [`MAX_BATCH`].
    pub fn with_batch_size(config: Arc<LineConfig>, batch_size: usize) -> Self {
        let batch_size = batch_size
            .next_power_of_two()
            .min(MAX_BATCH)
            .max(1);

        let template = cri_template(&config);
        let template_len = template.len();
        let segment_len = config.cri_window.len() + template_len;
        let fft_len = segment_len.next_power_of_two();

        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(fft_len);
        let inverse = planner.plan_fft_inverse(fft_len);

        let mut template_spectrum: Vec<Complex32> = template
            .iter()
            .map(|&t| Complex32::new(t, 0.0))
            .chain(std::iter::repeat(Complex32::new(0.0, 0.0)))
            .take(fft_len)
            .collect();
        forward.process(&mut template_spectrum);
        for bin in template_spectrum.iter_mut() {
            *bin = bin.conj();
        }

        Self {
            config,
            batch_size,
            fft_len,
            forward,
            inverse,
            template_spectrum,
            template_len,
        }
    }

    pub fn config(&self) -> &LineConfig {
        &self.config
    }

    /// Correlation scores for every candidate run-in position, computed as
    /// a circular correlation over the search segment. Lags past the
    /// window length wrap and are discarded, so the kept scores equal the
    /// direct dot products.
    fn correlation_scores(&self, normalized: &[f32]) -> Vec<f32> {
        let window = self.config.cri_window;
        let segment = &normalized[window.start..window.end + self.template_len];

        let mut buffer: Vec<Complex32> = segment
            .iter()
            .map(|&x| Complex32::new(x, 0.0))
            .chain(std::iter::repeat(Complex32::new(0.0, 0.0)))
            .take(self.fft_len)
            .collect();
        self.forward.process(&mut buffer);
        for (bin, t) in buffer.iter_mut().zip(&self.template_spectrum) {
            *bin *= t;
        }
        self.inverse.process(&mut buffer);

        let scale = 1.0 / self.fft_len as f32;
        buffer[..window.len()].iter().map(|c| c.re * scale).collect()
    }

    fn deconvolve_row(&self, frame_index: u64, samples: &[u8]) -> DeconvOutcome {
        debug_assert_eq!(samples.len(), self.config.samples_per_line);

        let normalized = normalize_line(samples, &self.config);
        let scores = self.correlation_scores(&normalized);
        let exclusion = self.config.samples_per_bit().ceil() as usize;

        let found = match evaluate_scores(&scores, self.config.cri_window.start, exclusion) {
            Some(found) => found,
            None => {
                return DeconvOutcome::Reject {
                    frame_index,
                    reason: Rejection::CriNotFound,
                }
            }
        };
        if found.peak_to_sidelobe < self.config.cri_rejection_ratio {
            return DeconvOutcome::Reject {
                frame_index,
                reason: Rejection::BelowThreshold {
                    peak_to_sidelobe: found.peak_to_sidelobe,
                },
            };
        }

        let (bytes, confidence) = recover_bytes(&normalized, found.position, &self.config);
        DeconvOutcome::Line(RawLine {
            frame_index,
            bytes,
            confidence,
        })
    }
}

impl Deconvolve for BatchDeconvolver {
    fn deconvolve(&self, frame: &SampleFrame) -> DeconvOutcome {
        self.deconvolve_row(frame.index, &frame.samples)
    }

    fn preferred_batch(&self) -> usize {
        self.batch_size
    }

    fn deconvolve_batch(&self, frames: &[SampleFrame]) -> Vec<DeconvOutcome> {
        if frames.is_empty() {
            return Vec::new();
        }
        // assemble the 2-D tile once, then fan its rows across cores
        let tile = Array2::from_shape_fn(
            (frames.len(), self.config.samples_per_line),
            |(row, col)| frames[row].samples[col],
        );
        frames
            .par_iter()
            .enumerate()
            .map(|(row, frame)| {
                let samples = tile.row(row);
                self.deconvolve_row(frame.index, samples.as_slice().expect("row-major tile"))
            })
            .collect()
    }
}
