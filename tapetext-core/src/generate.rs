//! Teletext line synthesis.
//!
//! Renders 42-byte packets into idealized VBI sample frames: run-in and
//! framing code, NRZ data at the configured bit rate, a mild low-pass
//! smear standing in for the broadcast/tape channel, and optional additive
//! Gaussian noise. This is the transmit-side twin of the deconvolver and
//! the fixture source for the end-to-end tests.

use std::sync::Arc;

use rand::Rng;
use rand_distr::StandardNormal;

use crate::config::{LineConfig, CRI_FC_BITS, LINE_BITS, LINE_BYTES};
use crate::signal_processing::correlation::cri_fc_bits;
use crate::utils::bytes_to_bits_lsb;

/// Renders sample frames for one line configuration.
#[derive(Debug, Clone)]
pub struct LineGenerator {
    config: Arc<LineConfig>,
    /// Sample index where the run-in starts
    cri_start: usize,
    /// Raw capture level for logic low
    black: f32,
    /// Raw capture level for logic high
    white: f32,
    /// Channel low-pass smear, in samples
    smear_sigma: f32,
}

impl LineGenerator {
    pub fn new(config: Arc<LineConfig>) -> Self {
        let cri_start = (config.cri_window.start + config.cri_window.end) / 2;
        Self {
            config,
            cri_start,
            black: 40.0,
            white: 200.0,
            smear_sigma: 1.2,
        }
    }

    /// Place the run-in at a specific sample offset (must stay inside the
    /// profile's search window for the deconvolver to find it).
    pub fn with_cri_start(mut self, cri_start: usize) -> Self {
        self.cri_start = cri_start;
        self
    }

    pub fn config(&self) -> &LineConfig {
        &self.config
    }

    /// Render one packet into a full scanline of raw samples.
    pub fn render_line(&self, payload: &[u8; LINE_BYTES]) -> Vec<u8> {
        let spb = self.config.samples_per_bit();
        let total_bits = CRI_FC_BITS + LINE_BITS;

        let mut bits = [0u8; CRI_FC_BITS + LINE_BITS];
        bits[..CRI_FC_BITS].copy_from_slice(&cri_fc_bits());
        bits[CRI_FC_BITS..].copy_from_slice(&bytes_to_bits_lsb(payload));

        // ideal NRZ trace
        let mut trace = vec![0.0f32; self.config.samples_per_line];
        for (i, value) in trace.iter_mut().enumerate() {
            if i < self.cri_start {
                continue;
            }
            let bit = ((i - self.cri_start) as f64 / spb) as usize;
            if bit < total_bits {
                *value = bits[bit] as f32;
            }
        }

        let smeared = gaussian_smear(&trace, self.smear_sigma);
        smeared
            .into_iter()
            .map(|v| {
                (self.black + v * (self.white - self.black))
                    .round()
                    .clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    /// A scanline carrying no teletext at all.
    pub fn blank_line(&self) -> Vec<u8> {
        vec![self.black.round() as u8; self.config.samples_per_line]
    }

    /// Concatenate rendered lines into a raw sample stream.
    pub fn render_stream(&self, payloads: &[[u8; LINE_BYTES]]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payloads.len() * self.config.samples_per_line);
        for payload in payloads {
            out.extend_from_slice(&self.render_line(payload));
        }
        out
    }

    /// Add white Gaussian noise. `sigma` is expressed as a fraction of the
    /// black-to-white span, so 0.1 matches a tape with ten-percent noise.
    pub fn add_noise<R: Rng>(&self, samples: &mut [u8], sigma: f32, rng: &mut R) {
        let raw_sigma = sigma * (self.white - self.black);
        for sample in samples.iter_mut() {
            let noise: f64 = rng.sample(StandardNormal);
            let value = *sample as f32 + noise as f32 * raw_sigma;
            *sample = value.round().clamp(0.0, 255.0) as u8;
        }
    }
}

fn gaussian_smear(trace: &[f32], sigma: f32) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil() as isize;
    let kernel: Vec<f32> = (-radius..=radius)
        .map(|k| (-0.5 * (k as f32 / sigma).powi(2)).exp())
        .collect();
    let norm: f32 = kernel.iter().sum();

    (0..trace.len())
        .map(|i| {
            let mut acc = 0.0f32;
            for (j, &w) in kernel.iter().enumerate() {
                let idx = i as isize + j as isize - radius;
                if idx >= 0 && (idx as usize) < trace.len() {
                    acc += w * trace[idx as usize];
                }
            }
            acc / norm
        })
        .collect()
}
