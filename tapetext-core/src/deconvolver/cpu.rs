//! Scalar per-line deconvolver backend.

use std::sync::Arc;

use crate::config::LineConfig;
use crate::signal_processing::{cri_template, locate_cri, normalize_line, recover_bytes};

use super::{Deconvolve, DeconvOutcome, RawLine, Rejection, SampleFrame};

/// One-line-at-a-time backend. The pipeline runs one of these per worker;
/// the struct itself holds only immutable state and is freely shared.
pub struct CpuDeconvolver {
    config: Arc<LineConfig>,
    template: Vec<f32>,
}

impl CpuDeconvolver {
    pub fn new(config: Arc<LineConfig>) -> Self {
        let template = cri_template(&config);
        Self { config, template }
    }

    pub fn config(&self) -> &LineConfig {
        &self.config
    }
}

impl Deconvolve for CpuDeconvolver {
    fn deconvolve(&self, frame: &SampleFrame) -> DeconvOutcome {
        debug_assert_eq!(frame.samples.len(), self.config.samples_per_line);

        let normalized = normalize_line(&frame.samples, &self.config);
        let found = match locate_cri(
            &normalized,
            &self.template,
            self.config.cri_window,
            self.config.samples_per_bit(),
        ) {
            Some(found) => found,
            None => {
                return DeconvOutcome::Reject {
                    frame_index: frame.index,
                    reason: Rejection::CriNotFound,
                }
            }
        };

        if found.peak_to_sidelobe < self.config.cri_rejection_ratio {
            return DeconvOutcome::Reject {
                frame_index: frame.index,
                reason: Rejection::BelowThreshold {
                    peak_to_sidelobe: found.peak_to_sidelobe,
                },
            };
        }

        let (bytes, confidence) = recover_bytes(&normalized, found.position, &self.config);
        DeconvOutcome::Line(RawLine {
            frame_index: frame.index,
            bytes,
            confidence,
        })
    }
}
