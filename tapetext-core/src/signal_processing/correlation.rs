//! Clock run-in and framing-code location by cross-correlation.

use crate::config::{LineConfig, SampleWindow, CRI_FC_BITS, FRAMING_CODE};
use crate::utils::byte_to_bits_lsb;

/// The 24-bit run-in plus framing-code sequence: 16 alternating clock bits
/// followed by the fixed framing byte.
pub fn cri_fc_bits() -> [u8; CRI_FC_BITS] {
    let mut bits = [0u8; CRI_FC_BITS];
    for (i, bit) in bits.iter_mut().take(16).enumerate() {
        *bit = (i % 2 == 0) as u8;
    }
    bits[16..].copy_from_slice(&byte_to_bits_lsb(FRAMING_CODE));
    bits
}

/// Render the idealized run-in template at the configured bit rate.
///
/// The template is zero-mean, which makes the sliding dot product
/// independent of the local DC offset of the samples.
pub fn cri_template(config: &LineConfig) -> Vec<f32> {
    let spb = config.samples_per_bit();
    let bits = cri_fc_bits();
    let len = (CRI_FC_BITS as f64 * spb).floor() as usize;

    let mut template: Vec<f32> = (0..len)
        .map(|i| {
            let bit = ((i as f64 / spb) as usize).min(CRI_FC_BITS - 1);
            bits[bit] as f32
        })
        .collect();

    // soften the square edges to roughly match the channel's low-pass
    let smoothed: Vec<f32> = (0..len)
        .map(|i| {
            let prev = template[i.saturating_sub(1)];
            let next = template[(i + 1).min(len - 1)];
            0.25 * prev + 0.5 * template[i] + 0.25 * next
        })
        .collect();
    template = smoothed;

    let mean = template.iter().sum::<f32>() / len as f32;
    for value in template.iter_mut() {
        *value -= mean;
    }
    template
}

/// Result of scanning the search window for the run-in.
#[derive(Debug, Clone, Copy)]
pub struct CriSearch {
    /// Sample index of the run-in's leading edge
    pub position: usize,
    /// Raw correlation score at the peak
    pub score: f32,
    /// Peak height over the window's sidelobe statistics; the rejection
    /// quantity compared against `cri_rejection_ratio`
    pub peak_to_sidelobe: f32,
}

/// Cross-correlate the normalized samples against the template across the
/// search window. Returns `None` when the window is degenerate or no
/// positive peak exists, which callers report as "no line present".
pub fn locate_cri(
    normalized: &[f32],
    template: &[f32],
    window: SampleWindow,
    samples_per_bit: f64,
) -> Option<CriSearch> {
    if window.is_empty() || window.end + template.len() > normalized.len() {
        return None;
    }

    let scores: Vec<f32> = (window.start..window.end)
        .map(|pos| {
            template
                .iter()
                .zip(&normalized[pos..pos + template.len()])
                .map(|(t, x)| t * x)
                .sum()
        })
        .collect();

    evaluate_scores(&scores, window.start, samples_per_bit.ceil() as usize)
}

/// Turn a correlation score track into a located peak.
///
/// Shared by the sliding-dot-product path and the FFT batch path so both
/// backends apply identical rejection statistics. The sidelobe mean and
/// spread exclude `exclusion` positions either side of the peak so the
/// peak does not mask itself.
pub fn evaluate_scores(
    scores: &[f32],
    window_start: usize,
    exclusion: usize,
) -> Option<CriSearch> {
    let (best_offset, &best_score) = scores
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?;
    if best_score <= 0.0 {
        return None;
    }

    let (mut count, mut sum, mut sum_sq) = (0usize, 0.0f64, 0.0f64);
    for (_, &s) in scores
        .iter()
        .enumerate()
        .filter(|(i, _)| i.abs_diff(best_offset) > exclusion)
    {
        count += 1;
        sum += s as f64;
        sum_sq += (s as f64) * (s as f64);
    }
    let peak_to_sidelobe = if count < 2 {
        f32::INFINITY
    } else {
        let mean = sum / count as f64;
        let variance = (sum_sq / count as f64 - mean * mean).max(0.0);
        let sigma = variance.sqrt().max(1e-9);
        ((best_score as f64 - mean) / sigma) as f32
    };

    Some(CriSearch {
        position: window_start + best_offset,
        score: best_score,
        peak_to_sidelobe,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfileRegistry;

    fn test_config() -> crate::config::LineConfig {
        ProfileRegistry::builtin().get("ideal").unwrap().as_ref().clone()
    }

    #[test]
    fn test_template_is_zero_mean() {
        let template = cri_template(&test_config());
        let mean: f32 = template.iter().sum::<f32>() / template.len() as f32;
        assert!(mean.abs() < 1e-5);
    }

    #[test]
    fn test_locates_planted_run_in() {
        let config = test_config();
        let template = cri_template(&config);
        let planted_at = 90usize;

        // plant an un-normalized copy of the run-in pattern in a flat line
        let mut line = vec![0.0f32; config.samples_per_line];
        let spb = config.samples_per_bit();
        let bits = cri_fc_bits();
        for i in 0..template.len() {
            let bit = ((i as f64 / spb) as usize).min(CRI_FC_BITS - 1);
            line[planted_at + i] = bits[bit] as f32;
        }

        let found = locate_cri(&line, &template, config.cri_window, spb)
            .expect("peak expected");
        assert!(
            found.position.abs_diff(planted_at) <= 1,
            "found at {}, planted at {}",
            found.position,
            planted_at
        );
        assert!(found.peak_to_sidelobe > config.cri_rejection_ratio);
    }

    #[test]
    fn test_flat_line_yields_no_peak() {
        let config = test_config();
        let template = cri_template(&config);
        let line = vec![0.0f32; config.samples_per_line];
        assert!(locate_cri(&line, &template, config.cri_window, config.samples_per_bit()).is_none());
    }

    #[test]
    fn test_noise_never_matches_like_a_real_run_in() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let config = test_config();
        let template = cri_template(&config);
        let spb = config.samples_per_bit();

        // reference: an exact run-in at a known offset
        let planted_at = 90usize;
        let mut reference = vec![0.0f32; config.samples_per_line];
        let bits = cri_fc_bits();
        for i in 0..template.len() {
            let bit = ((i as f64 / spb) as usize).min(CRI_FC_BITS - 1);
            reference[planted_at + i] = bits[bit] as f32;
        }
        let genuine = locate_cri(&reference, &template, config.cri_window, spb)
            .expect("planted run-in must peak")
            .peak_to_sidelobe;

        let mut rng = StdRng::seed_from_u64(7);
        let mut rejected = 0;
        for _ in 0..16 {
            let line: Vec<f32> =
                (0..config.samples_per_line).map(|_| rng.gen_range(-0.2..0.2)).collect();
            match locate_cri(&line, &template, config.cri_window, spb) {
                None => rejected += 1,
                Some(found) => {
                    // noise can score a spurious peak, but never one that
                    // stands out like the genuine alignment
                    assert!(
                        found.peak_to_sidelobe < genuine,
                        "noise peak {} rivals genuine {}",
                        found.peak_to_sidelobe,
                        genuine
                    );
                    if found.peak_to_sidelobe < config.cri_rejection_ratio {
                        rejected += 1;
                    }
                }
            }
        }
        assert!(rejected >= 8, "only {} of 16 noise lines rejected", rejected);
    }
}
