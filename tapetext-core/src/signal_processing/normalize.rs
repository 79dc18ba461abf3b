//! Gain and offset normalization for one captured scanline.

use crate::config::LineConfig;
use crate::utils::percentile;

/// Map raw capture samples to normalized amplitude with logic-low near 0.0
/// and logic-high near 1.0.
///
/// The black level is a low-percentile statistic over the region before
/// the clock run-in search window, which keeps it robust to dropout spikes.
/// The white level is taken from a high percentile over the region that
/// holds the run-in and data, so a line that never leaves the noise floor
/// normalizes against `min_signal_span` instead of amplifying noise.
pub fn normalize_line(samples: &[u8], config: &LineConfig) -> Vec<f32> {
    let gain_mapped: Vec<f32> = samples
        .iter()
        .map(|&raw| config.gain_curve.apply(raw))
        .collect();

    let pre_cri_end = config.cri_window.start.min(gain_mapped.len()).max(1);
    let black = percentile(&gain_mapped[..pre_cri_end], config.black_percentile);

    let signal_start = config.cri_window.start.min(gain_mapped.len());
    let white = percentile(&gain_mapped[signal_start..], 0.95);

    let span = (white - black).max(config.min_signal_span);
    gain_mapped
        .into_iter()
        .map(|value| (value - black) / span)
        .collect()
}
