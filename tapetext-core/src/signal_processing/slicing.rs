//! Soft-bit integration, channel deconvolution and hard slicing.

use crate::config::{LineConfig, ThresholdMode, LINE_BITS, LINE_BYTES};

/// Integrate a soft value in [0, 1] for each of `count` bits.
///
/// Each bit center gets a Gaussian-weighted window of surrounding samples
/// with sigma of a quarter bit period, wide enough to average sampling
/// jitter but narrow enough not to bleed neighbours in.
pub fn integrate_bits(
    normalized: &[f32],
    first_bit_center: f64,
    samples_per_bit: f64,
    count: usize,
) -> Vec<f32> {
    let sigma = samples_per_bit / 4.0;
    let radius = (3.0 * sigma).ceil() as isize;

    (0..count)
        .map(|bit| {
            let center = first_bit_center + bit as f64 * samples_per_bit;
            let anchor = center.round() as isize;
            let mut weighted = 0.0f64;
            let mut weight_sum = 0.0f64;
            for k in (anchor - radius)..=(anchor + radius) {
                if k < 0 || k as usize >= normalized.len() {
                    continue;
                }
                let z = (k as f64 - center) / sigma;
                let w = (-0.5 * z * z).exp();
                weighted += w * normalized[k as usize] as f64;
                weight_sum += w;
            }
            if weight_sum > 0.0 {
                (weighted / weight_sum) as f32
            } else {
                0.0
            }
        })
        .collect()
}

/// Sharpen bit transitions with the profile's short symmetric inverse
/// kernel, undoing the channel's low-pass smear. Edges replicate the
/// boundary value; output is clamped to [0, 1].
pub fn deconvolve_soft(soft: &[f32], kernel: &[f32]) -> Vec<f32> {
    debug_assert!(kernel.len() % 2 == 1);
    let half = kernel.len() / 2;
    (0..soft.len())
        .map(|i| {
            let mut acc = 0.0f32;
            for (j, &k) in kernel.iter().enumerate() {
                let idx = (i + j).saturating_sub(half).min(soft.len() - 1);
                acc += k * soft[idx];
            }
            acc.clamp(0.0, 1.0)
        })
        .collect()
}

/// Pick the hard-slicing level for one line of soft bits.
pub fn threshold_level(soft: &[f32], mode: ThresholdMode) -> f32 {
    match mode {
        ThresholdMode::Fixed { level } => level,
        ThresholdMode::Adaptive => {
            let mut sorted = soft.to_vec();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let quarter = (sorted.len() / 4).max(1);
            let low: f32 = sorted[..quarter].iter().sum::<f32>() / quarter as f32;
            let high: f32 =
                sorted[sorted.len() - quarter..].iter().sum::<f32>() / quarter as f32;
            (low + high) / 2.0
        }
    }
}

/// Cut soft bits at the threshold and pack them LSB-first into the 42
/// output bytes. Bit confidence is the doubled distance from the
/// threshold; a byte is only as confident as its weakest bit.
pub fn slice_to_bytes(soft: &[f32], threshold: f32) -> ([u8; LINE_BYTES], [f32; LINE_BYTES]) {
    debug_assert_eq!(soft.len(), LINE_BITS);
    let mut bytes = [0u8; LINE_BYTES];
    let mut confidence = [0.0f32; LINE_BYTES];

    for (byte_idx, chunk) in soft.chunks_exact(8).enumerate() {
        let mut byte = 0u8;
        let mut min_conf = 1.0f32;
        for (bit_idx, &value) in chunk.iter().enumerate() {
            if value > threshold {
                byte |= 1 << bit_idx;
            }
            let bit_conf = ((value - threshold).abs() * 2.0).clamp(0.0, 1.0);
            min_conf = min_conf.min(bit_conf);
        }
        bytes[byte_idx] = byte;
        confidence[byte_idx] = min_conf;
    }
    (bytes, confidence)
}

/// Convenience for the backends: integrate, deconvolve and slice one
/// normalized line whose run-in starts at `cri_position`.
pub fn recover_bytes(
    normalized: &[f32],
    cri_position: usize,
    config: &LineConfig,
) -> ([u8; LINE_BYTES], [f32; LINE_BYTES]) {
    let spb = config.samples_per_bit();
    let first_center = cri_position as f64 + config.data_start_offset() + 0.5 * spb;
    let soft = integrate_bits(normalized, first_center, spb, LINE_BITS);
    let sharpened = deconvolve_soft(&soft, &config.deconv_kernel);
    let threshold = threshold_level(&sharpened, config.threshold);
    slice_to_bytes(&sharpened, threshold)
}
