//! Line configuration types and the device-profile registry.
//!
//! A [`LineConfig`] fully describes the sample geometry of one capture
//! device: how many samples make up a line, where the clock run-in may
//! start, how raw sample values map to signal amplitude, and which inverse
//! kernel undoes the channel's low-pass smear. Profiles are data, not code;
//! supporting a new capture card means registering a new named record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::errors::ConfigError;

/// Data bytes per teletext line
pub const LINE_BYTES: usize = 42;

/// Data bits per teletext line
pub const LINE_BITS: usize = LINE_BYTES * 8;

/// Clock run-in plus framing code, in bits, preceding the data
pub const CRI_FC_BITS: usize = 24;

/// Framing code byte, LSB transmitted first (0xE4 MSB-first)
pub const FRAMING_CODE: u8 = 0x27;

/// Half-open sample index range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleWindow {
    pub start: usize,
    pub end: usize,
}

impl SampleWindow {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Mapping from raw 8-bit capture values to linearized signal amplitude
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GainCurve {
    /// `amplitude = raw / 255 * gain + lift`
    Linear { gain: f32, lift: f32 },
    /// Per-value lookup table, 256 entries
    Lut { table: Vec<f32> },
}

impl GainCurve {
    pub fn apply(&self, raw: u8) -> f32 {
        match self {
            GainCurve::Linear { gain, lift } => raw as f32 / 255.0 * gain + lift,
            GainCurve::Lut { table } => table[raw as usize],
        }
    }
}

impl Default for GainCurve {
    fn default() -> Self {
        GainCurve::Linear {
            gain: 1.0,
            lift: 0.0,
        }
    }
}

/// How soft bits are cut into hard bits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThresholdMode {
    /// Fixed cut level, nominally 0.5
    Fixed { level: f32 },
    /// Midpoint between the upper- and lower-quartile means of the line's
    /// soft bits. Tracks low-contrast tapes where the eye never opens to
    /// full amplitude.
    Adaptive,
}

impl Default for ThresholdMode {
    fn default() -> Self {
        ThresholdMode::Fixed { level: 0.5 }
    }
}

/// Static per-capture-device description of sample geometry.
///
/// Shared read-only by every pipeline stage; build once via
/// [`ProfileRegistry::get`] and wrap in an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineConfig {
    pub name: String,

    /// Capture sample rate in Hz
    pub sample_rate: f64,

    /// Samples per VBI scanline; also the `.vbi` frame size
    pub samples_per_line: usize,

    /// Nominal teletext bit rate in Hz
    pub bit_rate: f64,

    /// Sample range searched for the start of the clock run-in
    pub cri_window: SampleWindow,

    #[serde(default)]
    pub gain_curve: GainCurve,

    /// Symmetric inverse kernel applied to the soft-bit sequence
    #[serde(default = "default_deconv_kernel")]
    pub deconv_kernel: Vec<f32>,

    #[serde(default)]
    pub threshold: ThresholdMode,

    /// Minimum correlation peak-to-sidelobe ratio before a line is
    /// declared present
    #[serde(default = "default_cri_rejection_ratio")]
    pub cri_rejection_ratio: f32,

    /// Percentile of the pre-CRI region used as the black level
    #[serde(default = "default_black_percentile")]
    pub black_percentile: f32,

    /// Smallest black-to-white span treated as real signal; below this the
    /// line is normalized against the floor instead of dividing by noise
    #[serde(default = "default_min_signal_span")]
    pub min_signal_span: f32,
}

fn default_deconv_kernel() -> Vec<f32> {
    vec![-0.12, -0.10, 1.44, -0.10, -0.12]
}

fn default_cri_rejection_ratio() -> f32 {
    3.0
}

fn default_black_percentile() -> f32 {
    0.15
}

fn default_min_signal_span() -> f32 {
    0.05
}

impl LineConfig {
    /// Samples spanned by one data bit
    pub fn samples_per_bit(&self) -> f64 {
        self.sample_rate / self.bit_rate
    }

    /// Samples from the clock run-in start to the first data bit
    pub fn data_start_offset(&self) -> f64 {
        CRI_FC_BITS as f64 * self.samples_per_bit()
    }

    /// Samples needed from the clock run-in start to the end of the line's
    /// data, with one trailing bit of margin for the integration window
    pub fn required_samples(&self) -> usize {
        ((CRI_FC_BITS + LINE_BITS + 1) as f64 * self.samples_per_bit()).ceil() as usize
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.sample_rate > 0.0) {
            return Err(ConfigError::InvalidSampleRate {
                rate: self.sample_rate,
            });
        }
        if !(self.bit_rate > 0.0) || self.bit_rate >= self.sample_rate {
            return Err(ConfigError::InvalidBitRate {
                rate: self.bit_rate,
            });
        }
        if self.cri_window.is_empty() || self.cri_window.end > self.samples_per_line {
            return Err(ConfigError::WindowOutOfRange {
                start: self.cri_window.start,
                end: self.cri_window.end,
                samples_per_line: self.samples_per_line,
            });
        }
        let required = self.cri_window.end + self.required_samples();
        if required > self.samples_per_line {
            return Err(ConfigError::LineTooShort {
                samples_per_line: self.samples_per_line,
                required,
            });
        }
        if self.deconv_kernel.len() % 2 == 0 {
            return Err(ConfigError::EvenKernel {
                len: self.deconv_kernel.len(),
            });
        }
        if let GainCurve::Lut { table } = &self.gain_curve {
            if table.len() != 256 {
                return Err(ConfigError::BadGainLut { len: table.len() });
            }
        }
        Ok(())
    }
}

/// Named, immutable device profiles built at process start.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, Arc<LineConfig>>,
}

impl ProfileRegistry {
    /// Registry with the built-in capture-device profiles.
    pub fn builtin() -> Self {
        let mut registry = Self {
            profiles: BTreeMap::new(),
        };
        for profile in [
            bt8x8_pal(),
            bt8x8_ntsc(),
            saa7134_pal(),
            ideal_profile(),
        ] {
            registry.register(profile);
        }
        registry
    }

    pub fn register(&mut self, config: LineConfig) {
        self.profiles
            .insert(config.name.clone(), Arc::new(config));
    }

    pub fn get(&self, name: &str) -> Result<Arc<LineConfig>, ConfigError> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownProfile {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(|s| s.as_str())
    }
}

/// bt848/bt878 PAL raw VBI capture: 2048 samples per line at 35.468950 MHz
fn bt8x8_pal() -> LineConfig {
    LineConfig {
        name: "bt8x8_pal".into(),
        sample_rate: 35_468_950.0,
        samples_per_line: 2048,
        bit_rate: 6_937_500.0,
        cri_window: SampleWindow {
            start: 30,
            end: 200,
        },
        gain_curve: GainCurve::default(),
        deconv_kernel: default_deconv_kernel(),
        threshold: ThresholdMode::default(),
        cri_rejection_ratio: default_cri_rejection_ratio(),
        black_percentile: default_black_percentile(),
        min_signal_span: default_min_signal_span(),
    }
}

/// bt848/bt878 NTSC raw VBI capture
fn bt8x8_ntsc() -> LineConfig {
    LineConfig {
        name: "bt8x8_ntsc".into(),
        sample_rate: 28_636_363.0,
        samples_per_line: 2048,
        bit_rate: 5_727_272.0,
        cri_window: SampleWindow {
            start: 30,
            end: 200,
        },
        gain_curve: GainCurve::default(),
        deconv_kernel: default_deconv_kernel(),
        threshold: ThresholdMode::default(),
        cri_rejection_ratio: default_cri_rejection_ratio(),
        black_percentile: default_black_percentile(),
        min_signal_span: default_min_signal_span(),
    }
}

/// saa7134 PAL raw VBI capture
fn saa7134_pal() -> LineConfig {
    LineConfig {
        name: "saa7134_pal".into(),
        sample_rate: 31_250_000.0,
        samples_per_line: 1824,
        bit_rate: 6_937_500.0,
        cri_window: SampleWindow {
            start: 20,
            end: 150,
        },
        gain_curve: GainCurve::default(),
        deconv_kernel: default_deconv_kernel(),
        threshold: ThresholdMode::default(),
        cri_rejection_ratio: default_cri_rejection_ratio(),
        black_percentile: default_black_percentile(),
        min_signal_span: default_min_signal_span(),
    }
}

/// Synthesis geometry used by the line generator and the test suite.
/// Identical to `bt8x8_pal` apart from a narrower search window.
fn ideal_profile() -> LineConfig {
    LineConfig {
        name: "ideal".into(),
        sample_rate: 35_468_950.0,
        samples_per_line: 2048,
        bit_rate: 6_937_500.0,
        cri_window: SampleWindow {
            start: 40,
            end: 160,
        },
        gain_curve: GainCurve::default(),
        deconv_kernel: default_deconv_kernel(),
        threshold: ThresholdMode::default(),
        cri_rejection_ratio: default_cri_rejection_ratio(),
        black_percentile: default_black_percentile(),
        min_signal_span: default_min_signal_span(),
    }
}
