//! Shared signal-processing primitives for the deconvolver backends.
//!
//! Both the per-line CPU path and the batched backend are built from the
//! same three stages: amplitude normalization, clock run-in location by
//! cross-correlation, and soft-bit integration/slicing. Keeping them here
//! guarantees the backends agree to within floating-point noise.

pub mod correlation;
pub mod normalize;
pub mod slicing;

pub use correlation::{cri_template, evaluate_scores, locate_cri, CriSearch};
pub use normalize::normalize_line;
pub use slicing::{
    deconvolve_soft, integrate_bits, recover_bytes, slice_to_bytes, threshold_level,
};
