//! Residual correlation detector.
//!
//! The received image's own prediction residual `e_z` is compared with the
//! residual `e_u` that the expected watermark `u = mask * W` leaves under the
//! same predictor. Their cosine similarity is high when the watermark is present
//! and close to zero otherwise.

use rayon::prelude::*;

/// Outcome of checking one image against a decision threshold.
#[derive(Debug, Clone, Default)]
pub struct DetectionResult {
    /// Whether the correlation reached the threshold.
    pub detected: bool,
    /// Correlation between the received and expected residual fields, in `[-1, 1]`.
    pub correlation: f32,
}

impl DetectionResult {
    /// Classify a correlation score against `threshold`.
    #[must_use]
    pub fn from_correlation(correlation: f32, threshold: f32) -> Self {
        Self {
            detected: correlation >= threshold,
            correlation,
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.par_iter()
        .zip(b.par_iter())
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum()
}

/// Cosine similarity `<e_z, e_u> / (|e_z| * |e_u|)` of two residual fields.
///
/// The dot product and both norms are reduced concurrently. Returns 0 when
/// either field is all zeros.
#[must_use]
pub fn correlation(e_z: &[f32], e_u: &[f32]) -> f32 {
    debug_assert_eq!(e_z.len(), e_u.len());

    let (cross, (norm_z, norm_u)) = rayon::join(
        || dot(e_z, e_u),
        || rayon::join(|| dot(e_z, e_z).sqrt(), || dot(e_u, e_u).sqrt()),
    );

    let denom = norm_z * norm_u;
    if denom < f64::MIN_POSITIVE {
        return 0.0;
    }
    #[allow(clippy::cast_possible_truncation)]
    let score = (cross / denom) as f32;
    score
}
