//! Noise visibility function (NVF) mask.
//!
//! The mask at each pixel is `1 - 1 / (1 + variance)` over its `p x p` window:
//! flat regions, where added noise is most visible, map to ~0 and textured
//! regions map towards 1.

use rayon::prelude::*;

use crate::neighborhood::{extract_window, unpadded_dimensions};
use crate::LumaImage;

/// Variance of a window with divisor `n - 1`.
fn window_variance(window: &[f32]) -> f32 {
    #[allow(clippy::cast_precision_loss)]
    let n = window.len() as f32;
    let mean = window.iter().sum::<f32>() / n;
    let sum_sq = window.iter().map(|v| (v - mean).powi(2)).sum::<f32>();
    sum_sq / (n - 1.0)
}

/// Map a local variance onto the `[0, 1)` mask range.
#[inline]
fn visibility(variance: f32) -> f32 {
    1.0 - 1.0 / (1.0 + variance)
}

/// Compute the NVF mask of an image from its zero-padded copy.
///
/// `padded` must come from [`zero_pad`](crate::neighborhood::zero_pad) with the
/// same `p`. Rows are processed in parallel on the current rayon pool; each
/// worker reuses one private window buffer.
///
/// # Panics
///
/// Panics if `padded` has no interior pixel, i.e. it is not wider and taller
/// than `2 * (p / 2)`.
#[must_use]
pub fn nvf_mask(padded: &LumaImage, p: usize) -> LumaImage {
    let pad = p / 2;
    let (width, height) = unpadded_dimensions(padded, p);
    let mut mask = LumaImage::new(width, height);

    mask.par_chunks_mut(width as usize)
        .enumerate()
        .for_each_init(
            || vec![0.0_f32; p * p],
            |window, (row, line)| {
                for (col, m) in line.iter_mut().enumerate() {
                    extract_window(padded, row + pad, col + pad, p, window);
                    *m = visibility(window_variance(window));
                }
            },
        );

    tracing::debug!(width, height, p, "computed NVF mask");
    mask
}
