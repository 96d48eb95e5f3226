//! Additive embedding math.
//!
//! The watermark is `u = mask * W`, added to the image with a gain `a` chosen so
//! that the mean squared change matches the requested PSNR:
//!
//! `a = (255 / sqrt(10^(psnr / 10))) / rms(u)`

use rayon::prelude::*;

use crate::LumaImage;

/// Nominal peak value of the 8-bit luminance range.
pub const PEAK: f32 = 255.0;

/// Elementwise `mask * pattern`.
///
/// `pattern` must hold exactly `mask.width() * mask.height()` samples in row-major order.
#[must_use]
pub fn masked_pattern(mask: &LumaImage, pattern: &[f32]) -> LumaImage {
    debug_assert_eq!(mask.len(), pattern.len());
    let mut u = mask.clone();
    let out: &mut [f32] = &mut u;
    out.par_iter_mut()
        .zip(pattern.par_iter())
        .for_each(|(m, w)| *m *= w);
    u
}

/// Root-mean-square of a sample buffer, accumulated in `f64`.
#[must_use]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples
        .par_iter()
        .map(|&v| f64::from(v) * f64::from(v))
        .sum();
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let rms = (sum_sq / samples.len() as f64).sqrt() as f32;
    rms
}

/// Target RMS of the added signal for a given PSNR.
#[must_use]
pub fn target_rms(psnr: f32) -> f32 {
    PEAK / 10.0_f32.powf(psnr / 10.0).sqrt()
}

/// Gain that brings `u` to the RMS implied by `psnr`.
///
/// Returns `None` when `u` carries no energy (e.g. a flat image under the NVF mask).
#[must_use]
pub fn scale_factor(u: &LumaImage, psnr: f32) -> Option<f32> {
    let energy = rms(u.as_raw());
    if energy > 0.0 {
        Some(target_rms(psnr) / energy)
    } else {
        None
    }
}

/// Return `image + a * u` as a new image.
#[must_use]
pub fn add_watermark(image: &LumaImage, u: &LumaImage, a: f32) -> LumaImage {
    debug_assert_eq!(image.dimensions(), u.dimensions());
    let mut marked = image.clone();
    let out: &mut [f32] = &mut marked;
    out.par_iter_mut()
        .zip(u.as_raw().par_iter())
        .for_each(|(px, w)| *px += a * w);
    marked
}

/// Peak signal-to-noise ratio between two equally sized images, in dB.
///
/// Identical images give `f32::INFINITY`.
#[must_use]
pub fn psnr(original: &LumaImage, modified: &LumaImage) -> f32 {
    debug_assert_eq!(original.dimensions(), modified.dimensions());
    let sum_sq: f64 = original
        .as_raw()
        .par_iter()
        .zip(modified.as_raw().par_iter())
        .map(|(a, b)| {
            let d = f64::from(*a) - f64::from(*b);
            d * d
        })
        .sum();
    if sum_sq == 0.0 {
        return f32::INFINITY;
    }
    #[allow(clippy::cast_precision_loss)]
    let mse = sum_sq / original.len() as f64;
    let peak = f64::from(PEAK);
    #[allow(clippy::cast_possible_truncation)]
    let db = (10.0 * (peak * peak / mse).log10()) as f32;
    db
}
