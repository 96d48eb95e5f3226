//! Global linear predictor and prediction-error (ME) mask.
//!
//! Each pixel is predicted as a weighted sum of its `p * p - 1` neighbors. The
//! weights minimize the total squared residual over the image, i.e. they solve
//! the normal equations `Rx * c = rx` with
//!
//! - `Rx = sum(x * x^T)` over every neighborhood vector `x`,
//! - `rx = sum(x * value)`.
//!
//! The sums are built per worker and merged afterwards, so the result can vary
//! in the last bits with the thread count.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::neighborhood::{extract_neighbors, unpadded_dimensions};
use crate::LumaImage;

/// Singular values below `max_singular_value * SVD_RELATIVE_EPS` are dropped
/// in the least-squares fallback.
const SVD_RELATIVE_EPS: f64 = 1e-12;

/// Normal-equation accumulators for one worker.
struct NormalEquations {
    /// Upper triangle of `Rx`; the lower half is filled in before solving.
    rxx: DMatrix<f64>,
    rxy: DVector<f64>,
}

impl NormalEquations {
    fn zeros(n: usize) -> Self {
        Self {
            rxx: DMatrix::zeros(n, n),
            rxy: DVector::zeros(n),
        }
    }

    fn accumulate(&mut self, x: &[f32], target: f32) {
        let target = f64::from(target);
        for (a, &xa) in x.iter().enumerate() {
            let xa = f64::from(xa);
            self.rxy[a] += xa * target;
            for (b, &xb) in x.iter().enumerate().skip(a) {
                self.rxx[(a, b)] += xa * f64::from(xb);
            }
        }
    }

    fn merge(mut self, other: Self) -> Self {
        self.rxx += other.rxx;
        self.rxy += other.rxy;
        self
    }

    /// Solve for the predictor weights.
    ///
    /// Full-pivot LU first; a singular system falls back to the SVD
    /// minimum-norm least-squares solution. Non-finite sums (a NaN or infinite
    /// sample) are rejected before either decomposition runs.
    fn solve(mut self) -> Result<Vec<f32>> {
        if self.rxx.iter().chain(self.rxy.iter()).any(|v| !v.is_finite()) {
            return Err(Error::NumericalDegeneracy);
        }
        self.rxx.fill_lower_triangle_with_upper_triangle();

        let solution = if let Some(c) = self.rxx.clone().full_piv_lu().solve(&self.rxy) {
            c
        } else {
            tracing::warn!("normal equations are singular, using least-squares fallback");
            let svd = self.rxx.svd(true, true);
            let eps = svd.singular_values.max() * SVD_RELATIVE_EPS;
            svd.solve(&self.rxy, eps)
                .map_err(|_| Error::NumericalDegeneracy)?
        };

        if solution.iter().any(|c| !c.is_finite()) {
            return Err(Error::NumericalDegeneracy);
        }

        #[allow(clippy::cast_possible_truncation)]
        let coefficients = solution.iter().map(|&c| c as f32).collect();
        Ok(coefficients)
    }
}

/// A fitted linear predictor for a fixed neighborhood size.
#[derive(Debug, Clone, PartialEq)]
pub struct Predictor {
    p: usize,
    coefficients: Vec<f32>,
}

impl Predictor {
    /// Fit the predictor over every pixel of an image.
    ///
    /// `padded` is the image zero-padded for this `p`. Rows are split across
    /// the current rayon pool, each split accumulating its own normal equations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NumericalDegeneracy`] if the image holds non-finite
    /// samples or the solved weights are not finite.
    ///
    /// # Panics
    ///
    /// Panics if `padded` has no interior pixel for this `p`.
    pub fn fit(padded: &LumaImage, p: usize) -> Result<Self> {
        let n = p * p - 1;
        let pad = p / 2;
        let (width, height) = unpadded_dimensions(padded, p);
        let (width, height) = (width as usize, height as usize);
        let stride = padded.width() as usize;
        let data = padded.as_raw();

        let equations = (0..height)
            .into_par_iter()
            .fold(
                || (NormalEquations::zeros(n), vec![0.0_f32; n]),
                |(mut eq, mut x), row| {
                    let r = row + pad;
                    for col in 0..width {
                        let c = col + pad;
                        extract_neighbors(padded, r, c, p, &mut x);
                        eq.accumulate(&x, data[r * stride + c]);
                    }
                    (eq, x)
                },
            )
            .map(|(eq, _)| eq)
            .reduce(|| NormalEquations::zeros(n), NormalEquations::merge);

        let coefficients = equations.solve()?;
        tracing::debug!(p, ?coefficients, "fitted linear predictor");
        Ok(Self { p, coefficients })
    }

    /// Build a predictor from known weights (`p * p - 1` of them).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidNeighborhood`] if the weight count does not match `p`.
    pub fn from_coefficients(p: usize, coefficients: Vec<f32>) -> Result<Self> {
        if p < 3 || p % 2 == 0 || coefficients.len() != p * p - 1 {
            return Err(Error::InvalidNeighborhood(p));
        }
        Ok(Self { p, coefficients })
    }

    /// Neighborhood side length this predictor was fit for.
    #[must_use]
    pub fn p(&self) -> usize {
        self.p
    }

    /// Predictor weights in neighbor order.
    #[must_use]
    pub fn coefficients(&self) -> &[f32] {
        &self.coefficients
    }

    /// Prediction residual `value - c . neighbors` for every pixel.
    ///
    /// The image may differ from the one the predictor was fit on; detection
    /// applies the received image's weights to the masked reference pattern.
    ///
    /// # Panics
    ///
    /// Panics if `padded` has no interior pixel for this predictor's `p`.
    #[must_use]
    pub fn residuals(&self, padded: &LumaImage) -> LumaImage {
        let p = self.p;
        let pad = p / 2;
        let (width, height) = unpadded_dimensions(padded, p);
        let stride = padded.width() as usize;
        let data = padded.as_raw();
        let mut errors = LumaImage::new(width, height);

        errors
            .par_chunks_mut(width as usize)
            .enumerate()
            .for_each_init(
                || vec![0.0_f32; p * p - 1],
                |x, (row, line)| {
                    let r = row + pad;
                    for (col, e) in line.iter_mut().enumerate() {
                        let c = col + pad;
                        extract_neighbors(padded, r, c, p, x);
                        let predicted: f32 = self
                            .coefficients
                            .iter()
                            .zip(x.iter())
                            .map(|(w, v)| w * v)
                            .sum();
                        *e = data[r * stride + c] - predicted;
                    }
                },
            );

        errors
    }
}

/// Normalize absolute residuals to `[0, 1]` by their global maximum.
///
/// An all-zero residual field yields an all-zero mask.
#[must_use]
pub fn error_mask(errors: &LumaImage) -> LumaImage {
    let max_abs = errors
        .as_raw()
        .par_iter()
        .map(|e| e.abs())
        .reduce(|| 0.0_f32, f32::max);

    let mut mask = LumaImage::new(errors.width(), errors.height());
    if max_abs > 0.0 {
        let out: &mut [f32] = &mut mask;
        out.par_iter_mut()
            .zip(errors.as_raw().par_iter())
            .for_each(|(m, e)| *m = e.abs() / max_abs);
    }
    mask
}

/// Output of a predictor fit: weights, residual field, and optionally the ME mask.
#[derive(Debug, Clone)]
pub struct PredictionError {
    /// Predictor fit on the image.
    pub predictor: Predictor,
    /// Residual of every pixel under `predictor`.
    pub errors: LumaImage,
    /// `|errors| / max|errors|`, present when requested.
    pub mask: Option<LumaImage>,
}

/// Fit a predictor on an image and compute its residual field.
///
/// With `mask_needed`, the ME mask is derived from the residuals after the
/// full field is known.
///
/// # Errors
///
/// Returns [`Error::NumericalDegeneracy`] if the fit fails.
pub fn prediction_error(
    padded: &LumaImage,
    p: usize,
    mask_needed: bool,
) -> Result<PredictionError> {
    let predictor = Predictor::fit(padded, p)?;
    let errors = predictor.residuals(padded);
    let mask = mask_needed.then(|| error_mask(&errors));
    Ok(PredictionError {
        predictor,
        errors,
        mask,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neighborhood::zero_pad;

    #[allow(clippy::cast_precision_loss)]
    fn smooth(w: u32, h: u32) -> LumaImage {
        LumaImage::from_fn(w, h, |x, y| {
            let (fx, fy) = (x as f32, y as f32);
            image::Luma([128.0 + 50.0 * (fx * 0.15).sin() + 40.0 * (fy * 0.1).cos()])
        })
    }

    fn energy(img: &LumaImage) -> f64 {
        img.iter().map(|&v| f64::from(v) * f64::from(v)).sum()
    }

    #[test]
    fn fit_returns_one_weight_per_neighbor() {
        for p in [3, 5] {
            let padded = zero_pad(&smooth(40, 30), p);
            let predictor = Predictor::fit(&padded, p).unwrap();
            assert_eq!(predictor.p(), p);
            assert_eq!(predictor.coefficients().len(), p * p - 1);
            assert!(predictor.coefficients().iter().all(|c| c.is_finite()));
        }
    }

    #[test]
    fn fitted_predictor_removes_most_energy_of_smooth_image() {
        let img = smooth(48, 48);
        let padded = zero_pad(&img, 3);
        let result = prediction_error(&padded, 3, false).unwrap();
        assert!(result.mask.is_none());
        assert_eq!(result.errors.dimensions(), img.dimensions());
        assert!(
            energy(&result.errors) < 0.25 * energy(&img),
            "residual energy {} vs image energy {}",
            energy(&result.errors),
            energy(&img)
        );
    }

    #[test]
    fn residuals_match_manual_prediction() {
        let img = smooth(20, 20);
        let padded = zero_pad(&img, 3);
        let coefficients = vec![0.0, 0.5, 0.0, 0.25, 0.25, 0.0, 0.0, 0.0];
        let predictor = Predictor::from_coefficients(3, coefficients).unwrap();
        let errors = predictor.residuals(&padded);

        let (x, y) = (7, 11);
        let v = |dx: u32, dy: u32| img.get_pixel(x + dx - 1, y + dy - 1)[0];
        let expected = v(1, 1) - (0.5 * v(1, 0) + 0.25 * v(0, 1) + 0.25 * v(2, 1));
        assert!((errors.get_pixel(x, y)[0] - expected).abs() < 1e-3);
    }

    #[test]
    fn from_coefficients_rejects_wrong_length() {
        assert!(Predictor::from_coefficients(3, vec![0.0; 7]).is_err());
        assert!(Predictor::from_coefficients(4, vec![0.0; 15]).is_err());
        assert!(Predictor::from_coefficients(5, vec![0.0; 24]).is_ok());
    }

    #[test]
    fn black_image_falls_back_to_zero_weights() {
        let padded = zero_pad(&LumaImage::new(24, 24), 3);
        let result = prediction_error(&padded, 3, true).unwrap();
        assert!(result.predictor.coefficients().iter().all(|c| c.abs() < 1e-12));
        let mask = result.mask.unwrap();
        assert!(mask.iter().all(|&m| m.abs() < f32::EPSILON));
    }

    #[test]
    fn nan_sample_is_reported_as_degenerate() {
        let mut img = smooth(32, 32);
        img.put_pixel(13, 9, image::Luma([f32::NAN]));
        let err = Predictor::fit(&zero_pad(&img, 3), 3).unwrap_err();
        assert!(matches!(err, Error::NumericalDegeneracy));
    }

    #[test]
    fn rank_deficient_system_uses_least_squares_weights() {
        let x: Vec<f32> = (1..=8u8).map(f32::from).collect();
        let mut eq = NormalEquations::zeros(8);
        for _ in 0..5 {
            eq.accumulate(&x, 3.0);
        }

        let coefficients = eq.solve().unwrap();
        assert!(coefficients.iter().all(|c| c.is_finite()));
        // Minimum-norm solution of `x x^T c = x t` is `c = x t / |x|^2`.
        let norm_sq: f32 = x.iter().map(|v| v * v).sum();
        for (c, v) in coefficients.iter().zip(&x) {
            assert!((c - v * 3.0 / norm_sq).abs() < 1e-5, "{c}");
        }
        let predicted: f32 = coefficients.iter().zip(&x).map(|(c, v)| c * v).sum();
        assert!((predicted - 3.0).abs() < 1e-4, "{predicted}");
    }

    #[test]
    #[should_panic(expected = "has no interior")]
    fn residuals_panic_on_image_smaller_than_window() {
        let predictor = Predictor::from_coefficients(5, vec![0.0; 24]).unwrap();
        let _ = predictor.residuals(&LumaImage::new(4, 4));
    }

    #[test]
    fn error_mask_is_normalized_to_unit_maximum() {
        let padded = zero_pad(&smooth(32, 32), 5);
        let result = prediction_error(&padded, 5, true).unwrap();
        let mask = result.mask.unwrap();
        assert!(mask.iter().all(|m| (0.0..=1.0).contains(m)));
        let max = mask.iter().copied().fold(0.0_f32, f32::max);
        assert!((max - 1.0).abs() < 1e-6);
    }

    #[test]
    fn fit_is_stable_across_thread_counts() {
        let padded = zero_pad(&smooth(64, 40), 3);
        let fit_with = |threads| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .unwrap()
                .install(|| Predictor::fit(&padded, 3).unwrap())
        };
        let single = fit_with(1);
        let many = fit_with(4);
        for (a, b) in single.coefficients().iter().zip(many.coefficients()) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }
}
