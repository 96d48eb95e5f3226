//! Core watermark engine.

use std::fmt;
use std::path::{Path, PathBuf};

use image::{DynamicImage, GrayImage, ImageFormat, Luma, RgbImage};

use crate::config::WatermarkConfig;
use crate::detection::{self, DetectionResult};
use crate::embedding;
use crate::error::{Error, Result};
use crate::neighborhood::zero_pad;
use crate::pattern::ReferencePattern;
use crate::prediction::{error_mask, prediction_error, PredictionError, Predictor};
use crate::variance_mask::nvf_mask;
use crate::LumaImage;

/// Luminance weights for RGB to grayscale conversion.
const R_WEIGHT: f32 = 0.299;
const G_WEIGHT: f32 = 0.587;
const B_WEIGHT: f32 = 0.114;

/// Images must be strictly larger than this on each side.
const MIN_SIDE: u32 = 16;
/// Images must be strictly smaller than this on each side.
const MAX_SIDE: u32 = 16384;

/// Perceptual mask used to shape the watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskModel {
    /// Noise visibility function: local window variance.
    Nvf,
    /// Normalized magnitude of the linear prediction error.
    PredictionError,
}

impl MaskModel {
    /// Suffix appended to output file stems for this model.
    #[must_use]
    pub fn output_suffix(self) -> &'static str {
        match self {
            Self::Nvf => "_W_NVF",
            Self::PredictionError => "_W_ME",
        }
    }
}

impl fmt::Display for MaskModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nvf => f.write_str("NVF"),
            Self::PredictionError => f.write_str("ME"),
        }
    }
}

/// The watermark engine holding the host image, the reference pattern, and
/// a worker pool.
///
/// Create once per image and reuse for both mask models. Every per-pixel sweep
/// runs on the engine's own thread pool.
pub struct WatermarkEngine {
    image: LumaImage,
    pattern: ReferencePattern,
    config: WatermarkConfig,
    pool: rayon::ThreadPool,
}

impl fmt::Debug for WatermarkEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatermarkEngine")
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .field("config", &self.config)
            .field("threads", &self.pool.current_num_threads())
            .finish_non_exhaustive()
    }
}

impl WatermarkEngine {
    /// Create an engine for `image` with an in-memory pattern.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidNeighborhood`] / [`Error::InvalidPsnr`] for a bad config.
    /// - [`Error::InvalidDimensions`] if a side is not in `17..16384`.
    /// - [`Error::DimensionMismatch`] if the pattern has other dimensions.
    /// - [`Error::ThreadPool`] if the worker pool cannot be started.
    pub fn new(
        image: LumaImage,
        pattern: ReferencePattern,
        config: WatermarkConfig,
    ) -> Result<Self> {
        config.validate()?;

        let (width, height) = image.dimensions();
        let side_ok = |s: u32| s > MIN_SIDE && s < MAX_SIDE;
        if !side_ok(width) || !side_ok(height) {
            return Err(Error::InvalidDimensions { width, height });
        }
        if (pattern.width(), pattern.height()) != (width, height) {
            return Err(Error::DimensionMismatch {
                expected: (width, height),
                actual: (pattern.width(), pattern.height()),
            });
        }

        let threads = config.resolved_threads();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("watermark-worker-{i}"))
            .build()?;

        tracing::info!(
            width,
            height,
            p = config.p,
            psnr = config.psnr,
            threads,
            "watermark engine ready"
        );

        Ok(Self {
            image,
            pattern,
            config,
            pool,
        })
    }

    /// Create an engine, loading the reference pattern from a raw `f32` file.
    ///
    /// # Errors
    ///
    /// Same as [`WatermarkEngine::new`], plus [`Error::Io`] and
    /// [`Error::PatternSizeMismatch`] from reading the pattern.
    pub fn with_pattern_file(
        image: LumaImage,
        pattern_path: &Path,
        config: WatermarkConfig,
    ) -> Result<Self> {
        config.validate()?;
        let pattern = ReferencePattern::from_file(pattern_path, image.width(), image.height())?;
        Self::new(image, pattern, config)
    }

    /// The host image.
    #[must_use]
    pub fn image(&self) -> &LumaImage {
        &self.image
    }

    /// The reference pattern.
    #[must_use]
    pub fn pattern(&self) -> &ReferencePattern {
        &self.pattern
    }

    /// The validated configuration.
    #[must_use]
    pub fn config(&self) -> &WatermarkConfig {
        &self.config
    }

    /// Number of worker threads in the engine's pool.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Embed the reference pattern into the host image.
    ///
    /// Returns a new image; the host image is not modified. A mask with no
    /// energy leaves the image as it is.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NumericalDegeneracy`] if the predictor fit fails
    /// ([`MaskModel::PredictionError`] only).
    pub fn embed(&self, model: MaskModel) -> Result<LumaImage> {
        let _span = tracing::info_span!("embed", %model).entered();
        let p = self.config.p;

        self.pool.install(|| {
            let padded = zero_pad(&self.image, p);
            let mask = match model {
                MaskModel::Nvf => nvf_mask(&padded, p),
                MaskModel::PredictionError => fit_with_mask(&padded, p)?.2,
            };

            let u = embedding::masked_pattern(&mask, self.pattern.samples());
            if let Some(a) = embedding::scale_factor(&u, self.config.psnr) {
                tracing::debug!(a, "embedding strength");
                Ok(embedding::add_watermark(&self.image, &u, a))
            } else {
                tracing::warn!("mask carries no energy, image left unmarked");
                Ok(self.image.clone())
            }
        })
    }

    /// Correlation between `image`'s prediction residual and the residual the
    /// expected watermark would leave.
    ///
    /// Use the same `model` that was used for embedding.
    ///
    /// # Errors
    ///
    /// - [`Error::DimensionMismatch`] if `image` differs in size from the host image.
    /// - [`Error::NumericalDegeneracy`] if the predictor fit fails.
    pub fn detect(&self, image: &LumaImage, model: MaskModel) -> Result<f32> {
        if image.dimensions() != self.image.dimensions() {
            return Err(Error::DimensionMismatch {
                expected: self.image.dimensions(),
                actual: image.dimensions(),
            });
        }
        let _span = tracing::info_span!("detect", %model).entered();
        let p = self.config.p;

        self.pool.install(|| {
            let padded = zero_pad(image, p);
            let (predictor, e_z, mask) = match model {
                MaskModel::Nvf => {
                    let (fit, mask) = rayon::join(
                        || prediction_error(&padded, p, false),
                        || nvf_mask(&padded, p),
                    );
                    let fit = fit?;
                    (fit.predictor, fit.errors, mask)
                }
                MaskModel::PredictionError => fit_with_mask(&padded, p)?,
            };

            let u = embedding::masked_pattern(&mask, self.pattern.samples());
            let e_u = predictor.residuals(&zero_pad(&u, p));
            let score = detection::correlation(e_z.as_raw(), e_u.as_raw());
            tracing::debug!(score, "residual correlation");
            Ok(score)
        })
    }

    /// Detect and compare the correlation against `threshold`.
    ///
    /// # Errors
    ///
    /// Same as [`WatermarkEngine::detect`].
    pub fn verify(
        &self,
        image: &LumaImage,
        model: MaskModel,
        threshold: f32,
    ) -> Result<DetectionResult> {
        let correlation = self.detect(image, model)?;
        Ok(DetectionResult::from_correlation(correlation, threshold))
    }
}

/// Fit on a padded image and return the predictor, residuals, and ME mask.
fn fit_with_mask(padded: &LumaImage, p: usize) -> Result<(Predictor, LumaImage, LumaImage)> {
    let PredictionError {
        predictor,
        errors,
        mask,
    } = prediction_error(padded, p, true)?;
    let mask = mask.unwrap_or_else(|| error_mask(&errors));
    Ok((predictor, errors, mask))
}

/// Convert an RGB image to `f32` luminance in `[0, 255]`.
#[must_use]
pub fn to_luma(rgb: &RgbImage) -> LumaImage {
    LumaImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let px = rgb.get_pixel(x, y);
        Luma([R_WEIGHT * f32::from(px[0])
            + G_WEIGHT * f32::from(px[1])
            + B_WEIGHT * f32::from(px[2])])
    })
}

/// Load an image file as `f32` luminance.
///
/// # Errors
///
/// Returns [`Error::Image`] if the file cannot be opened or decoded.
pub fn load_luma(path: &Path) -> Result<LumaImage> {
    let rgb = image::open(path)?.to_rgb8();
    Ok(to_luma(&rgb))
}

/// Save a luminance image as 8-bit grayscale, rounding and clamping to `[0, 255]`.
///
/// # Errors
///
/// Returns an error if the format is unsupported or writing fails.
pub fn save_luma(img: &LumaImage, path: &Path) -> Result<()> {
    let format =
        ImageFormat::from_path(path).map_err(|e| Error::UnsupportedFormat(e.to_string()))?;

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let gray = GrayImage::from_fn(img.width(), img.height(), |x, y| {
        Luma([img.get_pixel(x, y)[0].round().clamp(0.0, 255.0) as u8])
    });
    let dyn_img = DynamicImage::ImageLuma8(gray);

    match format {
        ImageFormat::Jpeg => {
            let file = std::fs::File::create(path)?;
            let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(file, 100);
            encoder.encode_image(&dyn_img)?;
        }
        ImageFormat::Png | ImageFormat::WebP | ImageFormat::Bmp => {
            dyn_img.save(path)?;
        }
        _ => {
            return Err(Error::UnsupportedFormat(format!("{format:?}")));
        }
    }

    Ok(())
}

/// Check if a file has a supported image extension.
#[must_use]
pub fn is_supported_image(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => matches!(
            ext.to_lowercase().as_str(),
            "jpg" | "jpeg" | "png" | "webp" | "bmp"
        ),
        None => false,
    }
}

/// Insert `suffix` between a path's file stem and extension.
///
/// Example: `("photo.png", "_W_NVF")` becomes `"photo_W_NVF.png"`.
#[must_use]
pub fn suffixed_output_path(input: &Path, suffix: &str) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default().to_string_lossy();
    let parent = input.parent().unwrap_or(Path::new("."));
    match input.extension() {
        Some(ext) => parent.join(format!("{stem}{suffix}.{}", ext.to_string_lossy())),
        None => parent.join(format!("{stem}{suffix}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Smooth gradient plus deterministic hashed noise.
    #[allow(clippy::cast_precision_loss)]
    fn textured(w: u32, h: u32) -> LumaImage {
        LumaImage::from_fn(w, h, |x, y| {
            let hash = (x.wrapping_mul(73_856_093) ^ y.wrapping_mul(19_349_663))
                .wrapping_mul(0x9E37_79B1)
                >> 24;
            let noise = (hash as f32 / 255.0 - 0.5) * 24.0;
            let base = 80.0 + 40.0 * (x as f32 * 0.2).sin() * (y as f32 * 0.15).cos();
            Luma([base + noise])
        })
    }

    fn engine(w: u32, h: u32, config: WatermarkConfig) -> WatermarkEngine {
        WatermarkEngine::new(textured(w, h), ReferencePattern::generate(w, h, 11), config).unwrap()
    }

    #[test]
    fn new_rejects_out_of_range_dimensions() {
        let err = WatermarkEngine::new(
            textured(16, 40),
            ReferencePattern::generate(16, 40, 1),
            WatermarkConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidDimensions { width: 16, height: 40 }));
    }

    #[test]
    fn new_rejects_pattern_with_other_dimensions() {
        let err = WatermarkEngine::new(
            textured(40, 30),
            ReferencePattern::generate(30, 40, 1),
            WatermarkConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[test]
    fn new_rejects_invalid_config() {
        let config = WatermarkConfig {
            p: 4,
            ..WatermarkConfig::default()
        };
        let err = WatermarkEngine::new(
            textured(32, 32),
            ReferencePattern::generate(32, 32, 1),
            config,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidNeighborhood(4)));
    }

    #[test]
    fn engine_uses_configured_thread_count() {
        let config = WatermarkConfig {
            threads: 3,
            ..WatermarkConfig::default()
        };
        assert_eq!(engine(32, 32, config).threads(), 3);
    }

    #[test]
    fn embed_hits_target_psnr_for_both_models() {
        let engine = engine(64, 48, WatermarkConfig::default());
        for model in [MaskModel::Nvf, MaskModel::PredictionError] {
            let marked = engine.embed(model).unwrap();
            let measured = embedding::psnr(engine.image(), &marked);
            assert!(
                (measured - 30.0).abs() < 0.05,
                "{model}: measured {measured} dB"
            );
        }
    }

    #[test]
    fn embed_leaves_black_image_unmarked() {
        let engine = WatermarkEngine::new(
            LumaImage::new(24, 24),
            ReferencePattern::generate(24, 24, 5),
            WatermarkConfig::default(),
        )
        .unwrap();
        for model in [MaskModel::Nvf, MaskModel::PredictionError] {
            let marked = engine.embed(model).unwrap();
            assert_eq!(&marked, engine.image());
        }
    }

    #[test]
    fn embed_marks_only_the_rim_of_a_flat_image() {
        let engine = WatermarkEngine::new(
            LumaImage::from_pixel(64, 64, Luma([100.0])),
            ReferencePattern::generate(64, 64, 5),
            WatermarkConfig::default(),
        )
        .unwrap();
        let marked = engine.embed(MaskModel::Nvf).unwrap();

        let mut rim_changed = 0;
        for (x, y, px) in marked.enumerate_pixels() {
            let delta = px[0] - 100.0;
            if (2..62).contains(&x) && (2..62).contains(&y) {
                assert!(delta.abs() < f32::EPSILON, "interior ({x},{y}) moved by {delta}");
            } else if delta.abs() > 1e-3 {
                rim_changed += 1;
            }
        }
        assert!(rim_changed > 0, "no rim pixel carries the watermark");
        let measured = embedding::psnr(engine.image(), &marked);
        assert!((measured - 30.0).abs() < 0.05, "measured {measured} dB");
    }

    #[test]
    fn detect_rejects_other_dimensions() {
        let engine = engine(32, 32, WatermarkConfig::default());
        let err = engine.detect(&textured(33, 32), MaskModel::Nvf).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: (32, 32),
                actual: (33, 32)
            }
        ));
    }

    #[test]
    fn verify_flags_watermarked_image_only() {
        let engine = engine(96, 96, WatermarkConfig::default());
        let marked = engine.embed(MaskModel::Nvf).unwrap();
        let hit = engine.verify(&marked, MaskModel::Nvf, 0.2).unwrap();
        let miss = engine.verify(engine.image(), MaskModel::Nvf, 0.2).unwrap();
        assert!(hit.detected, "correlation {}", hit.correlation);
        assert!(!miss.detected, "correlation {}", miss.correlation);
    }

    #[test]
    fn model_display_and_suffix() {
        assert_eq!(MaskModel::Nvf.to_string(), "NVF");
        assert_eq!(MaskModel::PredictionError.to_string(), "ME");
        assert_eq!(MaskModel::Nvf.output_suffix(), "_W_NVF");
        assert_eq!(MaskModel::PredictionError.output_suffix(), "_W_ME");
    }

    #[test]
    fn to_luma_uses_rec601_weights() {
        let mut rgb = RgbImage::new(2, 1);
        rgb.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        rgb.put_pixel(1, 0, image::Rgb([10, 20, 30]));
        let luma = to_luma(&rgb);
        assert!((luma.get_pixel(0, 0)[0] - 76.245).abs() < 1e-3);
        assert!((luma.get_pixel(1, 0)[0] - 18.15).abs() < 1e-3);
    }

    #[test]
    fn save_luma_clamps_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        let img = LumaImage::from_fn(20, 20, |x, _| Luma([if x < 10 { -40.0 } else { 300.0 }]));
        save_luma(&img, &path).unwrap();

        let reloaded = image::open(&path).unwrap().to_luma8();
        assert_eq!(reloaded.get_pixel(0, 0)[0], 0);
        assert_eq!(reloaded.get_pixel(15, 3)[0], 255);
    }

    #[test]
    fn save_luma_rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let err = save_luma(&LumaImage::new(4, 4), &dir.path().join("out.xyz")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[test]
    fn suffixed_output_path_inserts_before_extension() {
        let p = suffixed_output_path(Path::new("/tmp/photo.png"), "_W_NVF");
        assert_eq!(p, PathBuf::from("/tmp/photo_W_NVF.png"));

        let p = suffixed_output_path(Path::new("image"), "_W_ME");
        assert_eq!(p.file_name().unwrap().to_str().unwrap(), "image_W_ME");
    }

    #[test]
    fn is_supported_image_accepts_common_formats() {
        assert!(is_supported_image(Path::new("photo.jpg")));
        assert!(is_supported_image(Path::new("photo.JPEG")));
        assert!(is_supported_image(Path::new("photo.png")));
        assert!(is_supported_image(Path::new("photo.bmp")));
        assert!(!is_supported_image(Path::new("photo.gif")));
        assert!(!is_supported_image(Path::new("photo")));
    }
}
