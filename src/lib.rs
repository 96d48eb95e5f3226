//! Embed and detect imperceptible watermarks in grayscale images.
//!
//! A pseudo-random reference pattern is shaped by a perceptual mask and added
//! to the image at a strength chosen to hit a target PSNR. Two mask models are
//! available:
//!
//! - **NVF** (noise visibility function): local window variance. Flat regions
//!   get almost no watermark, textured regions get the most.
//! - **Prediction error**: a global linear predictor is fit over every pixel's
//!   neighborhood by least squares, and the mask follows the magnitude of the
//!   prediction residual.
//!
//! Detection fits the predictor on the received image, predicts the residual
//! the masked pattern would leave behind, and correlates it with the image's
//! own residual.
//!
//! # Quick Start
//!
//! ```no_run
//! use masked_watermark::{
//!     load_luma, MaskModel, ReferencePattern, WatermarkConfig, WatermarkEngine,
//! };
//!
//! let image = load_luma("photo.png".as_ref()).expect("failed to load image");
//! let pattern = ReferencePattern::generate(image.width(), image.height(), 42);
//! let engine = WatermarkEngine::new(image, pattern, WatermarkConfig::default())
//!     .expect("failed to init engine");
//!
//! let marked = engine.embed(MaskModel::Nvf).unwrap();
//! let score = engine.detect(&marked, MaskModel::Nvf).unwrap();
//! println!("correlation: {score:.4}");
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod detection;
pub mod embedding;
mod engine;
pub mod error;
pub mod neighborhood;
pub mod pattern;
pub mod prediction;
pub mod variance_mask;

pub use config::WatermarkConfig;
pub use detection::DetectionResult;
pub use engine::{
    is_supported_image, load_luma, save_luma, suffixed_output_path, to_luma, MaskModel,
    WatermarkEngine,
};
pub use error::{Error, Result};
pub use pattern::ReferencePattern;

/// Single-channel `f32` image used for luminance, masks, and residual fields.
///
/// Samples are stored row-major: `width` is the column count, `height` the row count.
pub type LumaImage = image::ImageBuffer<image::Luma<f32>, Vec<f32>>;
