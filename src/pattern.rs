//! Pseudo-random reference pattern `W`.
//!
//! On disk the pattern is a headerless run of little-endian `f32` samples,
//! `width * height` of them, in row-major order.

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::error::{Error, Result};

/// Bytes per stored sample.
const SAMPLE_BYTES: usize = std::mem::size_of::<f32>();

/// The reference pattern shared by embedding and detection.
///
/// Immutable once built; its dimensions must match the image it is used with.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferencePattern {
    width: u32,
    height: u32,
    samples: Vec<f32>,
}

impl ReferencePattern {
    /// Wrap row-major samples for a `width x height` image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PatternSizeMismatch`] if `samples.len() != width * height`.
    pub fn from_samples(width: u32, height: u32, samples: Vec<f32>) -> Result<Self> {
        let expected = width as usize * height as usize;
        if samples.len() != expected {
            return Err(Error::PatternSizeMismatch {
                expected,
                actual: samples.len(),
                width,
                height,
            });
        }
        Ok(Self {
            width,
            height,
            samples,
        })
    }

    /// Load a raw `f32` pattern file for a `width x height` image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read and
    /// [`Error::PatternSizeMismatch`] if its size is not `width * height * 4` bytes.
    pub fn from_file(path: &Path, width: u32, height: u32) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let expected = width as usize * height as usize;
        if bytes.len() != expected * SAMPLE_BYTES {
            return Err(Error::PatternSizeMismatch {
                expected,
                actual: bytes.len() / SAMPLE_BYTES,
                width,
                height,
            });
        }

        let samples = bytes
            .chunks_exact(SAMPLE_BYTES)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        tracing::debug!(path = %path.display(), width, height, "loaded reference pattern");
        Self::from_samples(width, height, samples)
    }

    /// Generate a reproducible standard-normal pattern from a seed.
    #[must_use]
    pub fn generate(width: u32, height: u32, seed: u64) -> Self {
        let samples: Vec<f32> = StdRng::seed_from_u64(seed)
            .sample_iter(StandardNormal)
            .take(width as usize * height as usize)
            .collect();

        Self {
            width,
            height,
            samples,
        }
    }

    /// Write the pattern in the raw format read by [`ReferencePattern::from_file`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes: Vec<u8> = self.samples.iter().flat_map(|v| v.to_le_bytes()).collect();
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Pattern width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Pattern height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row-major samples.
    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }
}
