//! Engine configuration.

use crate::error::{Error, Result};

/// Largest supported neighborhood side.
pub const MAX_NEIGHBORHOOD: usize = 9;

/// Thread counts above this are treated as "auto".
const MAX_THREADS: usize = 256;

/// Options controlling watermark embedding and detection.
#[derive(Debug, Clone, PartialEq)]
pub struct WatermarkConfig {
    /// Neighborhood side length `p` (odd, `3..=9`).
    pub p: usize,
    /// Target PSNR of the embedded watermark, in dB.
    pub psnr: f32,
    /// Worker threads. `0` (or anything above 256) picks the available parallelism.
    pub threads: usize,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            p: 5,
            psnr: 30.0,
            threads: 0,
        }
    }
}

impl WatermarkConfig {
    /// Check the neighborhood size and PSNR.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidNeighborhood`] if `p` is even, `<= 1` or `> 9`,
    /// and [`Error::InvalidPsnr`] if `psnr` is not a positive finite number.
    pub fn validate(&self) -> Result<()> {
        if self.p <= 1 || self.p % 2 == 0 || self.p > MAX_NEIGHBORHOOD {
            return Err(Error::InvalidNeighborhood(self.p));
        }
        if !self.psnr.is_finite() || self.psnr <= 0.0 {
            return Err(Error::InvalidPsnr(self.psnr));
        }
        Ok(())
    }

    /// Zero-border width `(p - 1) / 2` around the image.
    #[must_use]
    pub fn pad(&self) -> usize {
        (self.p - 1) / 2
    }

    /// Number of worker threads the engine will actually use.
    #[must_use]
    pub fn resolved_threads(&self) -> usize {
        if self.threads == 0 || self.threads > MAX_THREADS {
            std::thread::available_parallelism().map_or(2, std::num::NonZeroUsize::get)
        } else {
            self.threads
        }
    }
}
