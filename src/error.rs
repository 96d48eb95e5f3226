//! Error types for the masked-watermark crate.

/// Errors that can occur while building the engine, embedding, or detecting.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The reference pattern holds a different number of samples than the image.
    #[error(
        "reference pattern has {actual} samples, expected {expected} for a {width}x{height} image"
    )]
    PatternSizeMismatch {
        /// Samples required (`width * height`).
        expected: usize,
        /// Samples actually present in the source.
        actual: usize,
        /// Image width in pixels.
        width: u32,
        /// Image height in pixels.
        height: u32,
    },

    /// The neighborhood side is not an odd number in `3..=9`.
    #[error("neighborhood size p={0} must be an odd number greater than 1 and at most 9")]
    InvalidNeighborhood(usize),

    /// The target PSNR is not a positive finite number.
    #[error("target PSNR must be a positive number, got {0}")]
    InvalidPsnr(f32),

    /// The image is too small or too large to be processed.
    #[error("image dimensions {width}x{height} out of range (each side must be in 17..16384)")]
    InvalidDimensions {
        /// Image width in pixels.
        width: u32,
        /// Image height in pixels.
        height: u32,
    },

    /// An image handed to the engine does not match the dimensions it was built for.
    #[error(
        "image is {}x{} but the engine was built for {}x{}",
        .actual.0, .actual.1, .expected.0, .expected.1
    )]
    DimensionMismatch {
        /// `(width, height)` the engine was built for.
        expected: (u32, u32),
        /// `(width, height)` of the offending image.
        actual: (u32, u32),
    },

    /// The normal equations produced non-finite predictor coefficients.
    #[error("predictor fit produced non-finite coefficients (degenerate normal equations)")]
    NumericalDegeneracy,

    /// The worker thread pool could not be created.
    #[error("failed to build worker thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// An I/O error occurred while reading or writing files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The image format is not supported.
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// An error occurred during image processing (load, save, encode).
    #[error("image processing error: {0}")]
    Image(#[from] image::ImageError),
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
