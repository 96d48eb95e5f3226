//! Zero padding and square-window extraction.
//!
//! All window functions take coordinates in *padded* space: pixel `(row, col)`
//! of the original image sits at `(row + pad, col + pad)` of the padded image.

use crate::LumaImage;

/// Surround `image` with a zero border of width `(p - 1) / 2`.
#[must_use]
pub fn zero_pad(image: &LumaImage, p: usize) -> LumaImage {
    #[allow(clippy::cast_possible_truncation)]
    let pad = ((p - 1) / 2) as u32;
    let mut padded = LumaImage::new(image.width() + 2 * pad, image.height() + 2 * pad);
    image::imageops::replace(&mut padded, image, i64::from(pad), i64::from(pad));
    padded
}

/// Dimensions of the image that `padded` was built from by [`zero_pad`].
///
/// # Panics
///
/// Panics if `padded` is not wider and taller than `2 * (p / 2)`, i.e. it
/// holds no pixel with a full `p x p` window.
#[must_use]
pub fn unpadded_dimensions(padded: &LumaImage, p: usize) -> (u32, u32) {
    #[allow(clippy::cast_possible_truncation)]
    let border = 2 * (p / 2) as u32;
    assert!(
        padded.width() > border && padded.height() > border,
        "padded image {}x{} has no interior for p={p}",
        padded.width(),
        padded.height()
    );
    (padded.width() - border, padded.height() - border)
}

/// Copy the full `p x p` window centered on `(row, col)` into `out`, row-major.
///
/// `out` must hold exactly `p * p` samples.
pub fn extract_window(padded: &LumaImage, row: usize, col: usize, p: usize, out: &mut [f32]) {
    debug_assert_eq!(out.len(), p * p);
    let half = p / 2;
    let stride = padded.width() as usize;
    let data = padded.as_raw();

    for (k, r) in (row - half..=row + half).enumerate() {
        let start = r * stride + col - half;
        out[k * p..(k + 1) * p].copy_from_slice(&data[start..start + p]);
    }
}

/// Copy the `p * p - 1` neighbors of `(row, col)` into `out`.
///
/// Order is row-major over the window with the center sample removed, so for
/// `p = 3` the layout is `[nw, n, ne, w, e, sw, s, se]`.
pub fn extract_neighbors(padded: &LumaImage, row: usize, col: usize, p: usize, out: &mut [f32]) {
    debug_assert_eq!(out.len(), p * p - 1);
    let half = p / 2;
    let stride = padded.width() as usize;
    let data = padded.as_raw();
    let mut k = 0;

    for r in row - half..=row + half {
        let start = r * stride + col - half;
        let line = &data[start..start + p];
        if r == row {
            out[k..k + half].copy_from_slice(&line[..half]);
            out[k + half..k + 2 * half].copy_from_slice(&line[half + 1..]);
            k += 2 * half;
        } else {
            out[k..k + p].copy_from_slice(line);
            k += p;
        }
    }
}
