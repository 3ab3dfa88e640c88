//! Separable Gaussian smoothing of 8-bit images
//!
//! The pipeline optionally smooths the normalized batch image before
//! binarization. The kernel size comes from user settings, so it is validated
//! here rather than asserted: even or zero sizes are rejected with
//! [`KernelSizeError`] and never rounded to a neighbouring odd size.

use ndarray::{Array2, ArrayView2};
use thiserror::Error;

/// Requested kernel size cannot center on a pixel.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Gaussian kernel size must be a positive odd integer, got {0}")]
pub struct KernelSizeError(pub usize);

/// Normalized 1-D Gaussian taps for a square kernel of odd size.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianKernel {
    size: usize,
    sigma: f64,
    taps: Vec<f64>,
}

impl GaussianKernel {
    /// Build a kernel whose sigma is derived from its size as
    /// `0.3 * ((size - 1) / 2 - 1) + 0.8`.
    pub fn new(size: usize) -> Result<Self, KernelSizeError> {
        if size == 0 || size % 2 == 0 {
            return Err(KernelSizeError(size));
        }

        let sigma = 0.3 * ((size as f64 - 1.0) * 0.5 - 1.0) + 0.8;
        let center = (size / 2) as f64;

        let mut taps: Vec<f64> = (0..size)
            .map(|i| {
                let x = i as f64 - center;
                (-(x * x) / (2.0 * sigma * sigma)).exp()
            })
            .collect();
        let sum: f64 = taps.iter().sum();
        taps.iter_mut().for_each(|t| *t /= sum);

        Ok(Self { size, sigma, taps })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn taps(&self) -> &[f64] {
        &self.taps
    }
}

/// Mirror an out-of-range index without repeating the edge pixel
/// (`dcb|abcd|cba`).
fn reflect_101(index: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let last = len as isize - 1;
    let period = 2 * last;
    let mut i = index.rem_euclid(period);
    if i > last {
        i = period - i;
    }
    i as usize
}

/// Smooth an image with a separable Gaussian kernel.
///
/// Rows are filtered first, then columns. Borders are mirrored (reflect-101)
/// and the result is rounded back to `u8`.
pub fn gaussian_blur(image: &ArrayView2<u8>, kernel: &GaussianKernel) -> Array2<u8> {
    let (height, width) = image.dim();
    if height == 0 || width == 0 {
        return Array2::zeros((height, width));
    }

    let half = (kernel.size / 2) as isize;
    let taps = kernel.taps();

    let mut horizontal = Array2::<f64>::zeros((height, width));
    for row in 0..height {
        for col in 0..width {
            let mut sum = 0.0;
            for (k, &tap) in taps.iter().enumerate() {
                let c = reflect_101(col as isize + k as isize - half, width);
                sum += tap * image[[row, c]] as f64;
            }
            horizontal[[row, col]] = sum;
        }
    }

    Array2::from_shape_fn((height, width), |(row, col)| {
        let mut sum = 0.0;
        for (k, &tap) in taps.iter().enumerate() {
            let r = reflect_101(row as isize + k as isize - half, height);
            sum += tap * horizontal[[r, col]];
        }
        sum.round().clamp(0.0, 255.0) as u8
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_even_and_zero_sizes_rejected() {
        assert_eq!(GaussianKernel::new(0), Err(KernelSizeError(0)));
        assert_eq!(GaussianKernel::new(4), Err(KernelSizeError(4)));
        assert!(GaussianKernel::new(11).is_ok());
    }

    #[test]
    fn test_kernel_is_normalized_and_symmetric() {
        let kernel = GaussianKernel::new(11).unwrap();
        assert_relative_eq!(kernel.sigma(), 2.0, epsilon = 1e-12);

        let taps = kernel.taps();
        assert_relative_eq!(taps.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        for i in 0..taps.len() / 2 {
            assert_relative_eq!(taps[i], taps[taps.len() - 1 - i], epsilon = 1e-15);
        }
        assert!(taps[5] > taps[4]);
    }

    #[test]
    fn test_reflect_101_indices() {
        assert_eq!(reflect_101(-1, 5), 1);
        assert_eq!(reflect_101(-2, 5), 2);
        assert_eq!(reflect_101(5, 5), 3);
        assert_eq!(reflect_101(6, 5), 2);
        assert_eq!(reflect_101(3, 5), 3);
        assert_eq!(reflect_101(-4, 1), 0);
    }

    #[test]
    fn test_uniform_image_unchanged() {
        let image = Array2::from_elem((7, 9), 77u8);
        let kernel = GaussianKernel::new(5).unwrap();
        let blurred = gaussian_blur(&image.view(), &kernel);
        assert!(blurred.iter().all(|&v| v == 77));
    }

    #[test]
    fn test_impulse_spreads_and_keeps_peak_centered() {
        let mut image = Array2::zeros((9, 9));
        image[[4, 4]] = 255u8;
        let kernel = GaussianKernel::new(3).unwrap();
        let blurred = gaussian_blur(&image.view(), &kernel);

        assert!(blurred[[4, 4]] < 255);
        assert!(blurred[[4, 5]] > 0);
        assert_eq!(blurred[[4, 3]], blurred[[4, 5]]);
        assert_eq!(blurred[[3, 4]], blurred[[5, 4]]);
        assert_eq!(blurred[[0, 0]], 0);
    }
}
