//! Normalization, profiles and conversions between ndarray and image crate types.
//!
//! # Coordinate System Conversions
//!
//! - **ndarray**: matrix indexing [row, col] = [y, x] with (height, width) dimensions
//! - **image crate**: graphics indexing (x, y) with (width, height) dimensions

use image::{GrayImage, ImageBuffer, Luma};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Min-max stretch an accumulator to the full 8-bit range.
///
/// The minimum maps to 0 and the maximum to 255, rounding to nearest. A
/// uniform image has no dynamic range and maps to all zeros.
pub fn normalize_min_max(image: &ArrayView2<f64>) -> Array2<u8> {
    let (min, max) = image
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });

    let range = max - min;
    let scale = if range > f64::EPSILON {
        255.0 / range
    } else {
        0.0
    };

    image.mapv(|v| ((v - min) * scale).round().clamp(0.0, 255.0) as u8)
}

/// Divide a profile by its largest absolute value so the peak is 1.
///
/// All-zero profiles are returned unchanged.
pub fn peak_normalize(profile: &ArrayView1<f64>) -> Array1<f64> {
    let peak = profile.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if peak > 0.0 {
        profile.mapv(|v| v / peak)
    } else {
        profile.to_owned()
    }
}

/// Sum down each column; one value per image column (x).
pub fn column_profile(image: &ArrayView2<f64>) -> Array1<f64> {
    image.sum_axis(Axis(0))
}

/// Sum along each row; one value per image row (y).
pub fn row_profile(image: &ArrayView2<f64>) -> Array1<f64> {
    image.sum_axis(Axis(1))
}

/// Convert ndarray `Array2<u8>` to an image crate `GrayImage`.
///
/// Array index [row, col] maps to image pixel (col, row).
pub fn array2_to_gray_image(arr: &ArrayView2<u8>) -> GrayImage {
    let (height, width) = arr.dim();
    ImageBuffer::<Luma<u8>, Vec<u8>>::from_fn(width as u32, height as u32, |x, y| {
        Luma([arr[[y as usize, x as usize]]])
    })
}

/// Convert an image crate `GrayImage` to ndarray `Array2<u8>`.
pub fn gray_image_to_array2(img: &GrayImage) -> Array2<u8> {
    let (width, height) = img.dimensions();
    Array2::from_shape_fn((height as usize, width as usize), |(row, col)| {
        img.get_pixel(col as u32, row as u32)[0]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_min_max_stretch() {
        let acc = array![[10.0, 20.0], [30.0, 60.0]];
        let norm = normalize_min_max(&acc.view());

        assert_eq!(norm[[0, 0]], 0);
        assert_eq!(norm[[1, 1]], 255);
        assert_eq!(norm[[0, 1]], 51);
        assert_eq!(norm[[1, 0]], 102);
    }

    #[test]
    fn test_uniform_image_maps_to_zero() {
        let acc = Array2::from_elem((3, 3), 42.0);
        assert!(normalize_min_max(&acc.view()).iter().all(|&v| v == 0));
    }

    #[test]
    fn test_profiles_and_peak_normalization() {
        let acc = array![[1.0, 2.0, 3.0], [1.0, 2.0, 3.0]];

        let columns = column_profile(&acc.view());
        assert_eq!(columns.len(), 3);
        assert_abs_diff_eq!(columns[2], 6.0);

        let rows = row_profile(&acc.view());
        assert_eq!(rows.len(), 2);
        assert_abs_diff_eq!(rows[0], 6.0);

        let peaked = peak_normalize(&columns.view());
        assert_abs_diff_eq!(peaked[2], 1.0);
        assert_abs_diff_eq!(peaked[0], 1.0 / 3.0, epsilon = 1e-12);

        let zeros = Array1::<f64>::zeros(4);
        assert_eq!(peak_normalize(&zeros.view()), zeros);
    }

    #[test]
    fn test_gray_image_roundtrip_orientation() {
        let arr = Array2::from_shape_fn((2, 3), |(r, c)| (r * 10 + c) as u8);
        let img = array2_to_gray_image(&arr.view());

        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(img.get_pixel(2, 1)[0], 12);
        assert_eq!(gray_image_to_array2(&img), arr);
    }
}
