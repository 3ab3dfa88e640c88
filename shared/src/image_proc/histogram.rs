use ndarray::{Array1, ArrayView2};

/// 256-bin intensity histogram of an 8-bit image, as counts.
pub fn intensity_histogram(image: &ArrayView2<u8>) -> Array1<f64> {
    let mut bins = Array1::<f64>::zeros(256);
    for &pixel in image.iter() {
        bins[pixel as usize] += 1.0;
    }
    bins
}
