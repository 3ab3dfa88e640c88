//! Binarization and connected component labeling.
//!
//! ## Otsu Thresholding
//! Automatic threshold selection that maximizes the between-class variance of
//! the 256-bin histogram, separating the beam spot from the background.
//!
//! ## Connected Components
//! Two-pass labeling with union-find and path compression, using
//! 8-connectivity so diagonal pixels belong to the same spot.

use ndarray::{Array2, ArrayView2};

/// How the binarization threshold is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdMode {
    /// Pixels strictly above the value become foreground
    Fixed(u8),
    /// Threshold chosen per image with Otsu's method
    Otsu,
}

impl ThresholdMode {
    /// Map the user-facing threshold setting onto a mode.
    ///
    /// `-1` selects Otsu, values in `0..=255` are fixed thresholds and
    /// anything else is out of range.
    pub fn from_setting(value: i32) -> Option<Self> {
        match value {
            -1 => Some(Self::Otsu),
            0..=255 => Some(Self::Fixed(value as u8)),
            _ => None,
        }
    }
}

/// Compute the optimal threshold of an 8-bit image using Otsu's method.
///
/// Returns the largest intensity `t` of the background class, so foreground is
/// `pixel > t`. A uniform image has no between-class variance and yields 0.
pub fn otsu_threshold(image: &ArrayView2<u8>) -> u8 {
    let mut histogram = [0u64; 256];
    for &pixel in image.iter() {
        histogram[pixel as usize] += 1;
    }
    let total_pixels = image.len() as f64;

    let sum: f64 = histogram
        .iter()
        .enumerate()
        .map(|(i, &count)| i as f64 * count as f64)
        .sum();

    let mut sum_b = 0.0;
    let mut weight_b = 0.0;
    let mut max_variance = 0.0;
    let mut threshold = 0u8;

    for (i, &count) in histogram.iter().enumerate() {
        weight_b += count as f64;
        if weight_b.abs() < f64::EPSILON {
            continue;
        }

        let weight_f = total_pixels - weight_b;
        if weight_f.abs() < f64::EPSILON {
            break;
        }

        sum_b += (i as f64) * (count as f64);
        let mean_b = sum_b / weight_b;
        let mean_f = (sum - sum_b) / weight_f;

        let variance = weight_b * weight_f * (mean_b - mean_f).powi(2);

        if variance > max_variance {
            max_variance = variance;
            threshold = i as u8;
        }
    }

    threshold
}

/// Binarize an 8-bit image.
///
/// Pixels strictly above the threshold become 255, all others 0. Returns the
/// binary image together with the threshold that was actually used.
pub fn apply_threshold(image: &ArrayView2<u8>, mode: ThresholdMode) -> (Array2<u8>, u8) {
    let threshold = match mode {
        ThresholdMode::Fixed(t) => t,
        ThresholdMode::Otsu => otsu_threshold(image),
    };
    let binary = image.mapv(|pixel| if pixel > threshold { 255 } else { 0 });
    (binary, threshold)
}

fn find_root(labels: &mut [usize], label: usize) -> usize {
    let mut current = label;
    while current != labels[current] {
        labels[current] = labels[labels[current]];
        current = labels[current];
    }
    current
}

fn union_labels(labels: &mut [usize], label1: usize, label2: usize) {
    let root1 = find_root(labels, label1);
    let root2 = find_root(labels, label2);
    if root1 < root2 {
        labels[root2] = root1;
    } else if root2 < root1 {
        labels[root1] = root2;
    }
}

/// Label 8-connected foreground components of a binary image.
///
/// Non-zero pixels are foreground. Background is 0 and components receive
/// consecutive labels starting at 1, numbered in raster order of their first
/// pixel.
pub fn connected_components(binary_image: &ArrayView2<u8>) -> Array2<usize> {
    let (height, width) = binary_image.dim();
    let mut labels = Array2::<usize>::zeros((height, width));
    let mut parent_table = vec![0usize];

    for i in 0..height {
        for j in 0..width {
            if binary_image[[i, j]] == 0 {
                continue;
            }

            // already-visited neighbours: W, NW, N, NE
            let mut neighbor_labels = [0usize; 4];
            let mut n = 0;
            if j > 0 && labels[[i, j - 1]] > 0 {
                neighbor_labels[n] = labels[[i, j - 1]];
                n += 1;
            }
            if i > 0 {
                if j > 0 && labels[[i - 1, j - 1]] > 0 {
                    neighbor_labels[n] = labels[[i - 1, j - 1]];
                    n += 1;
                }
                if labels[[i - 1, j]] > 0 {
                    neighbor_labels[n] = labels[[i - 1, j]];
                    n += 1;
                }
                if j + 1 < width && labels[[i - 1, j + 1]] > 0 {
                    neighbor_labels[n] = labels[[i - 1, j + 1]];
                    n += 1;
                }
            }

            let neighbors = &neighbor_labels[..n];
            match neighbors.iter().min() {
                None => {
                    let label = parent_table.len();
                    parent_table.push(label);
                    labels[[i, j]] = label;
                }
                Some(&min_label) => {
                    labels[[i, j]] = min_label;
                    for &neighbor_label in neighbors {
                        if neighbor_label != min_label {
                            union_labels(&mut parent_table, min_label, neighbor_label);
                        }
                    }
                }
            }
        }
    }

    for i in 1..parent_table.len() {
        find_root(&mut parent_table, i);
    }

    let mut relabel_map = vec![0; parent_table.len()];
    let mut next_label = 1;
    for i in 1..parent_table.len() {
        let root = parent_table[i];
        if relabel_map[root] == 0 {
            relabel_map[root] = next_label;
            next_label += 1;
        }
        relabel_map[i] = relabel_map[root];
    }

    labels.mapv_inplace(|label| relabel_map[label]);
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// Creates a binary test image from a 2D array of 1s and 0s
    fn create_test_image(pattern: &[&[u8]]) -> Array2<u8> {
        let height = pattern.len();
        let width = pattern[0].len();
        Array2::from_shape_fn((height, width), |(i, j)| pattern[i][j] * 255)
    }

    #[test]
    fn test_threshold_setting_mapping() {
        assert_eq!(ThresholdMode::from_setting(-1), Some(ThresholdMode::Otsu));
        assert_eq!(ThresholdMode::from_setting(0), Some(ThresholdMode::Fixed(0)));
        assert_eq!(
            ThresholdMode::from_setting(255),
            Some(ThresholdMode::Fixed(255))
        );
        assert_eq!(ThresholdMode::from_setting(-2), None);
        assert_eq!(ThresholdMode::from_setting(256), None);
    }

    #[test]
    fn test_fixed_threshold_is_strict() {
        let image = array![[4u8, 5, 6]];
        let (binary, used) = apply_threshold(&image.view(), ThresholdMode::Fixed(5));
        assert_eq!(used, 5);
        assert_eq!(binary, array![[0u8, 0, 255]]);
    }

    #[test]
    fn test_otsu_splits_bimodal_image() {
        let mut image = Array2::from_elem((20, 20), 20u8);
        for r in 5..15 {
            for c in 5..15 {
                image[[r, c]] = 200;
            }
        }

        let t = otsu_threshold(&image.view());
        assert!((20..200).contains(&t), "threshold {t}");

        let (binary, used) = apply_threshold(&image.view(), ThresholdMode::Otsu);
        assert_eq!(used, t);
        assert_eq!(binary.iter().filter(|&&v| v == 255).count(), 100);
    }

    #[test]
    fn test_otsu_uniform_image() {
        let image = Array2::from_elem((4, 4), 90u8);
        assert_eq!(otsu_threshold(&image.view()), 0);
    }

    #[test]
    fn test_diagonal_pixels_are_connected() {
        // fmt-ignore
        let pattern: &[&[u8]] = &[
            &[1, 0, 0, 0, 0],
            &[0, 1, 0, 0, 1],
            &[0, 0, 1, 0, 1],
            &[0, 0, 0, 0, 0],
        ];
        let labeled = connected_components(&create_test_image(pattern).view());

        assert_eq!(labeled[[0, 0]], 1);
        assert_eq!(labeled[[1, 1]], 1);
        assert_eq!(labeled[[2, 2]], 1);
        assert_eq!(labeled[[1, 4]], 2);
        assert_eq!(labeled[[2, 4]], 2);
        assert_eq!(labeled[[3, 3]], 0);
    }

    #[test]
    fn test_u_shape_merges_labels() {
        // fmt-ignore
        let pattern: &[&[u8]] = &[
            &[0, 0, 0, 0, 0],
            &[0, 1, 0, 1, 0],
            &[0, 1, 0, 1, 0],
            &[0, 1, 1, 1, 0],
            &[0, 0, 0, 0, 0],
        ];
        let labeled = connected_components(&create_test_image(pattern).view());

        assert_eq!(labeled.iter().copied().max(), Some(1));
        assert_eq!(labeled[[1, 3]], 1);
    }

    #[test]
    fn test_anti_diagonal_merge() {
        // NE neighbour joins two runs that only meet diagonally
        // fmt-ignore
        let pattern: &[&[u8]] = &[
            &[0, 0, 1],
            &[0, 1, 0],
            &[1, 0, 0],
        ];
        let labeled = connected_components(&create_test_image(pattern).view());
        assert_eq!(labeled.iter().copied().max(), Some(1));
    }
}
