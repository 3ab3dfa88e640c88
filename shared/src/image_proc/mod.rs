//! Image processing for beam-spot measurement.
//!
//! The accumulation pipeline reduces a batch of frames to a single 8-bit image
//! and then to one fitted ellipse. The steps live here as free functions over
//! `ndarray` arrays so they can be tested in isolation.
//!
//! # Module Organization
//!
//! - **ellipse**: `DetectedEllipse` value type and its derived geometry
//! - **image**: normalization, profiles and conversions to `image` crate types
//! - **histogram**: 256-bin intensity histogram
//! - **convolve2d**: separable Gaussian smoothing with a validated odd kernel
//! - **detection**: thresholding, external contours and ellipse fitting
//! - **overlay**: drawing fitted ellipses onto the processed image

pub mod convolve2d;
pub mod detection;
pub mod ellipse;
pub mod histogram;
pub mod image;
pub mod overlay;

pub use convolve2d::{gaussian_blur, GaussianKernel, KernelSizeError};
pub use detection::{
    apply_threshold, external_contours, fit_ellipse, otsu_threshold, Contour, EllipseFit,
    ThresholdMode,
};
pub use ellipse::DetectedEllipse;
pub use histogram::intensity_histogram;
pub use self::image::{
    array2_to_gray_image, gray_image_to_array2, normalize_min_max, peak_normalize,
    column_profile, row_profile,
};
pub use overlay::draw_ellipse;
