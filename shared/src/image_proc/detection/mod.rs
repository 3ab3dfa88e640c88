//! Beam-spot segmentation and shape fitting.
//!
//! # Module Organization
//!
//! - **thresholding**: fixed and Otsu binarization, connected component labeling
//! - **contours**: external boundary extraction and polygon area
//! - **ellipse_fit**: direct least-squares ellipse fit with a moments fallback

pub mod contours;
pub mod ellipse_fit;
pub mod thresholding;

pub use contours::{external_contours, Contour};
pub use ellipse_fit::{fit_ellipse, EllipseFit};
pub use thresholding::{apply_threshold, connected_components, otsu_threshold, ThresholdMode};
