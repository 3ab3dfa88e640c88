//! Fixtures shared by the workspace tests.
//!
//! Synthetic beam-spot images for the accumulation and detection tests, and
//! a scratch directory under the workspace root for artifacts worth keeping
//! after a test run.

use ndarray::Array2;
use once_cell::sync::Lazy;
use std::env;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum TestHelperError {
    #[error("workspace root not found from {0}")]
    WorkspaceRootNotFound(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Walk up from the current directory to the `Cargo.toml` declaring `[workspace]`.
pub fn find_workspace_root() -> Result<PathBuf, TestHelperError> {
    let start = env::current_dir()?;
    for dir in start.ancestors() {
        let manifest = dir.join("Cargo.toml");
        if manifest.is_file() && std::fs::read_to_string(&manifest)?.contains("[workspace]") {
            return Ok(dir.to_path_buf());
        }
    }
    Err(TestHelperError::WorkspaceRootNotFound(start))
}

static WORKSPACE_ROOT: Lazy<PathBuf> =
    Lazy::new(|| find_workspace_root().expect("Failed to find workspace root"));

/// `<workspace>/test_output`, created on first use.
pub fn get_output_dir() -> PathBuf {
    let output_dir = WORKSPACE_ROOT.join("test_output");
    std::fs::create_dir_all(&output_dir).expect("Failed to create output directory");
    output_dir
}

pub fn output_path<P: AsRef<Path>>(path: P) -> PathBuf {
    get_output_dir().join(path)
}

/// Elliptical Gaussian spot on a flat background.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeamSpot {
    pub x_c: f64,
    pub y_c: f64,
    /// Standard deviation along the rotated x axis, pixels
    pub sigma_x: f64,
    /// Standard deviation along the rotated y axis, pixels
    pub sigma_y: f64,
    /// Counter-clockwise rotation of the x axis, degrees
    pub angle: f64,
    pub peak: f64,
    pub background: f64,
}

impl BeamSpot {
    pub fn round(x_c: f64, y_c: f64, sigma: f64) -> Self {
        Self {
            x_c,
            y_c,
            sigma_x: sigma,
            sigma_y: sigma,
            angle: 0.0,
            peak: 200.0,
            background: 10.0,
        }
    }

    pub fn intensity(&self, x: f64, y: f64) -> f64 {
        let (sin, cos) = self.angle.to_radians().sin_cos();
        let dx = x - self.x_c;
        let dy = y - self.y_c;
        let u = dx * cos + dy * sin;
        let v = -dx * sin + dy * cos;
        let exponent = u * u / (2.0 * self.sigma_x.powi(2)) + v * v / (2.0 * self.sigma_y.powi(2));
        self.background + self.peak * (-exponent).exp()
    }

    /// Render into a `height x width` 8-bit image.
    pub fn render(&self, width: usize, height: usize) -> Array2<u8> {
        Array2::from_shape_fn((height, width), |(row, col)| {
            self.intensity(col as f64, row as f64).round().clamp(0.0, 255.0) as u8
        })
    }
}

/// Filled disk of `value` on a background of `background`.
pub fn disk_image(
    width: usize,
    height: usize,
    center: (f64, f64),
    radius: f64,
    value: u8,
    background: u8,
) -> Array2<u8> {
    Array2::from_shape_fn((height, width), |(row, col)| {
        let dx = col as f64 - center.0;
        let dy = row as f64 - center.1;
        if dx * dx + dy * dy <= radius * radius {
            value
        } else {
            background
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_root_has_manifest() {
        let root = find_workspace_root().unwrap();
        assert!(root.join("Cargo.toml").exists());
    }

    #[test]
    fn test_output_path_under_output_dir() {
        let path = output_path("spot.png");
        assert_eq!(path, get_output_dir().join("spot.png"));
        assert!(get_output_dir().is_dir());
    }

    #[test]
    fn test_spot_peaks_at_center() {
        let spot = BeamSpot::round(20.0, 10.0, 3.0);
        let image = spot.render(40, 20);
        assert_eq!(image[[10, 20]], 210);
        assert_eq!(image[[0, 0]], 10);
    }

    #[test]
    fn test_rotated_spot_is_symmetric() {
        let spot = BeamSpot {
            sigma_x: 6.0,
            sigma_y: 2.0,
            angle: 90.0,
            ..BeamSpot::round(0.0, 0.0, 1.0)
        };
        // major axis now vertical
        assert!(spot.intensity(0.0, 5.0) > spot.intensity(5.0, 0.0));
        assert!((spot.intensity(0.0, 5.0) - spot.intensity(0.0, -5.0)).abs() < 1e-9);
    }

    #[test]
    fn test_disk_image() {
        let image = disk_image(11, 11, (5.0, 5.0), 2.0, 255, 0);
        assert_eq!(image[[5, 5]], 255);
        assert_eq!(image[[5, 7]], 255);
        assert_eq!(image[[5, 8]], 0);
    }
}
