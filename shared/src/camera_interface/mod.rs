//! Camera abstraction layer for the beam focusing loop
//!
//! The focusing engine only needs a stream of 8-bit frames and a way to push
//! exposure/gain settings. Concrete drivers (vendor SDKs, V4L2, simulators)
//! implement [`CameraInterface`]; the engine never talks to them directly.

pub mod mock;

pub use mock::MockCameraInterface;

use ndarray::{s, Array2, Array3, ArrayView2};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Error type for camera operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CameraError {
    /// Hardware communication error
    #[error("hardware error: {0}")]
    HardwareError(String),
    /// Operation requires an open connection
    #[error("camera is not connected")]
    NotConnected,
    /// Frame capture error
    #[error("capture error: {0}")]
    CaptureError(String),
    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),
}

/// Result type for camera operations
pub type CameraResult<T> = Result<T, CameraError>;

/// Exposure and gain pushed to the camera before streaming
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Exposure duration
    pub exposure: Duration,
    /// Analog gain in dB
    pub gain: f64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            exposure: Duration::from_millis(10),
            gain: 0.0,
        }
    }
}

/// A raw 8-bit camera frame.
///
/// Pixels are stored as (height, width, channels). One channel is grayscale,
/// three channels are BGR and four channels are BGRA.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pixels: Array3<u8>,
}

impl Frame {
    /// Wrap a (height, width, channels) pixel array.
    pub fn new(pixels: Array3<u8>) -> CameraResult<Self> {
        match pixels.dim().2 {
            1 | 3 | 4 => Ok(Self { pixels }),
            n => Err(CameraError::CaptureError(format!(
                "unsupported channel count {n}"
            ))),
        }
    }

    /// Build a single-channel frame from a grayscale array.
    pub fn from_gray(gray: Array2<u8>) -> Self {
        let (height, width) = gray.dim();
        let pixels = gray
            .into_shape_with_order((height, width, 1))
            .unwrap_or_else(|_| Array3::zeros((height, width, 1)));
        Self { pixels }
    }

    pub fn width(&self) -> usize {
        self.pixels.dim().1
    }

    pub fn height(&self) -> usize {
        self.pixels.dim().0
    }

    pub fn channels(&self) -> usize {
        self.pixels.dim().2
    }

    pub fn is_grayscale(&self) -> bool {
        self.channels() == 1
    }

    /// Raw pixel storage
    pub fn pixels(&self) -> &Array3<u8> {
        &self.pixels
    }

    /// View of the single channel of a grayscale frame.
    pub fn gray_view(&self) -> Option<ArrayView2<'_, u8>> {
        self.is_grayscale().then(|| self.pixels.slice(s![.., .., 0]))
    }

    /// Convert to a single-channel image.
    ///
    /// Color frames use the BGR luma weights 0.114, 0.587, 0.299; the alpha
    /// channel of BGRA frames is ignored.
    pub fn to_grayscale(&self) -> Array2<u8> {
        if let Some(gray) = self.gray_view() {
            return gray.to_owned();
        }
        Array2::from_shape_fn((self.height(), self.width()), |(row, col)| {
            let b = self.pixels[[row, col, 0]] as f64;
            let g = self.pixels[[row, col, 1]] as f64;
            let r = self.pixels[[row, col, 2]] as f64;
            (0.114 * b + 0.587 * g + 0.299 * r).round().clamp(0.0, 255.0) as u8
        })
    }
}

/// Capability set every camera driver provides.
///
/// Lifecycle is `connect` → `configure` → `start` → repeated `next_frame` →
/// `stop` → `disconnect`.
pub trait CameraInterface: Send {
    /// Open the device.
    fn connect(&mut self) -> CameraResult<()>;

    /// Apply exposure and gain.
    fn configure(&mut self, settings: &CameraSettings) -> CameraResult<()>;

    /// Begin streaming.
    fn start(&mut self) -> CameraResult<()>;

    /// Stop streaming; the device stays open.
    fn stop(&mut self) -> CameraResult<()>;

    /// Close the device.
    fn disconnect(&mut self) -> CameraResult<()>;

    fn is_connected(&self) -> bool;

    /// Sensor size as (width, height)
    fn resolution(&self) -> (usize, usize);

    /// Block until the next frame is available.
    fn next_frame(&mut self) -> CameraResult<Frame>;

    /// Human readable camera name
    fn name(&self) -> &str;
}
