//! User-adjustable settings for a focusing session.
//!
//! Settings are loaded once by the composition root (see
//! [`crate::config_storage::ConfigStorage`]) and handed to each component as a
//! read-only snapshot.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::camera_interface::CameraSettings;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid objective powers literal {0:?}, expected \"[numerator, denominator]\"")]
    InvalidPowers(String),
    #[error("threshold {0} outside [-1, 255]")]
    InvalidThreshold(i32),
    #[error("batch size must be at least 1")]
    EmptyBatch,
}

/// A pixel coordinate supplied by the user, e.g. a corner of the ROI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

impl Point {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

/// Region of interest as two opposite corners in arbitrary order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoiCorners {
    pub first: Point,
    pub second: Point,
}

impl RoiCorners {
    pub fn new(first: Point, second: Point) -> Self {
        Self { first, second }
    }
}

/// Accumulation and detection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccumulationSettings {
    /// Frames summed into one measurement
    pub images_to_accumulate: usize,
    /// Binarization threshold, -1 selects Otsu
    pub threshold: i32,
    pub gaussian_filter: bool,
    /// Gaussian kernel size, must be odd
    pub gaussian_kernel: usize,
    /// Persist normalized and annotated images for each batch
    pub save_images: bool,
    /// Keep processing frames for display while no measurement is requested
    pub image_processing: bool,
}

impl Default for AccumulationSettings {
    fn default() -> Self {
        Self {
            images_to_accumulate: 30,
            threshold: -1,
            gaussian_filter: false,
            gaussian_kernel: 11,
            save_images: false,
            image_processing: true,
        }
    }
}

impl AccumulationSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.images_to_accumulate == 0 {
            return Err(SettingsError::EmptyBatch);
        }
        if !(-1..=255).contains(&self.threshold) {
            return Err(SettingsError::InvalidThreshold(self.threshold));
        }
        Ok(())
    }
}

/// Nelder-Mead run parameters.
///
/// Tolerances are stored as base-10 exponents the way they are entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    /// Starting currents (Q1, Q2) in amperes
    pub initial: [f64; 2],
    /// Inclusive (lower, upper) current bounds for Q1
    pub q1_bounds: (f64, f64),
    /// Inclusive (lower, upper) current bounds for Q2
    pub q2_bounds: (f64, f64),
    pub xatol_exponent: i32,
    pub fatol_exponent: i32,
    /// 0 means no limit
    pub maxiter: usize,
    /// 0 means no limit
    pub maxfev: usize,
    /// Objective exponents as a literal "[numerator, denominator]"
    pub powers: String,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            initial: [0.0, 0.0],
            q1_bounds: (0.0, 100.0),
            q2_bounds: (0.0, 100.0),
            xatol_exponent: -2,
            fatol_exponent: 6,
            maxiter: 100,
            maxfev: 100,
            powers: "[1, 2]".to_string(),
        }
    }
}

pub const DEFAULT_POWERS: (i32, i32) = (1, 2);

impl OptimizerSettings {
    pub fn xatol(&self) -> f64 {
        10f64.powi(self.xatol_exponent)
    }

    pub fn fatol(&self) -> f64 {
        10f64.powi(self.fatol_exponent)
    }

    pub fn bounds(&self) -> [(f64, f64); 2] {
        [self.q1_bounds, self.q2_bounds]
    }

    /// Objective exponents, falling back to (1, 2) when the literal is malformed.
    pub fn powers(&self) -> (i32, i32) {
        match parse_powers(&self.powers) {
            Ok(powers) => powers,
            Err(e) => {
                warn!("{e}; using default powers {:?}", DEFAULT_POWERS);
                DEFAULT_POWERS
            }
        }
    }
}

/// Parse a two-integer literal such as `"[1, 2]"`, `"(1, 2)"` or `"1, 2"`.
pub fn parse_powers(literal: &str) -> Result<(i32, i32), SettingsError> {
    let invalid = || SettingsError::InvalidPowers(literal.to_string());
    let trimmed = literal.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .or_else(|| {
            trimmed
                .strip_prefix('(')
                .and_then(|rest| rest.strip_suffix(')'))
        })
        .unwrap_or(trimmed);
    let values: Vec<i32> = serde_json::from_str(&format!("[{inner}]")).map_err(|_| invalid())?;
    match values.as_slice() {
        [numerator, denominator] => Ok((*numerator, *denominator)),
        _ => Err(invalid()),
    }
}

/// Serial link and polling parameters for the two Genesys supplies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerSupplySettings {
    pub port: Option<String>,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    /// Bus address of the supply driving Q1
    pub q1_address: u8,
    /// Bus address of the supply driving Q2
    pub q2_address: u8,
    pub refresh_interval_ms: u64,
    /// Upper bound on how long a caller waits for one queued command
    pub call_timeout_ms: u64,
}

impl Default for PowerSupplySettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 9600,
            read_timeout_ms: 500,
            q1_address: 6,
            q2_address: 7,
            refresh_interval_ms: 1000,
            call_timeout_ms: 5000,
        }
    }
}

impl PowerSupplySettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Everything a focusing session reads at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusSettings {
    pub accumulation: AccumulationSettings,
    pub optimizer: OptimizerSettings,
    pub power_supply: PowerSupplySettings,
    pub camera: CameraSettings,
    pub roi: Option<RoiCorners>,
}

impl FocusSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.accumulation.validate()
    }
}
