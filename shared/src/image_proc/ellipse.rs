//! Geometry of a fitted beam-spot ellipse.

use serde::Serialize;
use std::f64::consts::PI;
use std::fmt;

/// Ellipse fitted to the beam spot of one accumulated batch.
///
/// `minor` and `major` are full axis lengths in pixels and `angle` is in
/// degrees. The value is immutable and the derived fields are computed once
/// at construction. The null ellipse (all primary fields NaN) marks a failed
/// detection; its derived fields are NaN as well.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DetectedEllipse {
    x_c: f64,
    y_c: f64,
    minor: f64,
    major: f64,
    angle: f64,
    area: f64,
    perimeter: f64,
    circularity: f64,
    eccentricity: f64,
}

impl DetectedEllipse {
    pub fn new(x_c: f64, y_c: f64, minor: f64, major: f64, angle: f64) -> Self {
        let area = ellipse_area(major, minor);
        let perimeter = ramanujan_perimeter(major, minor);
        Self {
            x_c,
            y_c,
            minor,
            major,
            angle,
            area,
            perimeter,
            circularity: circularity(area, perimeter),
            eccentricity: eccentricity(major, minor),
        }
    }

    /// The detection-failure value.
    pub fn null() -> Self {
        Self::new(f64::NAN, f64::NAN, f64::NAN, f64::NAN, f64::NAN)
    }

    pub fn is_null(&self) -> bool {
        self.x_c.is_nan()
            && self.y_c.is_nan()
            && self.minor.is_nan()
            && self.major.is_nan()
            && self.angle.is_nan()
    }

    pub fn x_c(&self) -> f64 {
        self.x_c
    }

    pub fn y_c(&self) -> f64 {
        self.y_c
    }

    /// Full minor axis length, pixels
    pub fn minor(&self) -> f64 {
        self.minor
    }

    /// Full major axis length, pixels
    pub fn major(&self) -> f64 {
        self.major
    }

    /// Rotation in degrees
    pub fn angle(&self) -> f64 {
        self.angle
    }

    pub fn area(&self) -> f64 {
        self.area
    }

    pub fn perimeter(&self) -> f64 {
        self.perimeter
    }

    pub fn circularity(&self) -> f64 {
        self.circularity
    }

    pub fn eccentricity(&self) -> f64 {
        self.eccentricity
    }
}

impl Default for DetectedEllipse {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for DetectedEllipse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ellipse(center=({:.2}, {:.2}), minor={:.2}, major={:.2}, angle={:.2}, area={:.2}, circularity={:.4})",
            self.x_c, self.y_c, self.minor, self.major, self.angle, self.area, self.circularity
        )
    }
}

fn ellipse_area(major: f64, minor: f64) -> f64 {
    0.25 * PI * major * minor
}

/// Ramanujan's second approximation, written for full axis lengths.
fn ramanujan_perimeter(major: f64, minor: f64) -> f64 {
    0.5 * PI * (3.0 * (major + minor) - ((3.0 * major + minor) * (major + 3.0 * minor)).sqrt())
}

fn circularity(area: f64, perimeter: f64) -> f64 {
    4.0 * PI * area / perimeter.powi(2)
}

fn eccentricity(major: f64, minor: f64) -> f64 {
    (1.0 - (minor / major).powi(2)).sqrt()
}
