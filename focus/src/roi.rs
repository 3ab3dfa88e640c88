//! Region of interest normalization and cropping.

use ndarray::{s, ArrayView2};
use shared::settings::RoiCorners;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidRegionError {
    #[error("region ({x1}, {y1})-({x2}, {y2}) collapses to a line")]
    Degenerate { x1: i64, y1: i64, x2: i64, y2: i64 },

    #[error("region {roi:?} lies outside the {width}x{height} frame")]
    OutsideFrame {
        roi: Roi,
        width: usize,
        height: usize,
    },
}

/// Axis-aligned rectangle with `x1 < x2` and `y1 < y2`, end-exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

impl Roi {
    /// Order two user-picked corners, rejecting zero width or height.
    pub fn from_corners(corners: &RoiCorners) -> Result<Self, InvalidRegionError> {
        let (a, b) = (corners.first, corners.second);
        if a.x == b.x || a.y == b.y {
            return Err(InvalidRegionError::Degenerate {
                x1: a.x,
                y1: a.y,
                x2: b.x,
                y2: b.y,
            });
        }
        Ok(Self {
            x1: a.x.min(b.x),
            y1: a.y.min(b.y),
            x2: a.x.max(b.x),
            y2: a.y.max(b.y),
        })
    }

    pub fn width(&self) -> usize {
        (self.x2 - self.x1) as usize
    }

    pub fn height(&self) -> usize {
        (self.y2 - self.y1) as usize
    }

    /// View of `image` inside the region, clipped to the image bounds.
    pub fn crop<'a>(
        &self,
        image: ArrayView2<'a, u8>,
    ) -> Result<ArrayView2<'a, u8>, InvalidRegionError> {
        let (height, width) = image.dim();
        let clip = |v: i64, max: usize| v.clamp(0, max as i64) as usize;
        let (x1, x2) = (clip(self.x1, width), clip(self.x2, width));
        let (y1, y2) = (clip(self.y1, height), clip(self.y2, height));
        if x1 >= x2 || y1 >= y2 {
            return Err(InvalidRegionError::OutsideFrame {
                roi: *self,
                width,
                height,
            });
        }
        Ok(image.slice_move(s![y1..y2, x1..x2]))
    }
}
