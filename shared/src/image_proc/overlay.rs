//! Overlay drawing for visualizing detection results

use ndarray::Array2;

use super::ellipse::DetectedEllipse;

/// Draw the outline of a fitted ellipse onto a grayscale image in place.
///
/// The ellipse is sampled along its parameterization at sub-pixel spacing and
/// each sample is stamped with a square brush of `thickness` pixels. Samples
/// outside the image are clipped. Null ellipses draw nothing.
pub fn draw_ellipse(
    image: &mut Array2<u8>,
    ellipse: &DetectedEllipse,
    value: u8,
    thickness: usize,
) {
    if ellipse.is_null() || !ellipse.major().is_finite() || !ellipse.minor().is_finite() {
        return;
    }

    let (height, width) = image.dim();
    let a = ellipse.major() / 2.0;
    let b = ellipse.minor() / 2.0;
    let (sin_t, cos_t) = ellipse.angle().to_radians().sin_cos();

    let circumference = std::f64::consts::TAU * a.max(b);
    let samples = ((circumference * 4.0).ceil() as usize).max(16);

    let thickness = thickness.max(1) as isize;
    let lo = -(thickness - 1) / 2;
    let hi = thickness / 2;

    for i in 0..samples {
        let t = std::f64::consts::TAU * i as f64 / samples as f64;
        let (sin_p, cos_p) = t.sin_cos();
        let x = ellipse.x_c() + a * cos_p * cos_t - b * sin_p * sin_t;
        let y = ellipse.y_c() + a * cos_p * sin_t + b * sin_p * cos_t;

        let cx = x.round() as isize;
        let cy = y.round() as isize;
        for dy in lo..=hi {
            for dx in lo..=hi {
                let (px, py) = (cx + dx, cy + dy);
                if px >= 0 && py >= 0 && (px as usize) < width && (py as usize) < height {
                    image[[py as usize, px as usize]] = value;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circle_outline_hits_axis_points() {
        let mut image = Array2::zeros((41, 41));
        let circle = DetectedEllipse::new(20.0, 20.0, 20.0, 20.0, 0.0);
        draw_ellipse(&mut image, &circle, 255, 1);

        assert_eq!(image[[20, 30]], 255);
        assert_eq!(image[[20, 10]], 255);
        assert_eq!(image[[10, 20]], 255);
        assert_eq!(image[[30, 20]], 255);
        // interior untouched
        assert_eq!(image[[20, 20]], 0);
    }

    #[test]
    fn test_rotation_moves_major_axis() {
        let mut image = Array2::zeros((41, 41));
        let vertical = DetectedEllipse::new(20.0, 20.0, 8.0, 30.0, 90.0);
        draw_ellipse(&mut image, &vertical, 200, 1);

        assert_eq!(image[[5, 20]], 200);
        assert_eq!(image[[35, 20]], 200);
        assert_eq!(image[[20, 35]], 0);
    }

    #[test]
    fn test_clipped_and_null_ellipses_are_safe() {
        let mut image = Array2::zeros((10, 10));
        let off_edge = DetectedEllipse::new(0.0, 0.0, 30.0, 30.0, 0.0);
        draw_ellipse(&mut image, &off_edge, 255, 2);

        let before = image.clone();
        draw_ellipse(&mut image, &DetectedEllipse::null(), 255, 2);
        assert_eq!(image, before);
    }
}
