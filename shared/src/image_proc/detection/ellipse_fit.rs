//! Ellipse fitting to traced contours.
//!
//! The primary method is the direct least-squares conic fit of Fitzgibbon,
//! Pilu and Fisher (1999) on normalized coordinates. Contours too short or too
//! degenerate for a proper ellipse fall back to the equivalent ellipse of the
//! enclosed polygon's second moments.

use nalgebra::{DMatrix, Matrix2, Matrix3, SymmetricEigen, Vector3, Vector6};

use super::contours::polygon_area;

/// Geometric ellipse parameters in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EllipseFit {
    pub center_x: f64,
    pub center_y: f64,
    /// Full length of the short axis
    pub minor: f64,
    /// Full length of the long axis
    pub major: f64,
    /// Direction of the long axis in degrees, in [0, 180)
    pub angle: f64,
}

/// Fit an ellipse to boundary points given as `[x, y]`.
///
/// Returns `None` when neither the direct fit nor the moment fallback yields a
/// finite ellipse with positive axes.
pub fn fit_ellipse(points: &[[f64; 2]]) -> Option<EllipseFit> {
    fit_direct(points).or_else(|| fit_moments(points))
}

fn fit_direct(points: &[[f64; 2]]) -> Option<EllipseFit> {
    let n = points.len();
    if n < 6 || is_collinear(points) {
        return None;
    }

    let (mean_x, mean_y, scale) = normalization_params(points);

    let mut d = DMatrix::<f64>::zeros(n, 6);
    for (i, &[px, py]) in points.iter().enumerate() {
        let x = (px - mean_x) * scale;
        let y = (py - mean_y) * scale;
        d[(i, 0)] = x * x;
        d[(i, 1)] = x * y;
        d[(i, 2)] = y * y;
        d[(i, 3)] = x;
        d[(i, 4)] = y;
        d[(i, 5)] = 1.0;
    }

    let s = d.transpose() * &d;
    let s11 = s.fixed_view::<3, 3>(0, 0).into_owned();
    let s12 = s.fixed_view::<3, 3>(0, 3).into_owned();
    let s22 = s.fixed_view::<3, 3>(3, 3).into_owned();

    // constraint 4AC - B^2 = 1
    let c1 = Matrix3::new(0.0, 0.0, 2.0, 0.0, -1.0, 0.0, 2.0, 0.0, 0.0);

    let s22_inv = s22.try_inverse()?;
    let m = s11 - s12 * s22_inv * s12.transpose();
    let system = c1.try_inverse()? * m;

    let a1 = constrained_eigenvector(&system)?;
    let a2 = -s22_inv * s12.transpose() * a1;

    let coeffs = Vector6::new(a1[0], a1[1], a1[2], a2[0], a2[1], a2[2]);
    conic_to_ellipse(denormalize_conic(&coeffs, mean_x, mean_y, scale))
}

/// Shift to the centroid and scale so the mean distance is sqrt(2).
fn normalization_params(points: &[[f64; 2]]) -> (f64, f64, f64) {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p[0]).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p[1]).sum::<f64>() / n;

    let mean_dist = points
        .iter()
        .map(|p| ((p[0] - mean_x).powi(2) + (p[1] - mean_y).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let scale = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    (mean_x, mean_y, scale)
}

/// Point scatter with (numerically) no extent across its principal axis.
fn is_collinear(points: &[[f64; 2]]) -> bool {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p[0]).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p[1]).sum::<f64>() / n;
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for p in points {
        let (dx, dy) = (p[0] - mean_x, p[1] - mean_y);
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    let trace = sxx + syy;
    trace <= 0.0 || (sxx * syy - sxy * sxy) <= 1e-12 * trace * trace
}

/// Eigenvector of `system` whose conic satisfies 4AC - B^2 > 0.
///
/// Eigenvalues come from the characteristic cubic; each eigenvector is taken
/// from the adjugate of the shifted matrix.
fn constrained_eigenvector(system: &Matrix3<f64>) -> Option<Vector3<f64>> {
    let a = system;
    let trace = a.trace();
    let minor_sum = a[(0, 0)] * a[(1, 1)] - a[(0, 1)] * a[(1, 0)] + a[(0, 0)] * a[(2, 2)]
        - a[(0, 2)] * a[(2, 0)]
        + a[(1, 1)] * a[(2, 2)]
        - a[(1, 2)] * a[(2, 1)];
    let det = a.determinant();

    let mut best: Option<(f64, Vector3<f64>)> = None;
    for ev in real_cubic_roots(-trace, minor_sum, -det) {
        let shifted = system - Matrix3::identity() * ev;
        let Some(v) = null_vector(&shifted) else {
            continue;
        };
        let constraint = 4.0 * v[0] * v[2] - v[1] * v[1];
        if constraint > 0.0 && best.map_or(true, |(b, _)| ev.abs() < b) {
            best = Some((ev.abs(), v));
        }
    }
    best.map(|(_, v)| v)
}

/// Largest-norm row of the adjugate of a rank-2 matrix.
fn null_vector(m: &Matrix3<f64>) -> Option<Vector3<f64>> {
    let rows = [
        Vector3::new(
            m[(1, 1)] * m[(2, 2)] - m[(1, 2)] * m[(2, 1)],
            -(m[(1, 0)] * m[(2, 2)] - m[(1, 2)] * m[(2, 0)]),
            m[(1, 0)] * m[(2, 1)] - m[(1, 1)] * m[(2, 0)],
        ),
        Vector3::new(
            -(m[(0, 1)] * m[(2, 2)] - m[(0, 2)] * m[(2, 1)]),
            m[(0, 0)] * m[(2, 2)] - m[(0, 2)] * m[(2, 0)],
            -(m[(0, 0)] * m[(2, 1)] - m[(0, 1)] * m[(2, 0)]),
        ),
        Vector3::new(
            m[(0, 1)] * m[(1, 2)] - m[(0, 2)] * m[(1, 1)],
            -(m[(0, 0)] * m[(1, 2)] - m[(0, 2)] * m[(1, 0)]),
            m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)],
        ),
    ];

    let best = rows
        .iter()
        .max_by(|a, b| a.norm_squared().total_cmp(&b.norm_squared()))?;
    let norm_sq = best.norm_squared();
    if norm_sq < 1e-30 || !norm_sq.is_finite() {
        return None;
    }
    Some(best / norm_sq.sqrt())
}

/// Real roots of x^3 + b x^2 + c x + d = 0.
fn real_cubic_roots(b: f64, c: f64, d: f64) -> Vec<f64> {
    let p = c - b * b / 3.0;
    let q = 2.0 * b * b * b / 27.0 - b * c / 3.0 + d;
    let shift = -b / 3.0;
    let disc = -4.0 * p * p * p - 27.0 * q * q;

    if disc >= 0.0 {
        let r = (-p / 3.0).sqrt();
        let cos_arg = if r.abs() < 1e-15 {
            0.0
        } else {
            (-q / (2.0 * r * r * r)).clamp(-1.0, 1.0)
        };
        let theta = cos_arg.acos();
        (0..3)
            .map(|k| {
                2.0 * r * ((theta + 2.0 * std::f64::consts::PI * k as f64) / 3.0).cos() + shift
            })
            .collect()
    } else {
        let sqrt_disc = (q * q / 4.0 + p * p * p / 27.0).sqrt();
        let u = (-q / 2.0 + sqrt_disc).cbrt();
        let v = (-q / 2.0 - sqrt_disc).cbrt();
        vec![u + v + shift]
    }
}

/// Undo x' = s(x - mx), y' = s(y - my).
fn denormalize_conic(c: &Vector6<f64>, mx: f64, my: f64, s: f64) -> [f64; 6] {
    let [a_, b_, c_, d_, e_, f_] = [c[0], c[1], c[2], c[3], c[4], c[5]];
    let s2 = s * s;

    let a = a_ * s2;
    let b = b_ * s2;
    let c = c_ * s2;
    let d = -2.0 * a_ * s2 * mx - b_ * s2 * my + d_ * s;
    let e = -b_ * s2 * mx - 2.0 * c_ * s2 * my + e_ * s;
    let f =
        a_ * s2 * mx * mx + b_ * s2 * mx * my + c_ * s2 * my * my - d_ * s * mx - e_ * s * my + f_;

    [a, b, c, d, e, f]
}

/// Geometric form of the conic A x^2 + B xy + C y^2 + D x + E y + F = 0.
fn conic_to_ellipse([a, b, c, d, e, f]: [f64; 6]) -> Option<EllipseFit> {
    let denom = 4.0 * a * c - b * b;
    if denom <= 0.0 {
        return None;
    }

    let center_x = (b * e - 2.0 * c * d) / denom;
    let center_y = (b * d - 2.0 * a * e) / denom;
    let f_center = a * center_x * center_x
        + b * center_x * center_y
        + c * center_y * center_y
        + d * center_x
        + e * center_y
        + f;
    if f_center.abs() < 1e-15 {
        return None;
    }

    let quadratic = Matrix2::new(a, b / 2.0, b / 2.0, c);
    let eig = SymmetricEigen::new(quadratic);
    // semi-axis^2 = -F'/lambda; the smaller eigenvalue belongs to the long axis
    let (i_major, i_minor) = if eig.eigenvalues[0].abs() <= eig.eigenvalues[1].abs() {
        (0, 1)
    } else {
        (1, 0)
    };
    let semi_major_sq = -f_center / eig.eigenvalues[i_major];
    let semi_minor_sq = -f_center / eig.eigenvalues[i_minor];
    if semi_major_sq <= 0.0 || semi_minor_sq <= 0.0 {
        return None;
    }

    let direction = eig.eigenvectors.column(i_major);
    finite_fit(EllipseFit {
        center_x,
        center_y,
        minor: 2.0 * semi_minor_sq.sqrt(),
        major: 2.0 * semi_major_sq.sqrt(),
        angle: axis_angle_degrees(direction[0], direction[1]),
    })
}

/// Equivalent ellipse of the polygon's area moments.
///
/// A solid ellipse with semi-axis `a` has variance `a^2 / 4` along that axis.
fn fit_moments(points: &[[f64; 2]]) -> Option<EllipseFit> {
    if points.len() < 3 || polygon_area(points) <= 0.0 {
        return None;
    }

    let mut area2 = 0.0;
    let (mut cx, mut cy) = (0.0, 0.0);
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for (p, q) in points.iter().zip(points.iter().cycle().skip(1)) {
        let cross = p[0] * q[1] - q[0] * p[1];
        area2 += cross;
        cx += (p[0] + q[0]) * cross;
        cy += (p[1] + q[1]) * cross;
        sxx += (p[0] * p[0] + p[0] * q[0] + q[0] * q[0]) * cross;
        syy += (p[1] * p[1] + p[1] * q[1] + q[1] * q[1]) * cross;
        sxy += (p[0] * q[1] + 2.0 * p[0] * p[1] + 2.0 * q[0] * q[1] + q[0] * p[1]) * cross;
    }

    let area = area2 / 2.0;
    let center_x = cx / (3.0 * area2);
    let center_y = cy / (3.0 * area2);
    let mu20 = sxx / (12.0 * area) - center_x * center_x;
    let mu02 = syy / (12.0 * area) - center_y * center_y;
    let mu11 = sxy / (24.0 * area) - center_x * center_y;

    let eig = SymmetricEigen::new(Matrix2::new(mu20, mu11, mu11, mu02));
    let (i_major, i_minor) = if eig.eigenvalues[0] >= eig.eigenvalues[1] {
        (0, 1)
    } else {
        (1, 0)
    };
    if eig.eigenvalues[i_minor] <= 0.0 {
        return None;
    }

    let direction = eig.eigenvectors.column(i_major);
    finite_fit(EllipseFit {
        center_x,
        center_y,
        minor: 4.0 * eig.eigenvalues[i_minor].sqrt(),
        major: 4.0 * eig.eigenvalues[i_major].sqrt(),
        angle: axis_angle_degrees(direction[0], direction[1]),
    })
}

fn axis_angle_degrees(dx: f64, dy: f64) -> f64 {
    let angle = dy.atan2(dx).to_degrees().rem_euclid(180.0);
    // rem_euclid can round up to exactly 180
    if angle >= 180.0 {
        0.0
    } else {
        angle
    }
}

fn finite_fit(fit: EllipseFit) -> Option<EllipseFit> {
    let finite = [fit.center_x, fit.center_y, fit.minor, fit.major, fit.angle]
        .iter()
        .all(|v| v.is_finite());
    (finite && fit.minor > 0.0 && fit.major >= fit.minor).then_some(fit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_ellipse(cx: f64, cy: f64, a: f64, b: f64, angle_deg: f64, n: usize) -> Vec<[f64; 2]> {
        let (sin_a, cos_a) = angle_deg.to_radians().sin_cos();
        (0..n)
            .map(|i| {
                let t = std::f64::consts::TAU * i as f64 / n as f64;
                let px = a * t.cos();
                let py = b * t.sin();
                [cx + cos_a * px - sin_a * py, cy + sin_a * px + cos_a * py]
            })
            .collect()
    }

    #[test]
    fn test_direct_fit_recovers_rotated_ellipse() {
        let points = sample_ellipse(100.0, 80.0, 30.0, 15.0, 30.0, 60);
        let fit = fit_ellipse(&points).unwrap();

        assert_relative_eq!(fit.center_x, 100.0, epsilon = 1e-6);
        assert_relative_eq!(fit.center_y, 80.0, epsilon = 1e-6);
        assert_relative_eq!(fit.major, 60.0, epsilon = 1e-6);
        assert_relative_eq!(fit.minor, 30.0, epsilon = 1e-6);
        assert_relative_eq!(fit.angle, 30.0, epsilon = 1e-6);
    }

    #[test]
    fn test_angle_is_folded_into_half_turn() {
        let points = sample_ellipse(50.0, 50.0, 20.0, 10.0, -45.0, 40);
        let fit = fit_ellipse(&points).unwrap();
        assert_relative_eq!(fit.angle, 135.0, epsilon = 1e-6);
    }

    #[test]
    fn test_circle_has_equal_axes() {
        let points = sample_ellipse(10.0, 12.0, 5.0, 5.0, 0.0, 36);
        let fit = fit_ellipse(&points).unwrap();
        assert_relative_eq!(fit.major, 10.0, epsilon = 1e-6);
        assert_relative_eq!(fit.minor, 10.0, epsilon = 1e-6);
        assert!((0.0..180.0).contains(&fit.angle));
    }

    #[test]
    fn test_moments_fallback_for_short_contours() {
        // too few points for the direct fit
        let square = [[0.0, 0.0], [4.0, 0.0], [4.0, 4.0], [0.0, 4.0]];
        let fit = fit_ellipse(&square).unwrap();

        assert_relative_eq!(fit.center_x, 2.0, epsilon = 1e-12);
        assert_relative_eq!(fit.center_y, 2.0, epsilon = 1e-12);
        // variance of a 4x4 square is 16/12
        let axis = 4.0 * (16.0_f64 / 12.0).sqrt();
        assert_relative_eq!(fit.major, axis, epsilon = 1e-9);
        assert_relative_eq!(fit.minor, axis, epsilon = 1e-9);
    }

    #[test]
    fn test_degenerate_inputs_fail() {
        assert!(fit_ellipse(&[]).is_none());
        assert!(fit_ellipse(&[[1.0, 1.0]]).is_none());

        let collinear: Vec<[f64; 2]> = (0..10).map(|i| [i as f64, 2.0 * i as f64]).collect();
        assert!(fit_ellipse(&collinear).is_none());
    }
}
