//! Rotation-group helpers for the SE3 exponential and logarithm.
//!
//! Only the left Jacobian of SO(3) is needed: it maps the translational part
//! of a twist onto the translation of the resulting transform.

use nalgebra::{Matrix3, Vector3};

/// Below this angle the closed forms are replaced by their Taylor series.
const EPS_ANGLE: f64 = 1e-6;

/// `hat(w) * u == w.cross(u)`.
#[inline]
pub fn hat(w: &Vector3<f64>) -> Matrix3<f64> {
    w.cross_matrix()
}

/// Left Jacobian `Jl(w) = I + a [w]x + b [w]x²` with
/// `a = (1 - cos θ) / θ²` and `b = (θ - sin θ) / θ³`.
pub fn left_jacobian(w: &Vector3<f64>) -> Matrix3<f64> {
    let theta = w.norm();
    let w_x = hat(w);
    let (a, b) = if theta < EPS_ANGLE {
        (0.5, 1.0 / 6.0)
    } else {
        let t2 = theta * theta;
        ((1.0 - theta.cos()) / t2, (theta - theta.sin()) / (t2 * theta))
    };
    Matrix3::identity() + w_x * a + w_x * w_x * b
}

/// Inverse of [`left_jacobian`]:
/// `I - [w]x / 2 + c [w]x²` with `c = 1/θ² - (1 + cos θ) / (2 θ sin θ)`.
pub fn left_jacobian_inv(w: &Vector3<f64>) -> Matrix3<f64> {
    let theta = w.norm();
    let w_x = hat(w);
    let c = if theta < EPS_ANGLE {
        1.0 / 12.0
    } else {
        1.0 / (theta * theta) - (1.0 + theta.cos()) / (2.0 * theta * theta.sin())
    };
    Matrix3::identity() - w_x * 0.5 + w_x * w_x * c
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_hat_is_cross_product() {
        let w = Vector3::new(-0.5, 2.0, 1.5);
        let u = Vector3::new(3.0, 0.0, -1.0);
        assert_relative_eq!(hat(&w) * u, w.cross(&u), epsilon = 1e-12);
    }

    #[test]
    fn test_left_jacobian_and_inverse_cancel() {
        for w in [Vector3::new(0.4, -0.1, 0.7), Vector3::new(1e-8, 0.0, 0.0), Vector3::new(0.0, 2.5, 0.0)] {
            assert_relative_eq!(left_jacobian(&w) * left_jacobian_inv(&w), Matrix3::identity(), epsilon = 1e-9);
        }
    }

    #[test]
    fn test_left_jacobian_leaves_rotation_axis_unchanged() {
        let w = Vector3::new(0.0, 0.0, 1.2);
        assert_relative_eq!(left_jacobian(&w) * w, w, epsilon = 1e-12);
    }
}
