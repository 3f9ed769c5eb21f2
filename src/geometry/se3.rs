//! SE3: 6-DOF rigid body transformation.
//!
//! Poses in this crate follow the `T_wc` convention (camera to world). A
//! relative edge transform `a_t_b` maps points from keyframe B's camera frame
//! into keyframe A's camera frame.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use super::so3::{left_jacobian, left_jacobian_inv};

/// Rigid transformation: rotation + translation.
///
/// Transforms points as: p' = R * p + t
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build from a rotation and a translation.
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from a rotation matrix and translation.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot3 = Rotation3::from_matrix_unchecked(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
        }
    }

    /// Construct from a rotation vector (axis * angle) and translation.
    pub fn from_axis_angle(rotvec: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(rotvec),
            translation,
        }
    }

    /// Construct from homogeneous 4x4 matrix [R | t; 0 | 1].
    pub fn from_matrix(mat: Matrix4<f64>) -> Self {
        let rot = mat.fixed_view::<3, 3>(0, 0).into_owned();
        let translation = Vector3::new(mat[(0, 3)], mat[(1, 3)], mat[(2, 3)]);
        Self::from_rt(rot, translation)
    }

    /// Homogeneous 4x4 matrix.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        self.to_isometry().to_homogeneous()
    }

    fn to_isometry(self) -> nalgebra::Isometry3<f64> {
        nalgebra::Isometry3::from_parts(self.translation.into(), self.rotation)
    }

    /// Inverse transformation: [R^T | -R^T t].
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Compose two transforms: self ∘ other.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Apply to a point: R p + t.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Rotation as a 3x3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Magnitude of the rotation in radians, in [0, π].
    pub fn rotation_angle(&self) -> f64 {
        self.rotation.angle()
    }

    /// Log map to the tangent vector [ρ (translation part), φ (rotation part)].
    ///
    /// ```text
    /// φ = log(R),  ρ = Jl(φ)⁻¹ t
    /// ```
    pub fn log(&self) -> Vector6<f64> {
        let phi = self.rotation.scaled_axis();
        let rho = left_jacobian_inv(&phi) * self.translation;
        Vector6::new(rho.x, rho.y, rho.z, phi.x, phi.y, phi.z)
    }

    /// Exponential map from [ρ, φ].
    pub fn exp(tangent: &Vector6<f64>) -> Self {
        let rho = Vector3::new(tangent[0], tangent[1], tangent[2]);
        let phi = Vector3::new(tangent[3], tangent[4], tangent[5]);
        Self {
            rotation: UnitQuaternion::from_scaled_axis(phi),
            translation: left_jacobian(&phi) * rho,
        }
    }

    /// Right perturbation: self ∘ exp(δ).
    pub fn retract(&self, delta: &Vector6<f64>) -> Self {
        self.compose(&Self::exp(delta))
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> SE3 {
        SE3::from_axis_angle(Vector3::new(0.1, -0.3, 0.2), Vector3::new(1.0, -2.0, 0.5))
    }

    #[test]
    fn test_inverse_composes_to_identity() {
        let pose = sample_pose();
        let id = pose.compose(&pose.inverse());
        assert_relative_eq!(id.translation, Vector3::zeros(), epsilon = 1e-12);
        assert!(id.rotation_angle() < 1e-12);
    }

    #[test]
    fn test_transform_point_matches_matrix() {
        let pose = sample_pose();
        let p = Vector3::new(0.3, 0.4, 2.0);
        let m = pose.to_matrix();
        let ph = m * nalgebra::Vector4::new(p.x, p.y, p.z, 1.0);
        assert_relative_eq!(pose.transform_point(&p), ph.xyz(), epsilon = 1e-12);
    }

    #[test]
    fn test_log_exp_roundtrip() {
        let pose = sample_pose();
        let back = SE3::exp(&pose.log());
        assert_relative_eq!(back.translation, pose.translation, epsilon = 1e-10);
        assert!(back.rotation.angle_to(&pose.rotation) < 1e-10);
    }

    #[test]
    fn test_from_matrix() {
        let pose = sample_pose();
        let back = SE3::from_matrix(pose.to_matrix());
        assert_relative_eq!(back.translation, pose.translation, epsilon = 1e-12);
        assert!(back.rotation.angle_to(&pose.rotation) < 1e-10);
    }

    #[test]
    fn test_rotation_angle() {
        let pose = SE3::from_axis_angle(Vector3::new(0.0, 0.0, 0.5), Vector3::zeros());
        assert_relative_eq!(pose.rotation_angle(), 0.5, epsilon = 1e-12);
    }
}
