//! Scaled rigid transform produced by 3D-3D point set alignment.
//!
//! Edges in the keyframe graph are always SE3; an estimate is reduced with
//! [`Sim3::to_se3`] before it becomes an edge.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

use super::SE3;

/// Points map as `p' = s * R * p + t`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    /// Build from a rotation matrix, translation and scale.
    pub fn from_rts(rotation: Matrix3<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation)),
            translation,
            scale,
        }
    }

    /// Apply to a point: s R p + t.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        (self.rotation * p) * self.scale + self.translation
    }

    /// Rigid part of the estimate. Scale is discarded and the translation
    /// kept as estimated.
    pub fn to_se3(&self) -> SE3 {
        SE3::new(self.rotation, self.translation)
    }
}
