//! Pinhole camera with radial-tangential (plumb-bob) distortion.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Points closer than this to the image plane are treated as behind the camera.
const MIN_DEPTH: f64 = 1e-9;

/// Fixed-point iterations used to invert the distortion model.
const UNDISTORT_ITERATIONS: usize = 10;

/// Camera intrinsics and distortion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Radial distortion coefficients.
    #[serde(default)]
    pub k1: f64,
    #[serde(default)]
    pub k2: f64,
    /// Tangential distortion coefficients.
    #[serde(default)]
    pub p1: f64,
    #[serde(default)]
    pub p2: f64,
    /// Image size in pixels.
    pub width: u32,
    pub height: u32,
}

impl CameraModel {
    /// Undistorted pinhole camera.
    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            k1: 0.0,
            k2: 0.0,
            p1: 0.0,
            p2: 0.0,
            width,
            height,
        }
    }

    /// True if any distortion coefficient is non-zero.
    pub fn has_distortion(&self) -> bool {
        self.k1 != 0.0 || self.k2 != 0.0 || self.p1 != 0.0 || self.p2 != 0.0
    }

    fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2;
        let xd = x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (xd, yd)
    }

    /// Project a point in the camera frame to pixel coordinates.
    ///
    /// Points at or behind the camera map to an infinite pixel, so any
    /// reprojection error computed from them is infinite rather than NaN.
    pub fn project(&self, p: &Vector3<f64>) -> Vector2<f64> {
        if p.z <= MIN_DEPTH {
            return Vector2::new(f64::INFINITY, f64::INFINITY);
        }
        let (xd, yd) = self.distort(p.x / p.z, p.y / p.z);
        Vector2::new(self.fx * xd + self.cx, self.fy * yd + self.cy)
    }

    /// In front of the camera and inside the image bounds.
    pub fn is_visible(&self, p: &Vector3<f64>) -> bool {
        if p.z <= MIN_DEPTH {
            return false;
        }
        let uv = self.project(p);
        uv.x >= 0.0 && uv.y >= 0.0 && uv.x < self.width as f64 && uv.y < self.height as f64
    }

    /// Back-project a pixel to a ray on the normalized image plane (z = 1).
    pub fn unproject(&self, uv: &Vector2<f64>) -> Vector3<f64> {
        let xd = (uv.x - self.cx) / self.fx;
        let yd = (uv.y - self.cy) / self.fy;
        if !self.has_distortion() {
            return Vector3::new(xd, yd, 1.0);
        }

        let (mut x, mut y) = (xd, yd);
        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = x * x + y * y;
            let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2;
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }
        Vector3::new(x, y, 1.0)
    }
}

impl Default for CameraModel {
    fn default() -> Self {
        Self::pinhole(400.0, 400.0, 320.0, 240.0, 640, 480)
    }
}
