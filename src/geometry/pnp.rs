//! Minimal perspective-pose solver.
//!
//! Grunert-style P3P on three bearing vectors, with a fourth correspondence
//! selecting among the up-to-four real solutions. The camera-frame points
//! recovered by P3P are aligned to the input points with Kabsch.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};

use super::{CameraModel, SE3};
use crate::error::GeometryError;

const DEGENERATE_EPS: f64 = 1e-10;
const ROOT_IMAG_TOL: f64 = 1e-6;

/// Estimate the pose mapping `points` into the camera that observed `pixels`.
///
/// Requires exactly four correspondences. The first three drive P3P, the
/// fourth picks the solution with the smallest reprojection error.
pub fn solve_minimal_pose(
    points: &[Vector3<f64>; 4],
    pixels: &[Vector2<f64>; 4],
    camera: &CameraModel,
) -> Result<SE3, GeometryError> {
    let bearings = [
        camera.unproject(&pixels[0]).normalize(),
        camera.unproject(&pixels[1]).normalize(),
        camera.unproject(&pixels[2]).normalize(),
    ];
    let candidates = p3p(&[points[0], points[1], points[2]], &bearings)?;

    candidates
        .into_iter()
        .map(|pose| {
            let err = (camera.project(&pose.transform_point(&points[3])) - pixels[3]).norm_squared();
            (err, pose)
        })
        .filter(|(err, _)| err.is_finite())
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, pose)| pose)
        .ok_or(GeometryError::NoRealSolution)
}

/// P3P: poses `T` with `T * points[i]` lying along `bearings[i]`.
pub fn p3p(points: &[Vector3<f64>; 3], bearings: &[Vector3<f64>; 3]) -> Result<Vec<SE3>, GeometryError> {
    let a = (points[1] - points[2]).norm();
    let b = (points[0] - points[2]).norm();
    let c = (points[0] - points[1]).norm();
    let area = (points[1] - points[0]).cross(&(points[2] - points[0])).norm();
    if a <= DEGENERATE_EPS || b <= DEGENERATE_EPS || c <= DEGENERATE_EPS || area <= DEGENERATE_EPS {
        return Err(GeometryError::DegenerateConfiguration);
    }

    let cos_alpha = bearings[1].dot(&bearings[2]);
    let cos_beta = bearings[0].dot(&bearings[2]);
    let cos_gamma = bearings[0].dot(&bearings[1]);

    let (a2, b2, c2) = (a * a, b * b, c * c);
    let d = (b2 - a2) / c2;
    let e = b2 / c2;

    // With y = u x and z = v x, v = N(u) / D(u), and u solves
    // N² - 2 cosβ N D + E D² = 0.
    let n_poly = [1.0 - d, 2.0 * d * cos_gamma, -(1.0 + d), 0.0, 0.0];
    let d_poly = [2.0 * cos_beta, -2.0 * cos_alpha, 0.0, 0.0, 0.0];
    let e_poly = [1.0 - e, 2.0 * e * cos_gamma, -e, 0.0, 0.0];

    let n2 = poly_mul(&n_poly, &n_poly);
    let nd = poly_mul(&n_poly, &d_poly);
    let ed2 = poly_mul(&e_poly, &poly_mul(&d_poly, &d_poly));

    let mut coeffs = [0.0; 5];
    for i in 0..5 {
        coeffs[i] = n2[i] - 2.0 * cos_beta * nd[i] + ed2[i];
    }

    let mut solutions = Vec::new();
    for u in real_roots(&coeffs) {
        let den = d_poly[0] + d_poly[1] * u;
        let k = 1.0 + u * u - 2.0 * u * cos_gamma;
        if den.abs() < 1e-12 || k <= 1e-12 {
            continue;
        }
        let v = (n_poly[0] + n_poly[1] * u + n_poly[2] * u * u) / den;
        let x = (c2 / k).sqrt();
        let (y, z) = (u * x, v * x);
        if y <= 0.0 || z <= 0.0 {
            continue;
        }
        let cam_points = [bearings[0] * x, bearings[1] * y, bearings[2] * z];
        if let Ok(pose) = pose_from_points(points, &cam_points) {
            solutions.push(pose);
        }
    }

    if solutions.is_empty() {
        return Err(GeometryError::NoRealSolution);
    }
    Ok(solutions)
}

/// Rigid alignment (Kabsch): returns `T` minimizing Σ |T * src_i - dst_i|².
pub fn pose_from_points(src: &[Vector3<f64>], dst: &[Vector3<f64>]) -> Result<SE3, GeometryError> {
    if src.len() != dst.len() || src.len() < 3 {
        return Err(GeometryError::DegenerateConfiguration);
    }

    let n = src.len() as f64;
    let c_src = src.iter().sum::<Vector3<f64>>() / n;
    let c_dst = dst.iter().sum::<Vector3<f64>>() / n;

    let mut h = Matrix3::zeros();
    for (ps, pd) in src.iter().zip(dst) {
        h += (pd - c_dst) * (ps - c_src).transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u.ok_or(GeometryError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(GeometryError::SvdFailed)?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fix = u;
        u_fix.column_mut(2).neg_mut();
        r = u_fix * v_t;
    }

    Ok(SE3::from_rt(r, c_dst - r * c_src))
}

/// Multiply two polynomials (ascending coefficients), truncated to degree 4.
fn poly_mul(a: &[f64; 5], b: &[f64; 5]) -> [f64; 5] {
    let mut out = [0.0; 5];
    for i in 0..5 {
        for j in 0..5 - i {
            out[i + j] += a[i] * b[j];
        }
    }
    out
}

fn poly_eval(coeffs: &[f64], x: f64) -> (f64, f64) {
    let mut value = 0.0;
    let mut deriv = 0.0;
    for &c in coeffs.iter().rev() {
        deriv = deriv * x + value;
        value = value * x + c;
    }
    (value, deriv)
}

/// Real roots of a polynomial given in ascending order, via companion-matrix
/// eigenvalues followed by a few Newton steps.
fn real_roots(coeffs: &[f64]) -> Vec<f64> {
    let scale = coeffs.iter().fold(0.0f64, |m, c| m.max(c.abs()));
    if scale == 0.0 {
        return Vec::new();
    }
    let mut degree = coeffs.len() - 1;
    while degree > 0 && coeffs[degree].abs() < 1e-12 * scale {
        degree -= 1;
    }
    if degree == 0 {
        return Vec::new();
    }

    let lead = coeffs[degree];
    let mut comp = DMatrix::<f64>::zeros(degree, degree);
    for j in 0..degree {
        comp[(0, j)] = -coeffs[degree - 1 - j] / lead;
    }
    for i in 1..degree {
        comp[(i, i - 1)] = 1.0;
    }

    let Some(schur) = nalgebra::linalg::Schur::try_new(comp, f64::EPSILON, 500) else {
        return Vec::new();
    };

    let poly = &coeffs[..=degree];
    let mut roots: Vec<f64> = schur
        .complex_eigenvalues()
        .iter()
        .filter(|z| z.im.abs() <= ROOT_IMAG_TOL * (1.0 + z.re.abs()))
        .map(|z| {
            let mut x = z.re;
            for _ in 0..3 {
                let (f, df) = poly_eval(poly, x);
                if df.abs() < 1e-14 {
                    break;
                }
                x -= f / df;
            }
            x
        })
        .filter(|x| x.is_finite())
        .collect();

    roots.sort_by(|a, b| a.total_cmp(b));
    roots.dedup_by(|a, b| (*a - *b).abs() < 1e-9);
    roots
}
