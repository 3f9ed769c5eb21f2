//! Similarity alignment of two 3D point sets with RANSAC.
//!
//! Used for large loops where the two keyframes' map points may disagree in
//! scale. Finds S such that `points_a ≈ S * points_b`.

use nalgebra::{Matrix3, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::geometry::Sim3;

/// Minimal sample for a similarity transform.
const SAMPLE_SIZE: usize = 3;

/// Sim3 RANSAC parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Sim3SolverConfig {
    pub max_iterations: usize,
    /// Point-to-point inlier distance, in map units.
    pub inlier_threshold: f64,
    pub min_inliers: usize,
    /// Force unit scale (rigid alignment).
    pub fix_scale: bool,
    /// Confidence for the adaptive iteration count.
    pub probability: f64,
}

impl Default for Sim3SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 300,
            inlier_threshold: 0.075,
            min_inliers: 15,
            fix_scale: false,
            probability: 0.99,
        }
    }
}

/// Similarity found by [`Sim3Solver`].
#[derive(Debug, Clone)]
pub struct Sim3Estimate {
    /// Maps points of B onto points of A.
    pub a_s_b: Sim3,
    /// Indices of inlier correspondences, ascending.
    pub inliers: Vec<usize>,
    /// Mean squared error over the inliers.
    pub mse: f64,
}

/// RANSAC over point-to-point correspondences with a closed-form similarity fit.
pub struct Sim3Solver {
    config: Sim3SolverConfig,
    rng: StdRng,
}

impl Sim3Solver {
    /// Without a seed the generator is seeded from entropy.
    pub fn new(config: Sim3SolverConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }

    /// RANSAC over minimal samples, refined on the best consensus set.
    ///
    /// Returns None when fewer than `min_inliers` correspondences agree.
    pub fn solve(&mut self, points_b: &[Vector3<f64>], points_a: &[Vector3<f64>]) -> Option<Sim3Estimate> {
        let n = points_b.len();
        if n < SAMPLE_SIZE || n != points_a.len() || n < self.config.min_inliers {
            return None;
        }

        let mut best: Option<Sim3Estimate> = None;
        let mut max_iter = self.config.max_iterations;
        let mut iteration = 0;

        while iteration < max_iter {
            iteration += 1;
            let sample = rand::seq::index::sample(&mut self.rng, n, SAMPLE_SIZE);
            let sb: Vec<_> = sample.iter().map(|i| points_b[i]).collect();
            let sa: Vec<_> = sample.iter().map(|i| points_a[i]).collect();

            let Some(a_s_b) = align_similarity(&sb, &sa, self.config.fix_scale) else {
                continue;
            };
            let (inliers, mse) = find_inliers(points_b, points_a, &a_s_b, self.config.inlier_threshold);

            if inliers.len() > best.as_ref().map_or(0, |b| b.inliers.len()) {
                if inliers.len() >= self.config.min_inliers {
                    let ratio = inliers.len() as f64 / n as f64;
                    let needed = adaptive_iterations(ratio, self.config.probability, SAMPLE_SIZE);
                    max_iter = max_iter.min(iteration.saturating_add(needed));
                }
                best = Some(Sim3Estimate { a_s_b, inliers, mse });
            }
        }

        let mut best = best.filter(|b| b.inliers.len() >= self.config.min_inliers)?;

        let ib: Vec<_> = best.inliers.iter().map(|&i| points_b[i]).collect();
        let ia: Vec<_> = best.inliers.iter().map(|&i| points_a[i]).collect();
        if let Some(refined) = align_similarity(&ib, &ia, self.config.fix_scale) {
            let (inliers, mse) = find_inliers(points_b, points_a, &refined, self.config.inlier_threshold);
            if inliers.len() >= best.inliers.len() {
                best = Sim3Estimate {
                    a_s_b: refined,
                    inliers,
                    mse,
                };
            }
        }
        Some(best)
    }
}

/// Closed-form similarity (Umeyama): S minimizing Σ |S * src_i - dst_i|².
pub fn align_similarity(src: &[Vector3<f64>], dst: &[Vector3<f64>], fix_scale: bool) -> Option<Sim3> {
    let n = src.len();
    if n < SAMPLE_SIZE || n != dst.len() {
        return None;
    }

    let c_src = src.iter().sum::<Vector3<f64>>() / n as f64;
    let c_dst = dst.iter().sum::<Vector3<f64>>() / n as f64;

    let mut cov = Matrix3::zeros();
    let mut var_src = 0.0;
    for (s, d) in src.iter().zip(dst) {
        let ds = s - c_src;
        cov += (d - c_dst) * ds.transpose();
        var_src += ds.norm_squared();
    }
    if var_src < 1e-12 {
        return None;
    }

    let svd = cov.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut sign = Matrix3::identity();
    if (u * v_t).determinant() < 0.0 {
        sign[(2, 2)] = -1.0;
    }
    let rotation = u * sign * v_t;

    let scale = if fix_scale {
        1.0
    } else {
        let d = svd.singular_values;
        (d[0] + d[1] + sign[(2, 2)] * d[2]) / var_src
    };
    if !(scale.is_finite() && scale > 1e-9) {
        return None;
    }

    let translation = c_dst - scale * (rotation * c_src);
    Some(Sim3::from_rts(rotation, translation, scale))
}

fn find_inliers(
    points_b: &[Vector3<f64>],
    points_a: &[Vector3<f64>],
    a_s_b: &Sim3,
    threshold: f64,
) -> (Vec<usize>, f64) {
    let thresh2 = threshold * threshold;
    let mut inliers = Vec::new();
    let mut sum = 0.0;
    for (i, (pb, pa)) in points_b.iter().zip(points_a).enumerate() {
        let e2 = (a_s_b.transform_point(pb) - pa).norm_squared();
        if e2 < thresh2 {
            inliers.push(i);
            sum += e2;
        }
    }
    let mse = if inliers.is_empty() {
        f64::INFINITY
    } else {
        sum / inliers.len() as f64
    };
    (inliers, mse)
}

/// k = log(1 - p) / log(1 - w^s)
fn adaptive_iterations(inlier_ratio: f64, probability: f64, sample_size: usize) -> usize {
    if inlier_ratio <= 0.0 {
        return usize::MAX;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }
    let log_denom = (1.0 - inlier_ratio.powi(sample_size as i32)).ln();
    if log_denom.abs() < 1e-10 {
        return 1;
    }
    (((1.0 - probability).ln() / log_denom).ceil() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use rand::Rng;

    fn cloud(n: usize, seed: u64) -> Vec<Vector3<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                Vector3::new(
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(1.0..5.0),
                )
            })
            .collect()
    }

    #[test]
    fn test_align_rigid() {
        let src = cloud(10, 1);
        let gt = Sim3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.0, std::f64::consts::FRAC_PI_2),
            translation: Vector3::new(5.0, -3.0, 2.0),
            scale: 1.0,
        };
        let dst: Vec<_> = src.iter().map(|p| gt.transform_point(p)).collect();
        let est = align_similarity(&src, &dst, true).unwrap();
        for (s, d) in src.iter().zip(&dst) {
            assert_relative_eq!(est.transform_point(s), *d, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_align_with_scale() {
        let src = cloud(10, 2);
        let gt = Sim3 {
            rotation: UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
            translation: Vector3::new(0.5, 0.2, -1.0),
            scale: 2.5,
        };
        let dst: Vec<_> = src.iter().map(|p| gt.transform_point(p)).collect();
        let est = align_similarity(&src, &dst, false).unwrap();
        assert_relative_eq!(est.scale, 2.5, epsilon = 1e-9);
        assert_relative_eq!(est.translation, gt.translation, epsilon = 1e-9);
    }

    #[test]
    fn test_ransac_with_outliers() {
        let points_b = cloud(60, 3);
        let gt = Sim3 {
            rotation: UnitQuaternion::from_euler_angles(0.05, 0.1, -0.05),
            translation: Vector3::new(1.0, 2.0, 3.0),
            scale: 1.3,
        };
        let mut points_a: Vec<_> = points_b.iter().map(|p| gt.transform_point(p)).collect();
        let junk = cloud(10, 4);
        for (i, j) in junk.into_iter().enumerate() {
            points_a[i] = j * 3.0;
        }

        let mut solver = Sim3Solver::new(Sim3SolverConfig::default(), Some(11));
        let est = solver.solve(&points_b, &points_a).unwrap();
        assert!(est.inliers.len() >= 50);
        assert_relative_eq!(est.a_s_b.scale, 1.3, epsilon = 1e-6);
        assert_relative_eq!(est.a_s_b.translation, gt.translation, epsilon = 1e-6);
    }

    #[test]
    fn test_too_few_points() {
        let pts = cloud(2, 5);
        let mut solver = Sim3Solver::new(Sim3SolverConfig::default(), Some(1));
        assert!(solver.solve(&pts, &pts).is_none());
    }

    #[test]
    fn test_adaptive_iterations() {
        assert_eq!(adaptive_iterations(1.0, 0.99, 3), 1);
        assert!(adaptive_iterations(0.5, 0.99, 3) > adaptive_iterations(0.9, 0.99, 3));
    }
}
