//! Preemptive RANSAC for 3D-2D relative pose between two keyframes.
//!
//! A fixed pool of hypotheses is generated from minimal four-point samples,
//! then scored against a random stream of correspondences. After every
//! block of observations the pool is halved, keeping the best-scoring
//! hypotheses, until one is left or the observations run out.

use nalgebra::{Vector2, Vector3};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Match;
use crate::error::RegistrationRejected;
use crate::geometry::{solve_minimal_pose, CameraModel, SE3};
use crate::graph::Keyframe;

/// Correspondences per minimal sample.
const SAMPLE_SIZE: usize = 4;

/// Fewer correspondences than this and registration is not attempted.
pub const MIN_CORRESPONDENCES: usize = 5;

/// Preemptive RANSAC parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacConfig {
    /// Size of the initial hypothesis pool.
    pub n_hypotheses: usize,
    /// Observations scored between two halvings of the pool.
    pub block_size: usize,
    /// Maximum number of correspondences scored.
    pub max_observations: usize,
    /// Sampling gives up after `n_hypotheses * factor` minimal samples.
    pub max_sample_attempts_factor: usize,
    /// Fixed seed for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            n_hypotheses: 300,
            block_size: 10,
            max_observations: 1000,
            max_sample_attempts_factor: 20,
            seed: None,
        }
    }
}

/// A 3D point in A paired with its observed pixel in B.
#[derive(Debug, Clone, Copy)]
pub struct Correspondence {
    pub point: Vector3<f64>,
    pub pixel: Vector2<f64>,
}

/// An inlier as consumed downstream: the point in A and the back-projected
/// ray (normalized image plane) of its pixel in B.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub point: Vector3<f64>,
    pub ray: Vector3<f64>,
}

#[derive(Debug, Clone)]
struct Hypothesis {
    /// Maps points of A into B's camera frame.
    b_t_a: SE3,
    score: f64,
}

/// Result of a preemptive RANSAC run.
#[derive(Debug, Clone)]
pub struct RansacOutcome {
    /// Maps points of B into A's camera frame.
    pub a_t_b: SE3,
    /// Size of the hypothesis pool after each scored observation.
    pub survivors: Vec<usize>,
    pub observations_used: usize,
}

/// Preemption schedule: `max(1, floor(M * 2^-floor(i / B)))`.
pub fn preemption(i: usize, n_hypotheses: usize, block_size: usize) -> usize {
    let halvings = i / block_size.max(1);
    if halvings >= usize::BITS as usize {
        return 1;
    }
    (n_hypotheses >> halvings).max(1)
}

/// Preemptive RANSAC registration of A's map points against B's keypoints.
pub struct Registrator3P {
    camera: CameraModel,
    config: RansacConfig,
    rng: StdRng,
}

impl Registrator3P {
    /// Without `config.seed` the generator is seeded from entropy.
    pub fn new(camera: CameraModel, config: RansacConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { camera, config, rng }
    }

    /// Camera used to project A's points into B.
    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    /// Estimate the transform mapping points of B into A.
    ///
    /// Returns the identity when fewer than five matches are given or no
    /// hypothesis could be generated; callers treat that as failure.
    pub fn solve(&mut self, kfa: &Keyframe, kfb: &Keyframe, matches: &[Match]) -> SE3 {
        match self.solve_detailed(kfa, kfb, matches) {
            Ok(outcome) => outcome.a_t_b,
            Err(reason) => {
                debug!("registration fell back to identity: {}", reason);
                SE3::identity()
            }
        }
    }

    /// Like [`Self::solve`], but reports why no pose was found.
    ///
    /// `matches` index A's map points (query) and B's keypoints (train).
    pub fn solve_detailed(
        &mut self,
        kfa: &Keyframe,
        kfb: &Keyframe,
        matches: &[Match],
    ) -> Result<RansacOutcome, RegistrationRejected> {
        let correspondences = correspondences(kfa, kfb, matches);
        self.solve_correspondences(&correspondences)
    }

    /// Core of [`Self::solve_detailed`] on already paired points.
    pub fn solve_correspondences(
        &mut self,
        correspondences: &[Correspondence],
    ) -> Result<RansacOutcome, RegistrationRejected> {
        let n = correspondences.len();
        if n < MIN_CORRESPONDENCES {
            return Err(RegistrationRejected::InsufficientCorrespondences {
                found: n,
                required: MIN_CORRESPONDENCES,
            });
        }

        let mut hyps = self.generate_hypotheses(correspondences);
        if hyps.is_empty() {
            return Err(RegistrationRejected::NoHypothesis);
        }

        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut self.rng);

        let n_hyp = hyps.len();
        let block = self.config.block_size;
        let mut survivors = Vec::new();
        let mut i = 0;
        let mut pr = preemption(i, n_hyp, block);
        while i < self.config.max_observations && i < n && pr > 1 {
            let c = &correspondences[order[i]];
            for h in hyps.iter_mut() {
                let err = self.camera.project(&h.b_t_a.transform_point(&c.point)) - c.pixel;
                h.score -= (1.0 + err.norm_squared()).ln();
            }

            i += 1;
            let pr_next = preemption(i, n_hyp, block);
            if pr_next < pr && pr_next < hyps.len() {
                hyps.select_nth_unstable_by(pr_next, |a, b| b.score.total_cmp(&a.score));
                hyps.truncate(pr_next);
            }
            pr = pr_next;
            survivors.push(hyps.len());
        }

        let best = hyps
            .iter()
            .max_by(|a, b| a.score.total_cmp(&b.score))
            .ok_or(RegistrationRejected::NoHypothesis)?;

        debug!(
            "preemptive scoring used {} observations, {} hypotheses left",
            i,
            hyps.len()
        );

        Ok(RansacOutcome {
            a_t_b: best.b_t_a.inverse(),
            survivors,
            observations_used: i,
        })
    }

    fn generate_hypotheses(&mut self, correspondences: &[Correspondence]) -> Vec<Hypothesis> {
        let n_hyp = self.config.n_hypotheses;
        let max_attempts = n_hyp.saturating_mul(self.config.max_sample_attempts_factor.max(1));
        let mut hyps = Vec::with_capacity(n_hyp);
        let mut attempts = 0;

        while hyps.len() < n_hyp && attempts < max_attempts {
            attempts += 1;
            let sample = rand::seq::index::sample(&mut self.rng, correspondences.len(), SAMPLE_SIZE);
            let points = [0, 1, 2, 3].map(|k| correspondences[sample.index(k)].point);
            let pixels = [0, 1, 2, 3].map(|k| correspondences[sample.index(k)].pixel);

            // Degenerate samples are dropped and sampling continues.
            if let Ok(b_t_a) = solve_minimal_pose(&points, &pixels, &self.camera) {
                hyps.push(Hypothesis { b_t_a, score: 0.0 });
            }
        }

        if hyps.len() < n_hyp {
            warn!(
                "only {} of {} hypotheses after {} samples",
                hyps.len(),
                n_hyp,
                attempts
            );
        }
        hyps
    }

    /// Matches whose squared reprojection error under `a_t_b` is below
    /// `threshold²`, in input order, plus one observation per inlier.
    pub fn get_inliers(
        &self,
        kfa: &Keyframe,
        kfb: &Keyframe,
        matches: &[Match],
        a_t_b: &SE3,
        threshold: f64,
    ) -> (Vec<Match>, Vec<Observation>) {
        let b_t_a = a_t_b.inverse();
        let thresh2 = threshold * threshold;
        let mut inliers = Vec::new();
        let mut observations = Vec::new();

        for m in matches {
            let (Some(mpa), Some(kpb)) = (kfa.map_points.get(m.query_idx), kfb.keypoints.get(m.train_idx)) else {
                continue;
            };
            let err = self.camera.project(&b_t_a.transform_point(&mpa.position)) - kpb.position;
            if err.norm_squared() < thresh2 {
                inliers.push(*m);
                observations.push(Observation {
                    point: mpa.position,
                    ray: self.camera.unproject(&kpb.position),
                });
            }
        }
        (inliers, observations)
    }
}

fn correspondences(kfa: &Keyframe, kfb: &Keyframe, matches: &[Match]) -> Vec<Correspondence> {
    matches
        .iter()
        .filter_map(|m| {
            let point = kfa.map_points.get(m.query_idx)?.position;
            let pixel = kfb.keypoints.get(m.train_idx)?.position;
            Some(Correspondence { point, pixel })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Keypoint, KeyframeId, MapPoint};
    use approx::assert_relative_eq;
    use rand::Rng;

    fn config(seed: u64) -> RansacConfig {
        RansacConfig {
            n_hypotheses: 64,
            seed: Some(seed),
            ..RansacConfig::default()
        }
    }

    /// Keyframe A holds points in its frame; keyframe B observes them under
    /// `b_t_a`. `n_outliers` of the keypoints are scrambled.
    fn scene(b_t_a: &SE3, n: usize, n_outliers: usize, seed: u64) -> (Keyframe, Keyframe, Vec<Match>) {
        let camera = CameraModel::default();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut points = Vec::new();
        let mut keypoints = Vec::new();
        while points.len() < n {
            let p = Vector3::new(
                rng.gen_range(-1.5..1.5),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(2.5..4.0),
            );
            let pb = b_t_a.transform_point(&p);
            if !camera.is_visible(&pb) {
                continue;
            }
            let mut px = camera.project(&pb);
            if points.len() < n_outliers {
                px = Vector2::new(rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0));
            }
            points.push(MapPoint {
                position: p,
                source_camera: 0,
                descriptor: [0; 32],
            });
            keypoints.push(Keypoint {
                position: px,
                descriptor: [0; 32],
            });
        }
        let kfa = Keyframe::new(KeyframeId::new(0), SE3::identity(), points, vec![]);
        let kfb = Keyframe::new(KeyframeId::new(1), SE3::identity(), vec![], keypoints);
        let matches = (0..n)
            .map(|i| Match {
                query_idx: i,
                train_idx: i,
                distance: 0,
            })
            .collect();
        (kfa, kfb, matches)
    }

    fn ground_truth() -> SE3 {
        SE3::from_axis_angle(Vector3::new(0.02, -0.05, 0.01), Vector3::new(0.15, -0.05, 0.1))
    }

    #[test]
    fn test_preemption_schedule() {
        assert_eq!(preemption(0, 300, 10), 300);
        assert_eq!(preemption(9, 300, 10), 300);
        assert_eq!(preemption(10, 300, 10), 150);
        assert_eq!(preemption(80, 300, 10), 1);
        assert_eq!(preemption(10_000, 300, 10), 1);
        let mut prev = usize::MAX;
        for i in 0..200 {
            let p = preemption(i, 300, 10);
            assert!(p <= prev);
            prev = p;
        }
    }

    #[test]
    fn test_fewer_than_five_matches_returns_identity() {
        let (kfa, kfb, matches) = scene(&ground_truth(), 4, 0, 1);
        let mut reg = Registrator3P::new(CameraModel::default(), config(1));
        let pose = reg.solve(&kfa, &kfb, &matches);
        assert_eq!(pose, SE3::identity());
        assert!(matches!(
            reg.solve_detailed(&kfa, &kfb, &matches),
            Err(RegistrationRejected::InsufficientCorrespondences { found: 4, required: 5 })
        ));
    }

    #[test]
    fn test_recovers_pose_with_outliers() {
        let gt = ground_truth();
        let (kfa, kfb, matches) = scene(&gt, 120, 20, 2);
        let mut reg = Registrator3P::new(CameraModel::default(), config(2));
        let a_t_b = reg.solve(&kfa, &kfb, &matches);
        let expected = gt.inverse();
        assert_relative_eq!(a_t_b.translation, expected.translation, epsilon = 1e-6);
        assert!(a_t_b.rotation.angle_to(&expected.rotation) < 1e-6);
    }

    #[test]
    fn test_survivors_non_increasing_and_single_at_end() {
        let (kfa, kfb, matches) = scene(&ground_truth(), 120, 10, 3);
        let mut reg = Registrator3P::new(CameraModel::default(), config(3));
        let outcome = reg.solve_detailed(&kfa, &kfb, &matches).unwrap();
        let mut prev = usize::MAX;
        for &s in &outcome.survivors {
            assert!(s <= prev);
            prev = s;
        }
        assert_eq!(outcome.survivors.last().copied(), Some(1));
        // 64 hypotheses halve six times, one block of 10 observations each.
        assert_eq!(outcome.observations_used, 60);
    }

    #[test]
    fn test_observation_budget_limits_scoring() {
        let (kfa, kfb, matches) = scene(&ground_truth(), 50, 0, 4);
        let mut reg = Registrator3P::new(
            CameraModel::default(),
            RansacConfig {
                max_observations: 15,
                ..config(4)
            },
        );
        let outcome = reg.solve_detailed(&kfa, &kfb, &matches).unwrap();
        assert_eq!(outcome.observations_used, 15);
        assert_eq!(outcome.survivors.last().copied(), Some(32));
    }

    #[test]
    fn test_get_inliers_deterministic() {
        let gt = ground_truth();
        let (kfa, kfb, matches) = scene(&gt, 60, 15, 5);
        let reg = Registrator3P::new(CameraModel::default(), config(5));
        let a_t_b = gt.inverse();

        let (inliers1, obs1) = reg.get_inliers(&kfa, &kfb, &matches, &a_t_b, 3.0);
        let (inliers2, obs2) = reg.get_inliers(&kfa, &kfb, &matches, &a_t_b, 3.0);
        assert_eq!(inliers1, inliers2);
        assert_eq!(obs1, obs2);
        assert_eq!(inliers1.len(), obs1.len());
        assert!(inliers1.len() >= 45);
        assert!(inliers1.windows(2).all(|w| w[0].query_idx < w[1].query_idx));

        // Each observation ray points at the inlier's position seen from B.
        let b_t_a = gt;
        for (m, o) in inliers1.iter().zip(&obs1) {
            let pb = b_t_a.transform_point(&kfa.map_points[m.query_idx].position);
            assert_relative_eq!(o.ray, pb / pb.z, epsilon = 1e-2);
        }
    }
}
