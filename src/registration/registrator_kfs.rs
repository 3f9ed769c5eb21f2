//! Keyframe-to-keyframe registration: feature matching, robust pose
//! estimation and acceptance gates, producing a loop edge.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::registrator_3p::{Observation, RansacConfig, Registrator3P, MIN_CORRESPONDENCES};
use super::sim3_solver::{Sim3Solver, Sim3SolverConfig};
use super::{FeatureMatcher, Match};
use crate::error::RegistrationRejected;
use crate::geometry::{CameraModel, SE3};
use crate::graph::{Edge, Keyframe};

/// Acceptance gates and estimator settings for keyframe registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Minimum inlier count for an edge to be accepted.
    pub min_inliers: usize,
    /// Inlier reprojection threshold in pixels.
    pub threshold_px: f64,
    /// Maximum relative rotation of an accepted edge, in degrees.
    pub max_angle_deg: f64,
    /// Use 3D-3D similarity alignment for large loops.
    pub use_sim3: bool,
    pub ransac: RansacConfig,
    pub sim3: Sim3SolverConfig,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            min_inliers: 30,
            threshold_px: 3.0,
            max_angle_deg: 10.0,
            use_sim3: false,
            ransac: RansacConfig::default(),
            sim3: Sim3SolverConfig::default(),
        }
    }
}

/// A registered edge together with the inliers that support it.
#[derive(Debug, Clone)]
pub struct Registration {
    pub edge: Edge,
    pub inliers: Vec<Match>,
    pub observations: Vec<Observation>,
}

/// Matching plus pose estimation between two keyframes.
pub struct RegistratorKFs {
    matcher: Box<dyn FeatureMatcher>,
    reg_3p: Registrator3P,
    reg_sim3: Sim3Solver,
    config: RegistrationConfig,
}

impl RegistratorKFs {
    /// Both solvers share the RANSAC seed from `config`.
    pub fn new(camera: CameraModel, matcher: Box<dyn FeatureMatcher>, config: RegistrationConfig) -> Self {
        let reg_3p = Registrator3P::new(camera, config.ransac.clone());
        let reg_sim3 = Sim3Solver::new(config.sim3.clone(), config.ransac.seed);
        Self {
            matcher,
            reg_3p,
            reg_sim3,
            config,
        }
    }

    /// Thresholds in effect.
    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    /// Register a new keyframe against an older one.
    ///
    /// The resulting edge points from `kf_new` back to `kf_old`
    /// (`id_a = kf_old.id`, `id_b = kf_new.id`).
    pub fn try_and_match(&mut self, kf_new: &Keyframe, kf_old: &Keyframe) -> Result<Edge, RegistrationRejected> {
        self.register_3p(kf_new, kf_old).map(|r| r.edge)
    }

    /// Registration for appearance-based loops, where the two keyframes may
    /// disagree in scale. Falls back to the 3D-2D path unless similarity
    /// alignment is enabled.
    pub fn try_and_match_large_loop(
        &mut self,
        kf_new: &Keyframe,
        kf_old: &Keyframe,
    ) -> Result<Edge, RegistrationRejected> {
        if !self.config.use_sim3 {
            return self.try_and_match(kf_new, kf_old);
        }

        // Query: old (A) map points, train: new (B) map points.
        let matches = self.matcher.match_points(&kf_old.map_points, &kf_new.map_points);
        if matches.len() < self.config.sim3.min_inliers.max(MIN_CORRESPONDENCES) {
            return Err(RegistrationRejected::InsufficientCorrespondences {
                found: matches.len(),
                required: self.config.sim3.min_inliers.max(MIN_CORRESPONDENCES),
            });
        }
        let points_a: Vec<Vector3<f64>> = matches.iter().map(|m| kf_old.map_points[m.query_idx].position).collect();
        let points_b: Vec<Vector3<f64>> = matches.iter().map(|m| kf_new.map_points[m.train_idx].position).collect();

        let estimate = self
            .reg_sim3
            .solve(&points_b, &points_a)
            .ok_or(RegistrationRejected::NoHypothesis)?;
        debug!(
            "sim3 alignment {} -> {}: scale {:.3}, {} inliers",
            kf_new.id,
            kf_old.id,
            estimate.a_s_b.scale,
            estimate.inliers.len()
        );

        let a_t_b = estimate.a_s_b.to_se3();
        self.check_gates(estimate.inliers.len(), &a_t_b)?;
        Ok(self.make_edge(kf_new, kf_old, a_t_b))
    }

    /// 3D-2D registration: A's map points against B's keypoints.
    pub fn register_3p(&mut self, kf_new: &Keyframe, kf_old: &Keyframe) -> Result<Registration, RegistrationRejected> {
        let (kfa, kfb) = (kf_old, kf_new);
        let matches = self.matcher.match_points_to_keypoints(&kfa.map_points, &kfb.keypoints);
        if matches.len() < MIN_CORRESPONDENCES {
            return Err(RegistrationRejected::InsufficientCorrespondences {
                found: matches.len(),
                required: MIN_CORRESPONDENCES,
            });
        }

        let outcome = self.reg_3p.solve_detailed(kfa, kfb, &matches)?;
        let (inliers, observations) =
            self.reg_3p
                .get_inliers(kfa, kfb, &matches, &outcome.a_t_b, self.config.threshold_px);
        debug!(
            "registered {} -> {}: {} matches, {} inliers",
            kf_new.id,
            kf_old.id,
            matches.len(),
            inliers.len()
        );

        self.check_gates(inliers.len(), &outcome.a_t_b)?;
        let edge = self.make_edge(kf_new, kf_old, outcome.a_t_b);
        info!(
            "edge {} -> {} accepted: {} inliers, rotation {:.2}°, translation {:.3}",
            edge.id_b,
            edge.id_a,
            inliers.len(),
            edge.a_t_b.rotation_angle().to_degrees(),
            edge.distance()
        );
        Ok(Registration {
            edge,
            inliers,
            observations,
        })
    }

    fn check_gates(&self, n_inliers: usize, a_t_b: &SE3) -> Result<(), RegistrationRejected> {
        if n_inliers < self.config.min_inliers {
            return Err(RegistrationRejected::TooFewInliers {
                found: n_inliers,
                required: self.config.min_inliers,
            });
        }
        let angle_deg = a_t_b.rotation_angle().to_degrees();
        if angle_deg > self.config.max_angle_deg {
            return Err(RegistrationRejected::RotationTooLarge {
                angle_deg,
                max_deg: self.config.max_angle_deg,
            });
        }
        Ok(())
    }

    fn make_edge(&self, kf_new: &Keyframe, kf_old: &Keyframe, a_t_b: SE3) -> Edge {
        let scene_depth = (kf_new.scene_depth() + kf_old.scene_depth()) / 2.0;
        Edge::new_loop(kf_old.id, kf_new.id, a_t_b, scene_depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EdgeType, KeyframeId};
    use crate::registration::BruteForceMatcher;
    use crate::simulation::{relative_pose, SyntheticWorld};

    fn pose(x: f64, yaw_deg: f64) -> SE3 {
        SE3::from_axis_angle(
            Vector3::new(0.0, yaw_deg.to_radians(), 0.0),
            Vector3::new(x, 0.1, 0.0),
        )
    }

    fn registrator(config: RegistrationConfig) -> RegistratorKFs {
        RegistratorKFs::new(CameraModel::default(), Box::new(BruteForceMatcher::default()), config)
    }

    fn seeded() -> RegistrationConfig {
        let mut config = RegistrationConfig::default();
        config.ransac.seed = Some(3);
        config
    }

    fn pair(old: SE3, new: SE3) -> (Keyframe, Keyframe) {
        let world = SyntheticWorld::wall(CameraModel::default(), 300, 31);
        (
            world.observe(KeyframeId::new(0), &old, old),
            world.observe(KeyframeId::new(20), &new, new),
        )
    }

    #[test]
    fn test_accepts_overlapping_pair() {
        let (old, new) = pair(pose(0.0, 0.0), pose(0.3, 4.0));
        let mut reg = registrator(seeded());
        let registration = reg.register_3p(&new, &old).unwrap();
        let edge = registration.edge;

        assert_eq!(edge.id_a, KeyframeId::new(0));
        assert_eq!(edge.id_b, KeyframeId::new(20));
        assert_eq!(edge.edge_type, EdgeType::Loop);
        assert!(registration.inliers.len() >= 30);
        assert_eq!(registration.inliers.len(), registration.observations.len());

        let expected = relative_pose(&pose(0.0, 0.0), &pose(0.3, 4.0));
        assert!((edge.a_t_b.translation - expected.translation).norm() < 1e-6);
        assert!(edge.a_t_b.rotation.angle_to(&expected.rotation) < 1e-6);
    }

    #[test]
    fn test_rejects_large_rotation() {
        let (old, new) = pair(pose(0.0, 0.0), pose(0.0, 15.0));
        let mut reg = registrator(seeded());
        match reg.try_and_match(&new, &old) {
            Err(RegistrationRejected::RotationTooLarge { angle_deg, max_deg }) => {
                assert!((angle_deg - 15.0).abs() < 1e-3);
                assert_eq!(max_deg, 10.0);
            }
            other => panic!("expected rotation rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_too_few_inliers() {
        let (old, new) = pair(pose(0.0, 0.0), pose(0.2, 0.0));
        let mut reg = registrator(RegistrationConfig {
            min_inliers: 10_000,
            ..seeded()
        });
        assert!(matches!(
            reg.try_and_match(&new, &old),
            Err(RegistrationRejected::TooFewInliers { required: 10_000, .. })
        ));
    }

    #[test]
    fn test_rejects_without_correspondences() {
        // Looking away from the wall.
        let (old, new) = pair(pose(0.0, 0.0), pose(0.0, 180.0));
        let mut reg = registrator(seeded());
        assert!(matches!(
            reg.try_and_match(&new, &old),
            Err(RegistrationRejected::InsufficientCorrespondences { .. })
        ));
    }

    #[test]
    fn test_large_loop_with_similarity_alignment() {
        let (old, new) = pair(pose(0.0, 0.0), pose(0.5, -3.0));
        let mut reg = registrator(RegistrationConfig {
            use_sim3: true,
            ..seeded()
        });
        let edge = reg.try_and_match_large_loop(&new, &old).unwrap();
        let expected = relative_pose(&pose(0.0, 0.0), &pose(0.5, -3.0));
        assert!((edge.a_t_b.translation - expected.translation).norm() < 1e-6);
        assert!(edge.a_t_b.rotation.angle_to(&expected.rotation) < 1e-6);
    }

    #[test]
    fn test_large_loop_falls_back_to_3p() {
        let (old, new) = pair(pose(0.0, 0.0), pose(0.5, -3.0));
        let mut reg = registrator(seeded());
        let edge = reg.try_and_match_large_loop(&new, &old).unwrap();
        assert_eq!(edge.edge_type, EdgeType::Loop);
        assert_eq!(edge.id_b, KeyframeId::new(20));
    }
}
