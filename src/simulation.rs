//! Deterministic synthetic scenes: a seeded landmark cloud observed by a
//! pinhole camera, plus trajectories and noisy odometry to drive the backend.

use std::f64::consts::TAU;

use nalgebra::{Matrix3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::geometry::{CameraModel, SE3};
use crate::graph::{BowVector, Descriptor, Edge, Keyframe, KeyframeId, Keypoint, MapPoint};

/// A landmark in world coordinates with its binary descriptor.
#[derive(Debug, Clone)]
pub struct Landmark {
    pub position: Vector3<f64>,
    pub descriptor: Descriptor,
}

/// Static landmarks and the camera that observes them.
#[derive(Debug, Clone)]
pub struct SyntheticWorld {
    camera: CameraModel,
    landmarks: Vec<Landmark>,
}

impl SyntheticWorld {
    /// A textured slab around `z = 4` spanning `x` in [-4, 8], `y` in [-2, 2].
    pub fn wall(camera: CameraModel, n: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let landmarks = (0..n)
            .map(|_| {
                let position = Vector3::new(
                    rng.gen_range(-4.0..8.0),
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(3.5..4.5),
                );
                Landmark {
                    position,
                    descriptor: random_descriptor(&mut rng),
                }
            })
            .collect();
        Self { camera, landmarks }
    }

    /// Landmarks on a vertical cylinder of `radius` around the world origin,
    /// for trajectories that circle inside it.
    pub fn cylinder(camera: CameraModel, n: usize, radius: f64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let landmarks = (0..n)
            .map(|_| {
                let theta = rng.gen_range(0.0..TAU);
                let r = radius + rng.gen_range(-0.5..0.5);
                let position = Vector3::new(r * theta.cos(), rng.gen_range(-2.0..2.0), r * theta.sin());
                Landmark {
                    position,
                    descriptor: random_descriptor(&mut rng),
                }
            })
            .collect();
        Self { camera, landmarks }
    }

    /// Camera used to project the landmarks.
    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    /// Landmarks in the world frame.
    pub fn landmarks(&self) -> &[Landmark] {
        &self.landmarks
    }

    /// Keyframe seen from `true_pose` but reported at `reported_pose`.
    ///
    /// Map points are the visible landmarks in the camera frame, keypoints
    /// their exact projections, and the bag of words has one word per
    /// visible landmark. The keyframe is not finalized.
    pub fn observe(&self, id: KeyframeId, true_pose: &SE3, reported_pose: SE3) -> Keyframe {
        let c_t_w = true_pose.inverse();
        let mut map_points = Vec::new();
        let mut keypoints = Vec::new();
        let mut bow = BowVector::new();

        for (idx, lm) in self.landmarks.iter().enumerate() {
            let pc = c_t_w.transform_point(&lm.position);
            if !self.camera.is_visible(&pc) {
                continue;
            }
            map_points.push(MapPoint {
                position: pc,
                source_camera: 0,
                descriptor: lm.descriptor,
            });
            keypoints.push(Keypoint {
                position: self.camera.project(&pc),
                descriptor: lm.descriptor,
            });
            bow.insert(idx as u32, 1.0);
        }

        Keyframe::new(id, reported_pose, map_points, keypoints).with_bow_vector(bow)
    }
}

fn random_descriptor(rng: &mut StdRng) -> Descriptor {
    let mut d = [0u8; 32];
    rng.fill(&mut d[..]);
    d
}

/// `a_t_b` between two world poses.
pub fn relative_pose(a: &SE3, b: &SE3) -> SE3 {
    a.inverse().compose(b)
}

/// `n` poses evenly spaced on a horizontal circle, each camera looking
/// radially outward. Pose `n` would coincide with pose 0.
pub fn circle_trajectory(n: usize, radius: f64) -> Vec<SE3> {
    (0..n)
        .map(|i| {
            let theta = TAU * i as f64 / n as f64;
            let forward = Vector3::new(theta.cos(), 0.0, theta.sin());
            let down = Vector3::y();
            let right = down.cross(&forward);
            SE3::from_rt(Matrix3::from_columns(&[right, down, forward]), forward * radius)
        })
        .collect()
}

/// Relative-pose measurements corrupted by uniform noise.
#[derive(Debug)]
pub struct DriftingOdometry {
    rng: StdRng,
    /// Per-axis rotation noise bound, radians.
    pub rotation_noise: f64,
    /// Per-axis translation noise bound.
    pub translation_noise: f64,
}

impl DriftingOdometry {
    /// Noise is drawn uniformly per axis from a generator seeded with `seed`.
    pub fn new(rotation_noise: f64, translation_noise: f64, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            rotation_noise,
            translation_noise,
        }
    }

    /// Perturb a true relative pose.
    pub fn measure(&mut self, a_t_b: &SE3) -> SE3 {
        let r = self.rotation_noise;
        let t = self.translation_noise;
        let noise = SE3::from_axis_angle(
            Vector3::from_fn(|_, _| if r > 0.0 { self.rng.gen_range(-r..r) } else { 0.0 }),
            Vector3::from_fn(|_, _| if t > 0.0 { self.rng.gen_range(-t..t) } else { 0.0 }),
        );
        a_t_b.compose(&noise)
    }

    /// Integrate noisy measurements along `true_poses`, starting at the
    /// first true pose. Returns the drifting poses and one odometry edge per
    /// consecutive pair.
    pub fn integrate(&mut self, true_poses: &[SE3], scene_depth: f64) -> (Vec<SE3>, Vec<Edge>) {
        let Some(first) = true_poses.first() else {
            return (Vec::new(), Vec::new());
        };
        let mut poses = vec![*first];
        let mut edges = Vec::with_capacity(true_poses.len().saturating_sub(1));
        for (i, pair) in true_poses.windows(2).enumerate() {
            let measured = self.measure(&relative_pose(&pair[0], &pair[1]));
            let next = poses[i].compose(&measured);
            poses.push(next);
            edges.push(Edge::odometry(
                KeyframeId::new(i),
                KeyframeId::new(i + 1),
                measured,
                scene_depth,
            ));
        }
        (poses, edges)
    }
}
