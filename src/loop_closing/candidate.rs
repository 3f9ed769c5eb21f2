//! Covisibility-based candidate selection for local loop closure.

use serde::{Deserialize, Serialize};

use crate::geometry::CameraModel;
use crate::graph::{Keyframe, KeyframeId};

/// Filters for local loop candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalLoopConfig {
    /// Candidates closer in id than this are skipped. Must exceed the
    /// front end's own sliding window.
    pub min_id_gap: usize,
    /// Maximum distance between keyframe positions.
    pub max_distance: f64,
    /// Maximum relative rotation, in degrees.
    pub max_angle_deg: f64,
    /// Keyframes skipped after a local loop before searching again.
    pub cooldown: usize,
}

impl Default for LocalLoopConfig {
    fn default() -> Self {
        Self {
            min_id_gap: 15,
            max_distance: 1.0,
            max_angle_deg: 25.0,
            cooldown: 5,
        }
    }
}

/// Number of map points of `kf` and `candidate` that are visible from the
/// other keyframe.
pub fn covisibility_score(kf: &Keyframe, candidate: &Keyframe, camera: &CameraModel) -> usize {
    // Candidate camera frame into kf's camera frame.
    let rel = kf.pose.inverse().compose(&candidate.pose);
    let rel_inv = rel.inverse();

    let from_candidate = candidate
        .map_points
        .iter()
        .filter(|p| camera.is_visible(&rel.transform_point(&p.position)))
        .count();
    let from_kf = kf
        .map_points
        .iter()
        .filter(|p| camera.is_visible(&rel_inv.transform_point(&p.position)))
        .count();
    from_candidate + from_kf
}

/// Pick the older keyframe that best overlaps `kf`.
///
/// Candidates must be at least `min_id_gap` ids away, within `max_distance`
/// and `max_angle_deg` of `kf`. The highest covisibility score wins, the
/// first one scanned on ties. Candidates that see nothing in common are
/// never returned.
pub fn find_best_keyframe_for_matching(
    kf: &Keyframe,
    keyframes: &[Keyframe],
    camera: &CameraModel,
    config: &LocalLoopConfig,
) -> Option<KeyframeId> {
    let max_angle = config.max_angle_deg.to_radians();
    let mut best: Option<KeyframeId> = None;
    let mut best_score = 0;

    for kfi in keyframes {
        if kf.id.gap(kfi.id) < config.min_id_gap {
            continue;
        }
        if (kf.pose.translation - kfi.pose.translation).norm() > config.max_distance {
            continue;
        }
        let rel = kf.pose.inverse().compose(&kfi.pose);
        if rel.rotation_angle() > max_angle {
            continue;
        }

        let score = covisibility_score(kf, kfi, camera);
        if score > best_score {
            best = Some(kfi.id);
            best_score = score;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::simulation::SyntheticWorld;
    use nalgebra::Vector3;

    fn pose(x: f64, yaw_deg: f64) -> SE3 {
        SE3::from_axis_angle(
            Vector3::new(0.0, yaw_deg.to_radians(), 0.0),
            Vector3::new(x, 0.0, 0.0),
        )
    }

    fn build(world: &SyntheticWorld, poses: &[SE3]) -> Vec<Keyframe> {
        poses
            .iter()
            .enumerate()
            .map(|(i, p)| world.observe(KeyframeId::new(i), p, *p))
            .collect()
    }

    #[test]
    fn test_selects_overlapping_old_keyframe() {
        let world = SyntheticWorld::wall(CameraModel::default(), 300, 1);
        let mut poses = vec![pose(0.0, 0.0)];
        poses.extend((1..16).map(|i| pose(3.0 + i as f64 * 0.2, 0.0)));
        poses.push(pose(0.1, 2.0));
        let kfs = build(&world, &poses);

        let best = find_best_keyframe_for_matching(&kfs[16], &kfs, world.camera(), &LocalLoopConfig::default());
        assert_eq!(best, Some(KeyframeId::new(0)));
    }

    #[test]
    fn test_temporal_gap_excludes_recent() {
        let world = SyntheticWorld::wall(CameraModel::default(), 200, 2);
        let poses: Vec<_> = (0..15).map(|_| pose(0.0, 0.0)).collect();
        let kfs = build(&world, &poses);
        assert_eq!(
            find_best_keyframe_for_matching(&kfs[14], &kfs, world.camera(), &LocalLoopConfig::default()),
            None
        );
    }

    #[test]
    fn test_distance_and_angle_filters() {
        let world = SyntheticWorld::wall(CameraModel::default(), 200, 3);
        let mut poses: Vec<_> = (0..16).map(|i| pose(5.0 + i as f64, 0.0)).collect();
        poses[0] = pose(1.5, 0.0);
        poses[1] = pose(0.0, 30.0);
        poses.push(pose(0.0, 0.0));
        let kfs = build(&world, &poses);
        // kf 0 is too far, kf 1 is rotated too much; both are old enough.
        assert_eq!(
            find_best_keyframe_for_matching(&kfs[16], &kfs, world.camera(), &LocalLoopConfig::default()),
            None
        );
    }

    #[test]
    fn test_ties_keep_first() {
        let world = SyntheticWorld::wall(CameraModel::default(), 200, 4);
        let mut poses: Vec<_> = (0..20).map(|i| pose(10.0 + i as f64, 0.0)).collect();
        poses[0] = pose(0.0, 0.0);
        poses[1] = pose(0.0, 0.0);
        poses[19] = pose(0.0, 0.0);
        let kfs = build(&world, &poses);
        assert_eq!(
            find_best_keyframe_for_matching(&kfs[19], &kfs, world.camera(), &LocalLoopConfig::default()),
            Some(KeyframeId::new(0))
        );
    }
}
