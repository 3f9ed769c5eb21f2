//! Descriptor matching between keyframes.

use serde::{Deserialize, Serialize};

use crate::graph::{Descriptor, Keypoint, MapPoint};

/// A putative correspondence: `query_idx` indexes the first set,
/// `train_idx` the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: u32,
}

/// Produces putative correspondences from binary descriptors.
pub trait FeatureMatcher: Send + Sync {
    fn match_descriptors(&self, query: &[Descriptor], train: &[Descriptor]) -> Vec<Match>;

    /// Map points of one keyframe against keypoints of another.
    fn match_points_to_keypoints(&self, points: &[MapPoint], keypoints: &[Keypoint]) -> Vec<Match> {
        let query: Vec<Descriptor> = points.iter().map(|p| p.descriptor).collect();
        let train: Vec<Descriptor> = keypoints.iter().map(|k| k.descriptor).collect();
        self.match_descriptors(&query, &train)
    }

    /// Map points of one keyframe against map points of another.
    fn match_points(&self, query: &[MapPoint], train: &[MapPoint]) -> Vec<Match> {
        let q: Vec<Descriptor> = query.iter().map(|p| p.descriptor).collect();
        let t: Vec<Descriptor> = train.iter().map(|p| p.descriptor).collect();
        self.match_descriptors(&q, &t)
    }
}

/// Thresholds for [`BruteForceMatcher`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Maximum Hamming distance for acceptance.
    pub max_distance: u32,
    /// Best / second-best distance ratio.
    pub nn_ratio: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            max_distance: 100,
            nn_ratio: 0.75,
        }
    }
}

/// Hamming distance between two 256-bit descriptors.
#[inline]
pub fn descriptor_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Exhaustive matcher with a ratio test.
///
/// Each train descriptor is assigned to at most one query; when several
/// queries pick the same train descriptor, the closest one wins.
#[derive(Debug, Clone, Default)]
pub struct BruteForceMatcher {
    config: MatcherConfig,
}

impl BruteForceMatcher {
    /// Matcher with the given thresholds.
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }
}

impl FeatureMatcher for BruteForceMatcher {
    fn match_descriptors(&self, query: &[Descriptor], train: &[Descriptor]) -> Vec<Match> {
        let mut best_for_train: Vec<Option<Match>> = vec![None; train.len()];

        for (qi, q) in query.iter().enumerate() {
            let mut best = (u32::MAX, usize::MAX);
            let mut second = u32::MAX;
            for (ti, t) in train.iter().enumerate() {
                let d = descriptor_distance(q, t);
                if d < best.0 {
                    second = best.0;
                    best = (d, ti);
                } else if d < second {
                    second = d;
                }
            }

            let (dist, ti) = best;
            if ti == usize::MAX || dist > self.config.max_distance {
                continue;
            }
            if second != u32::MAX && dist as f64 > self.config.nn_ratio * second as f64 {
                continue;
            }

            let candidate = Match {
                query_idx: qi,
                train_idx: ti,
                distance: dist,
            };
            match &best_for_train[ti] {
                Some(existing) if existing.distance <= dist => {}
                _ => best_for_train[ti] = Some(candidate),
            }
        }

        let mut matches: Vec<Match> = best_for_train.into_iter().flatten().collect();
        matches.sort_by_key(|m| m.query_idx);
        matches
    }
}
