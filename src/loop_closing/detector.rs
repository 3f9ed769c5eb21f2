//! Appearance-based loop detection over bag-of-words vectors.
//!
//! The database keeps one L2-normalized sparse histogram per keyframe. A
//! query is scored against every entry that is far enough back in time by
//! cosine similarity, and the query keyframe is indexed afterwards.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::graph::{BowVector, Keyframe, KeyframeId};

/// Image-to-candidate lookup used for global loop closure.
pub trait LoopDetector: Send {
    /// Best earlier keyframe that looks like `kf`, if any. Also records `kf`
    /// for future queries.
    fn detect_loop(&mut self, kf: &Keyframe) -> Option<KeyframeId>;

    /// Forget every recorded keyframe.
    fn reset(&mut self);
}

/// Configuration for [`BowLoopDetector`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BowDetectorConfig {
    /// Entries closer than this many ids to the query are ignored.
    pub min_id_gap: usize,
    /// Minimum cosine similarity for a candidate.
    pub min_score: f64,
}

impl Default for BowDetectorConfig {
    fn default() -> Self {
        Self {
            min_id_gap: 15,
            min_score: 0.3,
        }
    }
}

/// Scored database entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopCandidate {
    pub keyframe_id: KeyframeId,
    pub score: f64,
}

/// Linear-scan bag-of-words database.
#[derive(Debug, Default)]
pub struct BowLoopDetector {
    config: BowDetectorConfig,
    entries: Vec<(KeyframeId, BowVector)>,
}

impl BowLoopDetector {
    /// Empty database.
    pub fn new(config: BowDetectorConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
        }
    }

    /// Number of indexed keyframes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has been indexed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Score `bow` against the database without modifying it.
    ///
    /// Ties keep the earliest entry.
    pub fn query(&self, id: KeyframeId, bow: &BowVector) -> Option<LoopCandidate> {
        let query = normalized(bow)?;
        let mut best: Option<LoopCandidate> = None;
        for (other, entry) in &self.entries {
            if other.gap(id) < self.config.min_id_gap {
                continue;
            }
            let score = dot(&query, entry);
            if score < self.config.min_score {
                continue;
            }
            if best.map_or(true, |b| score > b.score) {
                best = Some(LoopCandidate {
                    keyframe_id: *other,
                    score,
                });
            }
        }
        best
    }

    /// Index `bow` under `id`. Zero-norm vectors are not stored.
    pub fn add(&mut self, id: KeyframeId, bow: &BowVector) {
        if let Some(v) = normalized(bow) {
            self.entries.push((id, v));
        }
    }
}

impl LoopDetector for BowLoopDetector {
    fn detect_loop(&mut self, kf: &Keyframe) -> Option<KeyframeId> {
        let bow = kf.bow_vector.as_ref()?;
        let candidate = self.query(kf.id, bow);
        self.add(kf.id, bow);
        if let Some(c) = candidate {
            debug!("appearance candidate for {}: {} (score {:.3})", kf.id, c.keyframe_id, c.score);
        }
        candidate.map(|c| c.keyframe_id)
    }

    fn reset(&mut self) {
        self.entries.clear();
    }
}

fn normalized(bow: &BowVector) -> Option<BowVector> {
    let norm = bow.values().map(|w| w * w).sum::<f64>().sqrt();
    if norm <= 0.0 || !norm.is_finite() {
        return None;
    }
    Some(bow.iter().map(|(k, w)| (*k, w / norm)).collect::<HashMap<_, _>>())
}

fn dot(a: &BowVector, b: &BowVector) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(word, w)| large.get(word).map(|other| w * other))
        .sum()
}
