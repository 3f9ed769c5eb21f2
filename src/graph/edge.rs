//! Relative-pose constraints between keyframes.

use serde::{Deserialize, Serialize};

use super::KeyframeId;
use crate::geometry::SE3;

/// Origin of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeType {
    /// Relative pose reported by the front end's tracker.
    Odometry,
    /// Registered loop closure (local or appearance-based).
    Loop,
    /// Reserved for a motion-model fallback. Never produced.
    MotionModel,
}

/// Relative pose between two keyframes.
///
/// `a_t_b` maps points from B's camera frame into A's camera frame. By
/// convention `id_a < id_b`, and the edge is stored on the keyframe `id_b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id_a: KeyframeId,
    pub id_b: KeyframeId,
    pub a_t_b: SE3,
    pub edge_type: EdgeType,
    pub valid: bool,
    /// Mean scene depth of the two endpoints, used to normalize translation
    /// residuals in the optimizer.
    pub scene_depth: f64,
}

impl Edge {
    /// Front-end odometry between two keyframes.
    pub fn odometry(id_a: KeyframeId, id_b: KeyframeId, a_t_b: SE3, scene_depth: f64) -> Self {
        Self {
            id_a,
            id_b,
            a_t_b,
            edge_type: EdgeType::Odometry,
            valid: true,
            scene_depth,
        }
    }

    /// Loop closure found by registration.
    pub fn new_loop(id_a: KeyframeId, id_b: KeyframeId, a_t_b: SE3, scene_depth: f64) -> Self {
        Self {
            id_a,
            id_b,
            a_t_b,
            edge_type: EdgeType::Loop,
            valid: true,
            scene_depth,
        }
    }

    /// Reorient so that `id_a < id_b`, inverting the transform if needed.
    pub fn normalized(mut self) -> Self {
        if self.id_a > self.id_b {
            std::mem::swap(&mut self.id_a, &mut self.id_b);
            self.a_t_b = self.a_t_b.inverse();
        }
        self
    }

    /// Edges between consecutive keyframes are unique per pair.
    pub fn is_adjacent(&self) -> bool {
        self.id_a.is_adjacent(self.id_b)
    }

    /// True if the edge joins `a` and `b` in either direction.
    pub fn connects(&self, a: KeyframeId, b: KeyframeId) -> bool {
        (self.id_a == a && self.id_b == b) || (self.id_a == b && self.id_b == a)
    }

    /// Length of the relative translation, used for neighbor ordering.
    pub fn distance(&self) -> f64 {
        self.a_t_b.translation.norm()
    }
}
