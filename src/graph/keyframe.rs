//! Keyframe: a finalized camera observation with its map points and the
//! edges that point back to older keyframes.

use std::collections::BTreeMap;

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

use super::{BowVector, Descriptor, Edge, KeyframeId};
use crate::error::BackendError;
use crate::geometry::SE3;

/// Scene depth assumed for keyframes without usable map points.
const DEFAULT_SCENE_DEPTH: f64 = 1.0;

/// A 3D landmark expressed in its keyframe's camera frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapPoint {
    pub position: Vector3<f64>,
    /// Which camera of the rig triangulated the point.
    pub source_camera: u8,
    pub descriptor: Descriptor,
}

/// A detected image feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    /// Pixel coordinates.
    pub position: Vector2<f64>,
    pub descriptor: Descriptor,
}

/// Neighbor ids ordered by translational distance, nearest first.
///
/// Multi-valued: equal distances are kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NeighborIndex {
    entries: Vec<(f64, KeyframeId)>,
}

impl NeighborIndex {
    /// Insert keeping entries sorted by distance.
    pub fn insert(&mut self, distance: f64, id: KeyframeId) {
        let pos = self.entries.partition_point(|(d, _)| *d <= distance);
        self.entries.insert(pos, (distance, id));
    }

    /// Drop every entry for `id`.
    pub fn remove(&mut self, id: KeyframeId) {
        self.entries.retain(|(_, other)| *other != id);
    }

    /// Ids from nearest to farthest.
    pub fn ids(&self) -> impl Iterator<Item = KeyframeId> + '_ {
        self.entries.iter().map(|(_, id)| *id)
    }

    /// `(distance, id)` pairs from nearest to farthest.
    pub fn iter(&self) -> impl Iterator<Item = &(f64, KeyframeId)> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the keyframe has no neighbors yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A keyframe in the pose graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keyframe {
    pub id: KeyframeId,

    /// Pose reported by the front end (T_wc), uncorrected.
    pub raw_pose: SE3,

    /// Pose after pose-graph optimization (T_wc).
    pub pose: SE3,

    /// Landmarks in this keyframe's camera frame.
    pub map_points: Vec<MapPoint>,

    /// Image features used when this keyframe is the target of a registration.
    pub keypoints: Vec<Keypoint>,

    /// Appearance summary for loop detection.
    pub bow_vector: Option<BowVector>,

    /// Edges to older keyframes, keyed by the other endpoint.
    neighbors: BTreeMap<KeyframeId, Edge>,

    neighbor_index: NeighborIndex,

    scene_depth: f64,

    finalized: bool,
}

impl Keyframe {
    /// Create a keyframe whose optimized pose starts at the raw pose.
    pub fn new(id: KeyframeId, raw_pose: SE3, map_points: Vec<MapPoint>, keypoints: Vec<Keypoint>) -> Self {
        Self {
            id,
            raw_pose,
            pose: raw_pose,
            map_points,
            keypoints,
            bow_vector: None,
            neighbors: BTreeMap::new(),
            neighbor_index: NeighborIndex::default(),
            scene_depth: DEFAULT_SCENE_DEPTH,
            finalized: false,
        }
    }

    /// Attach a bag-of-words vector for appearance-based loop detection.
    pub fn with_bow_vector(mut self, bow: BowVector) -> Self {
        self.bow_vector = Some(bow);
        self
    }

    /// Compute derived fields. Must run exactly once, after ingestion.
    pub fn finalize(&mut self) -> Result<(), BackendError> {
        if self.finalized {
            return Err(BackendError::KeyframeAlreadyFinalized(self.id));
        }
        self.scene_depth = mean_depth(&self.map_points);
        self.finalized = true;
        Ok(())
    }

    /// True once [`Self::finalize`] has run.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Mean depth of the map points in front of the camera.
    pub fn scene_depth(&self) -> f64 {
        self.scene_depth
    }

    /// Replace the map points wholesale. Derived fields follow along once
    /// the keyframe is finalized.
    pub fn replace_map_points(&mut self, points: Vec<MapPoint>) {
        self.map_points = points;
        if self.finalized {
            self.scene_depth = mean_depth(&self.map_points);
        }
    }

    /// Edges stored on this keyframe, keyed by the other endpoint.
    pub fn neighbors(&self) -> &BTreeMap<KeyframeId, Edge> {
        &self.neighbors
    }

    /// Neighbors ordered by translation distance.
    pub fn neighbor_index(&self) -> &NeighborIndex {
        &self.neighbor_index
    }

    /// Edge stored here towards `other`, if any.
    pub fn edge_to(&self, other: KeyframeId) -> Option<&Edge> {
        self.neighbors.get(&other)
    }

    /// Insert an edge pointing back to `edge.id_a` unless one already exists.
    ///
    /// Returns whether the edge was inserted.
    pub fn insert_edge(&mut self, edge: Edge) -> bool {
        let other = edge.id_a;
        if self.neighbors.contains_key(&other) {
            return false;
        }
        self.neighbor_index.insert(edge.distance(), other);
        self.neighbors.insert(other, edge);
        true
    }

    /// Insert an edge, replacing any existing edge to the same keyframe.
    pub fn upsert_edge(&mut self, edge: Edge) {
        let other = edge.id_a;
        if self.neighbors.contains_key(&other) {
            self.neighbor_index.remove(other);
        }
        self.neighbor_index.insert(edge.distance(), other);
        self.neighbors.insert(other, edge);
    }
}

fn mean_depth(points: &[MapPoint]) -> f64 {
    let (sum, count) = points
        .iter()
        .map(|p| p.position.z)
        .filter(|z| *z > 0.0 && z.is_finite())
        .fold((0.0, 0usize), |(s, n), z| (s + z, n + 1));
    if count == 0 {
        DEFAULT_SCENE_DEPTH
    } else {
        sum / count as f64
    }
}
