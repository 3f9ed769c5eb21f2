//! Index-addressed arena of keyframes plus the permanent edge list.

use tracing::debug;

use super::{Edge, Keyframe, KeyframeId, MapPoint};
use crate::error::BackendError;
use crate::geometry::SE3;

/// Keyframes stored by id (`keyframes[i].id == i`) and the edges between them.
///
/// Edges reach the neighbor maps in two steps. Incoming odometry edges are
/// merged into the permanent list and a local batch; the batch is committed
/// onto the keyframes once every keyframe of a drain cycle has been added.
#[derive(Debug, Default)]
pub struct KeyframeGraph {
    keyframes: Vec<Keyframe>,
    edges: Vec<Edge>,
    local_edges: Vec<Edge>,
}

impl KeyframeGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keyframes.
    pub fn len(&self) -> usize {
        self.keyframes.len()
    }

    /// True when no keyframe has been pushed.
    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    /// All keyframes in id order.
    pub fn keyframes(&self) -> &[Keyframe] {
        &self.keyframes
    }

    /// Mutable slice of the keyframes. The slice cannot grow or shrink, so
    /// ids stay aligned with positions.
    pub fn keyframes_mut(&mut self) -> &mut [Keyframe] {
        &mut self.keyframes
    }

    /// Keyframe with the given id, `None` if it has not been pushed yet.
    pub fn get(&self, id: KeyframeId) -> Option<&Keyframe> {
        self.keyframes.get(id.index())
    }

    /// Mutable variant of [`Self::get`].
    pub fn get_mut(&mut self, id: KeyframeId) -> Option<&mut Keyframe> {
        self.keyframes.get_mut(id.index())
    }

    /// Most recently pushed keyframe.
    pub fn latest(&self) -> Option<&Keyframe> {
        self.keyframes.last()
    }

    /// Id of the most recently pushed keyframe.
    pub fn latest_id(&self) -> Option<KeyframeId> {
        self.keyframes.last().map(|kf| kf.id)
    }

    /// Permanent edge list.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Edges merged but not yet committed onto the keyframes.
    pub fn local_edges(&self) -> &[Edge] {
        &self.local_edges
    }

    /// Merge a submitted edge into the permanent list and the local batch.
    ///
    /// An edge between consecutive keyframes replaces any earlier edge for
    /// the same pair; other edges accumulate.
    pub fn merge_edge(&mut self, edge: Edge) {
        let edge = edge.normalized();
        upsert(&mut self.edges, edge.clone());
        upsert(&mut self.local_edges, edge);
    }

    /// Append a keyframe. Its id must equal the current number of keyframes.
    pub fn push_keyframe(&mut self, kf: Keyframe) -> Result<KeyframeId, BackendError> {
        let expected = self.keyframes.len();
        if kf.id.index() != expected {
            return Err(BackendError::GraphContiguityViolation {
                expected,
                got: kf.id.index(),
            });
        }
        let id = kf.id;
        self.keyframes.push(kf);
        Ok(id)
    }

    /// Attach a registered loop edge to its newer endpoint.
    ///
    /// Returns false when the keyframe already has an edge to the older one.
    pub fn add_loop_edge(&mut self, edge: Edge) -> Result<bool, BackendError> {
        let edge = edge.normalized();
        let kf = self
            .keyframes
            .get_mut(edge.id_b.index())
            .ok_or(BackendError::UnknownKeyframe(edge.id_b))?;
        let inserted = kf.insert_edge(edge.clone());
        if inserted {
            self.edges.push(edge);
        }
        Ok(inserted)
    }

    /// Commit the local batch onto the neighbor maps of each edge's newer
    /// endpoint, replacing an existing edge to the same keyframe.
    ///
    /// Edges whose newer endpoint has not arrived yet stay in the batch.
    /// Returns the committed edges in batch order.
    pub fn commit_local_edges(&mut self) -> Vec<Edge> {
        let len = self.keyframes.len();
        let (ready, waiting): (Vec<Edge>, Vec<Edge>) = std::mem::take(&mut self.local_edges)
            .into_iter()
            .partition(|e| e.id_b.index() < len);

        for edge in &ready {
            self.keyframes[edge.id_b.index()].upsert_edge(edge.clone());
        }
        if !waiting.is_empty() {
            debug!("{} edges wait for their keyframe", waiting.len());
        }
        self.local_edges = waiting;
        ready
    }

    /// Replace the map points of an existing keyframe.
    pub fn update_points(&mut self, id: KeyframeId, points: Vec<MapPoint>) -> Result<(), BackendError> {
        self.get_mut(id)
            .ok_or(BackendError::UnknownKeyframe(id))?
            .replace_map_points(points);
        Ok(())
    }

    /// Overwrite both poses of an existing keyframe.
    pub fn update_keyframe_pose(&mut self, id: KeyframeId, raw_pose: SE3, pose: SE3) -> Result<(), BackendError> {
        let kf = self.get_mut(id).ok_or(BackendError::UnknownKeyframe(id))?;
        kf.raw_pose = raw_pose;
        kf.pose = pose;
        Ok(())
    }

    /// Drop every keyframe and edge.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.edges.clear();
        self.local_edges.clear();
    }
}

fn upsert(list: &mut Vec<Edge>, edge: Edge) {
    if edge.is_adjacent() {
        if let Some(slot) = list
            .iter_mut()
            .find(|e| e.id_a == edge.id_a && e.id_b == edge.id_b)
        {
            *slot = edge;
            return;
        }
    }
    list.push(edge);
}
