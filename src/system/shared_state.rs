//! State shared between the front end, the backend and map readers.
//!
//! Two locks, never held together for long:
//! - `pending`: the waiting lists, held only to append or to swap them out
//! - `map`: the keyframe graph and the correction transform

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::error::BackendError;
use crate::geometry::SE3;
use crate::graph::{Edge, Keyframe, KeyframeGraph, KeyframeId, MapPoint};

/// Keyframes and edges submitted since the last drain.
#[derive(Debug, Default)]
pub struct PendingQueue {
    pub keyframes: Vec<Keyframe>,
    pub edges: Vec<Edge>,
}

impl PendingQueue {
    /// True when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty() && self.edges.is_empty()
    }
}

/// The permanent map as seen by readers.
#[derive(Debug)]
pub struct BackendMap {
    pub graph: KeyframeGraph,
    /// Maps the front end's drifting frame onto the optimized one.
    pub correction: SE3,
}

/// Queue, map and flags owned jointly by [`BackendHandle`]s and the backend.
pub struct SharedState {
    pending: Mutex<PendingQueue>,
    pub map: RwLock<BackendMap>,

    /// Set after optimized poses were written; readers clear it.
    map_updated: AtomicBool,

    /// Request the backend thread to exit.
    shutdown_requested: AtomicBool,
}

impl SharedState {
    /// Empty map whose correction starts at `initial_correction`.
    pub fn new(initial_correction: SE3) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(PendingQueue::default()),
            map: RwLock::new(BackendMap {
                graph: KeyframeGraph::new(),
                correction: initial_correction,
            }),
            map_updated: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
        })
    }

    /// Queue a keyframe for the next drain.
    pub fn push_keyframe(&self, kf: Keyframe) {
        self.pending.lock().keyframes.push(kf);
    }

    /// Queue an edge for the next drain.
    pub fn push_edge(&self, edge: Edge) {
        self.pending.lock().edges.push(edge);
    }

    /// Swap out both waiting lists.
    pub fn drain_pending(&self) -> PendingQueue {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Drop everything waiting.
    pub fn clear_pending(&self) {
        *self.pending.lock() = PendingQueue::default();
    }

    /// Waiting `(keyframes, edges)`.
    pub fn pending_len(&self) -> (usize, usize) {
        let pending = self.pending.lock();
        (pending.keyframes.len(), pending.edges.len())
    }

    /// True when optimized poses were written and not yet consumed.
    pub fn is_map_updated(&self) -> bool {
        self.map_updated.load(Ordering::SeqCst)
    }

    /// Set or clear the map-updated flag.
    pub fn set_map_updated(&self, value: bool) {
        self.map_updated.store(value, Ordering::SeqCst);
    }

    /// Ask the backend thread to exit after its current cycle.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    /// True once shutdown was requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}

/// Front-end and reader side of the backend.
///
/// Cheap to clone; every clone talks to the same backend.
#[derive(Clone)]
pub struct BackendHandle {
    shared: Arc<SharedState>,
}

impl BackendHandle {
    /// Handle onto an existing backend.
    pub fn new(shared: Arc<SharedState>) -> Self {
        Self { shared }
    }

    /// Queue a keyframe. Ids must be contiguous from 0 across submissions.
    pub fn submit_keyframe(&self, kf: Keyframe) {
        self.shared.push_keyframe(kf);
    }

    /// Queue an odometry edge between two submitted keyframes.
    pub fn submit_edge(&self, edge: Edge) {
        self.shared.push_edge(edge);
    }

    /// Read access to the permanent map. Poses may change between reads;
    /// use [`Self::is_map_updated`] to detect fresh results.
    pub fn map(&self) -> RwLockReadGuard<'_, BackendMap> {
        self.shared.map.read()
    }

    /// Keyframes accepted into the map so far. Queued ones are not counted.
    pub fn keyframe_count(&self) -> usize {
        self.shared.map.read().graph.len()
    }

    /// Optimized poses of all keyframes, by id.
    pub fn poses(&self) -> Vec<SE3> {
        self.shared.map.read().graph.keyframes().iter().map(|kf| kf.pose).collect()
    }

    /// Transform taking raw front-end poses to optimized ones.
    pub fn correction(&self) -> SE3 {
        self.shared.map.read().correction
    }

    /// Correct a drifting front-end pose into the optimized frame.
    pub fn correct(&self, raw_pose: &SE3) -> SE3 {
        self.correction().compose(raw_pose)
    }

    /// True when optimized poses were written since the flag was last cleared.
    pub fn is_map_updated(&self) -> bool {
        self.shared.is_map_updated()
    }

    /// Readers pass `false` after consuming an update.
    pub fn set_map_updated(&self, value: bool) {
        self.shared.set_map_updated(value);
    }

    /// Replace the map points of a keyframe already in the map.
    pub fn update_points(&self, id: KeyframeId, points: Vec<MapPoint>) -> Result<(), BackendError> {
        self.shared.map.write().graph.update_points(id, points)
    }

    /// Overwrite the raw and optimized poses of a keyframe already in the map.
    pub fn update_keyframe_pose(&self, id: KeyframeId, raw_pose: SE3, pose: SE3) -> Result<(), BackendError> {
        self.shared.map.write().graph.update_keyframe_pose(id, raw_pose, pose)
    }

    /// State shared with the backend this handle talks to.
    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }
}
