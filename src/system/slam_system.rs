//! Backend orchestrator.
//!
//! One drain cycle (`spin_once`):
//! 1. Swap out the waiting lists
//! 2. Merge submitted edges into the permanent list and the local batch
//! 3. Append keyframes, searching for local and then global loops
//! 4. Commit the local batch onto the keyframes and the solver
//! 5. Optimize a bounded subgraph when required and publish the result

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::geometry::CameraModel;
use crate::graph::{Edge, EdgeType, Keyframe, KeyframeId};
use crate::io::{KeyframeArchive, YamlKeyframeArchive};
use crate::loop_closing::{find_best_keyframe_for_matching, BowLoopDetector, LoopCooldown, LoopDetector};
use crate::optimizer::{select_subgraph, LmPoseGraph, OptimizationSummary, PoseGraphSolver};
use crate::registration::{BruteForceMatcher, FeatureMatcher, RegistratorKFs};

use super::shared_state::{BackendHandle, SharedState};

/// A loop edge added during a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopEvent {
    pub new_id: KeyframeId,
    pub old_id: KeyframeId,
}

/// Outcome of an optimization run.
#[derive(Debug, Clone)]
pub struct OptimizationReport {
    /// Subgraph cap that was requested.
    pub cap: usize,
    pub subgraph_size: usize,
    pub keyframes_updated: usize,
    pub summary: OptimizationSummary,
}

/// What happened during one `spin_once`.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub keyframes_added: usize,
    pub edges_merged: usize,
    pub edges_committed: usize,
    pub local_loops: Vec<LoopEvent>,
    pub global_loops: Vec<LoopEvent>,
    /// Any loop edge was added this cycle.
    pub loop_detected: bool,
    /// Trigger flags as they stood before optimization.
    pub optimization_required: bool,
    pub loop_required: bool,
    pub optimization: Option<OptimizationReport>,
}

impl CycleReport {
    /// True when the cycle found nothing to do.
    pub fn is_idle(&self) -> bool {
        self.keyframes_added == 0 && self.edges_merged == 0 && self.optimization.is_none()
    }
}

/// Counters accumulated over the backend's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub cycles: usize,
    pub keyframes: usize,
    pub local_loops: usize,
    pub global_loops: usize,
    pub registrations_rejected: usize,
    pub optimizations: usize,
    pub optimizer_failures: usize,
}

/// The backend: owns the loop-closure machinery and the solver, and
/// publishes into [`SharedState`].
pub struct SlamSystem {
    config: BackendConfig,
    camera: CameraModel,
    shared: Arc<SharedState>,
    registrator: RegistratorKFs,
    solver: Box<dyn PoseGraphSolver>,
    detector: Box<dyn LoopDetector>,
    archive: Option<Box<dyn KeyframeArchive>>,
    local_cooldown: LoopCooldown,
    global_cooldown: LoopCooldown,
    optimization_required: bool,
    loop_required: bool,
    stats: BackendStats,
}

impl SlamSystem {
    /// Backend with the default collaborators: brute-force matching,
    /// Levenberg-Marquardt pose graph and bag-of-words loop detection.
    pub fn new(config: BackendConfig) -> Result<Self> {
        config.validate()?;
        let archive: Option<Box<dyn KeyframeArchive>> = if config.save_keyframes {
            Some(Box::new(YamlKeyframeArchive::new(&config.archive_dir)?))
        } else {
            None
        };

        let camera = config.camera;
        let matcher = Box::new(BruteForceMatcher::new(config.matcher.clone()));
        let registrator = RegistratorKFs::new(camera, matcher, config.registration.clone());
        let solver = Box::new(LmPoseGraph::new(config.pose_graph.clone()));
        let detector = Box::new(BowLoopDetector::new(config.detector.clone()));

        Ok(Self {
            camera,
            shared: SharedState::new(config.body_from_camera()),
            registrator,
            solver,
            detector,
            archive,
            local_cooldown: LoopCooldown::new(config.local_loop.cooldown),
            global_cooldown: LoopCooldown::new(config.global_loop.cooldown),
            optimization_required: false,
            loop_required: false,
            stats: BackendStats::default(),
            config,
        })
    }

    /// Replace the pose-graph solver.
    pub fn with_solver(mut self, solver: Box<dyn PoseGraphSolver>) -> Self {
        self.solver = solver;
        self
    }

    /// Replace the appearance-based loop detector.
    pub fn with_detector(mut self, detector: Box<dyn LoopDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Archive every finalized keyframe into `archive`.
    pub fn with_archive(mut self, archive: Box<dyn KeyframeArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Replace the feature matcher used by loop registration.
    pub fn with_matcher(mut self, matcher: Box<dyn FeatureMatcher>) -> Self {
        self.registrator = RegistratorKFs::new(self.camera, matcher, self.config.registration.clone());
        self
    }

    /// Handle for the front end and map readers.
    pub fn handle(&self) -> BackendHandle {
        BackendHandle::new(Arc::clone(&self.shared))
    }

    /// State shared with handles and the runner thread.
    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Configuration the backend was built with.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Counters since construction. Not cleared by [`Self::reset`].
    pub fn stats(&self) -> &BackendStats {
        &self.stats
    }

    /// An optimization is pending, including one that failed last cycle.
    pub fn optimization_required(&self) -> bool {
        self.optimization_required
    }

    /// The pending optimization follows a loop closure and uses the loop cap.
    pub fn loop_required(&self) -> bool {
        self.loop_required
    }

    /// Run one drain cycle.
    ///
    /// A contiguity violation aborts the cycle; the keyframes after the
    /// offending one are dropped, while the keyframes, edges and loop flags
    /// accepted before it are kept. An optimizer failure leaves
    /// `optimization_required` set so the next cycle retries.
    pub fn spin_once(&mut self) -> Result<CycleReport, BackendError> {
        let pending = self.shared.drain_pending();
        let mut report = CycleReport::default();
        if pending.is_empty() && !self.optimization_required {
            return Ok(report);
        }
        self.stats.cycles += 1;
        debug!(
            "drained {} keyframes and {} edges",
            pending.keyframes.len(),
            pending.edges.len()
        );

        report.edges_merged = self.add_edges(pending.edges);
        self.add_keyframes(pending.keyframes, &mut report)?;

        report.optimization_required = self.optimization_required;
        report.loop_required = self.loop_required;
        report.optimization = self.run_pgo()?;
        Ok(report)
    }

    fn add_edges(&mut self, edges: Vec<Edge>) -> usize {
        let n = edges.len();
        let mut map = self.shared.map.write();
        for edge in edges {
            map.graph.merge_edge(edge);
        }
        if n > 0 {
            debug!("{} edges in the local batch", map.graph.local_edges().len());
        }
        n
    }

    /// Append `keyframes` in order, searching for loops after each one.
    ///
    /// The local batch is committed and the trigger flags are updated even
    /// when a keyframe fails partway through, so the keyframes and loop edges
    /// accepted before the failure stay consistent with the solver.
    fn add_keyframes(&mut self, keyframes: Vec<Keyframe>, report: &mut CycleReport) -> Result<(), BackendError> {
        let mut loop_found = false;
        let mut failure = None;
        for kf in keyframes {
            if let Err(e) = self.add_keyframe(kf, report, &mut loop_found) {
                failure = Some(e);
                break;
            }
        }

        let committed = self.shared.map.write().graph.commit_local_edges();
        for edge in &committed {
            self.solver
                .add_edge(edge, edge.edge_type == EdgeType::Loop, edge.scene_depth);
        }
        report.edges_committed = committed.len();

        if loop_found {
            self.optimization_required = true;
            self.loop_required = true;
        }
        report.loop_detected = loop_found;

        let len = self.shared.map.read().graph.len();
        if len + 1 < self.config.local_window {
            self.optimization_required = false;
        }
        debug!(
            "{} keyframes in the graph, optimization required: {}, loop: {}",
            len, self.optimization_required, self.loop_required
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Finalize and append one keyframe, then try a local loop and, unless a
    /// loop was already found this cycle, a global one.
    fn add_keyframe(&mut self, mut kf: Keyframe, report: &mut CycleReport, loop_found: &mut bool) -> Result<(), BackendError> {
        let id = kf.id;
        {
            let mut map = self.shared.map.write();
            let expected = map.graph.len();
            if id.index() != expected {
                return Err(BackendError::GraphContiguityViolation {
                    expected,
                    got: id.index(),
                });
            }
            kf.finalize()?;
            self.solver.add_keyframe(&kf);
            if let Some(archive) = self.archive.as_mut() {
                if let Err(e) = archive.store(&kf) {
                    warn!("failed to archive keyframe {}: {:#}", id, e);
                }
            }
            map.graph.push_keyframe(kf)?;
        }
        report.keyframes_added += 1;
        self.stats.keyframes += 1;

        if id.index() + 1 >= self.config.local_window {
            self.optimization_required = true;
        }

        if self.local_cooldown.is_ready(id) {
            if let Some(event) = self.try_local_loop(id)? {
                self.local_cooldown.trigger(id);
                report.local_loops.push(event);
                *loop_found = true;
            }
        }

        if !*loop_found && self.config.close_loops && self.global_cooldown.is_ready(id) {
            if let Some(event) = self.try_global_loop(id)? {
                self.global_cooldown.trigger(id);
                report.global_loops.push(event);
                *loop_found = true;
            }
        }
        Ok(())
    }

    /// Covisibility-based loop search for keyframe `id`.
    ///
    /// The map lock is released before registration; both keyframes are
    /// copied out.
    fn try_local_loop(&mut self, id: KeyframeId) -> Result<Option<LoopEvent>, BackendError> {
        let (kf, old) = {
            let map = self.shared.map.read();
            let keyframes = map.graph.keyframes();
            let Some(kf) = keyframes.get(id.index()) else {
                return Ok(None);
            };
            let Some(best) = find_best_keyframe_for_matching(kf, keyframes, &self.camera, &self.config.local_loop)
            else {
                return Ok(None);
            };
            debug!("local loop candidate for {}: {}", id, best);
            (kf.clone(), keyframes[best.index()].clone())
        };

        match self.registrator.try_and_match(&kf, &old) {
            Ok(edge) => {
                self.add_loop_edge(edge)?;
                self.stats.local_loops += 1;
                info!("local loop {} -> {}", id, old.id);
                Ok(Some(LoopEvent {
                    new_id: id,
                    old_id: old.id,
                }))
            }
            Err(reason) => {
                self.stats.registrations_rejected += 1;
                debug!("local loop {} -> {} rejected: {}", id, old.id, reason);
                Ok(None)
            }
        }
    }

    /// Appearance-based loop search for keyframe `id`.
    ///
    /// Only candidates with `0 < candidate < id` are registered.
    fn try_global_loop(&mut self, id: KeyframeId) -> Result<Option<LoopEvent>, BackendError> {
        let (kf, old) = {
            let map = self.shared.map.read();
            let keyframes = map.graph.keyframes();
            let Some(kf) = keyframes.get(id.index()) else {
                return Ok(None);
            };
            let Some(candidate) = self.detector.detect_loop(kf) else {
                return Ok(None);
            };
            if candidate.index() == 0 || candidate >= id {
                debug!("ignoring appearance candidate {} for {}", candidate, id);
                return Ok(None);
            }
            let Some(old) = keyframes.get(candidate.index()) else {
                warn!("loop detector returned unknown keyframe {}", candidate);
                return Ok(None);
            };
            debug!("global loop candidate for {}: {}", id, candidate);
            (kf.clone(), old.clone())
        };

        match self.registrator.try_and_match_large_loop(&kf, &old) {
            Ok(edge) => {
                self.add_loop_edge(edge)?;
                self.stats.global_loops += 1;
                info!("global loop {} -> {}", id, old.id);
                Ok(Some(LoopEvent {
                    new_id: id,
                    old_id: old.id,
                }))
            }
            Err(reason) => {
                self.stats.registrations_rejected += 1;
                debug!("global loop {} -> {} rejected: {}", id, old.id, reason);
                Ok(None)
            }
        }
    }

    fn add_loop_edge(&mut self, edge: Edge) -> Result<(), BackendError> {
        let inserted = self.shared.map.write().graph.add_loop_edge(edge.clone())?;
        if inserted {
            self.solver.add_edge(&edge, true, edge.scene_depth);
        } else {
            debug!("keyframe {} already has an edge to {}", edge.id_b, edge.id_a);
        }
        Ok(())
    }

    /// Optimize around the latest keyframe if required and publish the
    /// optimized poses and drift correction.
    fn run_pgo(&mut self) -> Result<Option<OptimizationReport>, BackendError> {
        if !self.optimization_required {
            return Ok(None);
        }
        let cap = if self.loop_required {
            self.config.loop_cap()
        } else {
            self.config.local_cap()
        };
        let vertices = select_subgraph(self.shared.map.read().graph.keyframes(), cap);
        info!(
            "optimizing {} keyframes (cap {}, loop: {})",
            vertices.len(),
            cap,
            self.loop_required
        );

        let summary = match self.solver.optimize_portion(&vertices) {
            Ok(summary) => summary,
            Err(e) => {
                self.stats.optimizer_failures += 1;
                warn!("optimization failed, retrying next cycle: {}", e);
                return Err(e);
            }
        };

        let keyframes_updated = {
            let mut map = self.shared.map.write();
            let updated = self.solver.apply_result(map.graph.keyframes_mut());
            self.shared.set_map_updated(true);
            if let Some(latest) = map.graph.latest() {
                let correction = latest.pose.compose(&latest.raw_pose.inverse());
                map.correction = correction;
            }
            updated
        };
        debug!("correction updated after {} iterations", summary.iterations);

        self.optimization_required = false;
        self.loop_required = false;
        self.stats.optimizations += 1;
        Ok(Some(OptimizationReport {
            cap,
            subgraph_size: vertices.len(),
            keyframes_updated,
            summary,
        }))
    }

    /// Drop all keyframes, edges, pending input and solver state.
    pub fn reset(&mut self) {
        self.shared.clear_pending();
        {
            let mut map = self.shared.map.write();
            map.graph.clear();
            map.correction = self.config.body_from_camera();
        }
        self.shared.set_map_updated(false);
        self.solver.reset();
        self.detector.reset();
        self.local_cooldown.reset();
        self.global_cooldown.reset();
        self.optimization_required = false;
        self.loop_required = false;
        info!("backend reset");
    }
}
