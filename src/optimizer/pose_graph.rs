//! Pose graph optimization over SE(3).
//!
//! The solver accumulates keyframes and relative-pose constraints as they
//! arrive and optimizes any requested portion of the graph:
//! 1. COLLECT: vertices of the requested set and the constraints between them
//! 2. SOLVE: Levenberg-Marquardt with right-perturbation updates
//! 3. APPLY: optimized poses are written back on request
//!
//! The lowest id of the requested set is held fixed as the gauge.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use nalgebra::{DMatrix, DVector, Matrix6, Vector6};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::BackendError;
use crate::geometry::SE3;
use crate::graph::{Edge, Keyframe, KeyframeId};

/// Finite-difference step for the numerical Jacobian.
const JACOBIAN_EPS: f64 = 1e-6;

/// External pose-graph solver interface.
pub trait PoseGraphSolver: Send {
    fn add_keyframe(&mut self, kf: &Keyframe);

    /// Add a relative-pose constraint. Translation residuals are divided by
    /// `scene_depth`; loop constraints get a robust kernel.
    fn add_edge(&mut self, edge: &Edge, is_loop: bool, scene_depth: f64);

    /// Optimize the poses of `vertices`, using only constraints with both
    /// endpoints in the set.
    fn optimize_portion(&mut self, vertices: &BTreeSet<KeyframeId>) -> Result<OptimizationSummary, BackendError>;

    /// Write the poses from the last optimization onto `keyframes`.
    /// Returns the number of keyframes updated.
    fn apply_result(&mut self, keyframes: &mut [Keyframe]) -> usize;

    fn reset(&mut self);
}

/// Configuration for pose graph optimization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseGraphConfig {
    /// Maximum number of LM iterations.
    pub max_iterations: usize,

    /// Convergence threshold on the update step.
    pub param_tolerance: f64,

    /// Convergence threshold on the gradient.
    pub gradient_tolerance: f64,

    /// Huber threshold for loop constraints.
    pub huber_delta: f64,
}

impl Default for PoseGraphConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            param_tolerance: 1e-8,
            gradient_tolerance: 1e-9,
            huber_delta: 0.5,
        }
    }
}

/// Outcome of one `optimize_portion` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizationSummary {
    pub vertices: usize,
    pub constraints: usize,
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
}

#[derive(Debug, Clone)]
struct Constraint {
    id_a: KeyframeId,
    id_b: KeyframeId,
    a_t_b: SE3,
    scene_depth: f64,
    robust: bool,
}

impl Constraint {
    /// Error of `T_a⁻¹ T_b` against the measurement, translation scaled by depth.
    fn residual(&self, t_a: &SE3, t_b: &SE3) -> Vector6<f64> {
        let predicted = t_a.inverse().compose(t_b);
        let mut r = self.a_t_b.inverse().compose(&predicted).log();
        let depth = self.scene_depth.max(1e-6);
        for k in 0..3 {
            r[k] /= depth;
        }
        r
    }
}

/// Dense Levenberg-Marquardt pose graph.
#[derive(Debug, Default)]
pub struct LmPoseGraph {
    config: PoseGraphConfig,
    /// Current estimate per vertex.
    vertices: BTreeMap<KeyframeId, SE3>,
    /// Vertices whose estimate came out of an optimization.
    optimized: BTreeSet<KeyframeId>,
    /// Non-loop constraints, one per ordered pair.
    odometry: HashMap<(KeyframeId, KeyframeId), Constraint>,
    loops: Vec<Constraint>,
    result: BTreeMap<KeyframeId, SE3>,
}

impl LmPoseGraph {
    /// Empty solver.
    pub fn new(config: PoseGraphConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Vertices known to the solver.
    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    /// Odometry plus loop constraints.
    pub fn num_constraints(&self) -> usize {
        self.odometry.len() + self.loops.len()
    }

    /// Current pose of a vertex.
    pub fn estimate(&self, id: KeyframeId) -> Option<&SE3> {
        self.vertices.get(&id)
    }

    fn constraints(&self) -> impl Iterator<Item = &Constraint> {
        self.odometry.values().chain(self.loops.iter())
    }

    /// Vertices that were never optimized start from their neighbors'
    /// estimates chained through the constraints, oldest first.
    fn seed_fresh_vertices(&mut self, set: &BTreeSet<KeyframeId>) {
        let fresh: Vec<KeyframeId> = set
            .iter()
            .filter(|id| !self.optimized.contains(id) && self.vertices.contains_key(id))
            .copied()
            .collect();
        for id in fresh {
            let seeded = self
                .constraints()
                .filter(|c| c.id_b == id && c.id_a < id && set.contains(&c.id_a))
                .filter(|c| self.optimized.contains(&c.id_a))
                .min_by_key(|c| id.index() - c.id_a.index())
                .and_then(|c| self.vertices.get(&c.id_a).map(|t_a| t_a.compose(&c.a_t_b)));
            if let Some(pose) = seeded {
                self.vertices.insert(id, pose);
                self.optimized.insert(id);
            }
        }
    }

    fn huber_weight(&self, r: &Vector6<f64>) -> f64 {
        let norm = r.norm();
        let delta = self.config.huber_delta;
        if norm <= delta {
            1.0
        } else {
            delta / norm
        }
    }

    fn robust_cost(&self, c: &Constraint, r: &Vector6<f64>) -> f64 {
        let s = r.norm_squared();
        let delta = self.config.huber_delta;
        if !c.robust || s <= delta * delta {
            s
        } else {
            2.0 * delta * s.sqrt() - delta * delta
        }
    }

    fn total_cost(&self, constraints: &[&Constraint], poses: &BTreeMap<KeyframeId, SE3>) -> f64 {
        constraints
            .iter()
            .map(|c| {
                let r = c.residual(&poses[&c.id_a], &poses[&c.id_b]);
                self.robust_cost(c, &r)
            })
            .sum()
    }
}

/// Right-perturbation Jacobian of a residual with respect to one pose.
fn numerical_jacobian(f: impl Fn(&SE3) -> Vector6<f64>, pose: &SE3) -> Matrix6<f64> {
    let mut jac = Matrix6::zeros();
    for k in 0..6 {
        let mut delta = Vector6::zeros();
        delta[k] = JACOBIAN_EPS;
        let plus = f(&pose.retract(&delta));
        let minus = f(&pose.retract(&(-delta)));
        jac.set_column(k, &((plus - minus) / (2.0 * JACOBIAN_EPS)));
    }
    jac
}

impl PoseGraphSolver for LmPoseGraph {
    fn add_keyframe(&mut self, kf: &Keyframe) {
        self.vertices.insert(kf.id, kf.pose);
    }

    fn add_edge(&mut self, edge: &Edge, is_loop: bool, scene_depth: f64) {
        let edge = edge.clone().normalized();
        let constraint = Constraint {
            id_a: edge.id_a,
            id_b: edge.id_b,
            a_t_b: edge.a_t_b,
            scene_depth,
            robust: is_loop,
        };
        if is_loop {
            self.loops.push(constraint);
        } else {
            self.odometry.insert((edge.id_a, edge.id_b), constraint);
        }
    }

    fn optimize_portion(&mut self, vertices: &BTreeSet<KeyframeId>) -> Result<OptimizationSummary, BackendError> {
        // COLLECT
        let set: BTreeSet<KeyframeId> = vertices
            .iter()
            .filter(|id| self.vertices.contains_key(id))
            .copied()
            .collect();
        if set.len() < vertices.len() {
            debug!("{} requested vertices are unknown to the solver", vertices.len() - set.len());
        }
        self.result.clear();

        let Some(&fixed) = set.iter().next() else {
            return Ok(OptimizationSummary::default());
        };
        self.optimized.insert(fixed);
        self.seed_fresh_vertices(&set);

        let constraints: Vec<&Constraint> = self
            .constraints()
            .filter(|c| c.id_a != c.id_b && set.contains(&c.id_a) && set.contains(&c.id_b))
            .collect();

        let mut poses: BTreeMap<KeyframeId, SE3> = set.iter().map(|id| (*id, self.vertices[id])).collect();
        let free: Vec<KeyframeId> = set.iter().filter(|id| **id != fixed).copied().collect();
        let column: HashMap<KeyframeId, usize> = free.iter().enumerate().map(|(i, id)| (*id, 6 * i)).collect();
        let n_params = 6 * free.len();

        let initial_cost = self.total_cost(&constraints, &poses);
        if !initial_cost.is_finite() {
            return Err(BackendError::OptimizerFailure(format!(
                "non-finite initial cost over {} vertices",
                set.len()
            )));
        }

        let mut summary = OptimizationSummary {
            vertices: set.len(),
            constraints: constraints.len(),
            iterations: 0,
            initial_cost,
            final_cost: initial_cost,
        };
        if n_params == 0 || constraints.is_empty() {
            self.result = poses;
            return Ok(summary);
        }

        // SOLVE
        let mut lambda = 1e-4;
        let mut cost = initial_cost;
        for iter in 0..self.config.max_iterations {
            summary.iterations = iter + 1;

            let mut h = DMatrix::<f64>::zeros(n_params, n_params);
            let mut g = DVector::<f64>::zeros(n_params);
            for c in &constraints {
                let (t_a, t_b) = (poses[&c.id_a], poses[&c.id_b]);
                let r = c.residual(&t_a, &t_b);
                let w = if c.robust { self.huber_weight(&r) } else { 1.0 };

                let mut blocks: Vec<(usize, Matrix6<f64>)> = Vec::with_capacity(2);
                if let Some(&col) = column.get(&c.id_a) {
                    blocks.push((col, numerical_jacobian(|ta| c.residual(ta, &t_b), &t_a)));
                }
                if let Some(&col) = column.get(&c.id_b) {
                    blocks.push((col, numerical_jacobian(|tb| c.residual(&t_a, tb), &t_b)));
                }
                for (ci, ji) in &blocks {
                    let gi = ji.transpose() * r * w;
                    let mut gv = g.fixed_rows_mut::<6>(*ci);
                    gv += gi;
                    for (cj, jj) in &blocks {
                        let mut hv = h.fixed_view_mut::<6, 6>(*ci, *cj);
                        hv += ji.transpose() * jj * w;
                    }
                }
            }

            if g.amax() < self.config.gradient_tolerance {
                break;
            }

            // Damp and factorize H in place.
            for i in 0..n_params {
                let d = h[(i, i)];
                h[(i, i)] = d + lambda * d.max(1e-6);
            }
            let delta = match h.cholesky() {
                Some(chol) => chol.solve(&(-&g)),
                None if iter == 0 => {
                    return Err(BackendError::OptimizerFailure(
                        "normal equations are not positive definite".to_string(),
                    ));
                }
                None => {
                    lambda = (lambda * 10.0).min(1e12);
                    continue;
                }
            };

            let trial: BTreeMap<KeyframeId, SE3> = poses
                .iter()
                .map(|(id, pose)| match column.get(id) {
                    Some(&col) => {
                        let d: Vector6<f64> = delta.fixed_rows::<6>(col).into_owned();
                        (*id, pose.retract(&d))
                    }
                    None => (*id, *pose),
                })
                .collect();
            let trial_cost = self.total_cost(&constraints, &trial);

            if trial_cost.is_finite() && trial_cost < cost {
                poses = trial;
                cost = trial_cost;
                lambda = (lambda * 0.1).max(1e-12);
                if delta.amax() < self.config.param_tolerance {
                    break;
                }
            } else {
                lambda = (lambda * 10.0).min(1e12);
                if lambda >= 1e12 {
                    warn!("pose graph LM stalled after {} iterations", iter + 1);
                    break;
                }
            }
        }
        summary.final_cost = cost;

        for (id, pose) in &poses {
            self.vertices.insert(*id, *pose);
            self.optimized.insert(*id);
        }
        self.result = poses;
        debug!(
            "pose graph: {} vertices, {} constraints, cost {:.3e} -> {:.3e} in {} iterations",
            summary.vertices, summary.constraints, summary.initial_cost, summary.final_cost, summary.iterations
        );
        Ok(summary)
    }

    // APPLY
    fn apply_result(&mut self, keyframes: &mut [Keyframe]) -> usize {
        let mut updated = 0;
        for (id, pose) in std::mem::take(&mut self.result) {
            if let Some(kf) = keyframes.get_mut(id.index()) {
                if kf.id == id {
                    kf.pose = pose;
                    updated += 1;
                }
            }
        }
        updated
    }

    fn reset(&mut self) {
        self.vertices.clear();
        self.optimized.clear();
        self.odometry.clear();
        self.loops.clear();
        self.result.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn kf(id: usize, pose: SE3) -> Keyframe {
        Keyframe::new(KeyframeId::new(id), pose, vec![], vec![])
    }

    fn step() -> SE3 {
        SE3::from_axis_angle(Vector3::new(0.0, 0.1, 0.0), Vector3::new(0.5, 0.0, 0.0))
    }

    fn ids(range: std::ops::Range<usize>) -> BTreeSet<KeyframeId> {
        range.map(KeyframeId::new).collect()
    }

    #[test]
    fn test_consistent_graph_has_zero_cost() {
        let mut pg = LmPoseGraph::new(PoseGraphConfig::default());
        let mut pose = SE3::identity();
        for i in 0..5 {
            pg.add_keyframe(&kf(i, pose));
            if i > 0 {
                pg.add_edge(&Edge::odometry(KeyframeId::new(i - 1), KeyframeId::new(i), step(), 2.0), false, 2.0);
            }
            pose = pose.compose(&step());
        }
        let summary = pg.optimize_portion(&ids(0..5)).unwrap();
        assert!(summary.initial_cost < 1e-20);
        assert_eq!(summary.constraints, 4);
    }

    #[test]
    fn test_recovers_from_perturbed_initial_poses() {
        let mut pg = LmPoseGraph::new(PoseGraphConfig::default());
        let mut truth = vec![SE3::identity()];
        for i in 1..6 {
            truth.push(truth[i - 1].compose(&step()));
        }
        for (i, t) in truth.iter().enumerate() {
            let noise = SE3::from_axis_angle(Vector3::new(0.02, -0.01, 0.03), Vector3::new(0.1, -0.05, 0.08));
            let init = if i == 0 { *t } else { t.compose(&noise) };
            pg.add_keyframe(&kf(i, init));
        }
        for i in 1..6 {
            pg.add_edge(&Edge::odometry(KeyframeId::new(i - 1), KeyframeId::new(i), step(), 1.0), false, 1.0);
        }
        // Make every vertex count as already optimized so nothing is re-seeded.
        pg.optimized = ids(0..6);

        let summary = pg.optimize_portion(&ids(0..6)).unwrap();
        assert!(summary.final_cost < 1e-10, "final cost {}", summary.final_cost);

        let mut kfs: Vec<Keyframe> = (0..6).map(|i| kf(i, SE3::identity())).collect();
        assert_eq!(pg.apply_result(&mut kfs), 6);
        for (k, t) in kfs.iter().zip(&truth) {
            assert_relative_eq!(k.pose.translation, t.translation, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_adjacent_constraints_overwrite() {
        let mut pg = LmPoseGraph::new(PoseGraphConfig::default());
        let e = Edge::odometry(KeyframeId::new(0), KeyframeId::new(1), step(), 1.0);
        pg.add_edge(&e, false, 1.0);
        pg.add_edge(&e, false, 1.0);
        assert_eq!(pg.num_constraints(), 1);
        pg.add_edge(&Edge::new_loop(KeyframeId::new(0), KeyframeId::new(20), step(), 1.0), true, 1.0);
        pg.add_edge(&Edge::new_loop(KeyframeId::new(0), KeyframeId::new(20), step(), 1.0), true, 1.0);
        assert_eq!(pg.num_constraints(), 3);
    }

    #[test]
    fn test_only_internal_constraints_used() {
        let mut pg = LmPoseGraph::new(PoseGraphConfig::default());
        for i in 0..4 {
            pg.add_keyframe(&kf(i, SE3::identity()));
        }
        for i in 1..4 {
            pg.add_edge(&Edge::odometry(KeyframeId::new(i - 1), KeyframeId::new(i), step(), 1.0), false, 1.0);
        }
        let summary = pg.optimize_portion(&ids(2..4)).unwrap();
        assert_eq!(summary.vertices, 2);
        assert_eq!(summary.constraints, 1);
    }

    #[test]
    fn test_fresh_vertex_seeded_from_odometry() {
        let mut pg = LmPoseGraph::new(PoseGraphConfig::default());
        pg.add_keyframe(&kf(0, SE3::identity()));
        // The front end reports kf 1 far from where odometry puts it.
        let far = SE3::from_axis_angle(Vector3::zeros(), Vector3::new(10.0, 0.0, 0.0));
        pg.add_keyframe(&kf(1, far));
        pg.add_edge(&Edge::odometry(KeyframeId::new(0), KeyframeId::new(1), step(), 1.0), false, 1.0);
        let summary = pg.optimize_portion(&ids(0..2)).unwrap();
        assert!(summary.initial_cost < 1e-20);
        assert_relative_eq!(
            pg.estimate(KeyframeId::new(1)).unwrap().translation,
            step().translation,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_loop_closure_distributes_error() {
        // Closed square whose odometry carries a small heading drift.
        let mut pg = LmPoseGraph::new(PoseGraphConfig::default());
        let turn = SE3::from_axis_angle(
            Vector3::new(0.0, std::f64::consts::FRAC_PI_2 + 0.02, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
        );
        let mut pose = SE3::identity();
        for i in 0..5 {
            pg.add_keyframe(&kf(i, pose));
            pose = pose.compose(&turn);
        }
        for i in 1..5 {
            pg.add_edge(&Edge::odometry(KeyframeId::new(i - 1), KeyframeId::new(i), turn, 1.0), false, 1.0);
        }
        pg.add_edge(&Edge::new_loop(KeyframeId::new(0), KeyframeId::new(4), SE3::identity(), 1.0), true, 1.0);

        let summary = pg.optimize_portion(&ids(0..5)).unwrap();
        assert!(summary.initial_cost > 1e-4);
        assert!(summary.final_cost < 0.5 * summary.initial_cost);
    }

    #[test]
    fn test_unconstrained_vertex_keeps_its_pose() {
        let mut pg = LmPoseGraph::new(PoseGraphConfig::default());
        let loose = SE3::from_axis_angle(Vector3::new(0.0, 0.3, 0.0), Vector3::new(-2.0, 0.5, 4.0));
        pg.add_keyframe(&kf(0, SE3::identity()));
        pg.add_keyframe(&kf(1, step()));
        pg.add_keyframe(&kf(2, loose));
        // Two disagreeing constraints between 0 and 1, none touching 2.
        pg.add_edge(&Edge::odometry(KeyframeId::new(0), KeyframeId::new(1), step(), 1.0), false, 1.0);
        let longer = SE3::from_axis_angle(Vector3::zeros(), Vector3::new(0.0, 0.0, 1.2));
        pg.add_edge(&Edge::new_loop(KeyframeId::new(0), KeyframeId::new(1), longer, 1.0), true, 1.0);

        let summary = pg.optimize_portion(&ids(0..3)).unwrap();
        assert_eq!(summary.vertices, 3);
        assert_eq!(summary.constraints, 2);
        assert!(summary.iterations >= 1);
        assert!(summary.final_cost <= summary.initial_cost);
        let kept = pg.estimate(KeyframeId::new(2)).unwrap();
        assert_relative_eq!(kept.translation, loose.translation, epsilon = 1e-12);
        assert_relative_eq!(kept.rotation.coords, loose.rotation.coords, epsilon = 1e-12);
    }

    #[test]
    fn test_reset() {
        let mut pg = LmPoseGraph::new(PoseGraphConfig::default());
        pg.add_keyframe(&kf(0, SE3::identity()));
        pg.add_edge(&Edge::odometry(KeyframeId::new(0), KeyframeId::new(1), step(), 1.0), false, 1.0);
        pg.reset();
        assert_eq!(pg.num_vertices(), 0);
        assert_eq!(pg.num_constraints(), 0);
    }
}
