//! Pose graph optimization.
//!
//! - `PoseGraphSolver`: the solver interface the backend drives
//! - `LmPoseGraph`: Levenberg-Marquardt over SE(3)
//! - `select_subgraph`: bounded vertex set around the latest keyframe

pub mod pose_graph;
pub mod subgraph;

pub use pose_graph::{LmPoseGraph, OptimizationSummary, PoseGraphConfig, PoseGraphSolver};
pub use subgraph::select_subgraph;
