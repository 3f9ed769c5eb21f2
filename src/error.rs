//! Error types for the backend.

use thiserror::Error;

use crate::graph::KeyframeId;

/// Failures of the backend orchestrator and its graph.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The front end submitted a keyframe whose id does not extend the graph.
    #[error("keyframe id {got} does not extend the graph (expected {expected})")]
    GraphContiguityViolation { expected: usize, got: usize },

    #[error("unknown keyframe {0}")]
    UnknownKeyframe(KeyframeId),

    #[error("keyframe {0} was already finalized")]
    KeyframeAlreadyFinalized(KeyframeId),

    #[error("pose graph optimization failed: {0}")]
    OptimizerFailure(String),
}

/// Why a registration between two keyframes produced no edge.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistrationRejected {
    #[error("only {found} correspondences, need at least {required}")]
    InsufficientCorrespondences { found: usize, required: usize },

    #[error("no pose hypothesis could be generated")]
    NoHypothesis,

    #[error("only {found} inliers, need at least {required}")]
    TooFewInliers { found: usize, required: usize },

    #[error("relative rotation {angle_deg:.1}° exceeds {max_deg:.1}°")]
    RotationTooLarge { angle_deg: f64, max_deg: f64 },
}

/// Failure modes of the minimal pose solvers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GeometryError {
    #[error("degenerate point configuration")]
    DegenerateConfiguration,

    #[error("no real solution")]
    NoRealSolution,

    #[error("SVD failed")]
    SvdFailed,
}
