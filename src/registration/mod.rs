//! Relative pose estimation between keyframes.
//!
//! - `matcher`: binary descriptor correspondences
//! - `registrator_3p`: preemptive RANSAC over minimal 3D-2D pose samples
//! - `sim3_solver`: scale-aware 3D-3D alignment for large loops
//! - `registrator_kfs`: matching, estimation and acceptance gates

pub mod matcher;
pub mod registrator_3p;
pub mod registrator_kfs;
pub mod sim3_solver;

pub use matcher::{descriptor_distance, BruteForceMatcher, FeatureMatcher, Match, MatcherConfig};
pub use registrator_3p::{
    preemption, Correspondence, Observation, RansacConfig, RansacOutcome, Registrator3P, MIN_CORRESPONDENCES,
};
pub use registrator_kfs::{Registration, RegistrationConfig, RegistratorKFs};
pub use sim3_solver::{align_similarity, Sim3Estimate, Sim3Solver, Sim3SolverConfig};
