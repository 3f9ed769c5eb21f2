//! Pose-graph backend for keyframe-based visual SLAM.
//!
//! The front end submits keyframes and odometry edges through a
//! [`system::BackendHandle`]; the backend closes local (covisibility) and
//! global (appearance) loops, optimizes a bounded subgraph and publishes
//! corrected poses plus a drift-correction transform.

pub mod config;
pub mod error;
pub mod geometry;
pub mod graph;
pub mod io;
pub mod loop_closing;
pub mod optimizer;
pub mod registration;
pub mod simulation;
pub mod system;

pub use config::BackendConfig;
pub use error::{BackendError, GeometryError, RegistrationRejected};
pub use system::{BackendHandle, BackendThread, SlamSystem};
