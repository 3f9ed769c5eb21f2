//! Geometry: rigid and similarity transforms, camera model, minimal pose solver.

pub mod camera;
pub mod pnp;
pub mod se3;
pub mod sim3;
pub mod so3;

pub use camera::CameraModel;
pub use pnp::{pose_from_points, solve_minimal_pose};
pub use se3::SE3;
pub use sim3::Sim3;
