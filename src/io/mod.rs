//! Persistence: keyframe archival and trajectory export.

pub mod archive;
pub mod trajectory;

pub use archive::{KeyframeArchive, YamlKeyframeArchive};
pub use trajectory::{read_trajectory_csv, write_trajectory_csv, TrajectoryRow};
