//! Keyframe graph: keyframes addressed by id, edges stored on the newer
//! endpoint pointing back to the older one, and a per-keyframe neighbor index
//! ordered by translational distance.

pub mod edge;
pub mod keyframe;
pub mod keyframe_graph;
pub mod types;

pub use edge::{Edge, EdgeType};
pub use keyframe::{Keyframe, Keypoint, MapPoint, NeighborIndex};
pub use keyframe_graph::KeyframeGraph;
pub use types::{BowVector, Descriptor, KeyframeId};
