//! Loop closing: candidate selection for local loops, appearance-based
//! detection for large loops, and the cooldown policy shared by both.

pub mod candidate;
pub mod detector;
pub mod policy;

pub use candidate::{covisibility_score, find_best_keyframe_for_matching, LocalLoopConfig};
pub use detector::{BowDetectorConfig, BowLoopDetector, LoopCandidate, LoopDetector};
pub use policy::{GlobalLoopConfig, LoopCooldown};
