//! Core identifier and descriptor types for the keyframe graph.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Identifier of a keyframe.
///
/// Ids are assigned by the front end, start at 0 and are contiguous, so a
/// KeyframeId doubles as the keyframe's index in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyframeId(pub usize);

impl KeyframeId {
    /// Id of the keyframe at arena position `id`.
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0
    }

    /// Absolute id difference.
    pub fn gap(self, other: KeyframeId) -> usize {
        self.0.abs_diff(other.0)
    }

    /// True for directly consecutive ids.
    pub fn is_adjacent(self, other: KeyframeId) -> bool {
        self.gap(other) == 1
    }
}

impl std::fmt::Display for KeyframeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// 256-bit binary feature descriptor.
pub type Descriptor = [u8; 32];

/// Sparse bag-of-words histogram: word id → weight.
pub type BowVector = HashMap<u32, f64>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyframe_id_display() {
        assert_eq!(format!("{}", KeyframeId::new(7)), "KF7");
    }

    #[test]
    fn test_adjacency() {
        let a = KeyframeId::new(4);
        assert!(a.is_adjacent(KeyframeId::new(5)));
        assert!(a.is_adjacent(KeyframeId::new(3)));
        assert!(!a.is_adjacent(KeyframeId::new(6)));
        assert_eq!(a.gap(KeyframeId::new(20)), 16);
    }

    #[test]
    fn test_ids_are_ordered() {
        let mut ids = vec![KeyframeId::new(3), KeyframeId::new(1), KeyframeId::new(2)];
        ids.sort();
        assert_eq!(ids, vec![KeyframeId::new(1), KeyframeId::new(2), KeyframeId::new(3)]);
    }
}
