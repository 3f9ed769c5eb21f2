//! Bounded neighborhood selection for pose graph optimization.

use std::collections::{BTreeSet, VecDeque};

use crate::graph::{Keyframe, KeyframeId};

/// Select at most `vmax` keyframe ids around the latest keyframe.
///
/// Breadth-first from the latest keyframe. Each visited keyframe enqueues its
/// neighbors nearest first, but the queue itself is plain FIFO, so this only
/// approximates a uniform-cost search.
pub fn select_subgraph(keyframes: &[Keyframe], vmax: usize) -> BTreeSet<KeyframeId> {
    let mut selected = BTreeSet::new();
    let Some(seed) = keyframes.last() else {
        return selected;
    };
    let limit = vmax.min(keyframes.len());
    if limit == 0 {
        return selected;
    }

    let mut queue = VecDeque::from([seed.id]);
    while let Some(id) = queue.pop_front() {
        if !selected.insert(id) {
            continue;
        }
        if selected.len() >= limit {
            break;
        }
        if let Some(kf) = keyframes.get(id.index()) {
            queue.extend(kf.neighbor_index().ids().filter(|n| !selected.contains(n)));
        }
    }
    selected
}
