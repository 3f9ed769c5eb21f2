//! Loop-closure triggering policy.

use serde::{Deserialize, Serialize};

use crate::graph::KeyframeId;

/// Settings for appearance-based loop closure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalLoopConfig {
    /// Keyframes skipped after a global loop before querying again.
    pub cooldown: usize,
}

impl Default for GlobalLoopConfig {
    fn default() -> Self {
        Self { cooldown: 5 }
    }
}

/// Suppresses loop searches for `cooldown` keyframes after a loop.
///
/// One instance per loop kind; nothing is shared between backends.
#[derive(Debug, Clone)]
pub struct LoopCooldown {
    cooldown: usize,
    last_loop_at: Option<KeyframeId>,
}

impl LoopCooldown {
    /// `cooldown` keyframes must pass after a loop before the next search.
    pub fn new(cooldown: usize) -> Self {
        Self {
            cooldown,
            last_loop_at: None,
        }
    }

    /// Whether a search may run for keyframe `id`.
    pub fn is_ready(&self, id: KeyframeId) -> bool {
        match self.last_loop_at {
            None => true,
            Some(last) => id.index() > last.index() + self.cooldown,
        }
    }

    /// Record a loop found at keyframe `id`.
    pub fn trigger(&mut self, id: KeyframeId) {
        self.last_loop_at = Some(id);
    }

    /// Keyframe at which the last loop was found.
    pub fn last_loop_at(&self) -> Option<KeyframeId> {
        self.last_loop_at
    }

    /// Forget the last loop.
    pub fn reset(&mut self) {
        self.last_loop_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_before_any_loop() {
        let cooldown = LoopCooldown::new(5);
        assert!(cooldown.is_ready(KeyframeId::new(0)));
    }

    #[test]
    fn test_skips_exactly_cooldown_keyframes() {
        let mut cooldown = LoopCooldown::new(5);
        cooldown.trigger(KeyframeId::new(20));
        for id in 21..=25 {
            assert!(!cooldown.is_ready(KeyframeId::new(id)), "{id} should be blocked");
        }
        assert!(cooldown.is_ready(KeyframeId::new(26)));
    }

    #[test]
    fn test_instances_are_independent() {
        let mut local = LoopCooldown::new(5);
        let global = LoopCooldown::new(5);
        local.trigger(KeyframeId::new(3));
        assert!(!local.is_ready(KeyframeId::new(4)));
        assert!(global.is_ready(KeyframeId::new(4)));
        local.reset();
        assert!(local.is_ready(KeyframeId::new(4)));
    }
}
