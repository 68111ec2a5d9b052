//! Idempotency helpers (§4.2, §5, §8).
//!
//! "Every state-changing command is idempotent on message `id`": callers
//! (the scheduler's message handler) keep a bounded recently-seen set of
//! frame ids per agent and consult `IdempotencyWindow::observe` before
//! applying a critical message's effect.

use std::collections::VecDeque;
use std::collections::HashSet;

use kh_ids::FrameId;

/// Bounded recently-seen-ids tracker. Not a full dedup-forever set (which
/// would grow unboundedly over an agent's lifetime): only the last
/// `capacity` ids are remembered, which is sufficient because a replay
/// only ever happens immediately after a reconnect, right after the ids it
/// replays were last seen.
pub struct IdempotencyWindow {
    capacity: usize,
    seen: HashSet<FrameId>,
    order: VecDeque<FrameId>,
}

impl IdempotencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns `true` the first time `id` is observed, `false` on any
    /// repeat. Callers should skip re-applying a message's effect (but may
    /// still re-send an `ack`) when this returns `false`.
    pub fn observe(&mut self, id: FrameId) -> bool {
        if self.seen.contains(&id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.clone());
        self.order.push_back(id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_is_new_repeat_is_not() {
        let mut window = IdempotencyWindow::new(8);
        let id = FrameId::new();
        assert!(window.observe(id.clone()));
        assert!(!window.observe(id));
    }

    #[test]
    fn eviction_forgets_the_oldest_id() {
        let mut window = IdempotencyWindow::new(2);
        let a = FrameId::new();
        let b = FrameId::new();
        let c = FrameId::new();
        assert!(window.observe(a.clone()));
        assert!(window.observe(b));
        assert!(window.observe(c));
        // `a` has been evicted, so it now looks "new" again -- acceptable:
        // a real replay would never resurrect an id this old.
        assert!(window.observe(a));
    }
}
