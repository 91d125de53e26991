//! Client-boundary dedup: a bounded seen-set of platform message ids.
//!
//! Gateway event redelivery is dropped here before any room logic runs.
//! This is an insertion-order LRU, not a correctness mechanism — the
//! per-room recent-id ring provides the durable guarantee.

use std::collections::{HashSet, VecDeque};

/// Bounded set + insertion-order queue of recently seen message ids.
#[derive(Debug)]
pub struct SeenMessages {
    capacity: usize,
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenMessages {
    /// Default capacity used by the Discord client boundary.
    pub const DEFAULT_CAPACITY: usize = 2000;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            set: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Record an id. Returns `true` when it was seen before (the caller
    /// should drop the event).
    pub fn check_and_insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return true;
        }
        if self.order.len() == self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.set.remove(&oldest);
        }
        self.set.insert(id.to_string());
        self.order.push_back(id.to_string());
        false
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for SeenMessages {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_ids_are_flagged() {
        let mut seen = SeenMessages::new(10);
        assert!(!seen.check_and_insert("a"));
        assert!(seen.check_and_insert("a"));
        assert!(!seen.check_and_insert("b"));
    }

    #[test]
    fn eviction_follows_insertion_order() {
        let mut seen = SeenMessages::new(3);
        seen.check_and_insert("a");
        seen.check_and_insert("b");
        seen.check_and_insert("c");
        seen.check_and_insert("d"); // evicts "a"

        assert_eq!(seen.len(), 3);
        assert!(!seen.check_and_insert("a")); // admitted again, evicts "b"
        assert!(!seen.check_and_insert("b"));
        assert!(seen.check_and_insert("d"));
    }

    #[test]
    fn capacity_floor_is_one() {
        let mut seen = SeenMessages::new(0);
        assert!(!seen.check_and_insert("a"));
        assert!(seen.check_and_insert("a"));
        assert!(!seen.check_and_insert("b"));
        assert_eq!(seen.len(), 1);
    }
}
