//! An in-memory cache of "is this node ready" with explicitly **no**
//! correctness role. Reimplementations of the original program tracked
//! readiness in module-level mutable maps and let the dispatch decision
//! trust them; this crate keeps the same shape of cache purely so the
//! dispatcher can log a cheap diagnostic without a DB round trip, but every
//! decision that matters re-reads `node_status` from the store. Nothing on
//! the claim path ever consults this type.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct AdvisoryReadiness {
    node1: AtomicBool,
    node2: AtomicBool,
}

impl AdvisoryReadiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, node_id: i64, ready: bool) {
        match node_id {
            1 => self.node1.store(ready, Ordering::Relaxed),
            2 => self.node2.store(ready, Ordering::Relaxed),
            _ => {}
        }
    }

    pub fn get(&self, node_id: i64) -> bool {
        match node_id {
            1 => self.node1.load(Ordering::Relaxed),
            2 => self.node2.load(Ordering::Relaxed),
            _ => false,
        }
    }

    /// Called after a successful dispatch: both nodes are about to start a
    /// new job, so their advisory "ready" goes back to false until the next
    /// `disp/state/*` message says otherwise.
    pub fn clear(&self) {
        self.node1.store(false, Ordering::Relaxed);
        self.node2.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_roundtrip_per_node() {
        let a = AdvisoryReadiness::new();
        a.set(1, true);
        a.set(2, false);
        assert!(a.get(1));
        assert!(!a.get(2));
    }

    #[test]
    fn clear_resets_both_nodes() {
        let a = AdvisoryReadiness::new();
        a.set(1, true);
        a.set(2, true);
        a.clear();
        assert!(!a.get(1));
        assert!(!a.get(2));
    }
}
