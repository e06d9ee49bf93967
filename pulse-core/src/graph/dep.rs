//! Per-cell edge registry.

use indexmap::IndexSet;

use super::CellId;
use crate::reactive::SubscriptionId;

/// Edge registry owned by exactly one cell.
///
/// `deps` are the cells that must be re-ingested when the owner changes;
/// `subs` are the external subscriptions notified after a drain cycle.
/// Both sets keep insertion order so iteration is deterministic, and adding
/// a member twice is a no-op.
#[derive(Debug, Default, Clone)]
pub struct Dep {
    deps: IndexSet<CellId>,
    subs: IndexSet<SubscriptionId>,
}

impl Dep {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dependent. Returns `false` if it was already present.
    pub fn depend(&mut self, dependent: CellId) -> bool {
        self.deps.insert(dependent)
    }

    pub fn undepend(&mut self, dependent: CellId) -> bool {
        self.deps.shift_remove(&dependent)
    }

    pub fn subscribe(&mut self, sub: SubscriptionId) -> bool {
        self.subs.insert(sub)
    }

    pub fn unsubscribe(&mut self, sub: SubscriptionId) -> bool {
        self.subs.shift_remove(&sub)
    }

    pub fn dependents(&self) -> impl Iterator<Item = CellId> + '_ {
        self.deps.iter().copied()
    }

    pub fn subscribers(&self) -> impl Iterator<Item = SubscriptionId> + '_ {
        self.subs.iter().copied()
    }

    pub fn has_dependent(&self, dependent: CellId) -> bool {
        self.deps.contains(&dependent)
    }

    pub fn dependent_count(&self) -> usize {
        self.deps.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_is_idempotent() {
        let mut dep = Dep::new();
        let a = CellId::new();

        assert!(dep.depend(a));
        assert!(!dep.depend(a));
        assert_eq!(dep.dependent_count(), 1);

        assert!(dep.undepend(a));
        assert!(!dep.undepend(a));
        assert_eq!(dep.dependent_count(), 0);
    }

    #[test]
    fn iteration_follows_insertion_order() {
        let mut dep = Dep::new();
        let ids: Vec<CellId> = (0..4).map(|_| CellId::new()).collect();
        for id in ids.iter().rev() {
            dep.depend(*id);
        }

        let seen: Vec<CellId> = dep.dependents().collect();
        let expected: Vec<CellId> = ids.iter().rev().copied().collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn subscribers_are_tracked_separately() {
        let mut dep = Dep::new();
        let sub = SubscriptionId::new();

        dep.subscribe(sub);
        dep.subscribe(sub);
        assert_eq!(dep.subscriber_count(), 1);
        assert_eq!(dep.dependent_count(), 0);

        dep.unsubscribe(sub);
        assert_eq!(dep.subscriber_count(), 0);
    }
}
