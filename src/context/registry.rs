use dashmap::DashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::error;

/// Result of removing a child from a [`ChildRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The key was not (or no longer) registered. Nothing changed.
    NotRegistered,
    /// The child was removed; other obligations are still outstanding.
    Removed,
    /// The child was removed and it was the last outstanding obligation.
    Settled,
}

/// Tracks the live direct children of one event context.
///
/// Alongside the set of child keys the registry keeps an `outstanding` counter: one unit per
/// registered child plus any implicit obligations the owner declared up front (its own
/// response, an external gate). Every unit is released exactly once, so exactly one caller
/// observes the counter reaching zero.
///
/// Once the counter has reached zero the registry is settled and refuses new children;
/// registration only succeeds while something is still outstanding, which keeps a
/// concurrent `register` and the final release linearizable.
#[derive(Debug)]
pub struct ChildRegistry {
    children: DashSet<u64>,
    outstanding: AtomicUsize,
    next_key: AtomicU64,
}

impl ChildRegistry {
    /// Creates a registry with `implicit` obligations outstanding and no children.
    pub fn new(implicit: usize) -> Self {
        Self {
            children: DashSet::new(),
            outstanding: AtomicUsize::new(implicit),
            next_key: AtomicU64::new(1),
        }
    }

    /// Registers a new child and returns its key, or `None` if the registry has settled.
    pub fn register(&self) -> Option<u64> {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n + 1)
            })
            .ok()?;
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.children.insert(key);
        Some(key)
    }

    /// Removes a child. Safe to call any number of times from any thread; only the first
    /// call for a given key releases its obligation.
    pub fn remove(&self, key: u64) -> Removal {
        if self.children.remove(&key).is_none() {
            return Removal::NotRegistered;
        }
        if self.release() {
            Removal::Settled
        } else {
            Removal::Removed
        }
    }

    /// Releases one implicit obligation. Returns `true` if this was the last one.
    pub fn release(&self) -> bool {
        match self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous == 1,
            Err(_) => {
                error!("child registry released more obligations than it tracked");
                debug_assert!(false, "child registry underflow");
                false
            }
        }
    }

    /// Obligations not yet released. This is the count completion is decided on.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Number of registered children. A `register` in flight is counted in `outstanding`
    /// before it shows up here, so this can lag by the children being added right now.
    pub fn len(&self) -> usize {
        self.children.len()
    }
}
