use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;

/// Correlation table for calls awaiting an out-of-band completion.
///
/// Every registered call gets a fresh token; the first `complete` for that
/// token wins and later ones are ignored. Clearing the table drops every
/// outstanding sender, so waiters observe cancellation instead of hanging.
pub struct PendingCalls<T> {
    next: AtomicU64,
    slots: DashMap<u64, oneshot::Sender<T>>,
}

impl<T> Default for PendingCalls<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingCalls<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            slots: DashMap::new(),
        }
    }

    pub fn register(&self) -> (u64, oneshot::Receiver<T>) {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.slots.insert(id, tx);
        (id, rx)
    }

    /// Returns `false` if `id` is unknown or already completed.
    pub fn complete(&self, id: u64, value: T) -> bool {
        self.slots
            .remove(&id)
            .is_some_and(|(_, tx)| tx.send(value).is_ok())
    }

    pub fn cancel(&self, id: u64) -> bool {
        self.slots.remove(&id).is_some()
    }

    /// Drop every outstanding call. Returns how many were pending.
    pub fn clear(&self) -> usize {
        let count = self.slots.len();
        self.slots.clear();
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
