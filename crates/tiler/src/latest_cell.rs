//! Single-slot latest-wins cell for cross-thread state snapshots.

use crossbeam_queue::ArrayQueue;

/// A one-element queue where a new publication evicts the unread value.
/// The reader always observes the most recent snapshot; intermediate
/// snapshots it never saw are intentionally dropped.
pub struct LatestCell<T> {
    slot: ArrayQueue<T>,
}

impl<T> LatestCell<T> {
    pub fn new() -> Self {
        Self {
            slot: ArrayQueue::new(1),
        }
    }

    pub fn publish(&self, value: T) {
        self.slot.force_push(value);
    }

    pub fn take(&self) -> Option<T> {
        self.slot.pop()
    }
}

impl<T> Default for LatestCell<T> {
    fn default() -> Self {
        Self::new()
    }
}
