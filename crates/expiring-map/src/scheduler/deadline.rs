//! Deadline tracking for stored entries.
//!
//! Provides a min-heap of entry deadlines that answers "what expires next"
//! in O(1) and pops due entries in O(log n) each. Generation counters mark
//! heap entries that no longer back a live entry (removed, replaced, or
//! superseded by an earlier deadline) so they can be skipped without
//! searching the heap.

use parking_lot::Mutex;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// An entry in the deadline heap.
#[derive(Debug, Clone)]
struct DeadlineEntry<K> {
    /// When the entry becomes due.
    deadline: Instant,
    /// Generation counter to detect stale entries.
    generation: u64,
    /// Key of the store entry.
    key: K,
}

impl<K> PartialEq for DeadlineEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl<K> Eq for DeadlineEntry<K> {}

impl<K> Ord for DeadlineEntry<K> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Earliest deadline first (wrapped in Reverse); generations are unique
        self.deadline
            .cmp(&other.deadline)
            .then(self.generation.cmp(&other.generation))
    }
}

impl<K> PartialOrd for DeadlineEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// A due heap entry handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueSlot<K> {
    /// Key of the store entry.
    pub key: K,
    /// Deadline the heap entry was pushed with.
    pub deadline: Instant,
    /// Generation assigned at insertion.
    pub generation: u64,
}

/// Thread-safe deadline heap for tracking entry expirations.
///
/// Callers push while holding the entry's shard lock; the heap lock is
/// never held while a shard lock is acquired.
pub struct DeadlineHeap<K> {
    /// Min-heap of deadlines (using Reverse for earliest-first ordering).
    heap: Mutex<BinaryHeap<Reverse<DeadlineEntry<K>>>>,
    /// Next generation to hand out (monotonically increasing, starts at 1).
    generation: AtomicU64,
}

impl<K> DeadlineHeap<K> {
    /// Create a new empty deadline heap.
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            generation: AtomicU64::new(1),
        }
    }

    /// Insert a deadline for `key`.
    ///
    /// Returns the generation assigned to this heap entry. The caller stores
    /// it on the store entry so that later pops can be validated.
    pub fn insert(&self, key: K, deadline: Instant) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        self.heap.lock().push(Reverse(DeadlineEntry {
            deadline,
            generation,
            key,
        }));
        generation
    }

    /// Pop every heap entry whose deadline is at or before `now`.
    ///
    /// The caller must check each slot's generation against the store.
    pub fn pop_expired(&self, now: Instant) -> Vec<DueSlot<K>> {
        let mut expired = Vec::new();
        let mut heap = self.heap.lock();

        while heap.peek().is_some_and(|Reverse(entry)| entry.deadline <= now) {
            if let Some(Reverse(entry)) = heap.pop() {
                expired.push(DueSlot {
                    key: entry.key,
                    deadline: entry.deadline,
                    generation: entry.generation,
                });
            }
        }

        expired
    }

    /// Peek at the next deadline without removing it.
    ///
    /// Returns `None` if the heap is empty.
    pub fn peek_deadline(&self) -> Option<Instant> {
        self.heap.lock().peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Get the number of entries in the heap.
    ///
    /// Note: This may include stale entries that haven't been cleaned up yet.
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Check if the heap is empty.
    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    /// Clear all entries from the heap.
    pub fn clear(&self) {
        self.heap.lock().clear();
    }

    /// Compact the heap by removing entries that fail the validity predicate.
    ///
    /// The heap is drained under its lock, filtered without it (the predicate
    /// may take shard locks), and merged back with anything pushed meanwhile.
    /// Only the thread that consumes the heap may call this, since entries
    /// are briefly invisible to `peek_deadline`.
    ///
    /// Returns the number of entries removed.
    pub fn compact<F>(&self, is_valid: F) -> usize
    where
        F: Fn(&K, u64) -> bool,
    {
        let drained = std::mem::take(&mut *self.heap.lock());
        let old_len = drained.len();

        let valid: Vec<_> = drained
            .into_iter()
            .filter(|Reverse(entry)| is_valid(&entry.key, entry.generation))
            .collect();
        let removed = old_len - valid.len();

        self.heap.lock().extend(valid);
        removed
    }
}

impl<K> Default for DeadlineHeap<K> {
    fn default() -> Self {
        Self::new()
    }
}


/// Property-based tests using proptest.
#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    proptest! {
        /// Popping at any cutoff returns exactly the entries at or before it,
        /// earliest first.
        #[test]
        fn pop_expired_returns_due_prefix_in_order(
            offsets in prop::collection::vec(0u64..10_000, 0..100),
            cutoff in 0u64..10_000
        ) {
            let base = Instant::now();
            let heap = DeadlineHeap::new();
            for (key, offset) in offsets.iter().enumerate() {
                heap.insert(key, base + Duration::from_millis(*offset));
            }

            let now = base + Duration::from_millis(cutoff);
            let popped = heap.pop_expired(now);

            let expected = offsets.iter().filter(|o| **o <= cutoff).count();
            prop_assert_eq!(popped.len(), expected);
            prop_assert_eq!(heap.len(), offsets.len() - expected);
            prop_assert!(popped.windows(2).all(|w| w[0].deadline <= w[1].deadline));
            prop_assert!(popped.iter().all(|slot| slot.deadline <= now));
            if let Some(next) = heap.peek_deadline() {
                prop_assert!(next > now);
            }
        }
    }
}
