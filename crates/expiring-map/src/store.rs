//! Concurrent entry storage with deadline bookkeeping.
//!
//! [`EntryStore`] pairs a sharded [`DashMap`] with the deadline heap the
//! scheduler consumes. Every mutation runs under the key's shard lock and,
//! when it moves the entry's deadline earlier than its backing heap entry,
//! pushes a new heap entry before the lock is released. Later deadlines
//! (the common case: access renewal, replacement) are left to the scheduler,
//! which re-schedules an entry when its old heap entry fires and finds it
//! still in the future.
//!
//! A due entry is logically expired even before the scheduler gets to it.
//! Operations that find one remove it atomically and hand the pair back as
//! an [`Expired`] so the caller can notify listeners. Whoever removes an
//! entry owns its notification.
//!
//! Lock order is shard, then heap. The wake-signal lock is only taken after
//! both are released.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::entry::ExpiringEntry;
use crate::error::{ExpiringMapError, Result, VARIABLE_EXPIRATION_DISABLED};
use crate::policy::{ExpirationOverride, ExpirationPolicy, ExpirationSettings, validate_ttl};
use crate::scheduler::deadline::{DeadlineHeap, DueSlot};
use crate::scheduler::signal::WakeSignal;
use crate::stats::MapStats;

/// Heap entries allowed beyond twice the live entry count before compaction.
pub(crate) const COMPACTION_SLACK: usize = 1024;

/// An entry removed because its deadline passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired<K, V> {
    /// Key of the evicted entry.
    pub key: K,
    /// Value of the evicted entry.
    pub value: V,
}

/// Result of an insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome<K, V> {
    /// Live value that was replaced (or, for `put_if_absent`, kept).
    pub previous: Option<V>,
    /// Due entry that was displaced and must be notified.
    pub expired: Option<Expired<K, V>>,
}

impl<K, V> PutOutcome<K, V> {
    fn vacant() -> Self {
        Self {
            previous: None,
            expired: None,
        }
    }
}

/// Result of an operation on a single existing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access<K, V, R> {
    /// The entry was live; carries the operation's result.
    Live(R),
    /// No entry for the key.
    Missing,
    /// The entry was due and has been removed by this call.
    Expired(Expired<K, V>),
}

impl<K, V, R> Access<K, V, R> {
    /// The live result, if any.
    pub fn live(self) -> Option<R> {
        match self {
            Access::Live(r) => Some(r),
            Access::Missing | Access::Expired(_) => None,
        }
    }
}

/// What the scheduler did with one popped heap entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOutcome<K, V> {
    /// The entry was due and has been removed.
    Expired(Expired<K, V>),
    /// The deadline had been extended; a new heap entry was pushed.
    Rescheduled(Instant),
    /// The heap entry no longer backs a live entry.
    Stale,
}

/// Concurrent map of expiring entries plus the deadline index.
pub struct EntryStore<K, V> {
    entries: DashMap<K, ExpiringEntry<V>>,
    deadlines: DeadlineHeap<K>,
    signal: WakeSignal,
    defaults: RwLock<ExpirationSettings>,
    variable: bool,
    stats: Arc<MapStats>,
}

impl<K, V> EntryStore<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty store.
    pub fn new(defaults: ExpirationSettings, variable: bool, stats: Arc<MapStats>) -> Self {
        Self {
            entries: DashMap::new(),
            deadlines: DeadlineHeap::new(),
            signal: WakeSignal::new(),
            defaults: RwLock::new(defaults),
            variable,
            stats,
        }
    }

    /// Whether per-entry settings are allowed.
    pub fn is_variable(&self) -> bool {
        self.variable
    }

    /// Current map-wide defaults.
    pub fn defaults(&self) -> ExpirationSettings {
        *self.defaults.read()
    }

    pub(crate) fn signal(&self) -> &WakeSignal {
        &self.signal
    }

    pub(crate) fn stats(&self) -> &MapStats {
        &self.stats
    }

    fn require_variable(&self) -> Result<()> {
        if self.variable {
            Ok(())
        } else {
            Err(ExpiringMapError::UnsupportedOperation(VARIABLE_EXPIRATION_DISABLED))
        }
    }

    fn check_override(&self, expiration: ExpirationOverride) -> Result<()> {
        if expiration.is_empty() {
            return Ok(());
        }
        self.require_variable()?;
        if let Some(duration) = expiration.duration {
            validate_ttl(duration)?;
        }
        Ok(())
    }

    /// Push a heap entry for the entry's current deadline.
    ///
    /// Must be called with the entry's shard lock held.
    fn schedule(&self, key: &K, entry: &mut ExpiringEntry<V>) -> Instant {
        let deadline = entry.deadline();
        let generation = self.deadlines.insert(key.clone(), deadline);
        entry.mark_scheduled(generation);
        deadline
    }

    fn record_expired(&self, key: K, entry: ExpiringEntry<V>) -> Expired<K, V> {
        self.stats.record_expiration();
        Expired {
            key,
            value: entry.into_value(),
        }
    }

    /// Insert or replace `key`.
    ///
    /// Replacing a live entry keeps its settings (merged with `expiration`)
    /// and restarts its clock. Replacing a due entry expires it first.
    /// A non-empty `expiration` requires variable expiration.
    pub fn put(&self, key: K, value: V, expiration: ExpirationOverride) -> Result<PutOutcome<K, V>> {
        self.check_override(expiration)?;
        Ok(self.insert(key, value, expiration))
    }

    pub(crate) fn insert(&self, key: K, value: V, expiration: ExpirationOverride) -> PutOutcome<K, V> {
        let defaults = self.defaults();
        let now = Instant::now();

        let (outcome, deadline) = match self.entries.entry(key) {
            Entry::Occupied(mut occupied) if !occupied.get().is_due(now) => {
                let entry = occupied.get_mut();
                let previous = entry.replace_value(value);
                entry.apply_override(expiration, defaults);
                entry.reset(defaults, now);
                let deadline = if entry.needs_schedule() {
                    let key = occupied.key().clone();
                    Some(self.schedule(&key, occupied.get_mut()))
                } else {
                    None
                };
                let outcome = PutOutcome {
                    previous: Some(previous),
                    expired: None,
                };
                (outcome, deadline)
            }
            Entry::Occupied(mut occupied) => {
                let key = occupied.key().clone();
                let mut fresh = ExpiringEntry::new(value, expiration, defaults, now);
                let deadline = self.schedule(&key, &mut fresh);
                let stale = std::mem::replace(occupied.get_mut(), fresh);
                let outcome = PutOutcome {
                    previous: None,
                    expired: Some(self.record_expired(key, stale)),
                };
                (outcome, Some(deadline))
            }
            Entry::Vacant(vacant) => {
                let mut fresh = ExpiringEntry::new(value, expiration, defaults, now);
                let deadline = self.schedule(vacant.key(), &mut fresh);
                vacant.insert(fresh);
                (PutOutcome::vacant(), Some(deadline))
            }
        };

        if let Some(deadline) = deadline {
            self.signal.notify_deadline(deadline);
            self.check_heap_growth();
        }
        outcome
    }

    /// Insert `key` only if it has no live entry.
    ///
    /// A live entry is left untouched (no renewal) and its value returned in
    /// `previous`.
    pub fn put_if_absent(
        &self,
        key: K,
        value: V,
        expiration: ExpirationOverride,
    ) -> Result<PutOutcome<K, V>>
    where
        V: Clone,
    {
        self.check_override(expiration)?;
        Ok(self.insert_if_absent(key, value, expiration))
    }

    pub(crate) fn insert_if_absent(
        &self,
        key: K,
        value: V,
        expiration: ExpirationOverride,
    ) -> PutOutcome<K, V>
    where
        V: Clone,
    {
        let defaults = self.defaults();
        let now = Instant::now();

        let (outcome, deadline) = match self.entries.entry(key) {
            Entry::Occupied(occupied) if !occupied.get().is_due(now) => {
                let outcome = PutOutcome {
                    previous: Some(occupied.get().value().clone()),
                    expired: None,
                };
                (outcome, None)
            }
            Entry::Occupied(mut occupied) => {
                let key = occupied.key().clone();
                let mut fresh = ExpiringEntry::new(value, expiration, defaults, now);
                let deadline = self.schedule(&key, &mut fresh);
                let stale = std::mem::replace(occupied.get_mut(), fresh);
                let outcome = PutOutcome {
                    previous: None,
                    expired: Some(self.record_expired(key, stale)),
                };
                (outcome, Some(deadline))
            }
            Entry::Vacant(vacant) => {
                let mut fresh = ExpiringEntry::new(value, expiration, defaults, now);
                let deadline = self.schedule(vacant.key(), &mut fresh);
                vacant.insert(fresh);
                (PutOutcome::vacant(), Some(deadline))
            }
        };

        if let Some(deadline) = deadline {
            self.signal.notify_deadline(deadline);
            self.check_heap_growth();
        }
        outcome
    }

    /// Insert `key` only if no entry exists, for values produced by a loader.
    ///
    /// Returns the value now associated with `key`: the loaded one, or the
    /// live value another thread inserted first.
    pub fn insert_loaded(
        &self,
        key: K,
        value: V,
        expiration: ExpirationOverride,
    ) -> Result<(V, Option<Expired<K, V>>)>
    where
        V: Clone,
    {
        let outcome = self.put_if_absent(key, value.clone(), expiration)?;
        match outcome.previous {
            Some(existing) => Ok((existing, outcome.expired)),
            None => {
                self.stats.record_load();
                Ok((value, outcome.expired))
            }
        }
    }

    /// Run `f` on the live entry for `key`.
    ///
    /// A due entry is removed instead and returned as
    /// [`Access::Expired`]. If `f` moved the deadline earlier than its heap
    /// entry, a new one is pushed and the scheduler is woken.
    fn with_live_entry<R>(
        &self,
        key: &K,
        f: impl FnOnce(&mut ExpiringEntry<V>, ExpirationSettings, Instant) -> R,
    ) -> Access<K, V, R> {
        loop {
            let now = Instant::now();
            let Some(mut guard) = self.entries.get_mut(key) else {
                return Access::Missing;
            };

            if guard.is_due(now) {
                drop(guard);
                if let Some((key, entry)) = self.entries.remove_if(key, |_, e| e.is_due(now)) {
                    trace!("Due entry evicted by caller");
                    return Access::Expired(self.record_expired(key, entry));
                }
                // Renewed, replaced, or removed in between
                continue;
            }

            let defaults = self.defaults();
            let (stored_key, entry) = guard.pair_mut();
            let result = f(entry, defaults, now);
            let deadline = entry.needs_schedule().then(|| self.schedule(stored_key, entry));
            drop(guard);

            if let Some(deadline) = deadline {
                self.signal.notify_deadline(deadline);
                self.check_heap_growth();
            }
            return Access::Live(result);
        }
    }

    /// Look up `key`, renewing it under the `Accessed` policy.
    pub fn get(&self, key: &K) -> Access<K, V, V>
    where
        V: Clone,
    {
        let access = self.with_live_entry(key, |entry, defaults, now| {
            if entry.policy() == ExpirationPolicy::Accessed {
                entry.reset(defaults, now);
            }
            entry.value().clone()
        });
        match access {
            Access::Live(_) => self.stats.record_hit(),
            Access::Missing | Access::Expired(_) => self.stats.record_miss(),
        }
        access
    }

    /// Replace the value of a live entry, restarting its clock.
    pub fn replace(&self, key: &K, value: V) -> Access<K, V, V> {
        self.with_live_entry(key, |entry, defaults, now| {
            let previous = entry.replace_value(value);
            entry.reset(defaults, now);
            previous
        })
    }

    /// Remove `key` without notification.
    ///
    /// The entry's heap slot goes stale and is dropped by the next sweep
    /// or compaction.
    pub fn remove(&self, key: &K) -> Option<V> {
        let (_, entry) = self.entries.remove(key)?;
        self.check_heap_growth();
        Some(entry.into_value())
    }

    /// Remove every entry without notification.
    pub fn clear(&self) {
        // Heap first: an insert racing with the store clear must keep its
        // heap entry.
        self.deadlines.clear();
        self.entries.clear();
    }

    /// Set the TTL of `key` and restart its clock.
    pub fn set_expiration(&self, key: &K, duration: Duration) -> Result<Access<K, V, ()>> {
        self.require_variable()?;
        validate_ttl(duration)?;
        let change = ExpirationOverride {
            duration: Some(duration),
            policy: None,
        };
        Ok(self.with_live_entry(key, |entry, defaults, now| {
            entry.apply_override(change, defaults);
            entry.reset(defaults, now);
        }))
    }

    /// Set the policy of `key`; effective immediately, clock untouched.
    pub fn set_expiration_policy(
        &self,
        key: &K,
        policy: ExpirationPolicy,
    ) -> Result<Access<K, V, ()>> {
        self.require_variable()?;
        let change = ExpirationOverride {
            duration: None,
            policy: Some(policy),
        };
        Ok(self.with_live_entry(key, |entry, defaults, _| {
            entry.apply_override(change, defaults);
        }))
    }

    /// Restart the clock of `key`.
    pub fn reset_expiration(&self, key: &K) -> Access<K, V, ()> {
        self.with_live_entry(key, |entry, defaults, now| entry.reset(defaults, now))
    }

    /// Change the map-wide default TTL, used by entries at their next reset.
    pub fn set_default_expiration(&self, duration: Duration) -> Result<()> {
        self.require_variable()?;
        self.defaults.write().duration = validate_ttl(duration)?;
        Ok(())
    }

    /// Change the map-wide default policy, used by entries at their next reset.
    pub fn set_default_expiration_policy(&self, policy: ExpirationPolicy) -> Result<()> {
        self.require_variable()?;
        self.defaults.write().policy = policy;
        Ok(())
    }

    fn read_live<R>(&self, key: &K, f: impl FnOnce(&ExpiringEntry<V>, Instant) -> R) -> Option<R> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_due(now))
            .map(|entry| f(&entry, now))
    }

    /// Whether `key` has a live entry. Never renews.
    pub fn contains_key(&self, key: &K) -> bool {
        self.read_live(key, |_, _| ()).is_some()
    }

    /// Effective TTL of `key`.
    pub fn expiration(&self, key: &K) -> Option<Duration> {
        self.read_live(key, |entry, _| entry.duration())
    }

    /// Time left before `key` becomes due.
    pub fn expected_expiration(&self, key: &K) -> Option<Duration> {
        self.read_live(key, ExpiringEntry::time_remaining)
    }

    /// Effective policy of `key`.
    pub fn expiration_policy(&self, key: &K) -> Option<ExpirationPolicy> {
        self.read_live(key, |entry, _| entry.policy())
    }

    /// Number of stored entries, including due entries not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys of all live entries.
    pub fn keys(&self) -> Vec<K> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| !entry.is_due(now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Key/value pairs of all live entries.
    pub fn entries(&self) -> Vec<(K, V)>
    where
        V: Clone,
    {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| !entry.is_due(now))
            .map(|entry| (entry.key().clone(), entry.value().value().clone()))
            .collect()
    }

    // ------------------------------------------------------------------
    // Scheduler side
    // ------------------------------------------------------------------

    /// Earliest deadline in the heap (possibly stale).
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.peek_deadline()
    }

    /// Pop every heap entry due at `now`.
    pub(crate) fn pop_due(&self, now: Instant) -> Vec<DueSlot<K>> {
        self.deadlines.pop_expired(now)
    }

    /// Resolve one popped heap entry against the store.
    ///
    /// Removes the entry if the heap entry still backs it and it is due;
    /// re-schedules it if its deadline has since moved later.
    pub(crate) fn expire_slot(&self, slot: DueSlot<K>, now: Instant) -> SlotOutcome<K, V> {
        let Entry::Occupied(mut occupied) = self.entries.entry(slot.key) else {
            return SlotOutcome::Stale;
        };
        if occupied.get().generation() != slot.generation {
            return SlotOutcome::Stale;
        }

        if occupied.get().is_due(now) {
            let (key, entry) = occupied.remove_entry();
            return SlotOutcome::Expired(self.record_expired(key, entry));
        }

        let key = occupied.key().clone();
        let deadline = self.schedule(&key, occupied.get_mut());
        self.stats.record_reschedule();
        SlotOutcome::Rescheduled(deadline)
    }

    fn heap_oversized(&self, heap_len: usize) -> bool {
        heap_len > self.entries.len().saturating_mul(2).saturating_add(COMPACTION_SLACK)
    }

    /// Get stale heap entries compacted once they dominate the heap.
    ///
    /// A running scheduler is woken to do it. Once the scheduler has
    /// stopped nobody sweeps, so the caller compacts.
    fn check_heap_growth(&self) {
        let heap_len = self.deadlines.len();
        if heap_len <= COMPACTION_SLACK || !self.heap_oversized(heap_len) {
            return;
        }
        if self.signal.request_compaction() {
            trace!(heap_len, "Requested deadline heap compaction");
        } else {
            self.compact_if_needed();
        }
    }

    /// Drop stale heap entries once they dominate the heap.
    ///
    /// Called from the scheduler thread, or from callers after the
    /// scheduler stopped: while the heap is being rebuilt it looks empty to
    /// `next_deadline`. Returns the number removed.
    pub(crate) fn compact_if_needed(&self) -> usize {
        if !self.heap_oversized(self.deadlines.len()) {
            return 0;
        }
        let removed = self.deadlines.compact(|key, generation| {
            self.entries
                .get(key)
                .is_some_and(|entry| entry.generation() == generation)
        });
        self.stats.record_compaction(removed);
        removed
    }

    #[cfg(test)]
    pub(crate) fn heap_len(&self) -> usize {
        self.deadlines.len()
    }
}
