//! Stored entries and their expiration metadata.

use std::time::{Duration, Instant};

use crate::policy::{ExpirationOverride, ExpirationPolicy, ExpirationSettings};

/// Offset used when `now + ttl` does not fit in an [`Instant`] (~100 years).
const MAX_DEADLINE_OFFSET: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Computes `now + ttl`, clamping TTLs too large to represent.
pub(crate) fn deadline_after(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(MAX_DEADLINE_OFFSET))
        .unwrap_or(now)
}

/// A stored value with its expiration metadata.
///
/// The key lives in the store's map; the entry only carries what changes.
/// `scheduled` and `generation` identify the deadline-heap entry that
/// currently backs this entry: heap entries carrying any other generation
/// are stale and ignored by the scheduler.
#[derive(Debug, Clone)]
pub struct ExpiringEntry<V> {
    value: V,
    /// Per-entry settings (variable expiration only).
    expiration: ExpirationOverride,
    /// Settings resolved at the last reset.
    settings: ExpirationSettings,
    last_reset: Instant,
    deadline: Instant,
    /// Deadline of the backing heap entry; never later than `deadline`.
    scheduled: Instant,
    generation: u64,
}

impl<V> ExpiringEntry<V> {
    /// Creates an entry whose clock starts at `now`.
    ///
    /// The entry is not backed by a heap entry until [`mark_scheduled`]
    /// is called.
    ///
    /// [`mark_scheduled`]: ExpiringEntry::mark_scheduled
    pub fn new(
        value: V,
        expiration: ExpirationOverride,
        defaults: ExpirationSettings,
        now: Instant,
    ) -> Self {
        let settings = expiration.resolve(defaults);
        let deadline = deadline_after(now, settings.duration);
        Self {
            value,
            expiration,
            settings,
            last_reset: now,
            deadline,
            scheduled: deadline,
            generation: 0,
        }
    }

    /// Returns the stored value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Replaces the value, returning the previous one.
    pub fn replace_value(&mut self, value: V) -> V {
        std::mem::replace(&mut self.value, value)
    }

    /// Consumes the entry, returning its value.
    pub fn into_value(self) -> V {
        self.value
    }

    /// Effective TTL of this entry.
    pub fn duration(&self) -> Duration {
        self.settings.duration
    }

    /// Effective renewal policy of this entry.
    pub fn policy(&self) -> ExpirationPolicy {
        self.settings.policy
    }

    /// Absolute instant at which this entry becomes due.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// When the clock was last reset.
    pub fn last_reset(&self) -> Instant {
        self.last_reset
    }

    /// Generation of the heap entry backing this entry.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    fn scheduled(&self) -> Instant {
        self.scheduled
    }

    /// Returns true once the deadline has been reached.
    #[inline]
    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline <= now
    }

    /// Time left until the deadline.
    pub fn time_remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    /// Applies new per-entry overrides; takes effect at the next reset,
    /// except for the policy which applies immediately.
    pub fn apply_override(&mut self, expiration: ExpirationOverride, defaults: ExpirationSettings) {
        self.expiration.merge(expiration);
        self.settings.policy = self.expiration.resolve(defaults).policy;
    }

    /// Restarts the TTL clock at `now`, re-resolving settings against `defaults`.
    pub fn reset(&mut self, defaults: ExpirationSettings, now: Instant) {
        self.settings = self.expiration.resolve(defaults);
        self.last_reset = now;
        self.deadline = deadline_after(now, self.settings.duration);
    }

    /// Returns true when the deadline moved earlier than the backing heap
    /// entry, so a new heap entry is required.
    ///
    /// Later deadlines are handled lazily: the scheduler re-schedules the
    /// entry when the old heap entry fires.
    #[inline]
    pub fn needs_schedule(&self) -> bool {
        self.deadline < self.scheduled
    }

    /// Records that a heap entry with `generation` now backs the current deadline.
    pub fn mark_scheduled(&mut self, generation: u64) {
        self.scheduled = self.deadline;
        self.generation = generation;
    }
}
