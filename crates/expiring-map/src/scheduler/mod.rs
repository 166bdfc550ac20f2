//! Background expiration for a single map.
//!
//! Each map owns one scheduler thread. It sleeps until the earliest
//! deadline in the store's heap, pops every due heap entry, and resolves
//! each one against the store under that entry's shard lock: due entries
//! are removed and handed to the dispatcher, extended entries are pushed
//! back with their new deadline, and stale heap entries are dropped.
//!
//! ```text
//! Caller threads                         Scheduler thread
//! ┌──────────────────────┐               ┌──────────────────────────┐
//! │ put / get / renew    │──push heap──▶ │ sleep(next deadline)     │
//! │   - shard lock       │               │ pop due heap entries     │
//! │   - maybe push heap  │──notify────▶  │   expire / reschedule    │
//! └──────────────────────┘               │   notify listeners       │
//!                                        │ compact stale entries    │
//!                                        └──────────────────────────┘
//! ```
//!
//! Panics raised while resolving a heap entry or while running a sweep are
//! caught, logged as [`ExpiringMapError::SchedulerFault`], and counted;
//! the loop keeps going.

pub mod deadline;
pub mod signal;

pub use deadline::{DeadlineHeap, DueSlot};
pub use signal::{Wake, WakeSignal};

use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

use crate::error::{ExpiringMapError, Result, panic_message};
use crate::listener::dispatch::NotificationDispatcher;
use crate::stats::MapStats;
use crate::store::{EntryStore, Expired, SlotOutcome};

/// Name given to every scheduler thread.
pub const SCHEDULER_THREAD_NAME: &str = "expiring-map-scheduler";

/// Pause after a failed cycle before trying again.
const FAULT_BACKOFF: Duration = Duration::from_millis(10);

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Entries removed and notified.
    pub expired: usize,
    /// Entries pushed back with a later deadline.
    pub rescheduled: usize,
    /// Heap entries that no longer backed a live entry.
    pub stale: usize,
    /// Heap entries whose processing panicked.
    pub faults: usize,
}

/// Handle to a running scheduler thread.
///
/// Dropping the handle stops the thread and waits for it.
pub struct ExpirationScheduler<K, V>
where
    K: Eq + Hash + Clone,
{
    store: Arc<EntryStore<K, V>>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl<K, V> ExpirationScheduler<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Spawn the scheduler thread for `store`.
    pub fn start(
        store: Arc<EntryStore<K, V>>,
        dispatcher: Arc<NotificationDispatcher<K, V>>,
    ) -> Result<Self> {
        let thread_store = Arc::clone(&store);
        let handle = thread::Builder::new()
            .name(SCHEDULER_THREAD_NAME.to_string())
            .spawn(move || scheduler_loop(&thread_store, &dispatcher))?;
        let thread_id = handle.thread().id();

        Ok(Self {
            store,
            handle: parking_lot::Mutex::new(Some(handle)),
            thread_id,
        })
    }
}

impl<K, V> ExpirationScheduler<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Whether the thread is still processing expirations.
    pub fn is_running(&self) -> bool {
        !self.store.signal().is_shutdown()
            && self
                .handle
                .lock()
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the thread. Does not wait for it.
    pub fn shutdown(&self) {
        self.store.signal().shutdown();
    }

    /// Stop the thread and wait for it to exit.
    ///
    /// Called from the scheduler thread itself (a listener dropping the last
    /// map handle), this only signals.
    pub fn wait(&self) {
        self.shutdown();
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            debug!("Waiting for expiration scheduler thread");
            let _ = handle.join();
        }
    }
}

impl<K, V> std::fmt::Debug for ExpirationScheduler<K, V>
where
    K: Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationScheduler")
            .field("thread_id", &self.thread_id)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl<K, V> Drop for ExpirationScheduler<K, V>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        self.wait();
    }
}

/// Scheduler thread main loop.
fn scheduler_loop<K, V>(store: &EntryStore<K, V>, dispatcher: &NotificationDispatcher<K, V>)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    info!("Expiration scheduler started");

    while store.signal().begin_cycle() {
        let next = match panic::catch_unwind(AssertUnwindSafe(|| run_cycle(store, dispatcher))) {
            Ok(next) => next,
            Err(payload) => {
                record_fault(store.stats(), panic_message(payload.as_ref()));
                Some(Instant::now() + FAULT_BACKOFF)
            }
        };

        trace!(next = ?next.map(|d| d.saturating_duration_since(Instant::now())), "Scheduler sleeping");
        if store.signal().sleep(next) == Wake::Shutdown {
            break;
        }
    }

    info!("Expiration scheduler stopped");
}

/// One wake-up: sweep, compact, and compute the next wait target.
fn run_cycle<K, V>(
    store: &EntryStore<K, V>,
    dispatcher: &NotificationDispatcher<K, V>,
) -> Option<Instant>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let summary = sweep(store, dispatcher, Instant::now());
    store.stats().record_sweep();
    if summary != SweepSummary::default() {
        debug!(
            expired = summary.expired,
            rescheduled = summary.rescheduled,
            stale = summary.stale,
            faults = summary.faults,
            "Sweep complete"
        );
    }

    let compacted = store.compact_if_needed();
    if compacted > 0 {
        debug!(compacted, "Compacted deadline heap");
    }

    store.next_deadline()
}

/// Resolve every heap entry due at `now`.
///
/// Sync listeners for one entry finish before the next entry is examined.
pub(crate) fn sweep<K, V>(
    store: &EntryStore<K, V>,
    dispatcher: &NotificationDispatcher<K, V>,
    now: Instant,
) -> SweepSummary
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let mut summary = SweepSummary::default();

    for slot in store.pop_due(now) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match store.expire_slot(slot, now) {
            SlotOutcome::Expired(Expired { key, value }) => {
                trace!("Entry expired");
                dispatcher.notify(key, value);
                SlotKind::Expired
            }
            SlotOutcome::Rescheduled(_) => SlotKind::Rescheduled,
            SlotOutcome::Stale => SlotKind::Stale,
        }));

        match outcome {
            Ok(SlotKind::Expired) => summary.expired += 1,
            Ok(SlotKind::Rescheduled) => summary.rescheduled += 1,
            Ok(SlotKind::Stale) => summary.stale += 1,
            Err(payload) => {
                summary.faults += 1;
                record_fault(store.stats(), panic_message(payload.as_ref()));
            }
        }
    }

    summary
}

enum SlotKind {
    Expired,
    Rescheduled,
    Stale,
}

fn record_fault(stats: &MapStats, message: String) {
    let fault = ExpiringMapError::SchedulerFault(message);
    error!(error = %fault, "Expiration sweep failed, continuing");
    stats.record_scheduler_fault();
}
