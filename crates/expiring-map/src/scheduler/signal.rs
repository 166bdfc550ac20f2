//! Sleep-until-deadline with early wake.
//!
//! The scheduler publishes the instant it intends to sleep until. Mutations
//! that produce a new deadline call [`WakeSignal::notify_deadline`], which
//! only signals the condvar when that deadline is strictly earlier than the
//! published target. Deadlines published while the scheduler is awake are
//! remembered, and the next sleep is skipped if one of them precedes the
//! target it was about to wait for. A compaction request wakes the
//! scheduler regardless of deadlines.

use parking_lot::{Condvar, Mutex};
use std::time::Instant;

#[derive(Debug, Default)]
struct WaitState {
    /// Instant the scheduler is sleeping until; `None` while it is awake
    /// or sleeping without a deadline.
    target: Option<Instant>,
    /// Whether the scheduler is blocked in `wait`.
    sleeping: bool,
    /// Earliest deadline published since the current cycle began.
    pending: Option<Instant>,
    /// The deadline heap holds too many stale entries.
    compact: bool,
    /// Permanent stop request.
    shutdown: bool,
}

/// Result of one [`WakeSignal::sleep`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The target instant was reached.
    Timeout,
    /// A mutation published an earlier deadline (or a spurious wakeup
    /// happened).
    Notified,
    /// Shutdown was requested.
    Shutdown,
}

/// Condition variable keyed to the scheduler's current wait target.
#[derive(Debug, Default)]
pub struct WakeSignal {
    state: Mutex<WaitState>,
    condvar: Condvar,
}

impl WakeSignal {
    /// Create a new signal with no wait target.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new deadline.
    ///
    /// Returns true if the scheduler was (or will be) woken because of it.
    pub fn notify_deadline(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        if state.sleeping && state.target.is_some_and(|target| deadline >= target) {
            return false;
        }
        state.pending = Some(state.pending.map_or(deadline, |p| p.min(deadline)));
        if state.sleeping {
            self.condvar.notify_one();
        }
        true
    }

    /// Ask the scheduler to run a cycle so it compacts its heap.
    ///
    /// Returns false once shutdown was requested, as nobody will act on it.
    pub fn request_compaction(&self) -> bool {
        let mut state = self.state.lock();
        if state.shutdown {
            return false;
        }
        if !state.compact {
            state.compact = true;
            if state.sleeping {
                self.condvar.notify_one();
            }
        }
        true
    }

    /// Mark the start of a sweep cycle.
    ///
    /// Deadlines published and compactions requested after this call are
    /// re-checked before the next sleep. Returns false if shutdown was
    /// requested.
    pub fn begin_cycle(&self) -> bool {
        let mut state = self.state.lock();
        state.pending = None;
        state.compact = false;
        !state.shutdown
    }

    /// Sleep until `target` (or indefinitely when `None`).
    ///
    /// Returns immediately with [`Wake::Notified`] if a deadline earlier
    /// than `target` was published, or a compaction requested, since
    /// [`begin_cycle`](WakeSignal::begin_cycle).
    pub fn sleep(&self, target: Option<Instant>) -> Wake {
        let mut state = self.state.lock();
        if state.shutdown {
            return Wake::Shutdown;
        }
        if state.compact
            || state
                .pending
                .is_some_and(|pending| target.is_none_or(|target| pending < target))
        {
            return Wake::Notified;
        }

        state.target = target;
        state.sleeping = true;
        let timed_out = match target {
            Some(deadline) => self.condvar.wait_until(&mut state, deadline).timed_out(),
            None => {
                self.condvar.wait(&mut state);
                false
            }
        };
        state.sleeping = false;
        state.target = None;

        if state.shutdown {
            Wake::Shutdown
        } else if timed_out {
            Wake::Timeout
        } else {
            Wake::Notified
        }
    }

    /// Request permanent shutdown and wake the scheduler.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.condvar.notify_all();
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }
}
