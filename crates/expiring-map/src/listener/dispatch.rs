//! Delivery of eviction events to registered listeners.
//!
//! The dispatcher is handed each evicted `(key, value)` pair by whichever
//! thread won the removal. Sync listeners run right there, in registration
//! order. Async listeners each get one job on the [`ListenerExecutor`];
//! jobs the pool refuses are run inline, so every async listener still sees
//! every eviction exactly once.
//!
//! A panicking listener is contained here: the panic becomes a
//! [`ExpiringMapError::ListenerFailure`], is logged and counted, and the
//! remaining listeners are still called.

use once_cell::sync::OnceCell;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, trace, warn};

use super::executor::{ExecutorConfig, ListenerExecutor, NotificationJob};
use super::{Delivery, ListenerId, ListenerRegistry};
use crate::error::{ExpiringMapError, panic_message};
use crate::stats::MapStats;

/// Routes eviction events to sync and async listeners.
pub struct NotificationDispatcher<K, V> {
    registry: ListenerRegistry<K, V>,
    stats: Arc<MapStats>,
    executor: OnceCell<Arc<ListenerExecutor>>,
    executor_config: ExecutorConfig,
    /// Whether the executor was supplied by the caller (and is therefore
    /// not ours to shut down).
    shared_executor: bool,
}

impl<K, V> NotificationDispatcher<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create a dispatcher that starts its own pool on first async delivery.
    pub fn new(stats: Arc<MapStats>, executor_config: ExecutorConfig) -> Self {
        Self {
            registry: ListenerRegistry::new(),
            stats,
            executor: OnceCell::new(),
            executor_config,
            shared_executor: false,
        }
    }

    /// Create a dispatcher that delivers async notifications on `executor`.
    pub fn with_executor(stats: Arc<MapStats>, executor: Arc<ListenerExecutor>) -> Self {
        let executor_config = executor.config();
        Self {
            registry: ListenerRegistry::new(),
            stats,
            executor: OnceCell::with_value(executor),
            executor_config,
            shared_executor: true,
        }
    }

    /// The listener registry.
    pub fn registry(&self) -> &ListenerRegistry<K, V> {
        &self.registry
    }

    /// Deliver one eviction to every listener registered right now.
    pub fn notify(&self, key: K, value: V) {
        let sync_listeners = self.registry.snapshot(Delivery::Sync);
        for registered in sync_listeners.iter() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                registered.listener.expired(&key, &value);
            }));
            match outcome {
                Ok(()) => self.stats.record_sync_notification(),
                Err(payload) => report_failure(&self.stats, registered.id, payload.as_ref()),
            }
        }

        let async_listeners = self.registry.snapshot(Delivery::Async);
        if async_listeners.is_empty() {
            return;
        }

        let pair = Arc::new((key, value));
        let executor = self.executor();
        for registered in async_listeners.iter() {
            let listener = Arc::clone(&registered.listener);
            let id = registered.id;
            let pair = Arc::clone(&pair);
            let stats = Arc::clone(&self.stats);

            let job = NotificationJob::new(id, move || {
                let (key, value) = &*pair;
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.expired(key, value)));
                match outcome {
                    Ok(()) => stats.record_async_notification(),
                    Err(payload) => report_failure(&stats, id, payload.as_ref()),
                }
            });

            match executor {
                Some(executor) => {
                    if let Err((reason, job)) = executor.submit(job) {
                        trace!(listener = %id, %reason, "Delivering async notification inline");
                        job.run();
                    }
                }
                None => job.run(),
            }
        }
    }

    /// The async pool, started on first use unless one was supplied.
    ///
    /// Returns `None` when the pool cannot be started; callers then deliver
    /// inline.
    fn executor(&self) -> Option<&Arc<ListenerExecutor>> {
        self.executor
            .get_or_try_init(|| ListenerExecutor::with_config(self.executor_config).map(Arc::new))
            .map_err(|e| error!(error = %e, "Failed to start listener executor"))
            .ok()
    }

    /// Stop the pool if this dispatcher started it.
    ///
    /// Queued jobs still run. Later async notifications are delivered inline.
    pub fn shutdown(&self) {
        if self.shared_executor {
            return;
        }
        if let Some(executor) = self.executor.get() {
            executor.shutdown();
        }
    }
}

impl<K, V> fmt::Debug for NotificationDispatcher<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("sync_listeners", &self.registry.len(Delivery::Sync))
            .field("async_listeners", &self.registry.len(Delivery::Async))
            .field("executor", &self.executor.get())
            .field("shared_executor", &self.shared_executor)
            .finish_non_exhaustive()
    }
}

fn report_failure(stats: &MapStats, listener: ListenerId, payload: &(dyn Any + Send)) {
    let failure = ExpiringMapError::ListenerFailure {
        listener,
        message: panic_message(payload),
    };
    warn!(error = %failure, "Listener panicked during notification");
    stats.record_listener_failure();
}
