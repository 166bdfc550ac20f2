//! Worker pool for asynchronous listener delivery.
//!
//! Async listeners run here so that slow callbacks never hold up the
//! scheduler. The pool may be owned by a single map or shared between
//! several maps through [`ExpiringMapBuilder::listener_executor`].
//!
//! # Design
//!
//! - Fixed number of worker threads (`threads`)
//! - Bounded submission queue; a full queue applies backpressure to the
//!   submitter instead of dropping a notification
//! - Workers drain queued jobs before exiting on shutdown
//! - Submissions from a worker thread never block on the queue (a worker
//!   waiting on its own queue could deadlock the pool)
//!
//! [`ExpiringMapBuilder::listener_executor`]: crate::ExpiringMapBuilder::listener_executor

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError, bounded};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::error::{ExpiringMapError, Result, panic_message};
use crate::listener::ListenerId;

/// Default number of listener worker threads.
pub const DEFAULT_LISTENER_THREADS: usize = 2;

/// Default capacity of the submission queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// How often idle workers re-check the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

thread_local! {
    static IN_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// A notification submitted to the pool.
pub struct NotificationJob {
    /// Listener this job delivers to.
    pub listener: ListenerId,
    /// The delivery itself.
    pub task: Box<dyn FnOnce() + Send>,
}

impl NotificationJob {
    /// Create a job delivering to `listener`.
    pub fn new(listener: ListenerId, task: impl FnOnce() + Send + 'static) -> Self {
        Self {
            listener,
            task: Box::new(task),
        }
    }

    /// Run the job on the current thread.
    pub fn run(self) {
        (self.task)();
    }
}

impl fmt::Debug for NotificationJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationJob")
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

/// Statistics for the listener pool.
#[derive(Debug, Default)]
pub struct ExecutorStats {
    pub jobs_submitted: AtomicU64,
    pub jobs_completed: AtomicU64,
    /// Jobs whose listener panicked.
    pub jobs_failed: AtomicU64,
    /// Submissions that had to wait for queue space.
    pub queue_full_events: AtomicU64,
    /// Jobs submitted but not yet finished.
    pub queue_depth: AtomicU64,
    pub total_execution_nanos: AtomicU64,
}

impl ExecutorStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_submit(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished job and how long its listener ran.
    pub fn record_complete(&self, success: bool, duration: Duration) {
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
        if success {
            self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        }
        #[allow(clippy::cast_possible_truncation)]
        let nanos = duration.as_nanos() as u64;
        self.total_execution_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Record a submission that found the queue full.
    pub fn record_queue_full(&self) {
        self.queue_full_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Mean listener run time over finished jobs.
    pub fn avg_execution_time(&self) -> Duration {
        let completed =
            self.jobs_completed.load(Ordering::Relaxed) + self.jobs_failed.load(Ordering::Relaxed);
        if completed == 0 {
            return Duration::ZERO;
        }
        let total_nanos = self.total_execution_nanos.load(Ordering::Relaxed);
        Duration::from_nanos(total_nanos / completed)
    }
}

/// Configuration for the listener pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker threads started by the pool.
    pub threads: usize,
    /// Jobs that may wait before submitters block.
    pub queue_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_LISTENER_THREADS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ExecutorConfig {
    /// Set the number of worker threads.
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the queue capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Reject configurations that cannot run any job.
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(ExpiringMapError::InvalidArgument(
                "listener pool needs at least one thread".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ExpiringMapError::InvalidArgument(
                "listener queue capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Error when submitting to the pool.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The pool has been shut down; the caller must deliver the job itself.
    #[error("listener executor has been shut down")]
    Shutdown,
    /// The queue is full and the submitter is one of the pool's own
    /// workers, which must not wait on it.
    #[error("listener queue is full")]
    QueueFull,
}

/// A bounded worker pool for asynchronous listener delivery.
pub struct ListenerExecutor {
    submit_tx: Sender<NotificationJob>,
    /// Taken on `wait`; empty once the pool has been joined.
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Held shared across the shutdown check and the send, exclusively
    /// while setting the flag. Once a worker sees the flag, every accepted
    /// job is already in the queue.
    gate: RwLock<()>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<ExecutorStats>,
    config: ExecutorConfig,
}

impl ListenerExecutor {
    /// Start a pool with custom configuration.
    pub fn with_config(config: ExecutorConfig) -> Result<Self> {
        config.validate()?;

        let (submit_tx, submit_rx) = bounded(config.queue_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = ExecutorStats::new();

        let mut workers = Vec::with_capacity(config.threads);

        for worker_id in 0..config.threads {
            let rx = submit_rx.clone();
            let worker_shutdown = Arc::clone(&shutdown);
            let worker_stats = Arc::clone(&stats);

            let spawned = thread::Builder::new()
                .name(format!("expiry-listener-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &rx, &worker_shutdown, &worker_stats));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Let the workers that did start exit before reporting
                    shutdown.store(true, Ordering::Release);
                    return Err(ExpiringMapError::Spawn(e));
                }
            }
        }

        info!(
            threads = config.threads,
            capacity = config.queue_capacity,
            "Listener executor started"
        );

        Ok(Self {
            submit_tx,
            workers: Mutex::new(workers),
            gate: RwLock::new(()),
            shutdown,
            stats,
            config,
        })
    }

    /// Submit a job.
    ///
    /// Blocks while the queue is full, unless called from one of this
    /// pool's workers, which get the job back with `SubmitError::QueueFull`.
    /// Returns the job with `SubmitError::Shutdown` when the pool no longer
    /// accepts work. An accepted job always runs.
    pub fn submit(&self, job: NotificationJob) -> std::result::Result<(), (SubmitError, NotificationJob)> {
        let job = {
            let _gate = self.gate.read();
            if self.shutdown.load(Ordering::Acquire) {
                return Err((SubmitError::Shutdown, job));
            }

            self.stats.record_submit();
            match self.submit_tx.try_send(job) {
                Ok(()) => {
                    trace!("Notification submitted to listener executor");
                    return Ok(());
                }
                Err(TrySendError::Full(job)) => job,
                Err(TrySendError::Disconnected(job)) => {
                    self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                    error!("Listener executor channel disconnected");
                    return Err((SubmitError::Shutdown, job));
                }
            }
        };

        self.stats.record_queue_full();
        if IN_WORKER.with(Cell::get) {
            // A worker blocking on its own queue could stall every worker
            self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            debug!(listener = %job.listener, "Listener queue full on worker thread, delivering inline");
            return Err((SubmitError::QueueFull, job));
        }

        warn!(
            capacity = self.config.queue_capacity,
            depth = self.stats.queue_depth.load(Ordering::Relaxed),
            "Listener queue full, waiting for capacity"
        );
        self.send_blocking(job)
    }

    /// Wait for queue space in slices, so `shutdown` never waits on a full
    /// queue for longer than one slice.
    fn send_blocking(&self, mut job: NotificationJob) -> std::result::Result<(), (SubmitError, NotificationJob)> {
        loop {
            let _gate = self.gate.read();
            if self.shutdown.load(Ordering::Acquire) {
                self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                return Err((SubmitError::Shutdown, job));
            }
            match self.submit_tx.send_timeout(job, POLL_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(pending)) => job = pending,
                Err(SendTimeoutError::Disconnected(pending)) => {
                    self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                    return Err((SubmitError::Shutdown, pending));
                }
            }
        }
    }

    /// Pool counters.
    pub fn stats(&self) -> &ExecutorStats {
        &self.stats
    }

    /// Jobs waiting or running.
    pub fn queue_depth(&self) -> u64 {
        self.stats.queue_depth.load(Ordering::Relaxed)
    }

    /// Get the pool configuration.
    pub fn config(&self) -> ExecutorConfig {
        self.config
    }

    /// Whether the pool still accepts jobs.
    pub fn is_healthy(&self) -> bool {
        !self.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting work. Workers finish queued jobs and exit.
    pub fn shutdown(&self) {
        let _gate = self.gate.write();
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            info!("Initiating listener executor shutdown");
        }
    }

    /// Shut down and wait for all workers to finish.
    ///
    /// Must not be called from one of this pool's workers.
    pub fn wait(&self) {
        self.shutdown();
        let workers = std::mem::take(&mut *self.workers.lock());
        debug!(workers = workers.len(), "Waiting for listener workers to finish");
        for handle in workers {
            let _ = handle.join();
        }
        info!("Listener executor shutdown complete");
    }
}

impl fmt::Debug for ListenerExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerExecutor")
            .field("config", &self.config)
            .field("healthy", &self.is_healthy())
            .field("queue_depth", &self.queue_depth())
            .finish_non_exhaustive()
    }
}

impl Drop for ListenerExecutor {
    fn drop(&mut self) {
        // Signal shutdown but don't wait; workers drain and exit on their own
        self.shutdown.store(true, Ordering::Release);
    }
}

fn worker_loop(
    worker_id: usize,
    rx: &Receiver<NotificationJob>,
    shutdown: &AtomicBool,
    stats: &ExecutorStats,
) {
    IN_WORKER.with(|flag| flag.set(true));
    debug!(worker_id, "Listener worker started");

    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(job) => deliver(worker_id, job, stats),
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Acquire) {
                    // Nothing is accepted after the flag; run what got in
                    // between the timeout and the check.
                    let mut drained = 0usize;
                    while let Ok(job) = rx.try_recv() {
                        deliver(worker_id, job, stats);
                        drained += 1;
                    }
                    debug!(worker_id, drained, "Worker received shutdown signal");
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!(worker_id, "Channel disconnected, worker exiting");
                break;
            }
        }
    }

    debug!(worker_id, "Listener worker exiting");
}

fn deliver(worker_id: usize, job: NotificationJob, stats: &ExecutorStats) {
    let start = Instant::now();
    let listener = job.listener;
    trace!(worker_id, %listener, "Worker delivering notification");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| job.run()));
    let success = match outcome {
        Ok(()) => true,
        Err(payload) => {
            error!(
                worker_id,
                %listener,
                panic = %panic_message(payload.as_ref()),
                "Notification job panicked"
            );
            false
        }
    };
    stats.record_complete(success, start.elapsed());
}
