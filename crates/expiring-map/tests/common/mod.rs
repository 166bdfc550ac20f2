//! Common test utilities for expiring map integration tests.

// Not all test binaries use every helper
#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound for anything that should happen "soon".
pub const EVENTUAL: Duration = Duration::from_secs(5);

/// Install a test-writer subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Thread-safe log of listener invocations.
#[derive(Debug)]
pub struct Recorder<K, V> {
    events: Arc<Mutex<Vec<(K, V)>>>,
}

impl<K, V> Clone for Recorder<K, V> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
        }
    }
}

impl<K: Clone, V: Clone> Recorder<K, V> {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A listener closure appending to this recorder.
    pub fn listener(&self) -> impl Fn(&K, &V) + Send + Sync + 'static
    where
        K: Send + 'static,
        V: Send + 'static,
    {
        let events = Arc::clone(&self.events);
        move |k: &K, v: &V| events.lock().push((k.clone(), v.clone()))
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn events(&self) -> Vec<(K, V)> {
        self.events.lock().clone()
    }

    pub fn keys(&self) -> Vec<K> {
        self.events.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    /// Wait until at least `count` events were recorded.
    pub fn wait_for(&self, count: usize) -> bool {
        wait_until(EVENTUAL, || self.len() >= count)
    }
}
