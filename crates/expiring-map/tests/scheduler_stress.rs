//! Stress tests for expiration under concurrency.
//!
//! These tests run user operations from many threads while the scheduler
//! evicts, and check that every entry ends up either removed by a caller or
//! expired with exactly one notification.

mod common;

use common::{EVENTUAL, init_tracing, wait_until};
use expiring_map::{ExpirationPolicy, ExpiringMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Number of threads for concurrent tests.
const THREAD_COUNT: usize = 8;

/// Number of operations per thread.
const OPS_PER_THREAD: usize = 1000;

fn counting_map(
    ttl: Duration,
    policy: ExpirationPolicy,
) -> (ExpiringMap<u64, u64>, Arc<AtomicU64>) {
    let notified = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&notified);
    let map = ExpiringMap::builder()
        .expiration(ttl)
        .expiration_policy(policy)
        .expiration_listener(move |_: &u64, _: &u64| {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .build()
        .unwrap();
    (map, notified)
}

// ============================================================================
// Renewal vs. sweep
// ============================================================================

#[test]
fn stress_renewal_racing_sweep_never_notifies() {
    init_tracing();
    let (map, notified) = counting_map(Duration::from_millis(40), ExpirationPolicy::Accessed);
    for key in 0..THREAD_COUNT as u64 {
        map.put(key, key);
    }

    // Each thread renews its key well inside the TTL for a full second,
    // so scheduler wake-ups keep landing next to fresh renewals.
    let handles: Vec<_> = (0..THREAD_COUNT as u64)
        .map(|key| {
            let map = map.clone();
            thread::spawn(move || {
                let start = Instant::now();
                while start.elapsed() < Duration::from_secs(1) {
                    assert_eq!(map.get(&key), Some(key));
                    thread::sleep(Duration::from_millis(10));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(notified.load(Ordering::Relaxed), 0);
    assert_eq!(map.len(), THREAD_COUNT);
    assert!(map.stats().reschedules > 0);
}

#[test]
fn stress_reset_expiration_keeps_entries_alive() {
    let (map, notified) = counting_map(Duration::from_millis(40), ExpirationPolicy::Created);
    map.put(0, 0);

    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(500) {
        map.reset_expiration(&0);
        thread::sleep(Duration::from_millis(5));
    }

    assert!(map.contains_key(&0));
    assert_eq!(notified.load(Ordering::Relaxed), 0);
}

// ============================================================================
// Removal vs. expiration
// ============================================================================

#[test]
fn stress_remove_racing_expiration_has_single_winner() {
    init_tracing();
    let (map, notified) = counting_map(Duration::from_millis(20), ExpirationPolicy::Created);
    let total = (THREAD_COUNT * OPS_PER_THREAD) as u64;
    for key in 0..total {
        map.put(key, key);
    }

    // Remove keys while their deadlines come due
    let removed = Arc::new(AtomicU64::new(0));
    let handles: Vec<_> = (0..THREAD_COUNT)
        .map(|thread_id| {
            let map = map.clone();
            let removed = Arc::clone(&removed);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(15));
                for i in 0..OPS_PER_THREAD {
                    let key = (i * THREAD_COUNT + thread_id) as u64;
                    if map.remove(&key).is_some() {
                        removed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(wait_until(EVENTUAL, || {
        removed.load(Ordering::Relaxed) + notified.load(Ordering::Relaxed) == total
    }));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(
        removed.load(Ordering::Relaxed) + notified.load(Ordering::Relaxed),
        total
    );
    assert!(map.is_empty());
}

// ============================================================================
// Mixed workload
// ============================================================================

#[test]
fn stress_mixed_operations_notify_each_eviction_once() {
    init_tracing();
    let (map, notified) = counting_map(Duration::from_millis(10), ExpirationPolicy::Created);
    let puts = Arc::new(AtomicU64::new(0));
    let removals = Arc::new(AtomicU64::new(0));
    let replaced = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..THREAD_COUNT)
        .map(|thread_id| {
            let map = map.clone();
            let puts = Arc::clone(&puts);
            let removals = Arc::clone(&removals);
            let replaced = Arc::clone(&replaced);
            thread::spawn(move || {
                for i in 0..OPS_PER_THREAD {
                    // Keys overlap between threads
                    let key = (i % 64) as u64;
                    match (i + thread_id) % 4 {
                        0 | 1 => {
                            puts.fetch_add(1, Ordering::Relaxed);
                            if map.put(key, i as u64).is_some() {
                                replaced.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        2 => {
                            map.get(&key);
                        }
                        _ => {
                            if map.remove(&key).is_some() {
                                removals.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    if i % 100 == 0 {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Every put either replaced a live entry, was removed, or expired
    let settled = || {
        replaced.load(Ordering::Relaxed)
            + removals.load(Ordering::Relaxed)
            + notified.load(Ordering::Relaxed)
    };
    assert!(wait_until(EVENTUAL, || settled() == puts.load(Ordering::Relaxed)));
    assert!(wait_until(EVENTUAL, || map.is_empty()));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(settled(), puts.load(Ordering::Relaxed));
    assert_eq!(map.stats().expirations, notified.load(Ordering::Relaxed));
}

#[test]
fn stress_churn_keeps_heap_bounded() {
    // Put/remove churn under an hour-long TTL leaves one stale heap entry per
    // key, and no deadline ever comes due to wake the scheduler.
    let map: ExpiringMap<u64, u64> = ExpiringMap::builder()
        .expiration(Duration::from_secs(3600))
        .build()
        .unwrap();
    map.put(u64::MAX, 0);

    let handles: Vec<_> = (0..THREAD_COUNT as u64)
        .map(|thread_id| {
            let map = map.clone();
            thread::spawn(move || {
                for i in 0..(OPS_PER_THREAD as u64 * 10) {
                    let key = (thread_id << 32) | i;
                    map.put(key, i);
                    assert_eq!(map.remove(&key), Some(i));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(wait_until(EVENTUAL, || map.stats().compacted > 0));
    assert_eq!(map.len(), 1);
    assert_eq!(map.stats().expirations, 0);
}

#[test]
fn stress_churn_after_shutdown_still_compacts() {
    let map: ExpiringMap<u64, u64> = ExpiringMap::builder()
        .expiration(Duration::from_secs(3600))
        .build()
        .unwrap();
    map.shutdown();

    for key in 0..(THREAD_COUNT * OPS_PER_THREAD) as u64 {
        map.put(key, key);
        map.remove(&key);
    }
    assert!(map.stats().compacted > 0);
    assert!(map.is_empty());
}
