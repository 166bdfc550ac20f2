//! Expiration listeners and their registry.
//!
//! A listener is a registered capability invoked with the `(key, value)` of
//! every entry evicted because its TTL elapsed. Whether it runs on the
//! evicting thread or on the listener pool is a property of the
//! registration, not of the listener.
//!
//! Registrations are copy-on-write: a notification pass works on the
//! snapshot it started with, so a listener added mid-pass is only seen by
//! later passes, and listeners may (un)register other listeners without
//! deadlocking.

pub mod dispatch;
pub mod executor;

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Callback invoked when an entry expires.
///
/// Implemented for every `Fn(&K, &V) + Send + Sync + 'static` closure.
pub trait ExpirationListener<K, V>: Send + Sync + 'static {
    /// Called once per eviction of `key`.
    fn expired(&self, key: &K, value: &V);
}

impl<K, V, F> ExpirationListener<K, V> for F
where
    F: Fn(&K, &V) + Send + Sync + 'static,
{
    fn expired(&self, key: &K, value: &V) {
        self(key, value);
    }
}

/// Handle identifying a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Create a listener ID from a raw value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// How a listener is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delivery {
    /// On the thread that performed the eviction.
    Sync,
    /// On the listener pool.
    Async,
}

/// A listener together with its registration handle.
pub struct Registered<K, V> {
    /// Registration handle.
    pub id: ListenerId,
    /// The callback.
    pub listener: Arc<dyn ExpirationListener<K, V>>,
}

impl<K, V> Clone for Registered<K, V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            listener: Arc::clone(&self.listener),
        }
    }
}

impl<K, V> fmt::Debug for Registered<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registered")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Immutable view of the registered listeners at one point in time.
pub type ListenerSnapshot<K, V> = Arc<Vec<Registered<K, V>>>;

/// Thread-safe set of sync and async listeners.
pub struct ListenerRegistry<K, V> {
    sync_listeners: RwLock<ListenerSnapshot<K, V>>,
    async_listeners: RwLock<ListenerSnapshot<K, V>>,
    next_id: AtomicU64,
}

impl<K, V> ListenerRegistry<K, V> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            sync_listeners: RwLock::new(Arc::new(Vec::new())),
            async_listeners: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    fn slot(&self, delivery: Delivery) -> &RwLock<ListenerSnapshot<K, V>> {
        match delivery {
            Delivery::Sync => &self.sync_listeners,
            Delivery::Async => &self.async_listeners,
        }
    }

    /// Register a listener; effective for every later notification pass.
    pub fn add(&self, delivery: Delivery, listener: Arc<dyn ExpirationListener<K, V>>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut slot = self.slot(delivery).write();
        let mut next = Vec::with_capacity(slot.len() + 1);
        next.extend(slot.iter().cloned());
        next.push(Registered { id, listener });
        *slot = Arc::new(next);
        id
    }

    /// Unregister a listener. Returns false if `id` was not registered
    /// with this delivery mode.
    pub fn remove(&self, delivery: Delivery, id: ListenerId) -> bool {
        let mut slot = self.slot(delivery).write();
        if !slot.iter().any(|r| r.id == id) {
            return false;
        }
        let next: Vec<_> = slot.iter().filter(|r| r.id != id).cloned().collect();
        *slot = Arc::new(next);
        true
    }

    /// Current listeners for `delivery`.
    pub fn snapshot(&self, delivery: Delivery) -> ListenerSnapshot<K, V> {
        Arc::clone(&self.slot(delivery).read())
    }

    /// Number of registered listeners for `delivery`.
    pub fn len(&self, delivery: Delivery) -> usize {
        self.slot(delivery).read().len()
    }

    /// Whether no listener of either kind is registered.
    pub fn is_empty(&self) -> bool {
        self.sync_listeners.read().is_empty() && self.async_listeners.read().is_empty()
    }
}

impl<K, V> Default for ListenerRegistry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: &Arc<AtomicUsize>) -> Arc<dyn ExpirationListener<u32, u32>> {
        let counter = Arc::clone(counter);
        Arc::new(move |_: &u32, _: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_add_and_remove() {
        let registry = ListenerRegistry::<u32, u32>::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let a = registry.add(Delivery::Sync, counting(&counter));
        let b = registry.add(Delivery::Async, counting(&counter));
        assert_ne!(a, b);
        assert_eq!(registry.len(Delivery::Sync), 1);
        assert_eq!(registry.len(Delivery::Async), 1);

        // Wrong delivery mode does not remove
        assert!(!registry.remove(Delivery::Async, a));
        assert!(registry.remove(Delivery::Sync, a));
        assert!(!registry.remove(Delivery::Sync, a));
        assert_eq!(registry.len(Delivery::Sync), 0);
        assert!(!registry.is_empty());

        assert!(registry.remove(Delivery::Async, b));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_registration() {
        let registry = ListenerRegistry::<u32, u32>::new();
        let counter = Arc::new(AtomicUsize::new(0));

        registry.add(Delivery::Sync, counting(&counter));
        let before = registry.snapshot(Delivery::Sync);
        registry.add(Delivery::Sync, counting(&counter));

        assert_eq!(before.len(), 1);
        assert_eq!(registry.snapshot(Delivery::Sync).len(), 2);
    }

    #[test]
    fn test_registration_order_preserved() {
        let registry = ListenerRegistry::<u32, u32>::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let ids: Vec<_> = (0..5)
            .map(|_| registry.add(Delivery::Sync, counting(&counter)))
            .collect();
        let snapshot_ids: Vec<_> = registry
            .snapshot(Delivery::Sync)
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, snapshot_ids);

        for r in registry.snapshot(Delivery::Sync).iter() {
            r.listener.expired(&1, &2);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_listener_id_display() {
        assert_eq!(ListenerId::new(3).to_string(), "listener-3");
        assert_eq!(ListenerId::new(3).raw(), 3);
    }
}
