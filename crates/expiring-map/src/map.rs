//! The public map type and its builder.
//!
//! [`ExpiringMap`] ties the pieces together: an [`EntryStore`] holding the
//! entries, a [`NotificationDispatcher`] delivering evictions, and the
//! [`ExpirationScheduler`] thread that performs them. Handles are cheap to
//! clone and share one map; the scheduler stops when the last handle is
//! dropped or when [`ExpiringMap::shutdown`] is called.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ExpiringMapConfig;
use crate::error::{ExpiringMapError, Result};
use crate::listener::dispatch::NotificationDispatcher;
use crate::listener::executor::ListenerExecutor;
use crate::listener::{Delivery, ExpirationListener, ListenerId};
use crate::policy::{ExpirationOverride, ExpirationPolicy, ExpiringValue};
use crate::scheduler::ExpirationScheduler;
use crate::stats::{MapStats, MapStatsSnapshot};
use crate::store::{Access, EntryStore, Expired, PutOutcome};

type EntryLoader<K, V> = Arc<dyn Fn(&K) -> Option<V> + Send + Sync>;
type ExpiringEntryLoader<K, V> = Arc<dyn Fn(&K) -> Option<ExpiringValue<V>> + Send + Sync>;

/// Produces values for keys missing from the map.
enum Loader<K, V> {
    Plain(EntryLoader<K, V>),
    Expiring(ExpiringEntryLoader<K, V>),
}

impl<K, V> Clone for Loader<K, V> {
    fn clone(&self) -> Self {
        match self {
            Loader::Plain(load) => Loader::Plain(Arc::clone(load)),
            Loader::Expiring(load) => Loader::Expiring(Arc::clone(load)),
        }
    }
}

impl<K, V> Loader<K, V> {
    fn load(&self, key: &K) -> Option<ExpiringValue<V>> {
        match self {
            Loader::Plain(load) => load(key).map(ExpiringValue::new),
            Loader::Expiring(load) => load(key),
        }
    }
}

/// A thread-safe map whose entries expire after a time-to-live.
///
/// ```
/// use expiring_map::{ExpirationPolicy, ExpiringMap};
/// use std::time::Duration;
///
/// let map = ExpiringMap::builder()
///     .expiration(Duration::from_secs(30))
///     .expiration_policy(ExpirationPolicy::Accessed)
///     .expiration_listener(|key: &String, value: &u32| println!("{key} expired ({value})"))
///     .build()?;
///
/// map.put("session".to_string(), 42);
/// assert_eq!(map.get(&"session".to_string()), Some(42));
/// # Ok::<(), expiring_map::ExpiringMapError>(())
/// ```
pub struct ExpiringMap<K, V>
where
    K: Eq + Hash + Clone,
{
    store: Arc<EntryStore<K, V>>,
    dispatcher: Arc<NotificationDispatcher<K, V>>,
    scheduler: Arc<ExpirationScheduler<K, V>>,
    loader: Option<Loader<K, V>>,
}

impl<K, V> Clone for ExpiringMap<K, V>
where
    K: Eq + Hash + Clone,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            dispatcher: Arc::clone(&self.dispatcher),
            scheduler: Arc::clone(&self.scheduler),
            loader: self.loader.clone(),
        }
    }
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create a map with the default configuration (60 second TTL,
    /// `Created` policy, fixed expiration).
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Start configuring a map.
    pub fn builder() -> ExpiringMapBuilder<K, V> {
        ExpiringMapBuilder::new()
    }

    fn notify(&self, expired: Expired<K, V>) {
        self.dispatcher.notify(expired.key, expired.value);
    }

    fn settle(&self, outcome: PutOutcome<K, V>) -> Option<V> {
        if let Some(expired) = outcome.expired {
            self.notify(expired);
        }
        outcome.previous
    }

    fn settle_access<R>(&self, access: Access<K, V, R>) -> Option<R> {
        match access {
            Access::Live(result) => Some(result),
            Access::Missing => None,
            Access::Expired(expired) => {
                self.notify(expired);
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Insert `value` under `key`, returning the previous live value.
    ///
    /// A replaced entry keeps its settings and restarts its clock.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let outcome = self.store.insert(key, value, ExpirationOverride::default());
        self.settle(outcome)
    }

    /// Insert with an entry-specific TTL. Requires variable expiration.
    pub fn put_with_expiration(&self, key: K, value: V, duration: Duration) -> Result<Option<V>> {
        let expiration = ExpirationOverride {
            duration: Some(duration),
            policy: None,
        };
        Ok(self.settle(self.store.put(key, value, expiration)?))
    }

    /// Insert with an entry-specific policy. Requires variable expiration.
    pub fn put_with_policy(&self, key: K, value: V, policy: ExpirationPolicy) -> Result<Option<V>> {
        let expiration = ExpirationOverride {
            duration: None,
            policy: Some(policy),
        };
        Ok(self.settle(self.store.put(key, value, expiration)?))
    }

    /// Insert with an entry-specific policy and TTL. Requires variable
    /// expiration.
    pub fn put_with(
        &self,
        key: K,
        value: V,
        policy: ExpirationPolicy,
        duration: Duration,
    ) -> Result<Option<V>> {
        let expiration = ExpirationOverride {
            duration: Some(duration),
            policy: Some(policy),
        };
        Ok(self.settle(self.store.put(key, value, expiration)?))
    }

    /// Insert only if `key` has no live entry; otherwise return its value
    /// without renewing it.
    pub fn put_if_absent(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        let outcome = self
            .store
            .insert_if_absent(key, value, ExpirationOverride::default());
        self.settle(outcome)
    }

    /// Replace the value of a live entry, restarting its clock.
    ///
    /// Returns the previous value, or `None` (and stores nothing) if `key`
    /// has no live entry.
    pub fn replace(&self, key: &K, value: V) -> Option<V> {
        let access = self.store.replace(key, value);
        self.settle_access(access)
    }

    // ------------------------------------------------------------------
    // Lookup and removal
    // ------------------------------------------------------------------

    /// Look up `key`.
    ///
    /// Renews the entry under the `Accessed` policy. On a miss the entry
    /// loader, if any, is consulted and its value stored.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        match self.store.get(key) {
            Access::Live(value) => return Some(value),
            Access::Expired(expired) => self.notify(expired),
            Access::Missing => {}
        }
        self.load(key)
    }

    fn load(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let loader = self.loader.as_ref()?;
        let loaded = loader.load(key)?;

        match self
            .store
            .insert_loaded(key.clone(), loaded.value, loaded.expiration)
        {
            Ok((value, expired)) => {
                if let Some(expired) = expired {
                    self.notify(expired);
                }
                Some(value)
            }
            Err(e) => {
                warn!(error = %e, "Loaded value rejected");
                None
            }
        }
    }

    /// Remove `key` without notifying listeners.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.store.remove(key)
    }

    /// Remove every entry without notifying listeners.
    pub fn clear(&self) {
        self.store.clear();
    }

    /// Whether `key` has a live entry. Never renews.
    pub fn contains_key(&self, key: &K) -> bool {
        self.store.contains_key(key)
    }

    /// Number of stored entries.
    ///
    /// May include entries that are due but not yet evicted.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Snapshot of the keys of all live entries.
    pub fn keys(&self) -> Vec<K> {
        self.store.keys()
    }

    /// Snapshot of all live entries.
    pub fn entries(&self) -> Vec<(K, V)>
    where
        V: Clone,
    {
        self.store.entries()
    }

    // ------------------------------------------------------------------
    // Expiration control
    // ------------------------------------------------------------------

    /// Set the TTL of `key` and restart its clock. Requires variable
    /// expiration. A missing key is ignored.
    pub fn set_expiration(&self, key: &K, duration: Duration) -> Result<()> {
        let access = self.store.set_expiration(key, duration)?;
        self.settle_access(access);
        Ok(())
    }

    /// Set the policy of `key` without restarting its clock. Requires
    /// variable expiration. A missing key is ignored.
    pub fn set_expiration_policy(&self, key: &K, policy: ExpirationPolicy) -> Result<()> {
        let access = self.store.set_expiration_policy(key, policy)?;
        self.settle_access(access);
        Ok(())
    }

    /// Restart the clock of `key`.
    pub fn reset_expiration(&self, key: &K) {
        let access = self.store.reset_expiration(key);
        self.settle_access(access);
    }

    /// Effective TTL of `key`.
    pub fn expiration(&self, key: &K) -> Option<Duration> {
        self.store.expiration(key)
    }

    /// Time left before `key` expires.
    pub fn expected_expiration(&self, key: &K) -> Option<Duration> {
        self.store.expected_expiration(key)
    }

    /// Effective policy of `key`.
    pub fn expiration_policy(&self, key: &K) -> Option<ExpirationPolicy> {
        self.store.expiration_policy(key)
    }

    /// Map-wide default TTL.
    pub fn default_expiration(&self) -> Duration {
        self.store.defaults().duration
    }

    /// Map-wide default policy.
    pub fn default_expiration_policy(&self) -> ExpirationPolicy {
        self.store.defaults().policy
    }

    /// Change the default TTL. Requires variable expiration.
    ///
    /// Entries without their own TTL pick it up at their next reset.
    pub fn set_default_expiration(&self, duration: Duration) -> Result<()> {
        self.store.set_default_expiration(duration)
    }

    /// Change the default policy. Requires variable expiration.
    ///
    /// Entries without their own policy pick it up at their next reset.
    pub fn set_default_expiration_policy(&self, policy: ExpirationPolicy) -> Result<()> {
        self.store.set_default_expiration_policy(policy)
    }

    /// Whether entries may carry their own TTL and policy.
    pub fn is_variable_expiration(&self) -> bool {
        self.store.is_variable()
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Register a listener run on the evicting thread.
    pub fn add_expiration_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        self.add_listener(Delivery::Sync, Arc::new(listener))
    }

    /// Register a listener run on the listener pool.
    pub fn add_async_expiration_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        self.add_listener(Delivery::Async, Arc::new(listener))
    }

    /// Register a listener with an explicit delivery mode.
    pub fn add_listener(
        &self,
        delivery: Delivery,
        listener: Arc<dyn ExpirationListener<K, V>>,
    ) -> ListenerId {
        let id = self.dispatcher.registry().add(delivery, listener);
        debug!(listener = %id, ?delivery, "Expiration listener added");
        id
    }

    /// Unregister a sync listener. Returns false if it was not registered.
    pub fn remove_expiration_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.registry().remove(Delivery::Sync, id)
    }

    /// Unregister an async listener. Returns false if it was not registered.
    pub fn remove_async_expiration_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.registry().remove(Delivery::Async, id)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Stop background expiration for every handle of this map.
    ///
    /// The map keeps working; due entries are expired (and notified) by the
    /// reads that find them. Async listeners then run inline.
    pub fn shutdown(&self) {
        self.scheduler.wait();
        self.dispatcher.shutdown();
    }

    /// Whether the scheduler thread is running.
    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Snapshot of this map's counters.
    pub fn stats(&self) -> MapStatsSnapshot {
        self.store.stats().snapshot()
    }
}

impl<K, V> fmt::Debug for ExpiringMap<K, V>
where
    K: Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiringMap")
            .field("len", &self.store.len())
            .field("defaults", &self.store.defaults())
            .field("variable", &self.store.is_variable())
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ExpiringMap`].
pub struct ExpiringMapBuilder<K, V> {
    config: ExpiringMapConfig,
    listeners: Vec<(Delivery, Arc<dyn ExpirationListener<K, V>>)>,
    entry_loader: Option<EntryLoader<K, V>>,
    expiring_entry_loader: Option<ExpiringEntryLoader<K, V>>,
    executor: Option<Arc<ListenerExecutor>>,
}

impl<K, V> ExpiringMapBuilder<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Start from the default configuration.
    pub fn new() -> Self {
        Self::from_config(ExpiringMapConfig::default())
    }

    /// Start from an existing configuration.
    pub fn from_config(config: ExpiringMapConfig) -> Self {
        Self {
            config,
            listeners: Vec::new(),
            entry_loader: None,
            expiring_entry_loader: None,
            executor: None,
        }
    }

    /// Sets the default TTL.
    #[must_use]
    pub fn expiration(mut self, duration: Duration) -> Self {
        self.config.expiration = duration;
        self
    }

    /// Sets the default renewal policy.
    #[must_use]
    pub fn expiration_policy(mut self, policy: ExpirationPolicy) -> Self {
        self.config.expiration_policy = policy;
        self
    }

    /// Allow per-entry TTLs and policies.
    #[must_use]
    pub fn variable_expiration(mut self) -> Self {
        self.config.variable_expiration = true;
        self
    }

    /// Adds a listener run on the evicting thread.
    #[must_use]
    pub fn expiration_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        self.listeners.push((Delivery::Sync, Arc::new(listener)));
        self
    }

    /// Adds a listener run on the listener pool.
    #[must_use]
    pub fn async_expiration_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        self.listeners.push((Delivery::Async, Arc::new(listener)));
        self
    }

    /// Sets a loader consulted by `get` on a miss.
    #[must_use]
    pub fn entry_loader<F>(mut self, loader: F) -> Self
    where
        F: Fn(&K) -> Option<V> + Send + Sync + 'static,
    {
        self.entry_loader = Some(Arc::new(loader));
        self
    }

    /// Sets a loader whose values carry their own expiration settings.
    ///
    /// Enables variable expiration.
    #[must_use]
    pub fn expiring_entry_loader<F>(mut self, loader: F) -> Self
    where
        F: Fn(&K) -> Option<ExpiringValue<V>> + Send + Sync + 'static,
    {
        self.expiring_entry_loader = Some(Arc::new(loader));
        self.config.variable_expiration = true;
        self
    }

    /// Deliver async notifications on a pool shared with other maps.
    ///
    /// The map never shuts a shared pool down.
    #[must_use]
    pub fn listener_executor(mut self, executor: Arc<ListenerExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Build the map and start its scheduler thread.
    pub fn build(self) -> Result<ExpiringMap<K, V>> {
        self.config.validate()?;

        let loader = match (self.entry_loader, self.expiring_entry_loader) {
            (Some(_), Some(_)) => {
                return Err(ExpiringMapError::InvalidArgument(
                    "either an entry loader or an expiring entry loader may be set, not both"
                        .to_string(),
                ));
            }
            (Some(load), None) => Some(Loader::Plain(load)),
            (None, Some(load)) => Some(Loader::Expiring(load)),
            (None, None) => None,
        };

        let stats = Arc::new(MapStats::new());
        let store = Arc::new(EntryStore::new(
            self.config.settings(),
            self.config.variable_expiration,
            Arc::clone(&stats),
        ));
        let dispatcher = Arc::new(match self.executor {
            Some(executor) => NotificationDispatcher::with_executor(stats, executor),
            None => NotificationDispatcher::new(stats, self.config.listener_executor),
        });
        for (delivery, listener) in self.listeners {
            dispatcher.registry().add(delivery, listener);
        }

        let scheduler = ExpirationScheduler::start(Arc::clone(&store), Arc::clone(&dispatcher))?;
        debug!(
            expiration = ?self.config.expiration,
            policy = ?self.config.expiration_policy,
            variable = self.config.variable_expiration,
            "Expiring map created"
        );

        Ok(ExpiringMap {
            store,
            dispatcher,
            scheduler: Arc::new(scheduler),
            loader,
        })
    }
}

impl<K, V> Default for ExpiringMapBuilder<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for ExpiringMapBuilder<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiringMapBuilder")
            .field("config", &self.config)
            .field("listeners", &self.listeners.len())
            .field("entry_loader", &self.entry_loader.is_some())
            .field("expiring_entry_loader", &self.expiring_entry_loader.is_some())
            .field("executor", &self.executor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Map = ExpiringMap<&'static str, u32>;

    #[test]
    fn test_default_map() {
        let map: Map = ExpiringMap::new().unwrap();
        assert_eq!(map.default_expiration(), Duration::from_secs(60));
        assert_eq!(map.default_expiration_policy(), ExpirationPolicy::Created);
        assert!(!map.is_variable_expiration());
        assert!(map.is_running());

        assert_eq!(map.put("a", 1), None);
        assert_eq!(map.put("a", 2), Some(1));
        assert_eq!(map.get(&"a"), Some(2));
        assert_eq!(map.len(), 1);
        assert_eq!(map.remove(&"a"), Some(2));
        assert!(map.is_empty());
    }

    #[test]
    fn test_build_rejects_zero_expiration() {
        let result = Map::builder().expiration(Duration::ZERO).build();
        assert!(matches!(result, Err(ExpiringMapError::InvalidArgument(_))));
    }

    #[test]
    fn test_build_rejects_two_loaders() {
        let result = Map::builder()
            .entry_loader(|_| Some(1))
            .expiring_entry_loader(|_| Some(ExpiringValue::new(2)))
            .build();
        assert!(matches!(result, Err(ExpiringMapError::InvalidArgument(_))));
    }

    #[test]
    fn test_fixed_map_rejects_per_entry_settings() {
        let map: Map = ExpiringMap::new().unwrap();
        map.put("a", 1);

        for result in [
            map.put_with_expiration("b", 1, Duration::from_secs(1)).map(|_| ()),
            map.put_with_policy("b", 1, ExpirationPolicy::Accessed).map(|_| ()),
            map.set_expiration(&"a", Duration::from_secs(1)),
            map.set_expiration_policy(&"a", ExpirationPolicy::Accessed),
            map.set_default_expiration(Duration::from_secs(1)),
            map.set_default_expiration_policy(ExpirationPolicy::Accessed),
        ] {
            assert!(matches!(result, Err(ExpiringMapError::UnsupportedOperation(_))));
        }
        assert!(!map.contains_key(&"b"));
    }

    #[test]
    fn test_variable_map_entry_settings() {
        let map: Map = ExpiringMap::builder().variable_expiration().build().unwrap();

        map.put_with("a", 1, ExpirationPolicy::Accessed, Duration::from_secs(5))
            .unwrap();
        assert_eq!(map.expiration(&"a"), Some(Duration::from_secs(5)));
        assert_eq!(map.expiration_policy(&"a"), Some(ExpirationPolicy::Accessed));
        assert!(map.expected_expiration(&"a").unwrap() <= Duration::from_secs(5));

        map.set_expiration(&"a", Duration::from_secs(10)).unwrap();
        assert_eq!(map.expiration(&"a"), Some(Duration::from_secs(10)));

        // Missing keys are ignored
        map.set_expiration(&"missing", Duration::from_secs(1)).unwrap();
        assert!(matches!(
            map.put_with_expiration("b", 1, Duration::ZERO),
            Err(ExpiringMapError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_put_if_absent_and_replace() {
        let map: Map = ExpiringMap::new().unwrap();

        assert_eq!(map.replace(&"a", 1), None);
        assert!(!map.contains_key(&"a"));

        assert_eq!(map.put_if_absent("a", 1), None);
        assert_eq!(map.put_if_absent("a", 2), Some(1));
        assert_eq!(map.replace(&"a", 3), Some(1));
        assert_eq!(map.get(&"a"), Some(3));
    }

    #[test]
    fn test_entry_loader_fills_misses() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let map: Map = ExpiringMap::builder()
            .entry_loader(move |key: &&'static str| {
                counter.fetch_add(1, Ordering::SeqCst);
                (*key != "none").then_some(7)
            })
            .build()
            .unwrap();

        assert_eq!(map.get(&"a"), Some(7));
        assert_eq!(map.get(&"a"), Some(7));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(map.get(&"none"), None);
        assert!(!map.contains_key(&"none"));
        assert_eq!(map.stats().loads, 1);
    }

    #[test]
    fn test_expiring_entry_loader_sets_entry_expiration() {
        let map: Map = ExpiringMap::builder()
            .expiring_entry_loader(|_| {
                Some(ExpiringValue::new(5).with_duration(Duration::from_secs(3)))
            })
            .build()
            .unwrap();

        assert!(map.is_variable_expiration());
        assert_eq!(map.get(&"k"), Some(5));
        assert_eq!(map.expiration(&"k"), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_listener_registration_handles() {
        let map: Map = ExpiringMap::new().unwrap();
        let sync_id = map.add_expiration_listener(|_, _| {});
        let async_id = map.add_async_expiration_listener(|_, _| {});

        assert!(!map.remove_async_expiration_listener(sync_id));
        assert!(map.remove_expiration_listener(sync_id));
        assert!(map.remove_async_expiration_listener(async_id));
    }

    #[test]
    fn test_clones_share_state_and_shutdown() {
        let map: Map = ExpiringMap::new().unwrap();
        let other = map.clone();
        map.put("a", 1);
        assert_eq!(other.get(&"a"), Some(1));

        other.shutdown();
        assert!(!map.is_running());
        // Still usable as a map
        map.put("b", 2);
        assert_eq!(map.get(&"b"), Some(2));
    }
}
