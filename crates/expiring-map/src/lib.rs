//! Thread-safe in-memory map with per-entry expiration.
//!
//! Entries are removed automatically once their time-to-live elapses, and
//! registered listeners are told about every such eviction. Each map owns
//! one background scheduler thread that sleeps until the next deadline.
//!
//! # Features
//!
//! - `Created` (TTL from insertion) and `Accessed` (TTL renewed on every
//!   read or write) expiration policies
//! - Variable expiration: per-entry durations and policies, changeable at
//!   runtime
//! - Sync listeners (run on the evicting thread) and async listeners (run
//!   on a bounded worker pool), registrable at any time
//! - Entry loaders that fill misses on `get`
//! - Lock-free statistics and structured `tracing` output
//!
//! Explicit removal, `clear`, and replacement never notify listeners. Each
//! eviction is delivered exactly once to every listener registered when it
//! happened.
//!
//! # Usage
//!
//! ```
//! use expiring_map::{ExpiringMap, TimeUnit};
//! use std::sync::mpsc;
//!
//! let (tx, rx) = mpsc::channel();
//! let tx = std::sync::Mutex::new(tx);
//! let map = ExpiringMap::builder()
//!     .expiration(TimeUnit::Milliseconds.duration(50)?)
//!     .expiration_listener(move |key: &&str, value: &u32| {
//!         let _ = tx.lock().unwrap().send((*key, *value));
//!     })
//!     .build()?;
//!
//! map.put("a", 1);
//! assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap(), ("a", 1));
//! assert!(map.get(&"a").is_none());
//! # Ok::<(), expiring_map::ExpiringMapError>(())
//! ```

pub mod config;
pub mod entry;
pub mod error;
pub mod listener;
pub mod map;
pub mod policy;
pub mod scheduler;
pub mod stats;
pub mod store;

pub use config::{DEFAULT_EXPIRATION, ExpiringMapConfig};
pub use entry::ExpiringEntry;
pub use error::{ExpiringMapError, Result};
pub use listener::executor::{ExecutorConfig, ExecutorStats, ListenerExecutor, SubmitError};
pub use listener::{Delivery, ExpirationListener, ListenerId};
pub use map::{ExpiringMap, ExpiringMapBuilder};
pub use policy::{ExpirationOverride, ExpirationPolicy, ExpiringValue, TimeUnit};
pub use stats::{MapStats, MapStatsSnapshot};
