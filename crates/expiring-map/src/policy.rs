//! Expiration policies, time units, and per-entry overrides.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ExpiringMapError, Result};

/// Rule that decides what resets an entry's TTL clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpirationPolicy {
    /// TTL counted from insertion (or explicit reset); reads do not renew it.
    #[default]
    Created,
    /// TTL renewed on every read or write.
    Accessed,
}

/// Unit for `(amount, unit)` style durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// Nanoseconds.
    Nanoseconds,
    /// Microseconds.
    Microseconds,
    /// Milliseconds.
    Milliseconds,
    /// Seconds.
    Seconds,
    /// Minutes.
    Minutes,
    /// Hours.
    Hours,
    /// Days.
    Days,
}

impl TimeUnit {
    /// Converts `amount` of this unit into a TTL.
    ///
    /// Fails with `InvalidArgument` for a zero amount or when the result
    /// does not fit in a [`Duration`].
    ///
    /// ```
    /// use expiring_map::TimeUnit;
    /// use std::time::Duration;
    ///
    /// assert_eq!(TimeUnit::Milliseconds.duration(100).unwrap(), Duration::from_millis(100));
    /// assert!(TimeUnit::Seconds.duration(0).is_err());
    /// ```
    pub fn duration(self, amount: u64) -> Result<Duration> {
        let secs_per = match self {
            TimeUnit::Nanoseconds => return validate_ttl(Duration::from_nanos(amount)),
            TimeUnit::Microseconds => return validate_ttl(Duration::from_micros(amount)),
            TimeUnit::Milliseconds => return validate_ttl(Duration::from_millis(amount)),
            TimeUnit::Seconds => 1,
            TimeUnit::Minutes => 60,
            TimeUnit::Hours => 60 * 60,
            TimeUnit::Days => 24 * 60 * 60,
        };
        let secs = amount.checked_mul(secs_per).ok_or_else(|| {
            ExpiringMapError::InvalidArgument(format!("{amount} {self:?} overflows a duration"))
        })?;
        validate_ttl(Duration::from_secs(secs))
    }
}

/// Rejects durations that can never produce a live entry.
pub(crate) fn validate_ttl(duration: Duration) -> Result<Duration> {
    if duration.is_zero() {
        return Err(ExpiringMapError::InvalidArgument(
            "expiration duration must be positive".to_string(),
        ));
    }
    Ok(duration)
}

/// Resolved expiration settings: a duration plus a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationSettings {
    /// Time-to-live.
    pub duration: Duration,
    /// Renewal policy.
    pub policy: ExpirationPolicy,
}

/// Per-entry settings that take precedence over the map defaults.
///
/// Only populated on maps built with variable expiration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExpirationOverride {
    /// Entry-specific TTL.
    pub duration: Option<Duration>,
    /// Entry-specific policy.
    pub policy: Option<ExpirationPolicy>,
}

impl ExpirationOverride {
    /// Returns true when neither field overrides the defaults.
    pub fn is_empty(&self) -> bool {
        self.duration.is_none() && self.policy.is_none()
    }

    /// Resolves this override against the map defaults.
    pub fn resolve(&self, defaults: ExpirationSettings) -> ExpirationSettings {
        ExpirationSettings {
            duration: self.duration.unwrap_or(defaults.duration),
            policy: self.policy.unwrap_or(defaults.policy),
        }
    }

    /// Replaces the fields that `other` sets.
    pub fn merge(&mut self, other: ExpirationOverride) {
        if other.duration.is_some() {
            self.duration = other.duration;
        }
        if other.policy.is_some() {
            self.policy = other.policy;
        }
    }
}

/// A value produced by an entry loader, optionally carrying its own expiration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiringValue<V> {
    /// The loaded value.
    pub value: V,
    /// Entry-specific settings (requires variable expiration when non-empty).
    pub expiration: ExpirationOverride,
}

impl<V> ExpiringValue<V> {
    /// Wraps a value that uses the map defaults.
    pub fn new(value: V) -> Self {
        Self {
            value,
            expiration: ExpirationOverride::default(),
        }
    }

    /// Sets an entry-specific TTL.
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.expiration.duration = Some(duration);
        self
    }

    /// Sets an entry-specific policy.
    #[must_use]
    pub fn with_policy(mut self, policy: ExpirationPolicy) -> Self {
        self.expiration.policy = Some(policy);
        self
    }
}
