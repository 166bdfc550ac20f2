//! Map configuration.
//!
//! [`ExpiringMapConfig`] holds everything a map needs at construction that
//! is plain data: the default TTL and policy, whether entries may carry
//! their own settings, and how the async listener pool is sized. It can be
//! built in code or deserialized (durations use humantime notation, e.g.
//! `"90s"` or `"5m"`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::listener::executor::ExecutorConfig;
use crate::policy::{ExpirationPolicy, ExpirationSettings, validate_ttl};

/// Default time-to-live for entries (60 seconds).
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(60);

/// Construction-time settings for an [`ExpiringMap`](crate::ExpiringMap).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpiringMapConfig {
    /// TTL applied to entries without their own duration.
    ///
    /// Default: 60 seconds.
    #[serde(with = "humantime_serde")]
    pub expiration: Duration,

    /// Renewal policy applied to entries without their own policy.
    ///
    /// Default: [`ExpirationPolicy::Created`].
    pub expiration_policy: ExpirationPolicy,

    /// Allow per-entry durations and policies, and changes to the defaults
    /// after construction.
    pub variable_expiration: bool,

    /// Sizing of the pool that runs async listeners.
    pub listener_executor: ExecutorConfig,
}

impl Default for ExpiringMapConfig {
    fn default() -> Self {
        Self {
            expiration: DEFAULT_EXPIRATION,
            expiration_policy: ExpirationPolicy::Created,
            variable_expiration: false,
            listener_executor: ExecutorConfig::default(),
        }
    }
}

impl ExpiringMapConfig {
    /// Sets the default TTL.
    #[must_use]
    pub fn expiration(mut self, duration: Duration) -> Self {
        self.expiration = duration;
        self
    }

    /// Sets the default renewal policy.
    #[must_use]
    pub fn expiration_policy(mut self, policy: ExpirationPolicy) -> Self {
        self.expiration_policy = policy;
        self
    }

    /// Enables or disables variable expiration.
    #[must_use]
    pub fn variable_expiration(mut self, enabled: bool) -> Self {
        self.variable_expiration = enabled;
        self
    }

    /// Sets the async listener pool configuration.
    #[must_use]
    pub fn listener_executor(mut self, config: ExecutorConfig) -> Self {
        self.listener_executor = config;
        self
    }

    /// Checks that the configuration can build a working map.
    pub fn validate(&self) -> Result<()> {
        validate_ttl(self.expiration)?;
        self.listener_executor.validate()
    }

    pub(crate) fn settings(&self) -> ExpirationSettings {
        ExpirationSettings {
            duration: self.expiration,
            policy: self.expiration_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExpiringMapError;

    #[test]
    fn test_defaults() {
        let config = ExpiringMapConfig::default();
        assert_eq!(config.expiration, Duration::from_secs(60));
        assert_eq!(config.expiration_policy, ExpirationPolicy::Created);
        assert!(!config.variable_expiration);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = ExpiringMapConfig::default()
            .expiration(Duration::from_millis(250))
            .expiration_policy(ExpirationPolicy::Accessed)
            .variable_expiration(true)
            .listener_executor(ExecutorConfig::default().with_threads(4));
        assert_eq!(config.expiration, Duration::from_millis(250));
        assert_eq!(config.settings().policy, ExpirationPolicy::Accessed);
        assert!(config.variable_expiration);
        assert_eq!(config.listener_executor.threads, 4);
    }

    #[test]
    fn test_validate_rejects_zero_expiration() {
        let config = ExpiringMapConfig::default().expiration(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ExpiringMapError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_deserialize_humantime() {
        let json = r#"{
            "expiration": "5m 30s",
            "expiration_policy": "accessed",
            "listener_executor": { "threads": 3 }
        }"#;
        let config: ExpiringMapConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.expiration, Duration::from_secs(330));
        assert_eq!(config.expiration_policy, ExpirationPolicy::Accessed);
        assert!(!config.variable_expiration);
        assert_eq!(config.listener_executor.threads, 3);
        assert_eq!(
            config.listener_executor.queue_capacity,
            ExecutorConfig::default().queue_capacity
        );
    }

    #[test]
    fn test_serialize_roundtrip_keeps_duration_readable() {
        let config = ExpiringMapConfig::default().expiration(Duration::from_secs(90));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"1m 30s\""), "{json}");
        let back: ExpiringMapConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
