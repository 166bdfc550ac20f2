//! Error types for expiring map operations.
//!
//! Argument and usage errors are returned synchronously from the call that
//! caused them. Listener and scheduler faults are contained at the dispatch
//! and sweep boundaries: they are built, logged, and counted, but never
//! surface to callers of `put`/`get`/`remove`.

use std::io;
use thiserror::Error;

use crate::listener::ListenerId;

/// Errors produced by an [`ExpiringMap`](crate::ExpiringMap).
#[derive(Debug, Error)]
pub enum ExpiringMapError {
    /// An argument was out of range (zero duration, overflowing time unit).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation requires variable expiration, which is disabled.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// A registered listener panicked while being notified.
    #[error("Expiration listener {listener} failed: {message}")]
    ListenerFailure {
        /// The listener that failed.
        listener: ListenerId,
        /// Panic payload rendered as text.
        message: String,
    },

    /// The scheduler hit an unexpected failure during a sweep.
    #[error("Expiration scheduler fault: {0}")]
    SchedulerFault(String),

    /// A background thread could not be spawned.
    #[error("Failed to spawn background thread: {0}")]
    Spawn(#[from] io::Error),
}

impl ExpiringMapError {
    /// Returns true for errors caused by the caller's arguments or usage.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            ExpiringMapError::InvalidArgument(_) | ExpiringMapError::UnsupportedOperation(_)
        )
    }
}

/// Result type for expiring map operations.
pub type Result<T> = std::result::Result<T, ExpiringMapError>;

/// Message used when variable expiration is required but disabled.
pub(crate) const VARIABLE_EXPIRATION_DISABLED: &str = "variable expiration is not enabled";

/// Renders a panic payload caught by `catch_unwind`.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
