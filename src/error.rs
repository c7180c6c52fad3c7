//! Error taxonomy shared by every component.
//!
//! A key that is absent from both the cache and the source is not an error: lookups
//! return `Ok(None)` for it. Everything else that can go wrong surfaces as a
//! [`CacheError`].

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the cache resilience layer
#[derive(Debug, Error)]
pub enum CacheError {
    /// Key failed validation (empty, too long, whitespace or control characters)
    #[error("Malformed cache key '{key}': {reason}")]
    MalformedKey { key: String, reason: &'static str },

    /// Connection or I/O failure talking to the key-value store (retryable)
    #[error("Cache store unavailable: {0}")]
    StoreUnavailable(String),

    /// Value could not be encoded or decoded (not retryable)
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Concurrent loads for a key could not be collapsed in time
    #[error("Timed out after {waited:?} waiting for the load lock on '{key}'")]
    LockTimeout { key: String, waited: Duration },

    /// Source calls are being rejected while the circuit breaker is open
    #[error("Circuit breaker is open; source call rejected")]
    CircuitOpen,

    /// Error returned by a caller-supplied loader, passed through untouched
    #[error("Loader failed: {0:#}")]
    Loader(anyhow::Error),

    /// Error returned by the system of record during a sync or audit
    #[error("System of record failed: {0:#}")]
    Source(anyhow::Error),

    /// Operation was cancelled through its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// A bounded queue rejected work under its backpressure policy
    #[error("Queue '{queue}' is full (capacity {capacity})")]
    QueueFull { queue: &'static str, capacity: usize },

    /// Cached value disagrees with the system of record
    #[error("Cached value for '{key}' is inconsistent with the source")]
    Inconsistent { key: String },

    /// A state machine was asked to make a transition it does not allow
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    /// A run of the same kind is already in progress
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    /// The component has been shut down and no longer accepts work
    #[error("{0} has been shut down")]
    Shutdown(&'static str),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CacheError {
    /// Whether retrying the same operation may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    pub(crate) fn malformed(key: impl Into<String>, reason: &'static str) -> Self {
        Self::MalformedKey {
            key: key.into(),
            reason,
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, CacheError>;
