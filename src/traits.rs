//! Store and Codec Traits
//!
//! This module defines the narrow interfaces through which the resilience layer talks
//! to the outside world.
//!
//! # Architecture
//!
//! - `CacheCodec`: Trait for pluggable serialization backends
//! - `KvStore`: The underlying key-value store (CRUD, TTL, batches, collections,
//!   connection-pool telemetry, health check)
//!
//! Components never hold a `KvStore` directly; they go through
//! [`CacheStore`](crate::store::CacheStore), which adds validated keys, typed values,
//! retries and shared statistics on top.
//!
//! # Example: Custom Store
//!
//! ```rust,ignore
//! use resilient_cache::{KvStore, async_trait};
//!
//! struct MyStore { /* ... */ }
//!
//! #[async_trait]
//! impl KvStore for MyStore {
//!     async fn get(&self, key: &str) -> resilient_cache::Result<Option<Vec<u8>>> {
//!         // Your implementation
//!     }
//!     // ... remaining operations
//! }
//! ```

use crate::error::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;

/// Trait for cache value serialization/deserialization
///
/// Implementations must be `Send + Sync + Debug` so a codec can be shared by every
/// component holding the store.
///
/// # Example: Custom Codec
///
/// ```rust,ignore
/// use resilient_cache::{CacheCodec, CacheError, Result};
/// use serde::{Serialize, de::DeserializeOwned};
///
/// #[derive(Debug)]
/// struct MyCustomCodec;
///
/// impl CacheCodec for MyCustomCodec {
///     fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
///         mycodec::serialize(value).map_err(|e| CacheError::Serialization(e.to_string()))
///     }
///
///     fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
///         mycodec::deserialize(bytes).map_err(|e| CacheError::Serialization(e.to_string()))
///     }
///
///     fn name(&self) -> &'static str {
///         "mycodec"
///     }
/// }
/// ```
pub trait CacheCodec: Send + Sync + Debug {
    /// Serialize a value to bytes
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the value cannot be encoded.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize bytes to a value
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the bytes do not decode into `T`.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Name of the codec, used in logs
    fn name(&self) -> &'static str;
}

/// Remaining lifetime of a stored key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key does not exist
    Missing,
    /// Key exists without an expiry
    Persistent,
    /// Key expires after the contained duration
    Expires(Duration),
}

/// Connection-pool telemetry reported by a store backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Upper bound on concurrently usable connections
    pub max_connections: u32,
    /// Commands currently in flight
    pub active: u32,
    /// Connections (or slots) not serving a command
    pub idle: u32,
    /// Commands issued since the backend was created
    pub total_commands: u64,
    /// Commands that failed at the transport level
    pub failed_commands: u64,
}

/// Key-value store consumed by the resilience layer
///
/// Every operation takes a raw string key; validation happens one level up in
/// [`CacheStore`](crate::store::CacheStore). Failures at the transport level must be
/// reported as `StoreUnavailable` so callers can retry them, type mismatches as
/// `Serialization`.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` to support concurrent access across async tasks.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get value by key
    ///
    /// # Returns
    ///
    /// * `Ok(Some(bytes))` - Value found
    /// * `Ok(None)` - Key not found or expired
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set value, with an optional time-to-live
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Set a new TTL on an existing key, returning `false` if the key is absent
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    /// Batched get; the result has one slot per requested key, in order
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Batched set, every entry receiving the same TTL
    async fn mset(&self, entries: &[(String, Vec<u8>)], ttl: Option<Duration>) -> Result<()>;

    /// Batched delete, returning how many keys existed
    async fn mdel(&self, keys: &[String]) -> Result<usize>;

    /// Set only if the key is absent (lease acquisition)
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Key was created with the given value and lease
    /// * `Ok(false)` - Key already existed, nothing changed
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Delete the key only if it still holds `expected` (lease release)
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Atomically add `by` to an integer counter, creating it at zero
    async fn incr(&self, key: &str, by: i64) -> Result<i64>;

    // ===== Hash =====

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>>;
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    // ===== List =====

    /// Push to the head, returning the new length
    async fn lpush(&self, key: &str, value: &[u8]) -> Result<usize>;
    /// Push to the tail, returning the new length
    async fn rpush(&self, key: &str, value: &[u8]) -> Result<usize>;
    /// Inclusive range; negative indexes count from the tail as in Redis
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Vec<u8>>>;
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()>;

    // ===== Set =====

    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    // ===== Sorted set =====

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    /// Increment a member's score, returning the new score
    async fn zincr_by(&self, key: &str, member: &str, delta: f64) -> Result<f64>;
    /// Members by descending score, inclusive range
    async fn zrevrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    /// Keys matching a glob pattern (`*`, `?`)
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Connection-pool statistics
    fn pool_stats(&self) -> PoolStats;

    /// Check if the store is reachable and operational
    async fn health_check(&self) -> bool;

    /// Name of this backend, used in logs
    fn name(&self) -> &'static str {
        "unknown"
    }
}
