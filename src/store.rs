//! Cache Store Adapter
//!
//! [`CacheStore`] is the handle every component uses to reach the key-value store. It
//! accepts only [`CacheKey`]s, encodes values with the configured [`Codec`], retries
//! transient failures, and records hit/miss/error counters plus per-read access samples
//! in a shared [`StoreMetrics`] that the monitor drains.

use crate::codecs::Codec;
use crate::error::{CacheError, Result};
use crate::keys::CacheKey;
use crate::retry::RetryPolicy;
use crate::traits::{CacheCodec, KeyTtl, KvStore, PoolStats};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Store adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub codec: Codec,
    pub retry: RetryPolicy,
    /// Access samples kept for the monitor before the oldest are dropped
    pub sample_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            codec: Codec::Json,
            retry: RetryPolicy::default(),
            sample_capacity: 10_000,
        }
    }
}

/// Result of a single read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessOutcome {
    Hit,
    Miss,
    Error,
}

/// One read observed by the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessSample {
    pub key: String,
    pub latency: Duration,
    pub outcome: AccessOutcome,
    pub at: DateTime<Utc>,
}

/// Point-in-time copy of the store counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub hit_rate: f64,
    pub pool: PoolStats,
    pub last_reset: DateTime<Utc>,
}

/// Counters shared by every clone of a [`CacheStore`]
#[derive(Debug)]
pub struct StoreMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    samples: Mutex<VecDeque<AccessSample>>,
    capacity: usize,
    last_reset: RwLock<DateTime<Utc>>,
}

impl StoreMetrics {
    fn new(capacity: usize) -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            samples: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            last_reset: RwLock::new(Utc::now()),
        }
    }

    fn record_read(&self, key: &str, started: Instant, outcome: AccessOutcome) {
        match outcome {
            AccessOutcome::Hit => self.hits.fetch_add(1, Ordering::Relaxed),
            AccessOutcome::Miss => self.misses.fetch_add(1, Ordering::Relaxed),
            AccessOutcome::Error => self.errors.fetch_add(1, Ordering::Relaxed),
        };
        let mut samples = self.samples.lock();
        if samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(AccessSample {
            key: key.to_string(),
            latency: started.elapsed(),
            outcome,
            at: Utc::now(),
        });
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Take every buffered access sample, oldest first
    pub fn drain_samples(&self) -> Vec<AccessSample> {
        self.samples.lock().drain(..).collect()
    }

    #[must_use]
    pub fn pending_samples(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
        self.deletes.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.samples.lock().clear();
        *self.last_reset.write() = Utc::now();
    }

    fn snapshot(&self, pool: PoolStats) -> StoreStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let reads = hits + misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if reads > 0 {
            hits as f64 / reads as f64
        } else {
            0.0
        };
        StoreStats {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            hit_rate,
            pool,
            last_reset: *self.last_reset.read(),
        }
    }
}

/// Value stored together with an optional version tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue<T> {
    pub value: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// Typed, instrumented handle over a [`KvStore`]
///
/// Cloning is cheap; all clones share the backend and the metrics.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn KvStore>,
    codec: Codec,
    retry: RetryPolicy,
    metrics: Arc<StoreMetrics>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("backend", &self.backend.name())
            .field("codec", &self.codec.name())
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    pub fn new(backend: Arc<dyn KvStore>, config: &StoreConfig) -> Self {
        debug!(backend = backend.name(), codec = config.codec.name(), "Creating cache store");
        Self {
            backend,
            codec: config.codec,
            retry: config.retry.clone(),
            metrics: Arc::new(StoreMetrics::new(config.sample_capacity)),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<StoreMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    #[must_use]
    pub fn codec(&self) -> Codec {
        self.codec
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.metrics.snapshot(self.backend.pool_stats())
    }

    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.backend.pool_stats()
    }

    pub async fn health_check(&self) -> bool {
        self.backend.health_check().await
    }

    /// Count failures of non-read operations
    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.metrics.record_error();
        }
        result
    }

    /// Read and decode a value
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` once retries are exhausted, `Serialization` if the stored bytes
    /// do not decode into `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>> {
        let started = Instant::now();
        let raw = self
            .retry
            .run("get", || self.backend.get(key.as_str()))
            .await;
        let decoded = match raw {
            Ok(Some(bytes)) => self.codec.deserialize::<T>(&bytes).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        let outcome = match &decoded {
            Ok(Some(_)) => AccessOutcome::Hit,
            Ok(None) => AccessOutcome::Miss,
            Err(_) => AccessOutcome::Error,
        };
        self.metrics.record_read(key.as_str(), started, outcome);
        if let Err(e) = &decoded {
            warn!(key = %key, error = %e, "Cache read failed");
        }
        decoded
    }

    /// Encode and write a value
    ///
    /// # Errors
    ///
    /// `Serialization` if the value cannot be encoded, `StoreUnavailable` once retries
    /// are exhausted.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let bytes = self.track(CacheCodec::serialize(&self.codec, value))?;
        self.track(
            self.retry
                .run("set", || self.backend.set(key.as_str(), &bytes, ttl))
                .await,
        )?;
        self.metrics.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, ttl_secs = ?ttl.map(|t| t.as_secs()), "Cached value");
        Ok(())
    }

    /// Read a value written by [`CacheStore::set_versioned`]
    ///
    /// # Errors
    ///
    /// See [`CacheStore::get`].
    pub async fn get_versioned<T: DeserializeOwned>(
        &self,
        key: &CacheKey,
    ) -> Result<Option<VersionedValue<T>>> {
        self.get(key).await
    }

    /// Write a value with a version tag
    ///
    /// # Errors
    ///
    /// See [`CacheStore::set`].
    pub async fn set_versioned<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        version: Option<u64>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        #[derive(Serialize)]
        struct Borrowed<'a, T> {
            value: &'a T,
            #[serde(skip_serializing_if = "Option::is_none")]
            version: Option<u64>,
        }
        self.set(key, &Borrowed { value, version }, ttl).await
    }

    /// Delete a key, returning whether it existed
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` once retries are exhausted.
    pub async fn delete(&self, key: &CacheKey) -> Result<bool> {
        let removed = self.track(
            self.retry
                .run("delete", || self.backend.delete(key.as_str()))
                .await,
        )?;
        self.metrics.deletes.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, removed, "Evicted key");
        Ok(removed)
    }

    /// # Errors
    ///
    /// `StoreUnavailable` once retries are exhausted.
    pub async fn exists(&self, key: &CacheKey) -> Result<bool> {
        self.track(
            self.retry
                .run("exists", || self.backend.exists(key.as_str()))
                .await,
        )
    }

    /// # Errors
    ///
    /// `StoreUnavailable` once retries are exhausted.
    pub async fn expire(&self, key: &CacheKey, ttl: Duration) -> Result<bool> {
        self.track(
            self.retry
                .run("expire", || self.backend.expire(key.as_str(), ttl))
                .await,
        )
    }

    /// # Errors
    ///
    /// `StoreUnavailable` once retries are exhausted.
    pub async fn ttl(&self, key: &CacheKey) -> Result<KeyTtl> {
        self.track(
            self.retry
                .run("ttl", || self.backend.ttl(key.as_str()))
                .await,
        )
    }

    /// Batched read; one slot per key, in order
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` once retries are exhausted, `Serialization` if any value fails
    /// to decode.
    pub async fn mget<T: DeserializeOwned>(&self, keys: &[CacheKey]) -> Result<Vec<Option<T>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        let raw_keys: Vec<String> = keys.iter().map(|k| k.as_str().to_string()).collect();
        let raw = match self.retry.run("mget", || self.backend.mget(&raw_keys)).await {
            Ok(raw) => raw,
            Err(e) => {
                for key in keys {
                    self.metrics
                        .record_read(key.as_str(), started, AccessOutcome::Error);
                }
                return Err(e);
            }
        };
        let mut values = Vec::with_capacity(raw.len());
        for (key, slot) in keys.iter().zip(raw) {
            let value = match slot {
                Some(bytes) => match self.codec.deserialize::<T>(&bytes) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        self.metrics
                            .record_read(key.as_str(), started, AccessOutcome::Error);
                        return Err(e);
                    }
                },
                None => None,
            };
            let outcome = if value.is_some() {
                AccessOutcome::Hit
            } else {
                AccessOutcome::Miss
            };
            self.metrics.record_read(key.as_str(), started, outcome);
            values.push(value);
        }
        Ok(values)
    }

    /// Batched write, every entry receiving the same TTL
    ///
    /// # Errors
    ///
    /// `Serialization` if any value cannot be encoded, `StoreUnavailable` once retries
    /// are exhausted.
    pub async fn mset<T: Serialize>(
        &self,
        entries: &[(CacheKey, T)],
        ttl: Option<Duration>,
    ) -> Result<()> {
        let encoded = entries
            .iter()
            .map(|(key, value)| {
                let bytes = CacheCodec::serialize(&self.codec, value)?;
                Ok((key.as_str().to_string(), bytes))
            })
            .collect::<Result<Vec<_>>>();
        let encoded = self.track(encoded)?;
        self.track(
            self.retry
                .run("mset", || self.backend.mset(&encoded, ttl))
                .await,
        )?;
        self.metrics
            .sets
            .fetch_add(encoded.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Batched delete, returning how many keys existed
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` once retries are exhausted.
    pub async fn mdel(&self, keys: &[CacheKey]) -> Result<usize> {
        let raw_keys: Vec<String> = keys.iter().map(|k| k.as_str().to_string()).collect();
        let removed = self.track(
            self.retry
                .run("mdel", || self.backend.mdel(&raw_keys))
                .await,
        )?;
        self.metrics
            .deletes
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        Ok(removed)
    }

    // ===== Hash =====

    /// # Errors
    ///
    /// `Serialization` or `StoreUnavailable`.
    pub async fn hset<T: Serialize + ?Sized>(
        &self,
        key: &CacheKey,
        field: &str,
        value: &T,
    ) -> Result<()> {
        let bytes = self.track(CacheCodec::serialize(&self.codec, value))?;
        self.track(
            self.retry
                .run("hset", || self.backend.hset(key.as_str(), field, &bytes))
                .await,
        )
    }

    /// # Errors
    ///
    /// `Serialization` or `StoreUnavailable`.
    pub async fn hget<T: DeserializeOwned>(&self, key: &CacheKey, field: &str) -> Result<Option<T>> {
        let raw = self.track(
            self.retry
                .run("hget", || self.backend.hget(key.as_str(), field))
                .await,
        )?;
        raw.map(|bytes| self.track(self.codec.deserialize(&bytes)))
            .transpose()
    }

    /// # Errors
    ///
    /// `Serialization` or `StoreUnavailable`.
    pub async fn hgetall<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Vec<(String, T)>> {
        let raw = self.track(
            self.retry
                .run("hgetall", || self.backend.hgetall(key.as_str()))
                .await,
        )?;
        raw.into_iter()
            .map(|(field, bytes)| Ok((field, self.track(self.codec.deserialize(&bytes))?)))
            .collect()
    }

    /// # Errors
    ///
    /// `StoreUnavailable` once retries are exhausted.
    pub async fn hdel(&self, key: &CacheKey, field: &str) -> Result<bool> {
        self.track(
            self.retry
                .run("hdel", || self.backend.hdel(key.as_str(), field))
                .await,
        )
    }

    // ===== List =====

    /// # Errors
    ///
    /// `Serialization` or `StoreUnavailable`.
    pub async fn lpush<T: Serialize + ?Sized>(&self, key: &CacheKey, value: &T) -> Result<usize> {
        let bytes = self.track(CacheCodec::serialize(&self.codec, value))?;
        self.track(
            self.retry
                .run("lpush", || self.backend.lpush(key.as_str(), &bytes))
                .await,
        )
    }

    /// # Errors
    ///
    /// `Serialization` or `StoreUnavailable`.
    pub async fn rpush<T: Serialize + ?Sized>(&self, key: &CacheKey, value: &T) -> Result<usize> {
        let bytes = self.track(CacheCodec::serialize(&self.codec, value))?;
        self.track(
            self.retry
                .run("rpush", || self.backend.rpush(key.as_str(), &bytes))
                .await,
        )
    }

    /// # Errors
    ///
    /// `Serialization` or `StoreUnavailable`.
    pub async fn lrange<T: DeserializeOwned>(
        &self,
        key: &CacheKey,
        start: isize,
        stop: isize,
    ) -> Result<Vec<T>> {
        let raw = self.track(
            self.retry
                .run("lrange", || self.backend.lrange(key.as_str(), start, stop))
                .await,
        )?;
        raw.iter()
            .map(|bytes| self.track(self.codec.deserialize(bytes)))
            .collect()
    }

    /// # Errors
    ///
    /// `StoreUnavailable` once retries are exhausted.
    pub async fn ltrim(&self, key: &CacheKey, start: isize, stop: isize) -> Result<()> {
        self.track(
            self.retry
                .run("ltrim", || self.backend.ltrim(key.as_str(), start, stop))
                .await,
        )
    }

    // ===== Set =====

    /// # Errors
    ///
    /// `StoreUnavailable` once retries are exhausted.
    pub async fn sadd(&self, key: &CacheKey, member: &str) -> Result<bool> {
        self.track(
            self.retry
                .run("sadd", || self.backend.sadd(key.as_str(), member))
                .await,
        )
    }

    /// # Errors
    ///
    /// `StoreUnavailable` once retries are exhausted.
    pub async fn srem(&self, key: &CacheKey, member: &str) -> Result<bool> {
        self.track(
            self.retry
                .run("srem", || self.backend.srem(key.as_str(), member))
                .await,
        )
    }

    /// # Errors
    ///
    /// `StoreUnavailable` once retries are exhausted.
    pub async fn smembers(&self, key: &CacheKey) -> Result<Vec<String>> {
        self.track(
            self.retry
                .run("smembers", || self.backend.smembers(key.as_str()))
                .await,
        )
    }

    /// # Errors
    ///
    /// `StoreUnavailable` once retries are exhausted.
    pub async fn sismember(&self, key: &CacheKey, member: &str) -> Result<bool> {
        self.track(
            self.retry
                .run("sismember", || self.backend.sismember(key.as_str(), member))
                .await,
        )
    }

    // ===== Sorted set =====

    /// # Errors
    ///
    /// `StoreUnavailable` once retries are exhausted.
    pub async fn zadd(&self, key: &CacheKey, member: &str, score: f64) -> Result<()> {
        self.track(
            self.retry
                .run("zadd", || self.backend.zadd(key.as_str(), member, score))
                .await,
        )
    }

    /// # Errors
    ///
    /// `StoreUnavailable` once retries are exhausted.
    pub async fn zincr_by(&self, key: &CacheKey, member: &str, delta: f64) -> Result<f64> {
        self.track(
            self.retry
                .run("zincr_by", || self.backend.zincr_by(key.as_str(), member, delta))
                .await,
        )
    }

    /// # Errors
    ///
    /// `StoreUnavailable` once retries are exhausted.
    pub async fn zrevrange_with_scores(
        &self,
        key: &CacheKey,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        self.track(
            self.retry
                .run("zrevrange", || {
                    self.backend.zrevrange_with_scores(key.as_str(), start, stop)
                })
                .await,
        )
    }

    /// # Errors
    ///
    /// `StoreUnavailable` once retries are exhausted.
    pub async fn zrem(&self, key: &CacheKey, member: &str) -> Result<bool> {
        self.track(
            self.retry
                .run("zrem", || self.backend.zrem(key.as_str(), member))
                .await,
        )
    }

    /// Raw keys matching a glob pattern
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` once retries are exhausted.
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.track(
            self.retry
                .run("scan", || self.backend.scan_keys(pattern))
                .await,
        )
    }

    // ===== Lease primitives (not retried: callers own their own backoff) =====

    pub(crate) async fn set_nx(&self, key: &CacheKey, token: &[u8], lease: Duration) -> Result<bool> {
        self.track(self.backend.set_nx(key.as_str(), token, lease).await)
    }

    pub(crate) async fn compare_and_delete(&self, key: &CacheKey, token: &[u8]) -> Result<bool> {
        self.track(self.backend.compare_and_delete(key.as_str(), token).await)
    }

    pub(crate) async fn get_raw(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        self.track(self.backend.get(key.as_str()).await)
    }

    pub(crate) async fn incr(&self, key: &CacheKey, by: i64) -> Result<i64> {
        self.track(
            self.retry
                .run("incr", || self.backend.incr(key.as_str(), by))
                .await,
        )
    }
}

/// Whether a component talks to a cache at all
///
/// A disabled component calls straight through to its source.
#[derive(Debug, Clone)]
pub enum CacheMode {
    Disabled,
    Enabled(CacheStore),
}

impl CacheMode {
    #[must_use]
    pub fn store(&self) -> Option<&CacheStore> {
        match self {
            Self::Disabled => None,
            Self::Enabled(store) => Some(store),
        }
    }

    /// Store handle, or a `Config` error naming the component that needs one
    pub(crate) fn require(&self, component: &'static str) -> Result<&CacheStore> {
        match self {
            Self::Disabled => Err(CacheError::Config(format!(
                "{component} requires an enabled cache store"
            ))),
            Self::Enabled(store) => Ok(store),
        }
    }
}
