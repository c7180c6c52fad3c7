//! Protection Shield
//!
//! Wraps a cache-miss load path with four defenses:
//!
//! - **Penetration**: an optional bloom filter rejects keys that were never created,
//!   and a short-lived null-marker cache remembers keys the source confirmed absent.
//! - **Breakdown**: concurrent misses for one key collapse onto a single load, first
//!   through an in-process map of async mutexes, then through a store-backed lease
//!   lock so that only one instance loads.
//! - **Avalanche**: values are cached with a jittered TTL.
//! - **Source instability**: a sliding-window circuit breaker fails fast with
//!   `CircuitOpen` instead of calling a struggling source.
//!
//! # Example
//!
//! ```rust,no_run
//! use resilient_cache::{CacheSystemBuilder, Result};
//!
//! # async fn example() -> Result<()> {
//! let system = CacheSystemBuilder::new().namespace("shop").build().await?;
//! let key = system.keys().entity("product", 42)?;
//! let price: Option<u64> = system
//!     .shield()
//!     .protected_get(&key, || async { Ok(Some(1999)) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod bloom;
mod breaker;
mod lock;
mod metrics;
mod ttl;

pub use bloom::{BloomConfig, BloomFilter};
pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState, Permit};
pub use lock::{LeaseGuard, LeaseLock, LockConfig};
pub use metrics::ProtectionMetrics;
pub use ttl::{JitteredTtl, TtlJitterConfig};

use crate::error::{CacheError, Result};
use crate::keys::{CacheKey, DataCategory, KeyBuilder, TtlTable};
use crate::store::{CacheMode, CacheStore};
use dashmap::DashMap;
use metrics::{ShieldCounters, bump};
use moka::future::Cache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShieldConfig {
    /// Existence filter; `None` disables it
    pub bloom: Option<BloomConfig>,
    /// How long a confirmed-absent key is answered from the null-marker cache
    pub null_ttl: Duration,
    pub null_capacity: u64,
    pub ttl: TtlJitterConfig,
    /// Keep `lock.lease` above `loader_timeout` so a live load never outlasts its lease
    pub lock: LockConfig,
    pub breaker: BreakerConfig,
    pub loader_timeout: Option<Duration>,
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            bloom: None,
            null_ttl: Duration::from_secs(60),
            null_capacity: 100_000,
            ttl: TtlJitterConfig::default(),
            lock: LockConfig::default(),
            breaker: BreakerConfig::default(),
            loader_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Per-call overrides for [`ProtectionShield::protected_get_with_options`]
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Base TTL before jitter; defaults to the key's category TTL
    pub base_ttl: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

/// Removes the in-flight entry once the last interested caller is done
/// Failure a slot holder leaves behind for the callers queued on the same key
#[derive(Debug, Clone)]
enum SharedFailure {
    Loader(Arc<str>),
    CircuitOpen,
}

impl SharedFailure {
    fn from_error(error: &CacheError) -> Option<Self> {
        match error {
            CacheError::Loader(e) => Some(Self::Loader(format!("{e:#}").into())),
            CacheError::CircuitOpen => Some(Self::CircuitOpen),
            _ => None,
        }
    }

    fn to_error(&self) -> CacheError {
        match self {
            Self::Loader(message) => CacheError::Loader(anyhow::anyhow!("{message}")),
            Self::CircuitOpen => CacheError::CircuitOpen,
        }
    }
}

type Slot = Arc<Mutex<Option<SharedFailure>>>;

struct InFlightSlot<'a> {
    map: &'a DashMap<String, Slot>,
    key: String,
    slot: Slot,
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        // Map + this handle; anyone else still waiting holds a third reference
        self.map.remove_if(&self.key, |_, v| {
            Arc::ptr_eq(v, &self.slot) && Arc::strong_count(v) <= 2
        });
    }
}

pub struct ProtectionShield {
    mode: CacheMode,
    keys: KeyBuilder,
    ttl_table: Arc<TtlTable>,
    jitter: JitteredTtl,
    bloom: Option<BloomFilter>,
    null_markers: Cache<String, ()>,
    in_flight: DashMap<String, Slot>,
    lease: Option<LeaseLock>,
    breaker: CircuitBreaker,
    counters: ShieldCounters,
    config: ShieldConfig,
}

impl ProtectionShield {
    #[must_use]
    pub fn new(
        mode: CacheMode,
        keys: KeyBuilder,
        ttl_table: Arc<TtlTable>,
        config: ShieldConfig,
    ) -> Self {
        let lease = match &mode {
            CacheMode::Disabled => None,
            CacheMode::Enabled(store) => Some(LeaseLock::new(
                store.clone(),
                keys.clone(),
                config.lock.clone(),
            )),
        };
        let null_markers = Cache::builder()
            .max_capacity(config.null_capacity)
            .time_to_live(config.null_ttl)
            .build();

        info!(
            cache_enabled = lease.is_some(),
            bloom = config.bloom.is_some(),
            null_ttl_secs = config.null_ttl.as_secs(),
            "Protection shield initialized"
        );

        Self {
            bloom: config.bloom.as_ref().map(BloomFilter::new),
            jitter: JitteredTtl::new(config.ttl.clone()),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            mode,
            keys,
            ttl_table,
            null_markers,
            in_flight: DashMap::new(),
            lease,
            counters: ShieldCounters::default(),
            config,
        }
    }

    /// Get `key` from the cache, loading it through `loader` on a miss
    ///
    /// `loader` returns `Ok(None)` when the source confirms the entity does not exist;
    /// that result is remembered by a null marker and returned as `Ok(None)`.
    ///
    /// # Errors
    ///
    /// - `CircuitOpen` while the breaker rejects source calls
    /// - `LockTimeout` if another caller's load could not be awaited in time
    /// - `Loader` with the loader's own error (never retried here)
    pub async fn protected_get<T, F, Fut>(&self, key: &CacheKey, loader: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send,
    {
        self.protected_get_with_options(key, GetOptions::default(), loader)
            .await
    }

    /// [`protected_get`](Self::protected_get) that gives up with `Cancelled` when
    /// `cancel` fires, during the lock wait or the load
    ///
    /// # Errors
    ///
    /// See [`ProtectionShield::protected_get`]; additionally `Cancelled`.
    pub async fn protected_get_with_cancel<T, F, Fut>(
        &self,
        key: &CacheKey,
        loader: F,
        cancel: &CancellationToken,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send,
    {
        let options = GetOptions {
            base_ttl: None,
            cancel: Some(cancel.clone()),
        };
        self.protected_get_with_options(key, options, loader).await
    }

    /// # Errors
    ///
    /// See [`ProtectionShield::protected_get_with_cancel`].
    pub async fn protected_get_with_options<T, F, Fut>(
        &self,
        key: &CacheKey,
        options: GetOptions,
        loader: F,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send,
    {
        bump(&self.counters.total_requests);
        let started = Instant::now();
        let cancel = options.cancel.unwrap_or_default();

        let result = self
            .guarded_get(key, options.base_ttl, &cancel, loader)
            .await;

        if matches!(result, Err(CacheError::Cancelled)) {
            bump(&self.counters.cancelled);
        }
        self.counters.record_latency(started.elapsed());
        result
    }

    async fn guarded_get<T, F, Fut>(
        &self,
        key: &CacheKey,
        base_ttl: Option<Duration>,
        cancel: &CancellationToken,
        loader: F,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send,
    {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        // 1. Existence filter
        if let Some(bloom) = &self.bloom
            && !bloom.might_contain(key.as_str())
        {
            bump(&self.counters.bloom_rejections);
            debug!(key = %key, "[Shield] Existence filter: definitely absent");
            return Ok(None);
        }

        // 2. Null marker
        if self.is_marked_absent(key) {
            bump(&self.counters.null_marker_hits);
            debug!(key = %key, "[Shield] Null marker hit");
            return Ok(None);
        }

        let store = match &self.mode {
            CacheMode::Disabled => {
                let loaded = self.call_loader(key, cancel, loader).await?;
                if loaded.is_none() {
                    self.mark_absent(key).await;
                }
                return Ok(loaded);
            }
            CacheMode::Enabled(store) => store,
        };

        // 3. Cache
        if let Some(value) = self.read_cache::<T>(store, key).await {
            bump(&self.counters.cache_hits);
            return Ok(Some(value));
        }
        bump(&self.counters.cache_misses);

        // 4. Collapse concurrent loads in this process
        let cleanup = InFlightSlot {
            map: &self.in_flight,
            key: key.as_str().to_string(),
            slot: self
                .in_flight
                .entry(key.as_str().to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .clone(),
        };
        let mut local = match cleanup.slot.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                bump(&self.counters.blocked_breakdowns);
                let guard = self.wait_local(&cleanup.slot, key, cancel).await?;
                // 5. Whoever held the slot has likely filled the cache
                if self.is_marked_absent(key) {
                    return Ok(None);
                }
                if let Some(value) = self.read_cache::<T>(store, key).await {
                    return Ok(Some(value));
                }
                if let Some(failure) = guard.as_ref() {
                    debug!(key = %key, "[Shield] Sharing failed load with waiter");
                    return Err(failure.to_error());
                }
                guard
            }
        };
        *local = None;

        // 4b. Collapse across instances
        let lease = match &self.lease {
            Some(lock) => match lock.acquire(key, cancel).await {
                Ok(guard) => Some(guard),
                Err(CacheError::StoreUnavailable(reason)) => {
                    bump(&self.counters.store_errors);
                    warn!(key = %key, reason = %reason, "[Shield] Lease unavailable, collapsing in-process only");
                    None
                }
                Err(e) => {
                    if matches!(e, CacheError::LockTimeout { .. }) {
                        bump(&self.counters.lock_timeouts);
                    }
                    return Err(e);
                }
            },
            None => None,
        };

        let outcome = self
            .load_under_lease(store, key, base_ttl, cancel, loader, lease.as_ref())
            .await;

        // 8. Release; lease expiry covers a failed release
        if let (Some(lock), Some(guard)) = (&self.lease, lease) {
            lock.release(guard).await;
        }
        if let Err(e) = &outcome {
            *local = SharedFailure::from_error(e);
        }
        outcome
    }

    async fn load_under_lease<T, F, Fut>(
        &self,
        store: &CacheStore,
        key: &CacheKey,
        base_ttl: Option<Duration>,
        cancel: &CancellationToken,
        loader: F,
        lease: Option<&LeaseGuard>,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send,
    {
        // 5. Another instance may have loaded while we waited for the lease
        if lease.is_some()
            && let Some(value) = self.read_cache::<T>(store, key).await
        {
            return Ok(Some(value));
        }

        // 6-7. Breaker, then loader
        match self.call_loader(key, cancel, loader).await? {
            Some(value) => {
                self.fill(store, key, &value, base_ttl, lease).await;
                Ok(Some(value))
            }
            None => {
                self.mark_absent(key).await;
                Ok(None)
            }
        }
    }

    async fn wait_local<'a>(
        &self,
        slot: &'a Mutex<Option<SharedFailure>>,
        key: &CacheKey,
        cancel: &CancellationToken,
    ) -> Result<MutexGuard<'a, Option<SharedFailure>>> {
        let wait = self.config.lock.wait_timeout;
        tokio::select! {
            () = cancel.cancelled() => Err(CacheError::Cancelled),
            acquired = tokio::time::timeout(wait, slot.lock()) => acquired.map_err(|_| {
                bump(&self.counters.lock_timeouts);
                warn!(key = %key, waited_ms = wait.as_millis(), "[Shield] Timed out waiting for in-flight load");
                CacheError::LockTimeout {
                    key: key.to_string(),
                    waited: wait,
                }
            }),
        }
    }

    /// Cache read that degrades failures to a miss
    async fn read_cache<T: DeserializeOwned>(&self, store: &CacheStore, key: &CacheKey) -> Option<T> {
        match store.get::<T>(key).await {
            Ok(value) => value,
            Err(e) => {
                bump(&self.counters.store_errors);
                warn!(key = %key, error = %e, "[Shield] Cache read failed, treating as miss");
                None
            }
        }
    }

    async fn call_loader<T, F, Fut>(
        &self,
        key: &CacheKey,
        cancel: &CancellationToken,
        loader: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send,
    {
        let permit = self.breaker.acquire()?;
        bump(&self.counters.loader_calls);
        debug!(key = %key, "[Shield] Loading from source");

        let timeout = self.config.loader_timeout;
        let load = async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, loader())
                    .await
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("loader timed out after {limit:?}"))),
                None => loader().await,
            }
        };

        let outcome = tokio::select! {
            () = cancel.cancelled() => {
                self.breaker.release(permit);
                return Err(CacheError::Cancelled);
            }
            outcome = load => outcome,
        };

        match outcome {
            Ok(value) => {
                self.breaker.record_success(permit);
                Ok(value)
            }
            Err(e) => {
                self.breaker.record_failure(permit);
                bump(&self.counters.loader_errors);
                warn!(key = %key, error = %e, "[Shield] Loader failed");
                Err(CacheError::Loader(e))
            }
        }
    }

    async fn fill<T: Serialize + Sync>(
        &self,
        store: &CacheStore,
        key: &CacheKey,
        value: &T,
        base_ttl: Option<Duration>,
        lease: Option<&LeaseGuard>,
    ) {
        if let (Some(lock), Some(guard)) = (&self.lease, lease) {
            match lock.still_held(guard).await {
                Ok(true) => {}
                Ok(false) => {
                    bump(&self.counters.fenced_writes);
                    warn!(key = %key, token = guard.token(), "[Shield] Lease lost during load, not caching result");
                    return;
                }
                Err(e) => {
                    bump(&self.counters.store_errors);
                    warn!(key = %key, error = %e, "[Shield] Could not verify lease, not caching result");
                    return;
                }
            }
        }

        let base = base_ttl.unwrap_or_else(|| self.category_ttl(key));
        let ttl = self.jitter.sample(base);
        match store.set(key, value, Some(ttl)).await {
            Ok(()) => {
                debug!(key = %key, ttl_secs = ttl.as_secs(), "[Shield] Cached loaded value");
                if let Some(bloom) = &self.bloom {
                    bloom.insert(key.as_str());
                }
            }
            Err(e) => {
                bump(&self.counters.store_errors);
                warn!(key = %key, error = %e, "[Shield] Failed to cache loaded value");
            }
        }
    }

    fn category_ttl(&self, key: &CacheKey) -> Duration {
        let category = key
            .segments()
            .nth(1)
            .map_or(DataCategory::Other, DataCategory::from_entity_kind);
        self.ttl_table.ttl_for(category)
    }

    fn is_marked_absent(&self, key: &CacheKey) -> bool {
        self.null_markers.contains_key(key.as_str())
    }

    async fn mark_absent(&self, key: &CacheKey) {
        self.null_markers.insert(key.as_str().to_string(), ()).await;
        bump(&self.counters.null_markers_written);
        debug!(key = %key, "[Shield] Wrote null marker");
    }

    /// Forget that `key` was confirmed absent (e.g. the entity was just created)
    pub async fn invalidate_null_marker(&self, key: &CacheKey) {
        self.null_markers.invalidate(key.as_str()).await;
    }

    /// Record keys that exist in the source so the existence filter admits them
    pub fn register_existing<'a>(&self, keys: impl IntoIterator<Item = &'a CacheKey>) {
        if let Some(bloom) = &self.bloom {
            let mut count = 0usize;
            for key in keys {
                bloom.insert(key.as_str());
                count += 1;
            }
            debug!(count, "[Shield] Registered keys with existence filter");
        }
    }

    #[must_use]
    pub fn has_existence_filter(&self) -> bool {
        self.bloom.is_some()
    }

    #[must_use]
    pub fn get_stats(&self) -> ProtectionMetrics {
        self.counters
            .snapshot(self.breaker.trips(), self.breaker.rejections())
    }

    /// Zero every counter and stamp `last_reset`; breaker state is kept
    pub fn reset_stats(&self) {
        self.counters.reset();
        self.breaker.reset_counters();
        info!("[Shield] Statistics reset");
    }

    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    #[must_use]
    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    /// Loads currently collapsing concurrent callers in this process
    #[must_use]
    pub fn in_flight_loads(&self) -> usize {
        self.in_flight.len()
    }

    #[must_use]
    pub fn mode(&self) -> &CacheMode {
        &self.mode
    }

    #[must_use]
    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    #[must_use]
    pub fn ttl_bounds(&self, base: Duration) -> (Duration, Duration) {
        self.jitter.bounds(base)
    }
}
