//! Consistency Coordinator
//!
//! Keeps cached entries in line with the system of record. Writes go through
//! [`ConsistencyCoordinator::sync_cache`] under one of four [`ConsistencyStrategy`]s;
//! mutation events published elsewhere are applied by a sharded [`WorkerPool`] so that
//! events for one key are handled in the order they were published. A background
//! auditor samples tracked keys, compares them with the source and repairs drift, and a
//! refresher reloads hot keys shortly before they expire.

mod audit;
mod event;
#[cfg(feature = "redis")]
mod pubsub;
mod source;
mod stats;
mod strategy;

pub use audit::ConsistencyCheckResult;
pub use event::{EventEnvelope, EventType, UpdateEvent};
#[cfg(feature = "redis")]
pub use pubsub::{EventBusConfig, EventPublisher, EventSubscriber, SubscriberStats};
pub use source::{DataSource, merge_changes};
pub use stats::ConsistencyStats;
pub use strategy::{ConsistencyStrategy, SyncOutcome};

use crate::error::{CacheError, Result};
use crate::keys::{CacheKey, DataCategory, KeyBuilder, TtlTable};
use crate::pool::{BackpressurePolicy, PoolConfig, WorkerPool, shard_of, spawn_periodic};
use crate::retry::RetryPolicy;
use crate::shield::ProtectionShield;
use crate::store::{CacheMode, CacheStore};
use crate::traits::KeyTtl;
use audit::{TrackedKey, is_consistent};
use chrono::Utc;
use dashmap::DashMap;
use moka::future::Cache;
use parking_lot::{Mutex, RwLock};
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stats::StatsCell;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const COMPONENT: &str = "consistency coordinator";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    /// Strategy used by `sync_cache` and by event handling
    pub strategy: ConsistencyStrategy,
    pub event_workers: usize,
    /// Capacity of each event worker's queue
    pub event_queue_capacity: usize,
    /// Applies to both the event queues and the write-behind queues
    pub backpressure: BackpressurePolicy,
    pub flush_workers: usize,
    pub flush_queue_capacity: usize,
    pub flush_max_attempts: u32,
    /// First flush retry delay; doubles on each further attempt
    pub flush_retry_base: Duration,
    pub audit_interval: Duration,
    /// Fraction of tracked keys checked per audit, in `[0, 1]`
    pub audit_sample_rate: f64,
    pub refresh_interval: Duration,
    /// Refresh once the remaining TTL drops below this fraction of the category TTL
    pub refresh_threshold: f64,
    /// Accesses within one refresh interval that make a key worth refreshing
    pub refresh_min_accesses: u32,
    /// Also bounds the per-key event versions remembered for stale-event detection
    pub max_tracked_keys: usize,
    /// How long the last applied event version of a key is remembered
    pub version_retention: Duration,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            strategy: ConsistencyStrategy::WriteThrough,
            event_workers: 4,
            event_queue_capacity: 1000,
            backpressure: BackpressurePolicy::default(),
            flush_workers: 2,
            flush_queue_capacity: 1000,
            flush_max_attempts: 3,
            flush_retry_base: Duration::from_millis(100),
            audit_interval: Duration::from_secs(300),
            audit_sample_rate: 0.1,
            refresh_interval: Duration::from_secs(30),
            refresh_threshold: 0.2,
            refresh_min_accesses: 5,
            max_tracked_keys: 10_000,
            version_retention: Duration::from_secs(600),
        }
    }
}

/// Source write queued by a write-behind sync
struct FlushJob {
    key: CacheKey,
    kind: String,
    id: String,
    changes: Value,
}

/// State shared between the coordinator handle and its workers
struct Inner {
    mode: CacheMode,
    keys: KeyBuilder,
    source: Arc<dyn DataSource>,
    ttl_table: Arc<TtlTable>,
    shield: Option<Arc<ProtectionShield>>,
    tracked: DashMap<CacheKey, TrackedKey>,
    /// Highest event version applied per key, bounded and aging out
    versions: Cache<CacheKey, u64>,
    last_results: RwLock<Vec<ConsistencyCheckResult>>,
    stats: StatsCell,
    config: ConsistencyConfig,
}

pub struct ConsistencyCoordinator {
    inner: Arc<Inner>,
    events: WorkerPool<UpdateEvent>,
    flushes: WorkerPool<FlushJob>,
    background: Mutex<Vec<JoinHandle<()>>>,
    stop: CancellationToken,
    #[cfg(feature = "redis")]
    publisher: Option<Arc<EventPublisher>>,
}

impl ConsistencyCoordinator {
    /// Start the event and write-behind workers
    ///
    /// Must be called from within a tokio runtime. When `shield` is given, entities
    /// created or updated through the coordinator are registered with its existence
    /// filter and their null markers are cleared.
    pub fn new(
        mode: CacheMode,
        keys: KeyBuilder,
        source: Arc<dyn DataSource>,
        ttl_table: Arc<TtlTable>,
        shield: Option<Arc<ProtectionShield>>,
        config: ConsistencyConfig,
    ) -> Self {
        let events_config = PoolConfig {
            workers: config.event_workers,
            queue_capacity: config.event_queue_capacity,
            backpressure: config.backpressure,
        };
        let flush_config = PoolConfig {
            workers: config.flush_workers,
            queue_capacity: config.flush_queue_capacity,
            backpressure: config.backpressure,
        };
        info!(
            strategy = config.strategy.as_str(),
            cache_enabled = mode.store().is_some(),
            "Consistency coordinator initialized"
        );

        let inner = Arc::new(Inner {
            mode,
            keys,
            source,
            ttl_table,
            shield,
            tracked: DashMap::new(),
            versions: Cache::builder()
                .max_capacity(u64::try_from(config.max_tracked_keys).unwrap_or(u64::MAX))
                .time_to_live(config.version_retention)
                .build(),
            last_results: RwLock::new(Vec::new()),
            stats: StatsCell::default(),
            config,
        });

        let handler = Arc::clone(&inner);
        let events = WorkerPool::spawn("consistency-events", events_config, move |event| {
            let inner = Arc::clone(&handler);
            async move { inner.handle_event(event).await }
        });
        let handler = Arc::clone(&inner);
        let flushes = WorkerPool::spawn("write-behind", flush_config, move |job| {
            let inner = Arc::clone(&handler);
            async move { inner.flush(job).await }
        });

        Self {
            inner,
            events,
            flushes,
            background: Mutex::new(Vec::new()),
            stop: CancellationToken::new(),
            #[cfg(feature = "redis")]
            publisher: None,
        }
    }

    /// Broadcast local syncs and published events to other instances
    #[cfg(feature = "redis")]
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Write `changes` to the source and bring the cache in line using the configured strategy
    ///
    /// # Errors
    ///
    /// See [`ConsistencyCoordinator::sync_cache_with`].
    pub async fn sync_cache(
        &self,
        key: &CacheKey,
        kind: &str,
        id: &str,
        changes: &Value,
    ) -> Result<SyncOutcome> {
        self.sync_cache_with(self.inner.config.strategy, key, kind, id, changes)
            .await
    }

    /// Like [`ConsistencyCoordinator::sync_cache`] with an explicit strategy
    ///
    /// A cache failure after a successful source write is reported as
    /// [`SyncOutcome::PartialFailure`]; the source write is not rolled back.
    ///
    /// # Errors
    ///
    /// - `Source` if the system of record rejects the write
    /// - `QueueFull` if a write-behind flush could not be queued (the cached copy is evicted)
    /// - `Shutdown` after [`ConsistencyCoordinator::shutdown`]
    pub async fn sync_cache_with(
        &self,
        strategy: ConsistencyStrategy,
        key: &CacheKey,
        kind: &str,
        id: &str,
        changes: &Value,
    ) -> Result<SyncOutcome> {
        if self.events.is_shut_down() {
            return Err(CacheError::Shutdown(COMPONENT));
        }
        let (outcome, record) = self.sync_locally(strategy, key, kind, id, changes).await?;
        self.broadcast(UpdateEvent::new(
            EventType::Update,
            kind,
            id,
            record,
            vec![key.clone()],
        ))
        .await;
        Ok(outcome)
    }

    /// Run one sync; also returns the record other instances should cache (`Null` to reload)
    async fn sync_locally(
        &self,
        strategy: ConsistencyStrategy,
        key: &CacheKey,
        kind: &str,
        id: &str,
        changes: &Value,
    ) -> Result<(SyncOutcome, Value)> {
        let inner = &self.inner;
        let store = match &inner.mode {
            CacheMode::Disabled => {
                inner.write_source(kind, id, changes).await?;
                inner.stats.update(|s| s.successful_syncs += 1);
                return Ok((SyncOutcome::Synced, Value::Null));
            }
            CacheMode::Enabled(store) => store,
        };
        debug!(key = %key, strategy = strategy.as_str(), "Syncing cache");

        match strategy {
            ConsistencyStrategy::WriteThrough => {
                let record = inner.write_source(kind, id, changes).await?;
                let step = inner.cache_record(store, key, kind, id, Some(&record)).await;
                Ok((inner.settle(key, step, SyncOutcome::Synced), record))
            }
            ConsistencyStrategy::WriteBehind => {
                self.write_behind(store, key, kind, id, changes).await
            }
            ConsistencyStrategy::CacheAside => {
                inner.write_source(kind, id, changes).await?;
                let step = store.delete(key).await.map(|_| ());
                Ok((inner.settle(key, step, SyncOutcome::Invalidated), Value::Null))
            }
            ConsistencyStrategy::RefreshAhead => {
                inner.write_source(kind, id, changes).await?;
                let (step, record) = match inner.source.load(kind, id).await {
                    Ok(record) => (
                        inner.cache_record(store, key, kind, id, record.as_ref()).await,
                        record.unwrap_or(Value::Null),
                    ),
                    Err(e) => (Err(CacheError::Source(e)), Value::Null),
                };
                inner.track(key, kind, id, true, false);
                Ok((inner.settle(key, step, SyncOutcome::Synced), record))
            }
        }
    }

    async fn write_behind(
        &self,
        store: &CacheStore,
        key: &CacheKey,
        kind: &str,
        id: &str,
        changes: &Value,
    ) -> Result<(SyncOutcome, Value)> {
        let inner = &self.inner;
        let cached = match store.get::<Value>(key).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(key = %key, error = %e, "Cached record unreadable, merging onto source copy");
                None
            }
        };
        let base = match cached {
            Some(record) => Some(record),
            None => inner.source.load(kind, id).await.map_err(|e| {
                inner.stats.update(|s| s.failed_syncs += 1);
                CacheError::Source(e)
            })?,
        };
        let mut record = base.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        merge_changes(&mut record, changes);

        if let Err(e) = store.set(key, &record, Some(inner.ttl_for(kind))).await {
            inner.stats.update(|s| s.failed_syncs += 1);
            return Err(e);
        }
        inner.track(key, kind, id, false, false);

        let job = FlushJob {
            key: key.clone(),
            kind: kind.to_string(),
            id: id.to_string(),
            changes: changes.clone(),
        };
        if let Err(e) = self.flushes.submit(shard_of(key.as_str()), job).await {
            // The source will never see these changes, so stop serving them
            if let Err(evict) = store.delete(key).await {
                warn!(key = %key, error = %evict, "Could not evict unflushed write-behind record");
            }
            inner.stats.update(|s| s.failed_syncs += 1);
            return Err(e);
        }
        inner.stats.update(|s| {
            s.successful_syncs += 1;
            s.write_behind_queued += 1;
        });
        Ok((SyncOutcome::Queued, record))
    }

    /// Queue a mutation event for asynchronous handling
    ///
    /// Events whose first affected key (or kind and id) match are handled by the same
    /// worker, in publish order. With an event bus the event is also sent to other instances.
    ///
    /// # Errors
    ///
    /// `QueueFull` under backpressure, `Shutdown` after [`ConsistencyCoordinator::shutdown`].
    pub async fn publish_event(&self, event: UpdateEvent) -> Result<()> {
        self.enqueue_event(event.clone()).await?;
        self.broadcast(event).await;
        Ok(())
    }

    /// Queue an event for this instance only
    pub(crate) async fn enqueue_event(&self, event: UpdateEvent) -> Result<()> {
        let shard = shard_of(&event.shard_key());
        debug!(
            event_id = %event.id(),
            event_type = event.event_type().as_str(),
            kind = event.entity_kind(),
            id = event.entity_id(),
            "Publishing update event"
        );
        self.inner.stats.update(|s| {
            s.total_events += 1;
            s.pending_events += 1;
        });
        if let Err(e) = self.events.submit(shard, event).await {
            self.inner.stats.update(|s| {
                s.pending_events = s.pending_events.saturating_sub(1);
                s.failed_events += 1;
            });
            return Err(e);
        }
        Ok(())
    }

    /// Send `event` to other instances; a failed publish is only logged
    #[cfg(feature = "redis")]
    async fn broadcast(&self, event: UpdateEvent) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        if let Err(e) = publisher.publish(&event).await {
            warn!(event_id = %event.id(), error = %e, "Failed to broadcast update event");
        }
    }

    #[cfg(not(feature = "redis"))]
    async fn broadcast(&self, _event: UpdateEvent) {}

    /// Whether `id` was broadcast by this instance
    #[cfg(feature = "redis")]
    pub(crate) fn sent_here(&self, id: uuid::Uuid) -> bool {
        match &self.publisher {
            Some(publisher) => publisher.sent_event(id),
            None => false,
        }
    }

    /// Note a read of `key` so the refresher can keep it warm
    pub fn record_access(&self, key: &CacheKey, kind: &str, id: &str) {
        self.inner.track(key, kind, id, true, true);
    }

    /// Run one audit pass now and return its results
    pub async fn audit_once(&self) -> Vec<ConsistencyCheckResult> {
        self.inner.audit().await
    }

    /// Run one refresh-ahead pass now, returning how many keys were reloaded
    pub async fn refresh_once(&self) -> u64 {
        self.inner.refresh().await
    }

    /// Spawn the periodic auditor and refresher
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if they were already started, `Shutdown` after shutdown.
    pub fn start_background(&self) -> Result<()> {
        if self.events.is_shut_down() {
            return Err(CacheError::Shutdown(COMPONENT));
        }
        let mut background = self.background.lock();
        if !background.is_empty() {
            return Err(CacheError::AlreadyRunning("consistency background tasks"));
        }
        let config = &self.inner.config;

        let inner = Arc::clone(&self.inner);
        background.push(spawn_periodic(
            "consistency-audit",
            config.audit_interval,
            self.stop.clone(),
            move || {
                let inner = Arc::clone(&inner);
                async move {
                    inner.audit().await;
                }
            },
        ));
        let inner = Arc::clone(&self.inner);
        background.push(spawn_periodic(
            "refresh-ahead",
            config.refresh_interval,
            self.stop.clone(),
            move || {
                let inner = Arc::clone(&inner);
                async move {
                    inner.refresh().await;
                }
            },
        ));
        Ok(())
    }

    #[must_use]
    pub fn get_stats(&self) -> ConsistencyStats {
        self.inner.stats.snapshot()
    }

    /// Zero the counters; `pending_events` keeps tracking queued events
    pub fn reset_stats(&self) {
        self.inner.stats.reset();
        info!("[Consistency] Statistics reset");
    }

    /// Results of the most recent audit pass
    #[must_use]
    pub fn last_audit_results(&self) -> Vec<ConsistencyCheckResult> {
        self.inner.last_results.read().clone()
    }

    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.inner.tracked.len()
    }

    /// Write-behind jobs accepted but not yet picked up
    #[must_use]
    pub fn pending_flushes(&self) -> usize {
        self.flushes.queued()
    }

    #[must_use]
    pub fn strategy(&self) -> ConsistencyStrategy {
        self.inner.config.strategy
    }

    #[must_use]
    pub fn keys(&self) -> &KeyBuilder {
        &self.inner.keys
    }

    /// Stop the background tasks, then drain queued events and write-behind flushes
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let handles = std::mem::take(&mut *self.background.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Consistency background task ended abnormally");
            }
        }
        self.events.shutdown().await;
        self.flushes.shutdown().await;
        info!("Consistency coordinator shut down");
    }
}

impl Inner {
    fn ttl_for(&self, kind: &str) -> Duration {
        self.ttl_table.ttl_for(DataCategory::from_entity_kind(kind))
    }

    async fn write_source(&self, kind: &str, id: &str, changes: &Value) -> Result<Value> {
        self.source.write(kind, id, changes).await.map_err(|e| {
            error!(kind, id, error = %e, "Source write failed");
            self.stats.update(|s| s.failed_syncs += 1);
            CacheError::Source(e)
        })
    }

    /// Turn the cache step of a sync into its outcome
    fn settle(&self, key: &CacheKey, step: Result<()>, success: SyncOutcome) -> SyncOutcome {
        match step {
            Ok(()) => {
                self.stats.update(|s| s.successful_syncs += 1);
                success
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Source updated but cache is out of date");
                self.stats.update(|s| s.partial_failures += 1);
                SyncOutcome::PartialFailure {
                    warning: format!("source updated but cache step for '{key}' failed: {e}"),
                }
            }
        }
    }

    /// Cache `record` under `key`, or evict `key` when the entity no longer exists
    async fn cache_record(
        &self,
        store: &CacheStore,
        key: &CacheKey,
        kind: &str,
        id: &str,
        record: Option<&Value>,
    ) -> Result<()> {
        if let Some(record) = record {
            store.set(key, record, Some(self.ttl_for(kind))).await?;
            self.track(key, kind, id, false, false);
            if let Some(shield) = &self.shield {
                shield.register_existing(std::iter::once(key));
                shield.invalidate_null_marker(key).await;
            }
        } else {
            store.delete(key).await?;
            self.tracked.remove(key);
        }
        Ok(())
    }

    fn track(&self, key: &CacheKey, kind: &str, id: &str, refresh: bool, access: bool) {
        if let Some(mut entry) = self.tracked.get_mut(key) {
            entry.refresh |= refresh;
            if access {
                entry.accesses = entry.accesses.saturating_add(1);
            }
            return;
        }
        if self.tracked.len() >= self.config.max_tracked_keys {
            debug!(key = %key, "Tracked key limit reached, not tracking");
            return;
        }
        self.tracked.insert(
            key.clone(),
            TrackedKey {
                key: key.clone(),
                kind: kind.to_string(),
                id: id.to_string(),
                accesses: u32::from(access),
                refresh,
            },
        );
    }

    async fn handle_event(&self, event: UpdateEvent) {
        let result = self.apply_event(&event).await;
        self.stats.update(|s| {
            s.pending_events = s.pending_events.saturating_sub(1);
            match &result {
                Ok(true) => s.processed_events += 1,
                Ok(false) => {
                    s.processed_events += 1;
                    s.stale_events += 1;
                }
                Err(_) => s.failed_events += 1,
            }
        });
        if let Err(e) = result {
            error!(event_id = %event.id(), error = %e, "Failed to apply update event");
        }
    }

    /// Apply one event; `Ok(false)` when it was skipped as stale
    async fn apply_event(&self, event: &UpdateEvent) -> Result<bool> {
        let store = match &self.mode {
            CacheMode::Disabled => return Ok(true),
            CacheMode::Enabled(store) => store,
        };
        let targets = event.target_keys(&self.keys)?;
        if let Some(version) = event.version() {
            for key in &targets {
                if self.versions.get(key).await.is_some_and(|seen| seen >= version) {
                    debug!(event_id = %event.id(), version, "Skipping stale update event");
                    return Ok(false);
                }
            }
        }

        let (kind, id) = (event.entity_kind(), event.entity_id());
        match event.event_type() {
            EventType::Delete => {
                store.mdel(&targets).await?;
                for key in &targets {
                    self.tracked.remove(key);
                }
            }
            EventType::Create | EventType::Update
                if self.config.strategy == ConsistencyStrategy::CacheAside =>
            {
                store.mdel(&targets).await?;
                self.clear_null_markers(&targets).await;
            }
            EventType::Create | EventType::Update => {
                let record = if event.payload().is_null() {
                    self.source.load(kind, id).await.map_err(CacheError::Source)?
                } else {
                    Some(event.payload().clone())
                };
                if let Some(record) = record {
                    let entries: Vec<(CacheKey, Value)> = targets
                        .iter()
                        .map(|key| (key.clone(), record.clone()))
                        .collect();
                    store.mset(&entries, Some(self.ttl_for(kind))).await?;
                    for key in &targets {
                        self.track(key, kind, id, false, false);
                    }
                    if let Some(shield) = &self.shield {
                        shield.register_existing(&targets);
                    }
                    self.clear_null_markers(&targets).await;
                } else {
                    store.mdel(&targets).await?;
                }
            }
        }

        if let Some(version) = event.version() {
            // Deletes are remembered too, so a late older update cannot resurrect the entity
            for key in targets {
                self.versions.insert(key, version).await;
            }
        }
        debug!(
            event_id = %event.id(),
            event_type = event.event_type().as_str(),
            "Applied update event"
        );
        Ok(true)
    }

    async fn clear_null_markers(&self, keys: &[CacheKey]) {
        if let Some(shield) = &self.shield {
            for key in keys {
                shield.invalidate_null_marker(key).await;
            }
        }
    }

    async fn flush(&self, job: FlushJob) {
        let attempts = self.config.flush_max_attempts.max(1);
        let backoff = RetryPolicy {
            max_attempts: attempts,
            base_delay: self.config.flush_retry_base,
            max_delay: self.config.flush_retry_base.saturating_mul(32),
            jitter: true,
        };
        for attempt in 0..attempts {
            match self.source.write(&job.kind, &job.id, &job.changes).await {
                Ok(_) => {
                    debug!(key = %job.key, attempt, "Write-behind flush succeeded");
                    self.stats.update(|s| s.write_behind_flushed += 1);
                    return;
                }
                Err(e) if attempt + 1 < attempts => {
                    warn!(key = %job.key, attempt, error = %e, "Write-behind flush failed, retrying");
                    tokio::time::sleep(backoff.delay_for(attempt)).await;
                }
                Err(e) => {
                    error!(key = %job.key, attempts, error = %e, "Write-behind flush abandoned");
                    self.stats.update(|s| s.write_behind_failures += 1);
                }
            }
        }
    }

    fn sample_tracked(&self) -> Vec<TrackedKey> {
        let total = self.tracked.len();
        if total == 0 {
            return Vec::new();
        }
        let rate = self.config.audit_sample_rate.clamp(0.0, 1.0);
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let amount = ((total as f64 * rate).ceil() as usize).clamp(1, total);
        let mut rng = rand::thread_rng();
        self.tracked
            .iter()
            .map(|entry| entry.value().clone())
            .choose_multiple(&mut rng, amount)
    }

    async fn audit(&self) -> Vec<ConsistencyCheckResult> {
        let CacheMode::Enabled(store) = &self.mode else {
            return Vec::new();
        };
        let sample = self.sample_tracked();
        let mut results = Vec::with_capacity(sample.len());

        for tracked in sample {
            let cached = match store.get::<Value>(&tracked.key).await {
                Ok(cached) => cached,
                Err(e) => {
                    warn!(key = %tracked.key, error = %e, "Audit skipped key: cache read failed");
                    continue;
                }
            };
            let source = match self.source.load(&tracked.kind, &tracked.id).await {
                Ok(source) => source,
                Err(e) => {
                    warn!(key = %tracked.key, error = %e, "Audit skipped key: source read failed");
                    continue;
                }
            };

            let consistent = is_consistent(cached.as_ref(), source.as_ref());
            let mut resynced = false;
            if !consistent {
                warn!(key = %tracked.key, "Cached value diverged from source, resyncing");
                match self
                    .cache_record(store, &tracked.key, &tracked.kind, &tracked.id, source.as_ref())
                    .await
                {
                    Ok(()) => resynced = true,
                    Err(e) => warn!(key = %tracked.key, error = %e, "Resync failed"),
                }
            }
            self.stats.update(|s| {
                s.total_checks += 1;
                if consistent {
                    s.consistent_count += 1;
                } else {
                    s.inconsistent_count += 1;
                    if resynced {
                        s.resync_count += 1;
                    }
                }
            });
            results.push(ConsistencyCheckResult {
                key: tracked.key,
                entity_kind: tracked.kind,
                entity_id: tracked.id,
                is_consistent: consistent,
                resynced,
                checked_at: Utc::now(),
            });
        }

        let inconsistent = results.iter().filter(|r| !r.is_consistent).count();
        info!(checked = results.len(), inconsistent, "Consistency audit finished");
        self.stats.update(|s| s.last_audit = Some(Utc::now()));
        *self.last_results.write() = results.clone();
        results
    }

    async fn refresh(&self) -> u64 {
        let CacheMode::Enabled(store) = &self.mode else {
            return 0;
        };
        let min_accesses = self.config.refresh_min_accesses;
        let candidates: Vec<TrackedKey> = self
            .tracked
            .iter_mut()
            .filter_map(|mut entry| {
                let hot = entry.refresh && entry.accesses >= min_accesses;
                entry.accesses = 0;
                hot.then(|| entry.value().clone())
            })
            .collect();

        let mut refreshed = 0u64;
        for tracked in candidates {
            let remaining = match store.ttl(&tracked.key).await {
                Ok(KeyTtl::Expires(remaining)) => remaining,
                Ok(KeyTtl::Missing | KeyTtl::Persistent) => continue,
                Err(e) => {
                    warn!(key = %tracked.key, error = %e, "Refresh skipped key: TTL unavailable");
                    continue;
                }
            };
            let full = self.ttl_for(&tracked.kind);
            if remaining.as_secs_f64() >= full.as_secs_f64() * self.config.refresh_threshold {
                continue;
            }
            let record = match self.source.load(&tracked.kind, &tracked.id).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(key = %tracked.key, error = %e, "Refresh skipped key: source read failed");
                    continue;
                }
            };
            match self
                .cache_record(store, &tracked.key, &tracked.kind, &tracked.id, record.as_ref())
                .await
            {
                Ok(()) => {
                    debug!(key = %tracked.key, remaining_ms = remaining.as_millis(), "Refreshed ahead of expiry");
                    refreshed += 1;
                }
                Err(e) => warn!(key = %tracked.key, error = %e, "Refresh write failed"),
            }
        }
        if refreshed > 0 {
            self.stats.update(|s| s.refreshes += refreshed);
            info!(refreshed, "Refresh-ahead pass finished");
        }
        refreshed
    }
}
