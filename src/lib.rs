//! Resilient Cache
//!
//! A cache resilience and coherence layer that sits between a request-serving
//! application and a slower system of record:
//! - **Protection Shield**: existence filter, null markers, per-key load collapsing with
//!   a fenced lease lock, jittered TTLs and a circuit breaker around the loader
//! - **Consistency Coordinator**: write-through, write-behind, cache-aside and
//!   refresh-ahead syncs, an ordered event pipeline and a self-repairing auditor
//! - **Warmup Orchestrator**: scores entities and pre-loads the hot ones in bounded batches
//! - **Observability Plane**: rolling latency and hit-rate windows, hot keys, alerts
//!   with cool-down, and performance reports
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use resilient_cache::CacheSystemBuilder;
//!
//! #[tokio::main]
//! async fn main() -> resilient_cache::Result<()> {
//!     let system = CacheSystemBuilder::from_env().namespace("shop").build().await?;
//!
//!     // Miss → loader → cached with a jittered TTL; later calls are hits
//!     let product: Option<serde_json::Value> = system
//!         .get_entity("product", 42, || async {
//!             Ok(Some(serde_json::json!({"name": "lamp", "price": 1999})))
//!         })
//!         .await?;
//!
//!     let stats = system.shield().get_stats();
//!     tracing::info!(hits = stats.cache_hits, "Protected reads so far");
//!
//!     system.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! Request → Protection Shield → Cache Store ─ hit → Return
//!              │ miss
//!              ├─ filter / null marker → Ok(None)
//!              ├─ lock (collapse) → breaker → Loader → cache with jittered TTL
//!
//! Writes / events → Consistency Coordinator → Source + Cache Store
//! Timer → Warmup Orchestrator → Cache Store
//! Timer → Cache Monitor ← samples from the Cache Store, stats from every component
//! ```

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod backends;
pub mod builder;
pub mod codecs;
pub mod config;
pub mod consistency;
pub mod error;
pub mod keys;
pub mod monitor;
pub mod pool;
pub mod retry;
pub mod shield;
pub mod store;
pub mod traits;
pub mod warmup;

pub use backends::MemoryStore;
#[cfg(feature = "redis")]
pub use backends::RedisStore;
pub use builder::CacheSystemBuilder;
pub use codecs::Codec;
pub use config::ResilienceConfig;
pub use consistency::{
    ConsistencyConfig, ConsistencyCoordinator, ConsistencyStats, ConsistencyStrategy,
    DataSource, EventType, SyncOutcome, UpdateEvent,
};
pub use error::{CacheError, Result};
pub use keys::{CacheKey, DataCategory, KeyBuilder, TtlTable};
pub use monitor::{
    Alert, AlertLevel, AlertRule, CacheMonitor, MonitorConfig, MonitoringData,
    PerformanceReport,
};
pub use pool::BackpressurePolicy;
pub use retry::RetryPolicy;
pub use shield::{CircuitState, ProtectionMetrics, ProtectionShield, ShieldConfig};
pub use store::{CacheMode, CacheStore, StoreConfig, StoreStats};
pub use traits::{CacheCodec, KeyTtl, KvStore, PoolStats};
pub use warmup::{
    WarmupConfig, WarmupOrchestrator, WarmupProgress, WarmupSource, WarmupStats,
    WarmupStrategy,
};

// Re-export async_trait for implementors of the source and store traits
pub use async_trait::async_trait;

/// Main entry point: every component, constructed once and handed out by reference
///
/// Build with [`CacheSystemBuilder`]. The consistency coordinator and the warmup
/// orchestrator are `None` unless their sources were supplied to the builder.
pub struct CacheSystem {
    pub(crate) keys: KeyBuilder,
    pub(crate) mode: CacheMode,
    pub(crate) ttl_table: Arc<TtlTable>,
    pub(crate) shield: Arc<ProtectionShield>,
    pub(crate) consistency: Option<Arc<ConsistencyCoordinator>>,
    pub(crate) warmup: Option<Arc<WarmupOrchestrator>>,
    pub(crate) monitor: Arc<CacheMonitor>,
    #[cfg(feature = "redis")]
    pub(crate) subscriber: Option<Arc<consistency::EventSubscriber>>,
    pub(crate) config: ResilienceConfig,
    pub(crate) background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl CacheSystem {
    /// Start every background task: auditor, refresher, monitor timers, the warmup
    /// scheduler when `warmup_interval` is set, and the event subscriber when an event
    /// bus is configured
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if called twice, `Shutdown` after [`CacheSystem::shutdown`].
    pub fn start(&self) -> Result<()> {
        if let Some(coordinator) = &self.consistency {
            coordinator.start_background()?;
        }
        self.monitor.start()?;
        if let (Some(warmup), Some(period)) = (&self.warmup, self.config.warmup_period()) {
            warmup.start_scheduler(period)?;
        }
        #[cfg(feature = "redis")]
        if let (Some(subscriber), Some(coordinator)) = (&self.subscriber, &self.consistency) {
            self.background
                .lock()
                .push(subscriber.start(Arc::clone(coordinator)));
        }
        info!(namespace = self.keys.namespace(), "Cache system started");
        Ok(())
    }

    /// Read an entity through the protection shield, noting the access for refresh-ahead
    ///
    /// # Errors
    ///
    /// `MalformedKey` if `kind` or `id` is not a valid key segment, otherwise see
    /// [`ProtectionShield::protected_get`].
    pub async fn get_entity<T, F, Fut>(
        &self,
        kind: &str,
        id: impl Display,
        loader: F,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send,
    {
        let id = id.to_string();
        let key = self.keys.entity(kind, &id)?;
        if let Some(coordinator) = &self.consistency {
            coordinator.record_access(&key, kind, &id);
        }
        self.shield.protected_get(&key, loader).await
    }

    /// `true` when the store answers, or when running without one
    pub async fn health_check(&self) -> bool {
        match &self.mode {
            CacheMode::Disabled => true,
            CacheMode::Enabled(store) => {
                let healthy = store.health_check().await;
                if !healthy {
                    warn!(backend = store.backend_name(), "Cache store health check failed");
                }
                healthy
            }
        }
    }

    /// Reset the statistics of every component
    pub fn reset_all_stats(&self) {
        self.shield.reset_stats();
        if let Some(coordinator) = &self.consistency {
            coordinator.reset_stats();
        }
        if let Some(warmup) = &self.warmup {
            warmup.reset_stats();
        }
        self.monitor.reset_stats();
    }

    /// Stop background work and drain queued events and write-behind flushes
    pub async fn shutdown(&self) {
        #[cfg(feature = "redis")]
        if let Some(subscriber) = &self.subscriber {
            subscriber.shutdown();
        }
        let handles = std::mem::take(&mut *self.background.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        if let Some(warmup) = &self.warmup {
            warmup.shutdown().await;
        }
        if let Some(coordinator) = &self.consistency {
            coordinator.shutdown().await;
        }
        self.monitor.shutdown().await;
        info!("Cache system shut down");
    }

    #[must_use]
    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    #[must_use]
    pub fn mode(&self) -> &CacheMode {
        &self.mode
    }

    /// Store handle, `None` when the cache is disabled
    #[must_use]
    pub fn store(&self) -> Option<&CacheStore> {
        self.mode.store()
    }

    #[must_use]
    pub fn ttl_table(&self) -> &Arc<TtlTable> {
        &self.ttl_table
    }

    #[must_use]
    pub fn shield(&self) -> &Arc<ProtectionShield> {
        &self.shield
    }

    #[must_use]
    pub fn consistency(&self) -> Option<&Arc<ConsistencyCoordinator>> {
        self.consistency.as_ref()
    }

    #[must_use]
    pub fn warmup(&self) -> Option<&Arc<WarmupOrchestrator>> {
        self.warmup.as_ref()
    }

    #[must_use]
    pub fn monitor(&self) -> &Arc<CacheMonitor> {
        &self.monitor
    }

    #[must_use]
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }
}
