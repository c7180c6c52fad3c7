//! Cache System Builder
//!
//! Constructs every component of a [`CacheSystem`] exactly once and wires them together.
//!
//! # Example: In-Memory Store
//!
//! ```rust,no_run
//! use resilient_cache::CacheSystemBuilder;
//!
//! #[tokio::main]
//! async fn main() -> resilient_cache::Result<()> {
//!     let system = CacheSystemBuilder::new()
//!         .namespace("shop")
//!         .build()
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! # Example: Custom Store and System of Record
//!
//! ```rust,ignore
//! use resilient_cache::CacheSystemBuilder;
//! use std::sync::Arc;
//!
//! let system = CacheSystemBuilder::from_env()
//!     .with_store(Arc::new(MyStore::new()))
//!     .with_data_source(Arc::new(MyDatabase::new()))
//!     .build()
//!     .await?;
//! ```

use crate::backends::MemoryStore;
use crate::config::ResilienceConfig;
use crate::consistency::{ConsistencyCoordinator, ConsistencyStrategy, DataSource};
use crate::error::Result;
use crate::keys::KeyBuilder;
use crate::monitor::{CacheMonitor, MonitoredComponents};
use crate::shield::ProtectionShield;
use crate::store::{CacheMode, CacheStore};
use crate::traits::KvStore;
use crate::warmup::{WarmupOrchestrator, WarmupSource};
use crate::CacheSystem;
use std::sync::Arc;
use tracing::info;

/// Builder for [`CacheSystem`]
///
/// # Default Behavior
///
/// With no store configured, the builder connects to Redis when `redis_url` is set
/// (feature `redis`) and otherwise uses an in-process [`MemoryStore`]. The consistency
/// coordinator exists only when a [`DataSource`] is supplied, and the warmup
/// orchestrator only when a [`WarmupSource`] is.
pub struct CacheSystemBuilder {
    config: ResilienceConfig,
    store: Option<Arc<dyn KvStore>>,
    data_source: Option<Arc<dyn DataSource>>,
    warmup_source: Option<Arc<dyn WarmupSource>>,
}

impl CacheSystemBuilder {
    /// Builder with default configuration; the environment is not consulted
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ResilienceConfig::default())
    }

    /// Builder seeded from `REDIS_URL` and `CACHE_NAMESPACE`
    #[must_use]
    pub fn from_env() -> Self {
        Self::with_config(ResilienceConfig::from_env())
    }

    #[must_use]
    pub fn with_config(config: ResilienceConfig) -> Self {
        Self {
            config,
            store: None,
            data_source: None,
            warmup_source: None,
        }
    }

    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Use a specific key-value store instead of the default one
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use resilient_cache::CacheSystemBuilder;
    /// use resilient_cache::backends::MemoryStore;
    /// use std::sync::Arc;
    ///
    /// # async fn example() -> resilient_cache::Result<()> {
    /// let system = CacheSystemBuilder::new()
    ///     .with_store(Arc::new(MemoryStore::new()))
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_data_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.data_source = Some(source);
        self
    }

    #[must_use]
    pub fn with_warmup_source(mut self, source: Arc<dyn WarmupSource>) -> Self {
        self.warmup_source = Some(source);
        self
    }

    /// Run with no cache store: reads go to the loader, syncs go to the source only
    #[must_use]
    pub fn disable_cache(mut self) -> Self {
        self.config.cache_enabled = false;
        self
    }

    #[must_use]
    pub fn consistency_strategy(mut self, strategy: ConsistencyStrategy) -> Self {
        self.config.consistency.strategy = strategy;
        self
    }

    /// Adjust any part of the configuration in place
    #[must_use]
    pub fn configure(mut self, f: impl FnOnce(&mut ResilienceConfig)) -> Self {
        f(&mut self.config);
        self
    }

    /// Build the system; background tasks stay stopped until [`CacheSystem::start`]
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - `MalformedKey` if the namespace is not a valid key segment
    /// - `StoreUnavailable` if the Redis store or event bus cannot be reached
    /// - `Config` if `redis_url` is set without the `redis` feature
    pub async fn build(self) -> Result<CacheSystem> {
        let Self {
            config,
            store,
            data_source,
            warmup_source,
        } = self;
        info!(namespace = %config.namespace, cache_enabled = config.cache_enabled, "Building cache system");

        let keys = KeyBuilder::new(config.namespace.clone())?;
        let mode = if config.cache_enabled {
            let backend = match store {
                Some(backend) => backend,
                None => Self::default_store(&config).await?,
            };
            info!(backend = backend.name(), "Using cache store");
            CacheMode::Enabled(CacheStore::new(backend, &config.store))
        } else {
            CacheMode::Disabled
        };
        let ttl_table = Arc::new(config.ttl_table());

        let shield = Arc::new(ProtectionShield::new(
            mode.clone(),
            keys.clone(),
            Arc::clone(&ttl_table),
            config.shield.clone(),
        ));
        #[cfg(feature = "redis")]
        let publisher = match (&config.event_bus, &config.redis_url, &data_source) {
            (Some(bus), Some(url), Some(_)) => Some(Arc::new(Self::event_publisher(url, bus).await?)),
            _ => None,
        };
        let consistency = data_source.map(|source| {
            let coordinator = ConsistencyCoordinator::new(
                mode.clone(),
                keys.clone(),
                source,
                Arc::clone(&ttl_table),
                Some(Arc::clone(&shield)),
                config.consistency.clone(),
            );
            #[cfg(feature = "redis")]
            let coordinator = match publisher {
                Some(publisher) => coordinator.with_publisher(publisher),
                None => coordinator,
            };
            Arc::new(coordinator)
        });
        let warmup = warmup_source.map(|source| {
            Arc::new(WarmupOrchestrator::new(
                mode.clone(),
                keys.clone(),
                source,
                Arc::clone(&ttl_table),
                Some(Arc::clone(&shield)),
                config.warmup.clone(),
            ))
        });
        let monitor = Arc::new(CacheMonitor::new(
            &mode,
            MonitoredComponents {
                shield: Some(Arc::clone(&shield)),
                consistency: consistency.clone(),
                warmup: warmup.clone(),
            },
            config.monitor.clone(),
        ));

        #[cfg(feature = "redis")]
        let subscriber = match (&config.event_bus, &config.redis_url, &consistency) {
            (Some(bus), Some(url), Some(_)) => Some(Arc::new(
                crate::consistency::EventSubscriber::new(url, bus.clone())?,
            )),
            _ => None,
        };

        info!(
            consistency = consistency.is_some(),
            warmup = warmup.is_some(),
            "Cache system built"
        );
        Ok(CacheSystem {
            keys,
            mode,
            ttl_table,
            shield,
            consistency,
            warmup,
            monitor,
            #[cfg(feature = "redis")]
            subscriber,
            config,
            background: parking_lot::Mutex::new(Vec::new()),
        })
    }

    #[cfg(feature = "redis")]
    async fn event_publisher(
        url: &str,
        bus: &crate::consistency::EventBusConfig,
    ) -> Result<crate::consistency::EventPublisher> {
        let client = redis::Client::open(url)?;
        let connection = redis::aio::ConnectionManager::new(client).await?;
        info!(channel = %bus.channel, "Broadcasting update events");
        Ok(crate::consistency::EventPublisher::new(connection, bus.clone()))
    }

    #[cfg(feature = "redis")]
    async fn default_store(config: &ResilienceConfig) -> Result<Arc<dyn KvStore>> {
        match &config.redis_url {
            Some(url) => Ok(Arc::new(
                crate::backends::RedisStore::with_url(url, config.redis_max_connections).await?,
            )),
            None => Ok(Arc::new(MemoryStore::new())),
        }
    }

    #[cfg(not(feature = "redis"))]
    async fn default_store(config: &ResilienceConfig) -> Result<Arc<dyn KvStore>> {
        match &config.redis_url {
            Some(_) => Err(crate::error::CacheError::Config(
                "redis_url is set but the `redis` feature is disabled".to_string(),
            )),
            None => Ok(Arc::new(MemoryStore::new())),
        }
    }
}

impl Default for CacheSystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}
