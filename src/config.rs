//! Aggregated configuration for a [`CacheSystem`](crate::CacheSystem).
//!
//! Every component keeps its own config struct with a `Default`; [`ResilienceConfig`]
//! gathers them so a deployment can load one document (any serde format) and override
//! the connection details from the environment.

#[cfg(feature = "redis")]
use crate::consistency::EventBusConfig;
use crate::consistency::ConsistencyConfig;
use crate::keys::{DEFAULT_TTL, DataCategory, TtlTable};
use crate::monitor::MonitorConfig;
use crate::shield::ShieldConfig;
use crate::store::StoreConfig;
use crate::warmup::WarmupConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Namespace used when neither the config nor `CACHE_NAMESPACE` sets one
pub const DEFAULT_NAMESPACE: &str = "cache";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Prefix of every key this system writes
    pub namespace: String,
    /// Redis connection string; `None` selects the in-memory store
    pub redis_url: Option<String>,
    pub redis_max_connections: u32,
    /// Store-less mode: every read goes to the loader
    pub cache_enabled: bool,
    /// TTL for categories with no built-in default
    pub default_ttl: Duration,
    pub ttl_overrides: HashMap<DataCategory, Duration>,
    pub store: StoreConfig,
    pub shield: ShieldConfig,
    pub consistency: ConsistencyConfig,
    pub warmup: WarmupConfig,
    /// Period of scheduled warmups; `None` leaves warmup to explicit calls
    pub warmup_interval: Option<Duration>,
    pub monitor: MonitorConfig,
    /// Cross-instance event bus; `None` keeps events local
    #[cfg(feature = "redis")]
    pub event_bus: Option<EventBusConfig>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            redis_url: None,
            redis_max_connections: 64,
            cache_enabled: true,
            default_ttl: DEFAULT_TTL,
            ttl_overrides: HashMap::new(),
            store: StoreConfig::default(),
            shield: ShieldConfig::default(),
            consistency: ConsistencyConfig::default(),
            warmup: WarmupConfig::default(),
            warmup_interval: None,
            monitor: MonitorConfig::default(),
            #[cfg(feature = "redis")]
            event_bus: None,
        }
    }
}

impl ResilienceConfig {
    /// Defaults with `REDIS_URL` and `CACHE_NAMESPACE` applied
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env(|name| std::env::var(name).ok())
    }

    /// Apply environment overrides read through `lookup`
    #[must_use]
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup("REDIS_URL").filter(|v| !v.trim().is_empty()) {
            self.redis_url = Some(url);
        }
        if let Some(namespace) = lookup("CACHE_NAMESPACE").filter(|v| !v.trim().is_empty()) {
            self.namespace = namespace;
        }
        self
    }

    /// TTL table seeded with the configured overrides
    #[must_use]
    pub fn ttl_table(&self) -> TtlTable {
        TtlTable::with_overrides(self.default_ttl, self.ttl_overrides.clone())
    }

    /// Scheduled warmup period, if any, with a one-second floor
    #[must_use]
    pub fn warmup_period(&self) -> Option<Duration> {
        self.warmup_interval.map(|p| p.max(Duration::from_secs(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_overrides_defaults() {
        let config = ResilienceConfig::default().with_env(|name| match name {
            "REDIS_URL" => Some("redis://cache:6379".to_string()),
            "CACHE_NAMESPACE" => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
    }

    #[test]
    fn partial_documents_fill_in_defaults() {
        let config: ResilienceConfig =
            serde_json::from_str(r#"{"namespace":"shop","cache_enabled":false}"#)
                .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(config.namespace, "shop");
        assert!(!config.cache_enabled);
        assert_eq!(config.consistency.event_workers, 4);

        let ttl = config.ttl_table();
        assert_eq!(ttl.ttl_for(DataCategory::Other), DEFAULT_TTL);
    }
}
