//! Common utilities for integration tests
//!
//! This module provides shared test infrastructure including:
//! - Unique namespaces so tests never share keys
//! - An in-memory system of record and warmup catalog
//! - Polling helpers for background work

#![allow(dead_code)]

use chrono::Utc;
use dashmap::DashMap;
use resilient_cache::consistency::merge_changes;
use resilient_cache::warmup::EntityMetrics;
use resilient_cache::{
    CacheSystem, CacheSystemBuilder, DataSource, MemoryStore, ResilienceConfig, WarmupSource,
    WarmupStrategy, async_trait,
};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Unique namespace for one test
pub fn test_namespace(name: &str) -> String {
    format!("test_{}_{}", name, rand::random::<u32>())
}

/// Build a system over a fresh in-memory store
pub async fn memory_system(
    name: &str,
    source: Option<Arc<RecordStore>>,
    configure: impl FnOnce(&mut ResilienceConfig),
) -> (CacheSystem, Arc<MemoryStore>) {
    let backend = Arc::new(MemoryStore::new());
    let mut builder = CacheSystemBuilder::new()
        .namespace(test_namespace(name))
        .with_store(backend.clone())
        .configure(configure);
    if let Some(source) = source {
        builder = builder.with_data_source(source);
    }
    let system = builder.build().await.unwrap_or_else(|e| panic!("{e}"));
    (system, backend)
}

/// Poll `check` every 10ms until it holds or `timeout` passes
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// In-memory system of record keyed by `(kind, id)`
#[derive(Default)]
pub struct RecordStore {
    records: DashMap<(String, String), Value>,
    pub loads: AtomicU64,
    pub writes: AtomicU64,
    failing_writes: AtomicBool,
}

impl RecordStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, kind: &str, id: &str, record: Value) {
        self.records
            .insert((kind.to_string(), id.to_string()), record);
    }

    pub fn record(&self, kind: &str, id: &str) -> Option<Value> {
        self.records
            .get(&(kind.to_string(), id.to_string()))
            .map(|r| r.value().clone())
    }

    pub fn fail_writes(&self, failing: bool) {
        self.failing_writes.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataSource for RecordStore {
    async fn load(&self, kind: &str, id: &str) -> anyhow::Result<Option<Value>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.record(kind, id))
    }

    async fn write(&self, kind: &str, id: &str, changes: &Value) -> anyhow::Result<Value> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.failing_writes.load(Ordering::SeqCst) {
            anyhow::bail!("database is read-only");
        }
        let mut entry = self
            .records
            .entry((kind.to_string(), id.to_string()))
            .or_insert_with(|| json!({}));
        merge_changes(entry.value_mut(), changes);
        Ok(entry.value().clone())
    }
}

/// Warmup catalog with a fixed candidate list per strategy
#[derive(Default)]
pub struct Catalog {
    pub products: Vec<EntityMetrics>,
    pub broken: HashSet<String>,
    pub loads: AtomicU64,
}

impl Catalog {
    /// `total` products; the first `hot` of them sold 150 units, the rest 20
    pub fn products(total: usize, hot: usize) -> Self {
        let products = (0..total)
            .map(|i| EntityMetrics {
                id: format!("p{i}"),
                sales: if i < hot { 150 } else { 20 },
                views: 0,
                rating: 0.0,
                last_active: Utc::now(),
            })
            .collect();
        Self {
            products,
            ..Self::default()
        }
    }
}

#[async_trait]
impl WarmupSource for Catalog {
    async fn candidates(&self, strategy: WarmupStrategy) -> anyhow::Result<Vec<EntityMetrics>> {
        match strategy {
            WarmupStrategy::HotProducts => Ok(self.products.clone()),
            _ => Ok(Vec::new()),
        }
    }

    async fn load(&self, _strategy: WarmupStrategy, id: &str) -> anyhow::Result<Option<Value>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.broken.contains(id) {
            anyhow::bail!("product {id} failed to load");
        }
        Ok(Some(json!({ "id": id, "name": format!("Product {id}") })))
    }
}
