//! Resilience Tour
//!
//! Walks through every component over the in-memory store: protected reads,
//! write-through syncs, update events, hot-product warmup and the monitor report.
//!
//! Run with: cargo run --example resilience_tour
//! More detail: RUST_LOG=resilient_cache=debug cargo run --example resilience_tour

use chrono::Utc;
use dashmap::DashMap;
use resilient_cache::consistency::merge_changes;
use resilient_cache::warmup::EntityMetrics;
use resilient_cache::{
    CacheSystemBuilder, DataSource, EventType, MemoryStore, UpdateEvent, WarmupSource,
    WarmupStrategy, async_trait,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Stand-in for the real database
#[derive(Default)]
struct Database {
    products: DashMap<String, Value>,
}

impl Database {
    fn seeded() -> Arc<Self> {
        let db = Self::default();
        for i in 0..100u32 {
            db.products.insert(
                i.to_string(),
                json!({ "id": i, "name": format!("Product {i}"), "price": 1000 + i }),
            );
        }
        Arc::new(db)
    }
}

#[async_trait]
impl DataSource for Database {
    async fn load(&self, _kind: &str, id: &str) -> anyhow::Result<Option<Value>> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(self.products.get(id).map(|p| p.value().clone()))
    }

    async fn write(&self, _kind: &str, id: &str, changes: &Value) -> anyhow::Result<Value> {
        let mut entry = self.products.entry(id.to_string()).or_insert_with(|| json!({}));
        merge_changes(entry.value_mut(), changes);
        Ok(entry.value().clone())
    }
}

#[async_trait]
impl WarmupSource for Database {
    async fn candidates(&self, strategy: WarmupStrategy) -> anyhow::Result<Vec<EntityMetrics>> {
        if strategy != WarmupStrategy::HotProducts {
            return Ok(Vec::new());
        }
        Ok(self
            .products
            .iter()
            .map(|p| {
                let id: u64 = p.key().parse().unwrap_or(0);
                EntityMetrics {
                    id: p.key().clone(),
                    sales: if id < 10 { 500 } else { 5 },
                    views: if id < 10 { 5000 } else { 50 },
                    rating: 4.5,
                    last_active: Utc::now(),
                }
            })
            .collect())
    }

    async fn load(&self, _strategy: WarmupStrategy, id: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.products.get(id).map(|p| p.value().clone()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("resilient_cache=info")))
        .init();

    println!("=== Resilient Cache: Tour ===\n");

    let db = Database::seeded();
    let system = Arc::new(
        CacheSystemBuilder::new()
            .namespace("tour")
            .with_store(Arc::new(MemoryStore::new()))
            .with_data_source(db.clone())
            .with_warmup_source(db.clone())
            .build()
            .await?,
    );
    system.start()?;

    // 1. Protected reads: 20 concurrent callers, one database load
    println!("1. Twenty concurrent reads of a cold product...");
    let mut handles = Vec::new();
    for _ in 0..20 {
        let system = Arc::clone(&system);
        let db = Arc::clone(&db);
        handles.push(tokio::spawn(async move {
            let product: Option<Value> = system
                .get_entity("product", 42, || async move { DataSource::load(&*db, "product", "42").await })
                .await?;
            resilient_cache::Result::Ok(product)
        }));
    }
    for handle in handles {
        handle.await??;
    }
    let stats = system.shield().get_stats();
    println!(
        "   requests: {}, loader calls: {}, collapsed: {}\n",
        stats.total_requests, stats.loader_calls, stats.blocked_breakdowns
    );

    // 2. Absent entities are answered without touching the database again
    println!("2. Reading a product that does not exist, three times...");
    for _ in 0..3 {
        let missing: Option<Value> = system
            .get_entity("product", "ghost", || async { DataSource::load(&*db, "product", "ghost").await })
            .await?;
        println!("   -> {missing:?}");
    }
    println!("   null marker hits: {}\n", system.shield().get_stats().null_marker_hits);

    // 3. Write-through sync
    if let Some(coordinator) = system.consistency() {
        println!("3. Changing the price of product 42 (write-through)...");
        let key = system.keys().entity("product", 42)?;
        let outcome = coordinator
            .sync_cache(&key, "product", "42", &json!({ "price": 899 }))
            .await?;
        println!("   outcome: {outcome:?}");

        // 4. Update events are applied in order
        println!("4. Publishing an update event for product 7...");
        let key7 = system.keys().entity("product", 7)?;
        coordinator
            .publish_event(UpdateEvent::new(
                EventType::Update,
                "product",
                "7",
                json!({ "id": 7, "name": "Product 7", "price": 1 }),
                vec![key7],
            ))
            .await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = coordinator.get_stats();
        println!(
            "   events processed: {}, successful syncs: {}\n",
            stats.processed_events, stats.successful_syncs
        );
    }

    // 5. Warm the hot products
    if let Some(warmup) = system.warmup() {
        println!("5. Warming hot products...");
        let progress = warmup.warmup_strategy(WarmupStrategy::HotProducts).await?;
        println!(
            "   warmed {}/{} ({:.0}%) in {:?}\n",
            progress.completed, progress.total, progress.rate, progress.elapsed
        );
    }

    // 6. Monitor report
    println!("6. Performance report");
    system.monitor().collect_now();
    let report = system.monitor().generate_performance_report(Duration::from_secs(600));
    let window = &report.current.window;
    println!(
        "   reads: {}, hit rate: {:.2}, p99: {:?}",
        window.requests,
        window.hit_rate.unwrap_or(0.0),
        window.p99_latency
    );
    for key in report.current.hot_keys.iter().take(3) {
        println!("   hot key {} ({} accesses)", key.key, key.accesses);
    }
    for recommendation in &report.recommendations {
        println!("   recommendation: {recommendation}");
    }
    println!("   active alerts: {}", report.active_alerts.len());

    system.shutdown().await;
    println!("\n=== Tour complete ===");
    Ok(())
}
