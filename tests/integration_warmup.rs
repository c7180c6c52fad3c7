//! Integration tests for the warmup orchestrator
//!
//! Tests cover:
//! - Hot-product selection, batching and progress
//! - Partial failure within a batch
//! - Scheduled warmups and cancellation

mod common;

use common::*;
use resilient_cache::warmup::{HotDataConfig, TaskStatus};
use resilient_cache::{CacheSystem, CacheSystemBuilder, MemoryStore, WarmupStrategy};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Only sales matter: views, rating and recency thresholds are all zero
fn sales_only() -> HotDataConfig {
    HotDataConfig {
        min_sales: 100,
        min_views: 0,
        min_rating: 0.0,
        recency_window: Duration::from_secs(365 * 24 * 3600),
        ..HotDataConfig::default()
    }
}

async fn warmup_system(name: &str, catalog: Arc<Catalog>) -> CacheSystem {
    CacheSystemBuilder::new()
        .namespace(test_namespace(name))
        .with_store(Arc::new(MemoryStore::new()))
        .with_warmup_source(catalog)
        .configure(|config| {
            config.warmup.hot = sales_only();
            config.warmup.batch_size = 10;
        })
        .build()
        .await
        .unwrap_or_else(|e| panic!("{e}"))
}

#[tokio::test]
async fn hot_products_are_warmed_in_batches() {
    let catalog = Arc::new(Catalog::products(500, 50));
    let system = warmup_system("hot_products", catalog.clone()).await;
    let warmup = system.warmup().cloned().unwrap_or_else(|| panic!("warmup source supplied"));

    let progress = warmup
        .warmup_strategy(WarmupStrategy::HotProducts)
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(progress.total, 50);
    assert_eq!(progress.completed, 50);
    assert_eq!(progress.failed, 0);
    assert!((progress.rate - 100.0).abs() < f64::EPSILON);
    assert_eq!(catalog.loads.load(Ordering::SeqCst), 50);

    let stats = warmup.get_stats();
    assert_eq!(stats.total_tasks, 50);
    assert_eq!(stats.completed_tasks, 50);
    assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);
    assert_eq!(stats.candidates_seen, 500);
    assert_eq!(stats.hot_entities, 50);
    // 100% success over a 10% hot fraction
    assert!((stats.estimated_hit_rate_improvement - 10.0).abs() < 1e-9);

    let store = system.store().cloned().unwrap_or_else(|| panic!("cache enabled"));
    let hot = system.keys().entity("product", "p0").unwrap_or_else(|e| panic!("{e}"));
    let cold = system.keys().entity("product", "p100").unwrap_or_else(|e| panic!("{e}"));
    let warmed: Option<Value> = store.get(&hot).await.unwrap_or_else(|e| panic!("{e}"));
    assert!(warmed.is_some());
    assert!(!store.exists(&cold).await.unwrap_or_else(|e| panic!("{e}")));

    let tasks = warmup.last_run_tasks();
    assert_eq!(tasks.len(), 50);
    assert!(tasks.iter().all(|t| t.status() == TaskStatus::Completed));
}

#[tokio::test]
async fn failures_are_counted_and_the_rest_complete() {
    let mut catalog = Catalog::products(30, 20);
    catalog.broken = ["p3", "p11"].into_iter().map(str::to_string).collect();
    let system = warmup_system("partial", Arc::new(catalog)).await;
    let warmup = system.warmup().cloned().unwrap_or_else(|| panic!("warmup source supplied"));

    let progress = warmup
        .warmup_all()
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(progress.total, 20);
    assert_eq!(progress.completed, 18);
    assert_eq!(progress.failed, 2);

    let stats = warmup.get_stats();
    assert!((stats.success_rate - 0.9).abs() < 1e-9);
    assert_eq!(stats.total_items_warmed, 18);

    warmup.reset_stats();
    let reset = warmup.get_stats();
    assert_eq!(reset.total_tasks, 0);
    assert_eq!(reset.failed_tasks, 0);
}

#[tokio::test]
async fn scheduled_warmups_run_on_their_interval() {
    let catalog = Arc::new(Catalog::products(20, 5));
    let system = warmup_system("scheduled", catalog.clone()).await;
    let warmup = system.warmup().cloned().unwrap_or_else(|| panic!("warmup source supplied"));

    warmup
        .start_scheduler(Duration::from_millis(50))
        .unwrap_or_else(|e| panic!("{e}"));
    assert!(matches!(
        warmup.start_scheduler(Duration::from_millis(50)),
        Err(resilient_cache::CacheError::AlreadyRunning(_))
    ));

    let ran_twice = wait_for(Duration::from_secs(3), || {
        let warmup = Arc::clone(&warmup);
        async move { warmup.get_stats().runs >= 2 }
    })
    .await;
    assert!(ran_twice);
    system.shutdown().await;
    assert!(!warmup.is_running());
}
