//! Integration tests for the consistency coordinator
//!
//! Tests cover:
//! - Write-through, write-behind and cache-aside syncs
//! - Ordered event handling (update, delete, reload on empty payload)
//! - Audit drift detection and resync
//! - Refresh-ahead of hot keys
//! - Draining shutdown

mod common;

use common::*;
use resilient_cache::{ConsistencyStrategy, EventType, SyncOutcome, UpdateEvent};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn write_through_is_visible_immediately() {
    let source = RecordStore::new();
    source.insert("product", "1", json!({"name": "lamp", "price": 1999}));
    let (system, _) = memory_system("write_through", Some(source.clone()), |_| {}).await;
    let coordinator = system.consistency().cloned().unwrap_or_else(|| panic!("source supplied"));
    let store = system.store().cloned().unwrap_or_else(|| panic!("cache enabled"));
    let key = system.keys().entity("product", 1).unwrap_or_else(|e| panic!("{e}"));

    let before = coordinator.get_stats().successful_syncs;
    let outcome = coordinator
        .sync_cache(&key, "product", "1", &json!({"price": 1499}))
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(outcome, SyncOutcome::Synced);

    let cached: Option<Value> = store.get(&key).await.unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(cached, Some(json!({"name": "lamp", "price": 1499})));
    assert_eq!(coordinator.get_stats().successful_syncs, before + 1);
    system.shutdown().await;
}

#[tokio::test]
async fn source_failure_leaves_cache_untouched() {
    let source = RecordStore::new();
    source.insert("product", "2", json!({"price": 10}));
    source.fail_writes(true);
    let (system, _) = memory_system("write_fail", Some(source.clone()), |_| {}).await;
    let coordinator = system.consistency().cloned().unwrap_or_else(|| panic!("source supplied"));
    let key = system.keys().entity("product", 2).unwrap_or_else(|e| panic!("{e}"));

    let result = coordinator
        .sync_cache(&key, "product", "2", &json!({"price": 11}))
        .await;
    assert!(matches!(result, Err(resilient_cache::CacheError::Source(_))));
    let store = system.store().cloned().unwrap_or_else(|| panic!("cache enabled"));
    assert!(!store.exists(&key).await.unwrap_or_else(|e| panic!("{e}")));
    assert_eq!(coordinator.get_stats().failed_syncs, 1);
    system.shutdown().await;
}

#[tokio::test]
async fn write_behind_caches_now_and_flushes_later() {
    let source = RecordStore::new();
    source.insert("inventory", "9", json!({"sku": "9", "count": 5}));
    let (system, _) = memory_system("write_behind", Some(source.clone()), |config| {
        config.consistency.strategy = ConsistencyStrategy::WriteBehind;
    })
    .await;
    let coordinator = system.consistency().cloned().unwrap_or_else(|| panic!("source supplied"));
    let store = system.store().cloned().unwrap_or_else(|| panic!("cache enabled"));
    let key = system.keys().entity("inventory", 9).unwrap_or_else(|e| panic!("{e}"));

    let outcome = coordinator
        .sync_cache(&key, "inventory", "9", &json!({"count": 4}))
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(outcome, SyncOutcome::Queued);
    let cached: Option<Value> = store.get(&key).await.unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(cached, Some(json!({"sku": "9", "count": 4})));

    // Shutdown drains the flush queue
    system.shutdown().await;
    assert_eq!(source.record("inventory", "9"), Some(json!({"sku": "9", "count": 4})));
    let stats = coordinator.get_stats();
    assert_eq!(stats.write_behind_queued, 1);
    assert_eq!(stats.write_behind_flushed, 1);
}

#[tokio::test]
async fn cache_aside_evicts_and_next_read_reloads() {
    let source = RecordStore::new();
    source.insert("category", "3", json!({"title": "Lamps"}));
    let (system, _) = memory_system("cache_aside", Some(source.clone()), |_| {}).await;
    let coordinator = system.consistency().cloned().unwrap_or_else(|| panic!("source supplied"));

    let first: Option<Value> = system
        .get_entity("category", 3, || async { Ok(source.record("category", "3")) })
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(first, Some(json!({"title": "Lamps"})));

    let key = system.keys().entity("category", 3).unwrap_or_else(|e| panic!("{e}"));
    let outcome = coordinator
        .sync_cache_with(
            ConsistencyStrategy::CacheAside,
            &key,
            "category",
            "3",
            &json!({"title": "Lighting"}),
        )
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(outcome, SyncOutcome::Invalidated);

    let second: Option<Value> = system
        .get_entity("category", 3, || async { Ok(source.record("category", "3")) })
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(second, Some(json!({"title": "Lighting"})));
    system.shutdown().await;
}

#[tokio::test]
async fn events_update_reload_and_delete_in_order() {
    let source = RecordStore::new();
    source.insert("product", "5", json!({"price": 50}));
    let (system, _) = memory_system("events", Some(source.clone()), |_| {}).await;
    let coordinator = system.consistency().cloned().unwrap_or_else(|| panic!("source supplied"));
    let store = system.store().cloned().unwrap_or_else(|| panic!("cache enabled"));
    let key = system.keys().entity("product", 5).unwrap_or_else(|e| panic!("{e}"));

    for price in [51, 52, 53] {
        let event = UpdateEvent::new(EventType::Update, "product", "5", json!({ "price": price }), vec![key.clone()]);
        coordinator.publish_event(event).await.unwrap_or_else(|e| panic!("{e}"));
    }
    let settled = wait_for(Duration::from_secs(2), || {
        let store = store.clone();
        let key = key.clone();
        async move {
            store.get::<Value>(&key).await.ok().flatten() == Some(json!({"price": 53}))
        }
    })
    .await;
    assert!(settled, "last update should win");

    // A null payload means "reload from the source"
    let reload = UpdateEvent::new(EventType::Update, "product", "5", Value::Null, Vec::new());
    coordinator.publish_event(reload).await.unwrap_or_else(|e| panic!("{e}"));
    let reloaded = wait_for(Duration::from_secs(2), || {
        let store = store.clone();
        let key = key.clone();
        async move {
            store.get::<Value>(&key).await.ok().flatten() == Some(json!({"price": 50}))
        }
    })
    .await;
    assert!(reloaded);

    let delete = UpdateEvent::new(EventType::Delete, "product", "5", Value::Null, vec![key.clone()]);
    coordinator.publish_event(delete).await.unwrap_or_else(|e| panic!("{e}"));
    let evicted = wait_for(Duration::from_secs(2), || {
        let store = store.clone();
        let key = key.clone();
        async move { !store.exists(&key).await.unwrap_or(true) }
    })
    .await;
    assert!(evicted);

    let counted = wait_for(Duration::from_secs(2), || {
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.get_stats().processed_events == 5 }
    })
    .await;
    assert!(counted);
    let stats = coordinator.get_stats();
    assert_eq!(stats.total_events, 5);
    assert_eq!(stats.processed_events, 5);
    assert_eq!(stats.pending_events, 0);
    system.shutdown().await;
}

#[tokio::test]
async fn audit_finds_stale_price_and_resyncs() {
    let source = RecordStore::new();
    source.insert("product", "8", json!({"price": 100}));
    let (system, _) = memory_system("audit", Some(source.clone()), |config| {
        config.consistency.audit_sample_rate = 1.0;
    })
    .await;
    let coordinator = system.consistency().cloned().unwrap_or_else(|| panic!("source supplied"));
    let store = system.store().cloned().unwrap_or_else(|| panic!("cache enabled"));
    let key = system.keys().entity("product", 8).unwrap_or_else(|e| panic!("{e}"));

    coordinator
        .sync_cache(&key, "product", "8", &json!({"price": 120}))
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    // Someone writes a stale price straight into the cache
    store
        .set(&key, &json!({"price": 90}), None)
        .await
        .unwrap_or_else(|e| panic!("{e}"));

    let results = coordinator.audit_once().await;
    let result = results
        .iter()
        .find(|r| r.key == key)
        .unwrap_or_else(|| panic!("tracked key audited"));
    assert!(!result.is_consistent);
    assert!(result.resynced);

    let repaired: Option<Value> = store.get(&key).await.unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(repaired, Some(json!({"price": 120})));
    let stats = coordinator.get_stats();
    assert_eq!(stats.inconsistent_count, 1);
    assert_eq!(stats.resync_count, 1);
    assert!(stats.consistency_rate <= 1.0);

    // The next pass finds nothing to repair
    let again = coordinator.audit_once().await;
    assert!(again.iter().all(|r| r.is_consistent));
    assert_eq!(coordinator.last_audit_results().len(), again.len());
    system.shutdown().await;
}

#[tokio::test]
async fn hot_keys_are_refreshed_before_expiry() {
    let source = RecordStore::new();
    source.insert("product", "4", json!({"price": 40}));
    let (system, _) = memory_system("refresh", Some(source.clone()), |config| {
        config.consistency.refresh_min_accesses = 3;
    })
    .await;
    let coordinator = system.consistency().cloned().unwrap_or_else(|| panic!("source supplied"));
    let store = system.store().cloned().unwrap_or_else(|| panic!("cache enabled"));
    let key = system.keys().entity("product", 4).unwrap_or_else(|e| panic!("{e}"));

    // Product TTL is one hour; one minute left is well under the refresh threshold
    store
        .set(&key, &json!({"price": 35}), Some(Duration::from_secs(60)))
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    for _ in 0..3 {
        let _: Option<Value> = system
            .get_entity("product", 4, || async { Ok(None) })
            .await
            .unwrap_or_else(|e| panic!("{e}"));
    }

    assert_eq!(coordinator.refresh_once().await, 1);
    let refreshed: Option<Value> = store.get(&key).await.unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(refreshed, Some(json!({"price": 40})));
    assert_eq!(coordinator.get_stats().refreshes, 1);

    // Access counts reset each pass, so a cold key is left alone
    assert_eq!(coordinator.refresh_once().await, 0);
    system.shutdown().await;
}

#[tokio::test]
async fn publishing_after_shutdown_is_rejected() {
    let source = RecordStore::new();
    let (system, _) = memory_system("shutdown", Some(source.clone()), |_| {}).await;
    let coordinator = Arc::clone(system.consistency().unwrap_or_else(|| panic!("source supplied")));
    system.shutdown().await;

    let event = UpdateEvent::new(EventType::Create, "product", "1", json!({"price": 1}), Vec::new());
    assert!(matches!(
        coordinator.publish_event(event).await,
        Err(resilient_cache::CacheError::Shutdown(_))
    ));
    assert_eq!(source.writes.load(Ordering::SeqCst), 0);
}
