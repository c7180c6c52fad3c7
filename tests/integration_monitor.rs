//! Integration tests for the monitor and the assembled system
//!
//! Tests cover:
//! - Collection of store samples into rates, percentiles and hot keys
//! - Alert raising and resolution against live component stats
//! - Performance reports and dashboard data
//! - Resetting every component at once

mod common;

use common::*;
use resilient_cache::monitor::{AlertMetric, AlertStatus, Comparison, TrendDirection, default_rules};
use resilient_cache::{AlertLevel, AlertRule, CacheSystemBuilder, MemoryStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn collection_reports_rates_and_hot_keys() {
    let (system, _) = memory_system("collect", None, |_| {}).await;
    for i in 0..4u32 {
        for _ in 0..(i + 1) {
            let _: Option<u32> = system
                .get_entity("product", i, || async move { Ok(Some(i)) })
                .await
                .unwrap_or_else(|e| panic!("{e}"));
        }
    }

    let snapshot = system.monitor().collect_now();
    // 6 hits, and each of the 4 misses is read twice: once up front, once under the lease
    assert_eq!(snapshot.window.requests, 14);
    assert_eq!(snapshot.window.hits, 6);
    assert_eq!(snapshot.window.misses, 8);
    assert!(snapshot.window.p99_latency >= snapshot.window.p95_latency);

    let hottest = snapshot.hot_keys.first().unwrap_or_else(|| panic!("hot keys present"));
    let key3 = system.keys().entity("product", 3).unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(hottest.key, key3.as_str());

    let protection = snapshot.protection.unwrap_or_else(|| panic!("shield attached"));
    assert_eq!(protection.total_requests, 10);
    assert_eq!(protection.cache_hits, 6);
}

#[tokio::test]
async fn open_circuit_raises_a_critical_alert() {
    let (system, _) = memory_system("alerts", None, |config| {
        config.shield.breaker.failure_threshold = 2;
        config.shield.breaker.min_requests_to_trip = 2;
        config.monitor.rules = default_rules();
    })
    .await;

    for i in 0..2u32 {
        let _: resilient_cache::Result<Option<u32>> = system
            .get_entity("price", i, || async { Err(anyhow::anyhow!("upstream timeout")) })
            .await;
    }
    let raised = system.monitor().evaluate_alerts();
    let circuit = raised
        .iter()
        .find(|a| a.rule_name == "circuit_open")
        .unwrap_or_else(|| panic!("circuit alert raised"));
    assert_eq!(circuit.level, AlertLevel::Critical);
    assert_eq!(system.monitor().get_active_alerts().len(), raised.len());

    let report = system.monitor().generate_performance_report(Duration::from_secs(3600));
    assert!(report.recommendations.iter().any(|r| r.contains("Circuit breaker is open")));
    assert!(!report.active_alerts.is_empty());
}

#[tokio::test]
async fn custom_rule_resolves_when_condition_clears() {
    let rule = AlertRule::new(
        "failing_reads",
        AlertMetric::ErrorRate,
        Comparison::Above,
        0.2,
        AlertLevel::Warning,
        Duration::from_secs(600),
    );
    let backend = Arc::new(MemoryStore::new());
    let system = CacheSystemBuilder::new()
        .namespace(test_namespace("custom_rule"))
        .with_store(backend.clone())
        .configure(|config| {
            config.monitor.rules = vec![rule];
            config.store.retry.max_attempts = 1;
        })
        .build()
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    let store = system.store().cloned().unwrap_or_else(|| panic!("cache enabled"));
    let key = system.keys().entity("session", "abc").unwrap_or_else(|e| panic!("{e}"));

    backend.set_available(false);
    for _ in 0..3 {
        assert!(store.get::<String>(&key).await.is_err());
    }
    backend.set_available(true);
    system.monitor().collect_now();
    let active = system.monitor().get_active_alerts();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].rule_name, "failing_reads");

    // 3 errors out of 18 reads is under the threshold
    store.set(&key, "ok", None).await.unwrap_or_else(|e| panic!("{e}"));
    for _ in 0..15 {
        let _: Option<String> = store.get(&key).await.unwrap_or_else(|e| panic!("{e}"));
    }
    system.monitor().collect_now();
    assert!(system.monitor().get_active_alerts().is_empty());
    let history = system.monitor().alert_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, AlertStatus::Resolved);
    assert!(history[0].resolved_at.is_some());
}

#[tokio::test]
async fn report_and_dashboard_cover_every_component() {
    let source = RecordStore::new();
    source.insert("product", "1", json!({"price": 10}));
    let (system, _) = memory_system("report", Some(source.clone()), |config| {
        config.consistency.audit_sample_rate = 1.0;
    })
    .await;
    let coordinator = system.consistency().cloned().unwrap_or_else(|| panic!("source supplied"));
    let key = system.keys().entity("product", 1).unwrap_or_else(|e| panic!("{e}"));
    coordinator
        .sync_cache(&key, "product", "1", &json!({"price": 12}))
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    coordinator.audit_once().await;

    for _ in 0..3 {
        let _: Option<serde_json::Value> = system
            .get_entity("product", 1, || async { Ok(source.record("product", "1")) })
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        system.monitor().collect_now();
    }

    let report = system.monitor().generate_performance_report(Duration::from_secs(600));
    assert_eq!(report.samples, 3);
    assert_eq!(report.trends.len(), 4);
    assert!(report.trends.iter().all(|t| t.direction == TrendDirection::Stable || t.change.is_finite()));
    let consistency = report.consistency.unwrap_or_else(|| panic!("coordinator attached"));
    assert_eq!(consistency.total_checks, 1);
    assert!((consistency.consistency_rate - 1.0).abs() < f64::EPSILON);
    assert!(report.protection.is_some());
    assert!(report.warmup.is_none());

    let data = system.monitor().get_monitoring_data();
    assert_eq!(data.time_series.len(), 3);
    let json = serde_json::to_value(&data).unwrap_or_else(|e| panic!("{e}"));
    assert!(json.get("current").is_some());

    system.reset_all_stats();
    assert_eq!(system.shield().get_stats().total_requests, 0);
    assert_eq!(coordinator.get_stats().total_checks, 0);
    assert!(system.monitor().get_monitoring_data().time_series.is_empty());
    system.shutdown().await;
}

#[tokio::test]
async fn background_tasks_start_once_and_stop_cleanly() {
    let source = RecordStore::new();
    let (system, _) = memory_system("lifecycle", Some(source), |config| {
        config.monitor.collection_interval = Duration::from_millis(20);
        config.monitor.alert_interval = Duration::from_millis(20);
    })
    .await;

    system.start().unwrap_or_else(|e| panic!("{e}"));
    assert!(matches!(
        system.start(),
        Err(resilient_cache::CacheError::AlreadyRunning(_))
    ));

    let collected = wait_for(Duration::from_secs(2), || {
        let monitor = Arc::clone(system.monitor());
        async move { monitor.get_monitoring_data().time_series.len() >= 2 }
    })
    .await;
    assert!(collected);
    system.shutdown().await;
}
