//! Observability Plane
//!
//! [`CacheMonitor`] drains the store's access samples into a rolling window on every
//! collection tick, derives rates, latency percentiles and hot keys, keeps a time
//! series of those aggregates, and evaluates alert rules on its own timer. Component
//! statistics (shield, coordinator, warmup) are read as snapshots and folded into
//! reports.

mod alerts;
mod report;
mod window;

pub use alerts::{Alert, AlertLevel, AlertMetric, AlertRule, AlertStatus, Comparison, default_rules};
pub use report::{MetricTrend, PerformanceReport, TrendDirection};
pub use window::{HotKeyRecord, TimeSeriesSample, WindowStats, percentile};

use crate::consistency::{ConsistencyCoordinator, ConsistencyStats};
use crate::error::{CacheError, Result};
use crate::shield::{CircuitState, ProtectionMetrics, ProtectionShield};
use crate::store::{CacheMode, CacheStore, StoreStats};
use crate::warmup::{WarmupOrchestrator, WarmupStats};
use alerts::AlertEngine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use window::SampleWindow;

use crate::pool::spawn_periodic;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub collection_interval: Duration,
    pub alert_interval: Duration,
    /// Maximum access samples held in the rolling window
    pub window_size: usize,
    /// Samples and time-series points older than this are discarded
    pub retention: Duration,
    pub top_hot_keys: usize,
    pub alert_history_limit: usize,
    pub rules: Vec<AlertRule>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            collection_interval: Duration::from_secs(10),
            alert_interval: Duration::from_secs(30),
            window_size: 10_000,
            retention: Duration::from_secs(3600),
            top_hot_keys: 10,
            alert_history_limit: 1000,
            rules: default_rules(),
        }
    }
}

/// Optional components whose statistics the monitor folds in
#[derive(Default, Clone)]
pub struct MonitoredComponents {
    pub shield: Option<Arc<ProtectionShield>>,
    pub consistency: Option<Arc<ConsistencyCoordinator>>,
    pub warmup: Option<Arc<WarmupOrchestrator>>,
}

/// Everything known at one instant
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub collected_at: DateTime<Utc>,
    pub window: WindowStats,
    pub hot_keys: Vec<HotKeyRecord>,
    pub store: Option<StoreStats>,
    pub protection: Option<ProtectionMetrics>,
    pub circuit_state: Option<CircuitState>,
    pub consistency: Option<ConsistencyStats>,
    pub warmup: Option<WarmupStats>,
}

impl MonitorSnapshot {
    /// Snapshot with no data at all
    #[must_use]
    pub fn empty() -> Self {
        Self {
            collected_at: Utc::now(),
            window: WindowStats::default(),
            hot_keys: Vec::new(),
            store: None,
            protection: None,
            circuit_state: None,
            consistency: None,
            warmup: None,
        }
    }
}

/// Dashboard payload
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringData {
    pub current: MonitorSnapshot,
    pub time_series: Vec<TimeSeriesSample>,
    pub active_alerts: Vec<Alert>,
    pub recent_alerts: Vec<Alert>,
}

struct Inner {
    store: Option<CacheStore>,
    components: MonitoredComponents,
    window: Mutex<SampleWindow>,
    series: Mutex<VecDeque<TimeSeriesSample>>,
    alerts: Mutex<AlertEngine>,
    config: MonitorConfig,
}

pub struct CacheMonitor {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop: CancellationToken,
}

impl CacheMonitor {
    #[must_use]
    pub fn new(mode: &CacheMode, components: MonitoredComponents, config: MonitorConfig) -> Self {
        let store = match mode {
            CacheMode::Disabled => None,
            CacheMode::Enabled(store) => Some(store.clone()),
        };
        info!(
            collection_secs = config.collection_interval.as_secs(),
            alert_secs = config.alert_interval.as_secs(),
            rules = config.rules.len(),
            "Cache monitor initialized"
        );
        Self {
            inner: Arc::new(Inner {
                store,
                components,
                window: Mutex::new(SampleWindow::new(config.window_size, config.retention)),
                series: Mutex::new(VecDeque::new()),
                alerts: Mutex::new(AlertEngine::new(
                    config.rules.clone(),
                    config.alert_history_limit,
                )),
                config,
            }),
            tasks: Mutex::new(Vec::new()),
            stop: CancellationToken::new(),
        }
    }

    /// Run one collection tick now, then evaluate the alert rules
    pub fn collect_now(&self) -> MonitorSnapshot {
        let snapshot = self.inner.collect();
        self.inner.alerts.lock().evaluate(&snapshot);
        snapshot
    }

    /// Evaluate alert rules against the current window, returning newly raised alerts
    pub fn evaluate_alerts(&self) -> Vec<Alert> {
        self.inner.evaluate()
    }

    /// Spawn the collection and alert timers
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if the timers are already started.
    pub fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Err(CacheError::AlreadyRunning("cache monitor"));
        }
        let inner = Arc::clone(&self.inner);
        tasks.push(spawn_periodic(
            "monitor-collect",
            self.inner.config.collection_interval,
            self.stop.clone(),
            move || {
                let inner = Arc::clone(&inner);
                async move {
                    inner.collect();
                }
            },
        ));
        let inner = Arc::clone(&self.inner);
        tasks.push(spawn_periodic(
            "monitor-alerts",
            self.inner.config.alert_interval,
            self.stop.clone(),
            move || {
                let inner = Arc::clone(&inner);
                async move {
                    inner.evaluate();
                }
            },
        ));
        Ok(())
    }

    #[must_use]
    pub fn get_active_alerts(&self) -> Vec<Alert> {
        self.inner.alerts.lock().active()
    }

    /// Raised alerts, oldest first, with their current status
    #[must_use]
    pub fn alert_history(&self) -> Vec<Alert> {
        self.inner.alerts.lock().history()
    }

    #[must_use]
    pub fn rules(&self) -> Vec<AlertRule> {
        self.inner.alerts.lock().rules().to_vec()
    }

    /// Current aggregates over the window, without draining new samples
    #[must_use]
    pub fn get_current_stats(&self) -> MonitorSnapshot {
        self.inner.snapshot()
    }

    /// Summarize the last `period`: current state, trend per metric and recommendations
    #[must_use]
    pub fn generate_performance_report(&self, period: Duration) -> PerformanceReport {
        let current = self.inner.snapshot();
        let cutoff = chrono::Duration::from_std(period)
            .map_or(DateTime::<Utc>::MIN_UTC, |period| Utc::now() - period);
        let series: Vec<TimeSeriesSample> = self
            .inner
            .series
            .lock()
            .iter()
            .filter(|s| s.at >= cutoff)
            .cloned()
            .collect();
        debug!(samples = series.len(), period_secs = period.as_secs(), "Generating performance report");

        PerformanceReport {
            period,
            generated_at: Utc::now(),
            samples: series.len(),
            trends: report::trends(&series),
            recommendations: report::recommendations(&current),
            active_alerts: self.get_active_alerts(),
            protection: current.protection.clone(),
            consistency: current.consistency.clone(),
            warmup: current.warmup.clone(),
            current,
        }
    }

    #[must_use]
    pub fn get_monitoring_data(&self) -> MonitoringData {
        let alerts = self.inner.alerts.lock();
        MonitoringData {
            current: self.inner.snapshot(),
            time_series: self.inner.series.lock().iter().cloned().collect(),
            active_alerts: alerts.active(),
            recent_alerts: alerts.history().into_iter().rev().take(20).collect(),
        }
    }

    /// Clear the window, the time series, the alerts and the store counters
    pub fn reset_stats(&self) {
        self.inner.window.lock().clear();
        self.inner.series.lock().clear();
        self.inner.alerts.lock().clear();
        if let Some(store) = &self.inner.store {
            store.metrics().reset();
        }
        info!("[Monitor] Statistics reset");
    }

    /// Stop both timers
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Monitor task ended abnormally");
            }
        }
        info!("Cache monitor shut down");
    }
}

impl Inner {
    fn snapshot(&self) -> MonitorSnapshot {
        let (window, hot_keys) = {
            let window = self.window.lock();
            (window.stats(), window.hot_keys(self.config.top_hot_keys))
        };
        let shield = self.components.shield.as_ref();
        MonitorSnapshot {
            collected_at: Utc::now(),
            window,
            hot_keys,
            store: self.store.as_ref().map(CacheStore::stats),
            protection: shield.map(|s| s.get_stats()),
            circuit_state: shield.map(|s| s.circuit_state()),
            consistency: self.components.consistency.as_ref().map(|c| c.get_stats()),
            warmup: self.components.warmup.as_ref().map(|w| w.get_stats()),
        }
    }

    fn collect(&self) -> MonitorSnapshot {
        let now = Utc::now();
        let drained = self
            .store
            .as_ref()
            .map(|store| store.metrics().drain_samples())
            .unwrap_or_default();
        {
            let mut window = self.window.lock();
            window.extend(drained);
            window.prune(now);
        }
        let snapshot = self.snapshot();
        let w = &snapshot.window;
        let point = TimeSeriesSample {
            at: snapshot.collected_at,
            requests: w.requests,
            hit_rate: w.hit_rate.unwrap_or(0.0),
            miss_rate: w.miss_rate.unwrap_or(0.0),
            error_rate: w.error_rate.unwrap_or(0.0),
            avg_latency: w.avg_latency,
            p95_latency: w.p95_latency,
            p99_latency: w.p99_latency,
        };
        {
            let mut series = self.series.lock();
            series.push_back(point);
            if let Ok(retention) = chrono::Duration::from_std(self.config.retention) {
                let cutoff = now - retention;
                while series.front().is_some_and(|s| s.at < cutoff) {
                    series.pop_front();
                }
            }
        }
        debug!(requests = w.requests, hit_rate = ?w.hit_rate, "Collected cache metrics");
        snapshot
    }

    fn evaluate(&self) -> Vec<Alert> {
        let snapshot = self.snapshot();
        self.alerts.lock().evaluate(&snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryStore;
    use crate::keys::KeyBuilder;
    use crate::store::StoreConfig;

    #[tokio::test]
    async fn collection_drains_store_samples() {
        let store = CacheStore::new(Arc::new(MemoryStore::new()), &StoreConfig::default());
        let keys = KeyBuilder::new("unit").unwrap_or_else(|e| panic!("{e}"));
        let key = keys.entity("product", 1).unwrap_or_else(|e| panic!("{e}"));
        store.set(&key, &1u32, None).await.unwrap_or_else(|e| panic!("{e}"));
        for _ in 0..3 {
            let _: Option<u32> = store.get(&key).await.unwrap_or_else(|e| panic!("{e}"));
        }
        let missing = keys.entity("product", 2).unwrap_or_else(|e| panic!("{e}"));
        let _: Option<u32> = store.get(&missing).await.unwrap_or_else(|e| panic!("{e}"));

        let monitor = CacheMonitor::new(
            &CacheMode::Enabled(store.clone()),
            MonitoredComponents::default(),
            MonitorConfig::default(),
        );
        let snapshot = monitor.collect_now();
        assert_eq!(snapshot.window.requests, 4);
        assert_eq!(snapshot.window.hit_rate, Some(0.75));
        assert_eq!(snapshot.hot_keys[0].key, key.as_str());
        assert_eq!(store.metrics().pending_samples(), 0);
        assert_eq!(monitor.get_monitoring_data().time_series.len(), 1);

        // Hit rate 75% is below the default 80% rule
        let active = monitor.get_active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rule_name, "low_hit_rate");

        monitor.reset_stats();
        assert_eq!(monitor.get_current_stats().window.requests, 0);
        assert!(monitor.get_active_alerts().is_empty());
    }
}
