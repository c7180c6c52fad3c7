use super::MonitorSnapshot;
use super::alerts::Alert;
use super::window::TimeSeriesSample;
use crate::consistency::ConsistencyStats;
use crate::shield::{CircuitState, ProtectionMetrics};
use crate::warmup::WarmupStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Relative change below which a metric counts as stable
const STABLE_BAND: f64 = 0.05;

const TARGET_HIT_RATE: f64 = 0.8;
const MAX_ERROR_RATE: f64 = 0.01;
const MAX_P99_MS: f64 = 100.0;
const MIN_CONSISTENCY_RATE: f64 = 0.99;
const MIN_WARMUP_SUCCESS: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Degrading,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricTrend {
    pub metric: String,
    pub direction: TrendDirection,
    /// Mean of the later half of the period minus mean of the earlier half
    pub change: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub period: Duration,
    pub generated_at: DateTime<Utc>,
    /// Time-series samples the trends were computed from
    pub samples: usize,
    pub current: MonitorSnapshot,
    pub trends: Vec<MetricTrend>,
    pub recommendations: Vec<String>,
    pub active_alerts: Vec<Alert>,
    pub protection: Option<ProtectionMetrics>,
    pub consistency: Option<ConsistencyStats>,
    pub warmup: Option<WarmupStats>,
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn trend(metric: &str, values: &[f64], higher_is_better: bool) -> MetricTrend {
    let mid = values.len() / 2;
    let (earlier, later) = values.split_at(mid);
    let (before, after) = (mean(earlier), mean(later));
    let change = if earlier.is_empty() { 0.0 } else { after - before };
    let band = (before.abs() * STABLE_BAND).max(1e-3);
    let direction = if change.abs() <= band {
        TrendDirection::Stable
    } else if (change > 0.0) == higher_is_better {
        TrendDirection::Improving
    } else {
        TrendDirection::Degrading
    };
    MetricTrend {
        metric: metric.to_string(),
        direction,
        change,
    }
}

/// Per-metric trend over the samples, comparing the earlier half with the later half
pub(crate) fn trends(series: &[TimeSeriesSample]) -> Vec<MetricTrend> {
    let ms = |d: Duration| d.as_secs_f64() * 1000.0;
    let hit: Vec<f64> = series.iter().map(|s| s.hit_rate).collect();
    let errors: Vec<f64> = series.iter().map(|s| s.error_rate).collect();
    let avg: Vec<f64> = series.iter().map(|s| ms(s.avg_latency)).collect();
    let p99: Vec<f64> = series.iter().map(|s| ms(s.p99_latency)).collect();
    vec![
        trend("hit_rate", &hit, true),
        trend("error_rate", &errors, false),
        trend("avg_latency_ms", &avg, false),
        trend("p99_latency_ms", &p99, false),
    ]
}

/// Plain-language advice for every threshold the snapshot breaches
pub(crate) fn recommendations(snapshot: &MonitorSnapshot) -> Vec<String> {
    let mut advice = Vec::new();
    let window = &snapshot.window;

    if let Some(hit_rate) = window.hit_rate
        && hit_rate < TARGET_HIT_RATE
    {
        advice.push(format!(
            "Hit rate is {:.1}% (target {:.0}%): lengthen TTLs for stable categories or warm more hot entities",
            hit_rate * 100.0,
            TARGET_HIT_RATE * 100.0
        ));
    }
    if let Some(error_rate) = window.error_rate
        && error_rate > MAX_ERROR_RATE
    {
        advice.push(format!(
            "Store error rate is {:.2}%: check store connectivity and pool size",
            error_rate * 100.0
        ));
    }
    let p99_ms = window.p99_latency.as_secs_f64() * 1000.0;
    if window.requests > 0 && p99_ms > MAX_P99_MS {
        advice.push(format!(
            "p99 latency is {p99_ms:.1}ms: look for oversized values or a saturated store"
        ));
    }
    if let Some(protection) = &snapshot.protection {
        if protection.blocked_penetrations > protection.cache_hits / 10 + 100 {
            advice.push(
                "Many lookups target absent keys: enable the existence filter or lengthen the null-marker TTL"
                    .to_string(),
            );
        }
        if protection.lock_timeouts > 0 {
            advice.push(format!(
                "{} lock timeouts: raise the lock wait timeout or speed up the slowest loaders",
                protection.lock_timeouts
            ));
        }
        if protection.circuit_trips > 0 {
            advice.push(format!(
                "Circuit breaker tripped {} times: the system of record is unstable",
                protection.circuit_trips
            ));
        }
    }
    if snapshot.circuit_state == Some(CircuitState::Open) {
        advice.push("Circuit breaker is open: source calls are being rejected".to_string());
    }
    if let Some(consistency) = &snapshot.consistency {
        if consistency.total_checks > 0 && consistency.consistency_rate < MIN_CONSISTENCY_RATE {
            advice.push(format!(
                "Consistency rate is {:.1}%: prefer write-through for frequently updated entities",
                consistency.consistency_rate * 100.0
            ));
        }
        if consistency.write_behind_failures > 0 {
            advice.push(format!(
                "{} write-behind flushes were abandoned: the source rejected queued writes",
                consistency.write_behind_failures
            ));
        }
    }
    if let Some(warmup) = &snapshot.warmup
        && warmup.total_tasks > 0
        && warmup.success_rate < MIN_WARMUP_SUCCESS
    {
        advice.push(format!(
            "Warmup success rate is {:.1}%: check the warmup source",
            warmup.success_rate * 100.0
        ));
    }

    if advice.is_empty() {
        advice.push("No issues detected".to_string());
    }
    advice
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::window::WindowStats;

    fn point(hit_rate: f64, p99_ms: u64) -> TimeSeriesSample {
        TimeSeriesSample {
            at: Utc::now(),
            requests: 100,
            hit_rate,
            miss_rate: 1.0 - hit_rate,
            error_rate: 0.0,
            avg_latency: Duration::from_millis(5),
            p95_latency: Duration::from_millis(p99_ms / 2),
            p99_latency: Duration::from_millis(p99_ms),
        }
    }

    #[test]
    fn trends_compare_halves() {
        let series = [point(0.6, 200), point(0.6, 200), point(0.9, 50), point(0.9, 50)];
        let trends = trends(&series);
        let by_name = |name: &str| {
            trends
                .iter()
                .find(|t| t.metric == name)
                .map(|t| t.direction)
        };
        assert_eq!(by_name("hit_rate"), Some(TrendDirection::Improving));
        assert_eq!(by_name("p99_latency_ms"), Some(TrendDirection::Improving));
        assert_eq!(by_name("avg_latency_ms"), Some(TrendDirection::Stable));
        assert_eq!(by_name("error_rate"), Some(TrendDirection::Stable));
    }

    #[test]
    fn recommendations_follow_breaches() {
        let healthy = MonitorSnapshot {
            window: WindowStats {
                requests: 10,
                hit_rate: Some(0.95),
                error_rate: Some(0.0),
                ..WindowStats::default()
            },
            ..MonitorSnapshot::empty()
        };
        assert_eq!(recommendations(&healthy), ["No issues detected"]);

        let cold = MonitorSnapshot {
            window: WindowStats {
                requests: 10,
                hit_rate: Some(0.4),
                error_rate: Some(0.0),
                ..WindowStats::default()
            },
            circuit_state: Some(CircuitState::Open),
            ..MonitorSnapshot::empty()
        };
        let advice = recommendations(&cold);
        assert_eq!(advice.len(), 2);
        assert!(advice[0].starts_with("Hit rate is 40.0%"));
    }
}
