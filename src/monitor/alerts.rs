//! Rule-based alerting.
//!
//! A rule raises one `Active` alert while its predicate holds; the alert turns
//! `Resolved` on the first evaluation where the predicate no longer holds. A rule that
//! fired within its cool-down does not raise again, even after resolving.

use super::MonitorSnapshot;
use crate::shield::CircuitState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Resolved,
}

/// Value a rule looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    HitRate,
    ErrorRate,
    AvgLatencyMs,
    P99LatencyMs,
    ConsistencyRate,
    /// `1.0` while the breaker is open, else `0.0`
    CircuitOpen,
    LockTimeouts,
    WarmupSuccessRate,
}

impl AlertMetric {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HitRate => "hit_rate",
            Self::ErrorRate => "error_rate",
            Self::AvgLatencyMs => "avg_latency_ms",
            Self::P99LatencyMs => "p99_latency_ms",
            Self::ConsistencyRate => "consistency_rate",
            Self::CircuitOpen => "circuit_open",
            Self::LockTimeouts => "lock_timeouts",
            Self::WarmupSuccessRate => "warmup_success_rate",
        }
    }

    /// Current value, or `None` when there is nothing to judge yet
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn value(&self, snapshot: &MonitorSnapshot) -> Option<f64> {
        let window = &snapshot.window;
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        match self {
            Self::HitRate => window.hit_rate,
            Self::ErrorRate => window.error_rate,
            Self::AvgLatencyMs => (window.requests > 0).then(|| ms(window.avg_latency)),
            Self::P99LatencyMs => (window.requests > 0).then(|| ms(window.p99_latency)),
            Self::ConsistencyRate => snapshot.consistency.as_ref().and_then(|c| {
                (c.total_checks > 0).then_some(c.consistency_rate)
            }),
            Self::CircuitOpen => snapshot
                .circuit_state
                .map(|state| if state == CircuitState::Open { 1.0 } else { 0.0 }),
            Self::LockTimeouts => snapshot.protection.as_ref().map(|p| p.lock_timeouts as f64),
            Self::WarmupSuccessRate => snapshot
                .warmup
                .as_ref()
                .and_then(|w| (w.total_tasks > 0).then_some(w.success_rate)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Above,
    Below,
}

impl Comparison {
    #[must_use]
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Above => value > threshold,
            Self::Below => value < threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub metric: AlertMetric,
    pub comparison: Comparison,
    pub threshold: f64,
    pub level: AlertLevel,
    /// Minimum time between two alerts raised by this rule
    pub cooldown: Duration,
}

impl AlertRule {
    pub fn new(
        name: impl Into<String>,
        metric: AlertMetric,
        comparison: Comparison,
        threshold: f64,
        level: AlertLevel,
        cooldown: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            metric,
            comparison,
            threshold,
            level,
            cooldown,
        }
    }
}

/// Low hit rate, high p99 latency, high error rate, low consistency rate and an open circuit
#[must_use]
pub fn default_rules() -> Vec<AlertRule> {
    let five_minutes = Duration::from_secs(300);
    vec![
        AlertRule::new(
            "low_hit_rate",
            AlertMetric::HitRate,
            Comparison::Below,
            0.8,
            AlertLevel::Warning,
            five_minutes,
        ),
        AlertRule::new(
            "high_p99_latency",
            AlertMetric::P99LatencyMs,
            Comparison::Above,
            100.0,
            AlertLevel::Warning,
            five_minutes,
        ),
        AlertRule::new(
            "high_error_rate",
            AlertMetric::ErrorRate,
            Comparison::Above,
            0.05,
            AlertLevel::Critical,
            five_minutes,
        ),
        AlertRule::new(
            "low_consistency_rate",
            AlertMetric::ConsistencyRate,
            Comparison::Below,
            0.95,
            AlertLevel::Warning,
            five_minutes,
        ),
        AlertRule::new(
            "circuit_open",
            AlertMetric::CircuitOpen,
            Comparison::Above,
            0.5,
            AlertLevel::Critical,
            Duration::from_secs(60),
        ),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub rule_name: String,
    pub message: String,
    pub level: AlertLevel,
    pub status: AlertStatus,
    pub metric: AlertMetric,
    /// Metric value when the alert was raised
    pub value: f64,
    pub threshold: f64,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub(crate) struct AlertEngine {
    rules: Vec<AlertRule>,
    active: HashMap<String, Alert>,
    history: VecDeque<Alert>,
    history_limit: usize,
    last_fired: HashMap<String, Instant>,
}

impl AlertEngine {
    pub fn new(rules: Vec<AlertRule>, history_limit: usize) -> Self {
        Self {
            rules,
            active: HashMap::new(),
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
            last_fired: HashMap::new(),
        }
    }

    /// Evaluate every rule against `snapshot`, returning the alerts raised by this pass
    pub fn evaluate(&mut self, snapshot: &MonitorSnapshot) -> Vec<Alert> {
        let now = Instant::now();
        let mut raised = Vec::new();

        for rule in &self.rules {
            let Some(value) = rule.metric.value(snapshot) else {
                continue;
            };
            let firing = rule.comparison.holds(value, rule.threshold);

            if !firing {
                if let Some(mut alert) = self.active.remove(&rule.name) {
                    alert.status = AlertStatus::Resolved;
                    alert.resolved_at = Some(Utc::now());
                    info!(rule = %rule.name, value, "Alert resolved");
                    if let Some(entry) = self.history.iter_mut().find(|a| a.id == alert.id) {
                        *entry = alert;
                    }
                }
                continue;
            }

            let cooling = self
                .last_fired
                .get(&rule.name)
                .is_some_and(|fired| now.duration_since(*fired) < rule.cooldown);
            if self.active.contains_key(&rule.name) || cooling {
                continue;
            }

            let alert = Alert {
                id: Uuid::new_v4(),
                rule_name: rule.name.clone(),
                message: format!(
                    "{} is {:.3}, {} threshold {:.3}",
                    rule.metric.as_str(),
                    value,
                    match rule.comparison {
                        Comparison::Above => "above",
                        Comparison::Below => "below",
                    },
                    rule.threshold
                ),
                level: rule.level,
                status: AlertStatus::Active,
                metric: rule.metric,
                value,
                threshold: rule.threshold,
                created_at: Utc::now(),
                resolved_at: None,
            };
            warn!(rule = %rule.name, level = rule.level.as_str(), value, threshold = rule.threshold, "Alert raised");
            self.last_fired.insert(rule.name.clone(), now);
            self.active.insert(rule.name.clone(), alert.clone());
            if self.history.len() >= self.history_limit {
                self.history.pop_front();
            }
            self.history.push_back(alert.clone());
            raised.push(alert);
        }
        raised
    }

    pub fn active(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.active.values().cloned().collect();
        alerts.sort_by(|a, b| b.level.cmp(&a.level).then(a.created_at.cmp(&b.created_at)));
        alerts
    }

    pub fn history(&self) -> Vec<Alert> {
        self.history.iter().cloned().collect()
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.history.clear();
        self.last_fired.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::window::WindowStats;

    fn snapshot(hit_rate: f64) -> MonitorSnapshot {
        MonitorSnapshot {
            window: WindowStats {
                requests: 100,
                hit_rate: Some(hit_rate),
                miss_rate: Some(1.0 - hit_rate),
                error_rate: Some(0.0),
                ..WindowStats::default()
            },
            ..MonitorSnapshot::empty()
        }
    }

    fn engine() -> AlertEngine {
        AlertEngine::new(
            vec![AlertRule::new(
                "low_hit_rate",
                AlertMetric::HitRate,
                Comparison::Below,
                0.8,
                AlertLevel::Warning,
                Duration::from_secs(300),
            )],
            100,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn alert_lifecycle_with_cooldown() {
        let mut engine = engine();

        assert_eq!(engine.evaluate(&snapshot(0.5)).len(), 1);
        // Still firing: no duplicate while active
        assert!(engine.evaluate(&snapshot(0.5)).is_empty());
        assert_eq!(engine.active().len(), 1);

        assert!(engine.evaluate(&snapshot(0.95)).is_empty());
        assert!(engine.active().is_empty());
        assert_eq!(engine.history()[0].status, AlertStatus::Resolved);

        // Cool-down blocks an immediate re-fire
        assert!(engine.evaluate(&snapshot(0.5)).is_empty());
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(engine.evaluate(&snapshot(0.5)).len(), 1);
        assert_eq!(engine.history().len(), 2);
    }

    #[test]
    fn default_rules_have_unique_names() {
        let rules = default_rules();
        let mut names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 5);

        let circuit = rules
            .iter()
            .find(|r| r.metric == AlertMetric::CircuitOpen)
            .unwrap_or_else(|| panic!("no circuit rule"));
        assert_eq!(circuit.level, AlertLevel::Critical);
        assert_eq!(circuit.cooldown, Duration::from_secs(60));
    }

    #[test]
    fn rules_without_data_are_skipped() {
        let mut engine = AlertEngine::new(default_rules(), 10);
        assert!(engine.evaluate(&MonitorSnapshot::empty()).is_empty());
    }
}
