//! Hot-data identification.
//!
//! An entity is hot when it clears every threshold. Its score is the weighted sum of
//! each signal divided by its threshold, each ratio capped at [`MAX_SIGNAL`], so a
//! single runaway metric cannot dominate the ranking.

use super::strategy::EntityMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::time::Duration;

/// Upper bound of any normalized signal
pub const MAX_SIGNAL: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotDataConfig {
    pub min_sales: u64,
    pub min_views: u64,
    pub min_rating: f64,
    /// Entities inactive for longer than this are never hot
    pub recency_window: Duration,
    pub sales_weight: f64,
    pub views_weight: f64,
    pub rating_weight: f64,
    pub recency_weight: f64,
    /// Scores at or above this are `High`
    pub high_cutoff: f64,
    /// Scores at or above this (and below `high_cutoff`) are `Medium`
    pub medium_cutoff: f64,
}

impl Default for HotDataConfig {
    fn default() -> Self {
        Self {
            min_sales: 100,
            min_views: 1000,
            min_rating: 4.0,
            recency_window: Duration::from_secs(7 * 24 * 3600),
            sales_weight: 0.4,
            views_weight: 0.3,
            rating_weight: 0.2,
            recency_weight: 0.1,
            high_cutoff: 1.6,
            medium_cutoff: 1.25,
        }
    }
}

/// A candidate that cleared every threshold
#[derive(Debug, Clone, PartialEq)]
pub struct HotEntity {
    pub metrics: EntityMetrics,
    pub score: f64,
    pub priority: Priority,
}

#[derive(Debug, Clone, Default)]
pub struct HotDataIdentifier {
    config: HotDataConfig,
}

fn ratio(value: f64, threshold: f64) -> f64 {
    if threshold <= 0.0 {
        return MAX_SIGNAL;
    }
    (value / threshold).clamp(0.0, MAX_SIGNAL)
}

impl HotDataIdentifier {
    #[must_use]
    pub fn new(config: HotDataConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &HotDataConfig {
        &self.config
    }

    fn age(metrics: &EntityMetrics, now: DateTime<Utc>) -> Duration {
        (now - metrics.last_active).to_std().unwrap_or(Duration::ZERO)
    }

    #[must_use]
    pub fn is_hot(&self, metrics: &EntityMetrics, now: DateTime<Utc>) -> bool {
        let c = &self.config;
        metrics.sales >= c.min_sales
            && metrics.views >= c.min_views
            && metrics.rating >= c.min_rating
            && Self::age(metrics, now) <= c.recency_window
    }

    /// Composite score; an entity exactly at every threshold and just active scores
    /// the sum of the weights
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn score(&self, metrics: &EntityMetrics, now: DateTime<Utc>) -> f64 {
        let c = &self.config;
        let window = c.recency_window.as_secs_f64();
        let recency = if window > 0.0 {
            let freshness = 1.0 - Self::age(metrics, now).as_secs_f64() / window;
            1.0 + freshness.clamp(0.0, 1.0)
        } else {
            1.0
        };
        c.sales_weight * ratio(metrics.sales as f64, c.min_sales as f64)
            + c.views_weight * ratio(metrics.views as f64, c.min_views as f64)
            + c.rating_weight * ratio(metrics.rating, c.min_rating)
            + c.recency_weight * recency
    }

    #[must_use]
    pub fn priority_for(&self, score: f64) -> Priority {
        if score >= self.config.high_cutoff {
            Priority::High
        } else if score >= self.config.medium_cutoff {
            Priority::Medium
        } else {
            Priority::Low
        }
    }

    /// Keep the hot candidates, highest priority first, then by descending score
    #[must_use]
    pub fn identify(&self, candidates: Vec<EntityMetrics>, now: DateTime<Utc>) -> Vec<HotEntity> {
        let mut hot: Vec<HotEntity> = candidates
            .into_iter()
            .filter(|m| self.is_hot(m, now))
            .map(|metrics| {
                let score = self.score(&metrics, now);
                HotEntity {
                    priority: self.priority_for(score),
                    metrics,
                    score,
                }
            })
            .collect();
        hot.sort_by(|a, b| {
            Reverse(a.priority)
                .cmp(&Reverse(b.priority))
                .then_with(|| b.score.total_cmp(&a.score))
        });
        hot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str, sales: u64, views: u64, rating: f64, age_hours: i64) -> EntityMetrics {
        EntityMetrics {
            id: id.to_string(),
            sales,
            views,
            rating,
            last_active: Utc::now() - chrono::Duration::hours(age_hours),
        }
    }

    #[test]
    fn every_threshold_must_be_cleared() {
        let identifier = HotDataIdentifier::default();
        let now = Utc::now();
        assert!(identifier.is_hot(&entity("a", 100, 1000, 4.0, 1), now));
        assert!(!identifier.is_hot(&entity("b", 99, 5000, 5.0, 1), now));
        assert!(!identifier.is_hot(&entity("c", 500, 999, 5.0, 1), now));
        assert!(!identifier.is_hot(&entity("d", 500, 5000, 3.9, 1), now));
        assert!(!identifier.is_hot(&entity("e", 500, 5000, 5.0, 24 * 8), now));
    }

    #[test]
    fn signals_are_capped() {
        let identifier = HotDataIdentifier::default();
        let now = Utc::now();
        let huge = identifier.score(&entity("a", 1_000_000, 2000, 8.0, 0), now);
        let double = identifier.score(&entity("b", 200, 2000, 8.0, 0), now);
        assert!((huge - double).abs() < 1e-6);
        assert!(huge <= MAX_SIGNAL + 1e-6);
    }

    #[test]
    fn identify_orders_high_to_low() {
        let identifier = HotDataIdentifier::default();
        let hot = identifier.identify(
            vec![
                entity("barely", 100, 1000, 4.0, 24 * 6),
                entity("strong", 400, 4000, 5.0, 0),
                entity("cold", 1, 1, 1.0, 0),
                entity("middle", 150, 1500, 4.5, 12),
            ],
            Utc::now(),
        );
        let ids: Vec<&str> = hot.iter().map(|h| h.metrics.id.as_str()).collect();
        assert_eq!(ids, ["strong", "middle", "barely"]);
        assert_eq!(hot[0].priority, Priority::High);
        assert!(hot.windows(2).all(|w| w[0].priority >= w[1].priority));
    }
}
