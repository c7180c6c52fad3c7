//! Jittered TTLs so entries written together do not expire together.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlJitterConfig {
    /// Maximum distance from the base TTL, in either direction
    pub random_range: Duration,
    pub min_ttl: Duration,
    pub max_ttl: Duration,
}

impl Default for TtlJitterConfig {
    fn default() -> Self {
        Self {
            random_range: Duration::from_secs(30),
            min_ttl: Duration::from_secs(1),
            max_ttl: Duration::from_secs(86_400),
        }
    }
}

/// Samples TTLs uniformly from `base ± random_range`, clamped to `[min_ttl, max_ttl]`
#[derive(Debug, Clone)]
pub struct JitteredTtl {
    config: TtlJitterConfig,
}

impl JitteredTtl {
    #[must_use]
    pub fn new(config: TtlJitterConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &TtlJitterConfig {
        &self.config
    }

    /// Inclusive range every sample for `base` falls into
    #[must_use]
    pub fn bounds(&self, base: Duration) -> (Duration, Duration) {
        let lo = base.saturating_sub(self.config.random_range);
        let hi = base.saturating_add(self.config.random_range);
        (self.clamp(lo), self.clamp(hi))
    }

    #[must_use]
    pub fn sample(&self, base: Duration) -> Duration {
        let range_ms = millis(self.config.random_range);
        if range_ms == 0 {
            return self.clamp(base);
        }
        let offset = rand::thread_rng().gen_range(-range_ms..=range_ms);
        let ttl_ms = millis(base).saturating_add(offset).max(0);
        self.clamp(Duration::from_millis(ttl_ms.unsigned_abs()))
    }

    fn clamp(&self, ttl: Duration) -> Duration {
        // A misconfigured min above max resolves to max
        ttl.max(self.config.min_ttl).min(self.config.max_ttl)
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn samples_stay_within_clamped_band() {
        let ttl = JitteredTtl::new(TtlJitterConfig {
            random_range: 30 * MINUTE,
            min_ttl: 30 * MINUTE,
            max_ttl: 120 * MINUTE,
        });
        let base = 60 * MINUTE;
        assert_eq!(ttl.bounds(base), (30 * MINUTE, 90 * MINUTE));

        let samples: Vec<Duration> = (0..1000).map(|_| ttl.sample(base)).collect();
        assert!(samples.iter().all(|t| *t >= 30 * MINUTE && *t <= 90 * MINUTE));
        // Jitter actually spreads the values
        let distinct: std::collections::HashSet<_> = samples.iter().collect();
        assert!(distinct.len() > 100);
    }

    #[test]
    fn min_floor_applies_to_short_bases() {
        let ttl = JitteredTtl::new(TtlJitterConfig {
            random_range: Duration::from_secs(30),
            min_ttl: Duration::from_secs(5),
            max_ttl: Duration::from_secs(3600),
        });
        for _ in 0..200 {
            assert!(ttl.sample(Duration::from_secs(10)) >= Duration::from_secs(5));
        }
    }

    #[test]
    fn zero_range_is_deterministic() {
        let ttl = JitteredTtl::new(TtlJitterConfig {
            random_range: Duration::ZERO,
            ..TtlJitterConfig::default()
        });
        assert_eq!(ttl.sample(MINUTE), MINUTE);
    }
}
