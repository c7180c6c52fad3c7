//! Rolling window of store access samples.

use crate::store::{AccessOutcome, AccessSample};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Access statistics for one key within the window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotKeyRecord {
    pub key: String,
    pub accesses: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Aggregates computed at one collection tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesSample {
    pub at: DateTime<Utc>,
    pub requests: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub error_rate: f64,
    pub avg_latency: Duration,
    pub p95_latency: Duration,
    pub p99_latency: Duration,
}

/// Window aggregates; rates are `None` while the window is empty
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub hit_rate: Option<f64>,
    pub miss_rate: Option<f64>,
    pub error_rate: Option<f64>,
    pub avg_latency: Duration,
    pub p95_latency: Duration,
    pub p99_latency: Duration,
}

/// Nearest-rank percentile of an ascending slice
#[must_use]
pub fn percentile(sorted: &[Duration], pct: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    sorted.get(index).copied().unwrap_or_default()
}

#[derive(Debug)]
pub(crate) struct SampleWindow {
    samples: VecDeque<AccessSample>,
    capacity: usize,
    retention: Duration,
}

impl SampleWindow {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            capacity: capacity.max(1),
            retention,
        }
    }

    pub fn extend(&mut self, samples: impl IntoIterator<Item = AccessSample>) {
        for sample in samples {
            if self.samples.len() >= self.capacity {
                self.samples.pop_front();
            }
            self.samples.push_back(sample);
        }
    }

    /// Drop samples older than the retention period
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return;
        };
        let cutoff = now - retention;
        while self.samples.front().is_some_and(|s| s.at < cutoff) {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> WindowStats {
        let requests = self.samples.len() as u64;
        if requests == 0 {
            return WindowStats::default();
        }
        let (mut hits, mut misses, mut errors) = (0u64, 0u64, 0u64);
        let mut latencies: Vec<Duration> = Vec::with_capacity(self.samples.len());
        for sample in &self.samples {
            match sample.outcome {
                AccessOutcome::Hit => hits += 1,
                AccessOutcome::Miss => misses += 1,
                AccessOutcome::Error => errors += 1,
            }
            latencies.push(sample.latency);
        }
        latencies.sort_unstable();
        let total: Duration = latencies.iter().sum();
        let rate = |n: u64| Some(n as f64 / requests as f64);

        WindowStats {
            requests,
            hits,
            misses,
            errors,
            hit_rate: rate(hits),
            miss_rate: rate(misses),
            error_rate: rate(errors),
            avg_latency: total
                .checked_div(u32::try_from(latencies.len()).unwrap_or(u32::MAX))
                .unwrap_or_default(),
            p95_latency: percentile(&latencies, 95.0),
            p99_latency: percentile(&latencies, 99.0),
        }
    }

    /// The `n` most accessed keys, most accessed first
    #[allow(clippy::cast_precision_loss)]
    pub fn hot_keys(&self, n: usize) -> Vec<HotKeyRecord> {
        let mut counts: HashMap<&str, (u64, u64, u64)> = HashMap::new();
        for sample in &self.samples {
            let entry = counts.entry(sample.key.as_str()).or_default();
            entry.0 += 1;
            match sample.outcome {
                AccessOutcome::Hit => entry.1 += 1,
                AccessOutcome::Miss => entry.2 += 1,
                AccessOutcome::Error => {}
            }
        }
        let mut ranked: Vec<HotKeyRecord> = counts
            .into_iter()
            .map(|(key, (accesses, hits, misses))| HotKeyRecord {
                key: key.to_string(),
                accesses,
                hits,
                misses,
                hit_rate: hits as f64 / accesses as f64,
            })
            .collect();
        ranked.sort_by(|a, b| b.accesses.cmp(&a.accesses).then_with(|| a.key.cmp(&b.key)));
        ranked.truncate(n);
        ranked
    }
}
