use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Snapshot of the shield's counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionMetrics {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Lookups rejected by the existence filter
    pub bloom_rejections: u64,
    /// Lookups answered by a null marker
    pub null_marker_hits: u64,
    /// `bloom_rejections + null_marker_hits`
    pub blocked_penetrations: u64,
    /// Callers that waited on another caller's load instead of loading themselves
    pub blocked_breakdowns: u64,
    pub lock_timeouts: u64,
    pub circuit_trips: u64,
    pub circuit_rejections: u64,
    pub loader_calls: u64,
    pub loader_errors: u64,
    pub null_markers_written: u64,
    /// Loads whose result was not cached because the lease had been lost
    pub fenced_writes: u64,
    /// Store failures the shield degraded around
    pub store_errors: u64,
    pub cancelled: u64,
    pub avg_latency: Duration,
    pub max_latency: Duration,
    pub hit_rate: f64,
    pub last_reset: DateTime<Utc>,
}

#[derive(Debug)]
pub(crate) struct ShieldCounters {
    pub total_requests: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub bloom_rejections: AtomicU64,
    pub null_marker_hits: AtomicU64,
    pub blocked_breakdowns: AtomicU64,
    pub lock_timeouts: AtomicU64,
    pub loader_calls: AtomicU64,
    pub loader_errors: AtomicU64,
    pub null_markers_written: AtomicU64,
    pub fenced_writes: AtomicU64,
    pub store_errors: AtomicU64,
    pub cancelled: AtomicU64,
    latency_total_us: AtomicU64,
    latency_count: AtomicU64,
    latency_max_us: AtomicU64,
    last_reset: RwLock<DateTime<Utc>>,
}

impl Default for ShieldCounters {
    fn default() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            bloom_rejections: AtomicU64::new(0),
            null_marker_hits: AtomicU64::new(0),
            blocked_breakdowns: AtomicU64::new(0),
            lock_timeouts: AtomicU64::new(0),
            loader_calls: AtomicU64::new(0),
            loader_errors: AtomicU64::new(0),
            null_markers_written: AtomicU64::new(0),
            fenced_writes: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            latency_total_us: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            last_reset: RwLock::new(Utc::now()),
        }
    }
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl ShieldCounters {
    pub fn record_latency(&self, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.latency_total_us.fetch_add(us, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        self.latency_max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn snapshot(&self, circuit_trips: u64, circuit_rejections: u64) -> ProtectionMetrics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let bloom_rejections = load(&self.bloom_rejections);
        let null_marker_hits = load(&self.null_marker_hits);
        let cache_hits = load(&self.cache_hits);
        let cache_misses = load(&self.cache_misses);
        let count = load(&self.latency_count);
        let avg_us = load(&self.latency_total_us).checked_div(count).unwrap_or(0);
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if cache_hits + cache_misses > 0 {
            cache_hits as f64 / (cache_hits + cache_misses) as f64
        } else {
            0.0
        };

        ProtectionMetrics {
            total_requests: load(&self.total_requests),
            cache_hits,
            cache_misses,
            bloom_rejections,
            null_marker_hits,
            blocked_penetrations: bloom_rejections + null_marker_hits,
            blocked_breakdowns: load(&self.blocked_breakdowns),
            lock_timeouts: load(&self.lock_timeouts),
            circuit_trips,
            circuit_rejections,
            loader_calls: load(&self.loader_calls),
            loader_errors: load(&self.loader_errors),
            null_markers_written: load(&self.null_markers_written),
            fenced_writes: load(&self.fenced_writes),
            store_errors: load(&self.store_errors),
            cancelled: load(&self.cancelled),
            avg_latency: Duration::from_micros(avg_us),
            max_latency: Duration::from_micros(load(&self.latency_max_us)),
            hit_rate,
            last_reset: *self.last_reset.read(),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.total_requests,
            &self.cache_hits,
            &self.cache_misses,
            &self.bloom_rejections,
            &self.null_marker_hits,
            &self.blocked_breakdowns,
            &self.lock_timeouts,
            &self.loader_calls,
            &self.loader_errors,
            &self.null_markers_written,
            &self.fenced_writes,
            &self.store_errors,
            &self.cancelled,
            &self.latency_total_us,
            &self.latency_count,
            &self.latency_max_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.last_reset.write() = Utc::now();
    }
}
