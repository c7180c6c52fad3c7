use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Snapshot of the coordinator's counters
///
/// Everything except `pending_events` counts since `last_reset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyStats {
    pub total_events: u64,
    pub processed_events: u64,
    /// Gauge of events accepted but not yet handled; a reset leaves it as is
    pub pending_events: u64,
    pub failed_events: u64,
    /// Events skipped because a newer version had already been applied
    pub stale_events: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    /// Syncs where the source was written but the cache could not be updated
    pub partial_failures: u64,
    pub write_behind_queued: u64,
    pub write_behind_flushed: u64,
    pub write_behind_failures: u64,
    pub refreshes: u64,
    pub total_checks: u64,
    pub consistent_count: u64,
    pub inconsistent_count: u64,
    pub resync_count: u64,
    /// `consistent_count / total_checks`, `1.0` before any check
    pub consistency_rate: f64,
    pub last_audit: Option<DateTime<Utc>>,
    pub last_reset: DateTime<Utc>,
}

impl Default for ConsistencyStats {
    fn default() -> Self {
        Self {
            total_events: 0,
            processed_events: 0,
            pending_events: 0,
            failed_events: 0,
            stale_events: 0,
            successful_syncs: 0,
            failed_syncs: 0,
            partial_failures: 0,
            write_behind_queued: 0,
            write_behind_flushed: 0,
            write_behind_failures: 0,
            refreshes: 0,
            total_checks: 0,
            consistent_count: 0,
            inconsistent_count: 0,
            resync_count: 0,
            consistency_rate: 1.0,
            last_audit: None,
            last_reset: Utc::now(),
        }
    }
}

/// Owner of the live counters; every mutation goes through [`StatsCell::update`]
#[derive(Debug, Default)]
pub(crate) struct StatsCell {
    inner: Mutex<ConsistencyStats>,
}

impl StatsCell {
    pub fn update(&self, f: impl FnOnce(&mut ConsistencyStats)) {
        let mut stats = self.inner.lock();
        f(&mut stats);
        #[allow(clippy::cast_precision_loss)]
        let rate = if stats.total_checks == 0 {
            1.0
        } else {
            (stats.consistent_count as f64 / stats.total_checks as f64).min(1.0)
        };
        stats.consistency_rate = rate;
    }

    pub fn snapshot(&self) -> ConsistencyStats {
        self.inner.lock().clone()
    }

    /// Zero the counters; events still queued stay counted as pending
    pub fn reset(&self) {
        let mut stats = self.inner.lock();
        let pending = stats.pending_events;
        *stats = ConsistencyStats {
            pending_events: pending,
            ..ConsistencyStats::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_tracks_checks_and_starts_at_one() {
        let cell = StatsCell::default();
        assert!((cell.snapshot().consistency_rate - 1.0).abs() < f64::EPSILON);

        cell.update(|s| {
            s.total_checks += 4;
            s.consistent_count += 3;
            s.inconsistent_count += 1;
        });
        assert!((cell.snapshot().consistency_rate - 0.75).abs() < f64::EPSILON);

        cell.update(|s| s.pending_events += 2);
        cell.reset();
        let stats = cell.snapshot();
        assert_eq!(stats.total_checks, 0);
        assert_eq!(stats.pending_events, 2);
        assert!((stats.consistency_rate - 1.0).abs() < f64::EPSILON);
    }
}
