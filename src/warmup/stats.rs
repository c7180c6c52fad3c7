use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Progress of the current (or last) warmup run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WarmupProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
    pub pending: usize,
    /// Finished tasks (completed or failed) as a percentage of `total`
    pub rate: f64,
    pub elapsed: Duration,
    pub estimated_remaining: Option<Duration>,
}

#[derive(Debug, Default)]
struct ProgressState {
    total: usize,
    completed: usize,
    failed: usize,
    running: usize,
    started: Option<Instant>,
    finished: Option<Instant>,
}

#[derive(Debug, Default)]
pub(crate) struct ProgressCell {
    inner: Mutex<ProgressState>,
}

impl ProgressCell {
    pub fn begin(&self, total: usize) {
        *self.inner.lock() = ProgressState {
            total,
            started: Some(Instant::now()),
            ..ProgressState::default()
        };
    }

    pub fn task_started(&self) {
        self.inner.lock().running += 1;
    }

    pub fn task_finished(&self, ok: bool) {
        let mut state = self.inner.lock();
        state.running = state.running.saturating_sub(1);
        if ok {
            state.completed += 1;
        } else {
            state.failed += 1;
        }
    }

    pub fn finish(&self) {
        self.inner.lock().finished = Some(Instant::now());
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> WarmupProgress {
        let state = self.inner.lock();
        let done = state.completed + state.failed;
        let pending = state.total.saturating_sub(done + state.running);
        let elapsed = match (state.started, state.finished) {
            (Some(started), Some(finished)) => finished.duration_since(started),
            (Some(started), None) => started.elapsed(),
            _ => Duration::ZERO,
        };
        let rate = if state.total == 0 {
            0.0
        } else {
            done as f64 / state.total as f64 * 100.0
        };
        let remaining = state.total.saturating_sub(done);
        let estimated_remaining = (done > 0).then(|| {
            elapsed
                .checked_div(u32::try_from(done).unwrap_or(u32::MAX))
                .unwrap_or_default()
                .saturating_mul(u32::try_from(remaining).unwrap_or(u32::MAX))
        });
        WarmupProgress {
            total: state.total,
            completed: state.completed,
            failed: state.failed,
            running: state.running,
            pending,
            rate,
            elapsed,
            estimated_remaining,
        }
    }
}

/// Accumulated warmup statistics since the last reset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupStats {
    pub runs: u64,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    /// `(total - failed) / total`, `0.0` before any task ran
    pub success_rate: f64,
    pub avg_task_duration: Duration,
    pub fastest_task: Option<Duration>,
    pub slowest_task: Option<Duration>,
    pub total_items_warmed: u64,
    pub candidates_seen: u64,
    pub hot_entities: u64,
    /// `success_rate * hot_fraction * 100`, hot fraction being hot entities over candidates
    pub estimated_hit_rate_improvement: f64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_reset: DateTime<Utc>,
}

impl Default for WarmupStats {
    fn default() -> Self {
        Self {
            runs: 0,
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            success_rate: 0.0,
            avg_task_duration: Duration::ZERO,
            fastest_task: None,
            slowest_task: None,
            total_items_warmed: 0,
            candidates_seen: 0,
            hot_entities: 0,
            estimated_hit_rate_improvement: 0.0,
            last_run: None,
            last_reset: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct StatsState {
    stats: WarmupStats,
    total_duration: Duration,
    timed_tasks: u32,
}

/// Owner of the live statistics; mutated only through its methods
#[derive(Debug, Default)]
pub(crate) struct WarmupStatsCell {
    inner: Mutex<StatsState>,
}

impl WarmupStatsCell {
    pub fn record_run(&self, candidates: usize, hot: usize) {
        let state = &mut *self.inner.lock();
        state.stats.runs += 1;
        state.stats.candidates_seen += candidates as u64;
        state.stats.hot_entities += hot as u64;
        state.stats.last_run = Some(Utc::now());
        Self::derive(&mut state.stats);
    }

    pub fn record_task(&self, ok: bool, items: u64, duration: Option<Duration>) {
        let state = &mut *self.inner.lock();
        state.stats.total_tasks += 1;
        if ok {
            state.stats.completed_tasks += 1;
            state.stats.total_items_warmed += items;
        } else {
            state.stats.failed_tasks += 1;
        }
        if let Some(duration) = duration {
            state.total_duration += duration;
            state.timed_tasks = state.timed_tasks.saturating_add(1);
            state.stats.avg_task_duration = state
                .total_duration
                .checked_div(state.timed_tasks)
                .unwrap_or_default();
            state.stats.fastest_task = Some(state.stats.fastest_task.map_or(duration, |d| d.min(duration)));
            state.stats.slowest_task = Some(state.stats.slowest_task.map_or(duration, |d| d.max(duration)));
        }
        Self::derive(&mut state.stats);
    }

    #[allow(clippy::cast_precision_loss)]
    fn derive(stats: &mut WarmupStats) {
        stats.success_rate = if stats.total_tasks == 0 {
            0.0
        } else {
            (stats.total_tasks - stats.failed_tasks) as f64 / stats.total_tasks as f64
        };
        let hot_fraction = if stats.candidates_seen == 0 {
            0.0
        } else {
            stats.hot_entities as f64 / stats.candidates_seen as f64
        };
        stats.estimated_hit_rate_improvement = stats.success_rate * hot_fraction * 100.0;
    }

    pub fn snapshot(&self) -> WarmupStats {
        self.inner.lock().stats.clone()
    }

    pub fn reset(&self) {
        *self.inner.lock() = StatsState::default();
    }
}
