//! Circuit breaker guarding the system of record.
//!
//! Outcomes are counted in a sliding window split into buckets. The breaker trips when
//! the window holds at least `failure_threshold` failures *and* at least
//! `min_requests_to_trip` requests. After `recovery_timeout` the next caller is let
//! through as a trial; trials decide between closing and reopening.

use crate::error::{CacheError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub min_requests_to_trip: u32,
    /// Length of the sliding window
    pub window: Duration,
    /// Number of buckets the window is divided into
    pub buckets: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            min_requests_to_trip: 10,
            window: Duration::from_secs(60),
            buckets: 10,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Admission granted by [`CircuitBreaker::acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Permit {
    /// Regular call while closed; its outcome feeds the window
    Normal,
    /// Trial call while half-open; its outcome decides the next state
    Trial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub window_requests: u32,
    pub window_failures: u32,
    pub trips: u64,
    pub rejections: u64,
}

#[derive(Debug)]
struct Bucket {
    started_at: Instant,
    requests: u32,
    failures: u32,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    buckets: VecDeque<Bucket>,
    opened_at: Option<Instant>,
    trials_in_flight: u32,
}

impl Inner {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.buckets.front()
            && now.duration_since(front.started_at) >= window
        {
            self.buckets.pop_front();
        }
    }

    fn totals(&self) -> (u32, u32) {
        self.buckets.iter().fold((0, 0), |(r, f), b| {
            (r.saturating_add(b.requests), f.saturating_add(b.failures))
        })
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trials_in_flight = 0;
        self.buckets.clear();
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.trials_in_flight = 0;
        self.buckets.clear();
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    bucket_len: Duration,
    inner: Mutex<Inner>,
    trips: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        let bucket_len = config.window / config.buckets.max(1);
        Self {
            bucket_len: bucket_len.max(Duration::from_millis(1)),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                buckets: VecDeque::new(),
                opened_at: None,
                trials_in_flight: 0,
            }),
            trips: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Ask to call the source
    ///
    /// # Errors
    ///
    /// `CircuitOpen` while open and recovering, or while every half-open trial slot is taken.
    pub fn acquire(&self) -> Result<Permit> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::Open => {
                let recovered = inner
                    .opened_at
                    .is_none_or(|at| now.duration_since(at) >= self.config.recovery_timeout);
                if recovered {
                    inner.state = CircuitState::HalfOpen;
                    inner.trials_in_flight = 1;
                    info!("Circuit breaker half-open, admitting trial call");
                    Ok(Permit::Trial)
                } else {
                    drop(inner);
                    self.rejections.fetch_add(1, Ordering::Relaxed);
                    Err(CacheError::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if inner.trials_in_flight < self.config.half_open_max_calls.max(1) {
                    inner.trials_in_flight += 1;
                    Ok(Permit::Trial)
                } else {
                    drop(inner);
                    self.rejections.fetch_add(1, Ordering::Relaxed);
                    Err(CacheError::CircuitOpen)
                }
            }
        }
    }

    pub fn record_success(&self, permit: Permit) {
        self.record(permit, false);
    }

    pub fn record_failure(&self, permit: Permit) {
        self.record(permit, true);
    }

    /// Give a permit back without an outcome (e.g. the call was cancelled)
    pub fn release(&self, permit: Permit) {
        if permit == Permit::Trial {
            let mut inner = self.inner.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
            }
        }
    }

    fn record(&self, permit: Permit, failed: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match (permit, inner.state) {
            (Permit::Trial, CircuitState::HalfOpen) => {
                if failed {
                    inner.open(now);
                    drop(inner);
                    self.trips.fetch_add(1, Ordering::Relaxed);
                    warn!("Circuit breaker trial failed, reopening");
                } else {
                    inner.close();
                    info!("Circuit breaker trial succeeded, closed");
                }
            }
            (Permit::Normal, CircuitState::Closed) => {
                inner.prune(now, self.config.window);
                let needs_bucket = inner
                    .buckets
                    .back()
                    .is_none_or(|back| now.duration_since(back.started_at) >= self.bucket_len);
                if needs_bucket {
                    inner.buckets.push_back(Bucket {
                        started_at: now,
                        requests: 0,
                        failures: 0,
                    });
                }
                if let Some(back) = inner.buckets.back_mut() {
                    back.requests += 1;
                    back.failures += u32::from(failed);
                }
                let (requests, failures) = inner.totals();
                if failed
                    && failures >= self.config.failure_threshold
                    && requests >= self.config.min_requests_to_trip
                {
                    inner.open(now);
                    drop(inner);
                    self.trips.fetch_add(1, Ordering::Relaxed);
                    warn!(requests, failures, "Circuit breaker tripped open");
                }
            }
            // Outcome of a call admitted under a state that has since changed
            _ => {}
        }
    }

    /// Current state; an open breaker reports `Open` until a caller triggers the half-open transition
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        inner.prune(Instant::now(), self.config.window);
        let (window_requests, window_failures) = inner.totals();
        BreakerSnapshot {
            state: inner.state,
            window_requests,
            window_failures,
            trips: self.trips.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Zero the trip and rejection counters; the state machine is left alone
    pub fn reset_counters(&self) {
        self.trips.store(0, Ordering::Relaxed);
        self.rejections.store(0, Ordering::Relaxed);
    }

    /// Force the breaker closed and forget the window
    pub fn reset(&self) {
        self.inner.lock().close();
        self.reset_counters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 5,
            min_requests_to_trip: 10,
            window: Duration::from_secs(60),
            buckets: 6,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        })
    }

    fn call(breaker: &CircuitBreaker, fail: bool) -> Result<()> {
        let permit = breaker.acquire()?;
        if fail {
            breaker.record_failure(permit);
        } else {
            breaker.record_success(permit);
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn never_opens_below_request_floor() {
        let breaker = breaker();
        for _ in 0..9 {
            call(&breaker, true).unwrap_or_else(|e| panic!("{e}"));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        call(&breaker, true).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_rejects_then_half_opens_after_recovery() {
        let breaker = breaker();
        // 12 requests, 6 failures: trips on the 11th, the 12th is rejected
        for i in 0..12 {
            let _ = call(&breaker, i % 2 == 0);
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.trips(), 1);
        assert_eq!(breaker.rejections(), 1);

        assert!(matches!(breaker.acquire(), Err(CacheError::CircuitOpen)));
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(matches!(breaker.acquire(), Err(CacheError::CircuitOpen)));
        assert_eq!(breaker.rejections(), 3);

        tokio::time::advance(Duration::from_secs(2)).await;
        let permit = breaker.acquire().unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(permit, Permit::Trial);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Trial slots are bounded
        assert!(breaker.acquire().is_err());

        breaker.record_success(permit);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens() {
        let breaker = breaker();
        for _ in 0..10 {
            let _ = call(&breaker, true);
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        let permit = breaker.acquire().unwrap_or_else(|e| panic!("{e}"));
        breaker.record_failure(permit);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.trips(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn old_failures_slide_out_of_the_window() {
        let breaker = breaker();
        for _ in 0..4 {
            call(&breaker, true).unwrap_or_else(|e| panic!("{e}"));
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        for _ in 0..10 {
            call(&breaker, false).unwrap_or_else(|e| panic!("{e}"));
        }
        call(&breaker, true).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().window_failures, 1);
    }
}
