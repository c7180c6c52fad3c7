//! Sharded worker pool with bounded queues.
//!
//! Each worker owns one bounded queue. Jobs are routed by a shard hash, so all jobs with
//! the same shard are handled by the same worker in submission order. Shutdown closes
//! the queues and waits for the workers to drain what was already accepted.

use crate::error::{CacheError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What `submit` does when the target queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum BackpressurePolicy {
    /// Wait up to `timeout` for room, then fail with `QueueFull`
    Block { timeout: Duration },
    /// Fail with `QueueFull` immediately
    Reject,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self::Block {
            timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub workers: usize,
    /// Capacity of each worker's queue
    pub queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1000,
            backpressure: BackpressurePolicy::default(),
        }
    }
}

/// Stable shard for any hashable routing key
pub fn shard_of<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Fixed set of workers, one bounded FIFO queue each
pub struct WorkerPool<J> {
    name: &'static str,
    senders: RwLock<Option<Vec<mpsc::Sender<J>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    config: PoolConfig,
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Spawn `config.workers` workers, each running `handler` on its jobs one at a time
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<H, Fut>(name: &'static str, config: PoolConfig, handler: H) -> Self
    where
        H: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let workers = config.workers.max(1);
        let capacity = config.queue_capacity.max(1);
        let handler = Arc::new(handler);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for worker in 0..workers {
            let (tx, mut rx) = mpsc::channel::<J>(capacity);
            let handler = Arc::clone(&handler);
            handles.push(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    handler(job).await;
                }
                debug!(pool = name, worker, "Worker drained and stopped");
            }));
            senders.push(tx);
        }

        info!(pool = name, workers, capacity, "Worker pool started");

        Self {
            name,
            senders: RwLock::new(Some(senders)),
            handles: Mutex::new(handles),
            config: PoolConfig {
                workers,
                queue_capacity: capacity,
                backpressure: config.backpressure,
            },
        }
    }

    fn sender_for(&self, shard: u64) -> Result<mpsc::Sender<J>> {
        let guard = self.senders.read();
        let senders = guard.as_ref().ok_or(CacheError::Shutdown(self.name))?;
        let len = senders.len() as u64;
        let index = usize::try_from(shard % len).unwrap_or(0);
        senders
            .get(index)
            .cloned()
            .ok_or(CacheError::Shutdown(self.name))
    }

    /// Enqueue a job on the worker owning `shard`
    ///
    /// # Errors
    ///
    /// `QueueFull` when the queue stays full under the backpressure policy, `Shutdown`
    /// once [`WorkerPool::shutdown`] has been called.
    pub async fn submit(&self, shard: u64, job: J) -> Result<()> {
        let sender = self.sender_for(shard)?;
        let full = CacheError::QueueFull {
            queue: self.name,
            capacity: self.config.queue_capacity,
        };
        match self.config.backpressure {
            BackpressurePolicy::Reject => match sender.try_send(job) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    warn!(pool = self.name, "Queue full, job rejected");
                    Err(full)
                }
                Err(TrySendError::Closed(_)) => Err(CacheError::Shutdown(self.name)),
            },
            BackpressurePolicy::Block { timeout } => {
                match sender.send_timeout(job, timeout).await {
                    Ok(()) => Ok(()),
                    Err(SendTimeoutError::Timeout(_)) => {
                        warn!(pool = self.name, timeout_ms = timeout.as_millis(), "Queue full after waiting, job rejected");
                        Err(full)
                    }
                    Err(SendTimeoutError::Closed(_)) => Err(CacheError::Shutdown(self.name)),
                }
            }
        }
    }

    /// Jobs accepted but not yet picked up by a worker
    #[must_use]
    pub fn queued(&self) -> usize {
        self.senders.read().as_ref().map_or(0, |senders| {
            senders
                .iter()
                .map(|s| self.config.queue_capacity.saturating_sub(s.capacity()))
                .sum()
        })
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.config.workers
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.senders.read().is_none()
    }

    /// Stop accepting jobs and wait for every accepted job to finish
    pub async fn shutdown(&self) {
        let Some(senders) = self.senders.write().take() else {
            return;
        };
        drop(senders);
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(pool = self.name, error = %e, "Worker ended abnormally");
            }
        }
        info!(pool = self.name, "Worker pool shut down");
    }
}

/// Run `tick` every `period` until `stop` is cancelled
///
/// The first run happens one full period after spawning.
pub(crate) fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    stop: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(task = name, period_ms = period.as_millis(), "Periodic task started");
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
        debug!(task = name, "Periodic task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn same_shard_keeps_submission_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let pool = WorkerPool::spawn("test", PoolConfig::default(), move |n: u32| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(n);
            }
        });
        let shard = shard_of("shop:product:1");
        for n in 0..50 {
            pool.submit(shard, n).await.unwrap_or_else(|e| panic!("{e}"));
        }
        pool.shutdown().await;
        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn reject_policy_fails_fast_when_full() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let worker_gate = Arc::clone(&gate);
        let config = PoolConfig {
            workers: 1,
            queue_capacity: 1,
            backpressure: BackpressurePolicy::Reject,
        };
        let pool = WorkerPool::spawn("reject", config, move |(): ()| {
            let gate = Arc::clone(&worker_gate);
            async move {
                let _ = gate.acquire().await;
            }
        });
        // First job is picked up and blocks; second fills the queue.
        pool.submit(0, ()).await.unwrap_or_else(|e| panic!("{e}"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.submit(0, ()).await.unwrap_or_else(|e| panic!("{e}"));
        let third = pool.submit(0, ()).await;
        assert!(matches!(third, Err(CacheError::QueueFull { capacity: 1, .. })));
        gate.add_permits(10);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn block_policy_times_out() {
        let config = PoolConfig {
            workers: 1,
            queue_capacity: 1,
            backpressure: BackpressurePolicy::Block {
                timeout: Duration::from_millis(30),
            },
        };
        let pool = WorkerPool::spawn("block", config, |(): ()| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
        });
        pool.submit(0, ()).await.unwrap_or_else(|e| panic!("{e}"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.submit(0, ()).await.unwrap_or_else(|e| panic!("{e}"));
        assert!(matches!(
            pool.submit(0, ()).await,
            Err(CacheError::QueueFull { .. })
        ));
    }

    #[tokio::test]
    async fn shutdown_drains_and_refuses_new_work() {
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        let pool = WorkerPool::spawn("drain", PoolConfig::default(), move |(): ()| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        for shard in 0..20 {
            pool.submit(shard, ()).await.unwrap_or_else(|e| panic!("{e}"));
        }
        pool.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 20);
        assert!(pool.is_shut_down());
        assert!(matches!(pool.submit(0, ()).await, Err(CacheError::Shutdown(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_task_ticks_until_cancelled() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let stop = CancellationToken::new();
        let handle = spawn_periodic("ticker", Duration::from_secs(10), stop.clone(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        stop.cancel();
        handle.await.unwrap_or_else(|e| panic!("{e}"));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
