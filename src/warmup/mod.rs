//! Warmup Orchestrator
//!
//! Pre-loads hot entities before traffic asks for them. Each strategy's candidates are
//! scored by a [`HotDataIdentifier`]; every hot entity becomes one [`WarmupTask`].
//! Tasks run highest priority first, in batches of `batch_size`, with at most
//! `max_concurrency` loads in flight. A failing entity is counted and its batch carries on.

mod hot;
mod stats;
mod strategy;
mod task;

pub use hot::{HotDataConfig, HotDataIdentifier, HotEntity, MAX_SIGNAL, Priority};
pub use stats::{WarmupProgress, WarmupStats};
pub use strategy::{EntityMetrics, WarmupSource, WarmupStrategy};
pub use task::{TaskStatus, WarmupTask};

use crate::error::{CacheError, Result};
use crate::keys::{KeyBuilder, TtlTable};
use crate::pool::spawn_periodic;
use crate::shield::{JitteredTtl, ProtectionShield, TtlJitterConfig};
use crate::store::{CacheMode, CacheStore};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use stats::{ProgressCell, WarmupStatsCell};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupConfig {
    /// Strategies run by `warmup_all` and by the scheduler
    pub strategies: Vec<WarmupStrategy>,
    pub batch_size: usize,
    /// Loads in flight at once within a batch
    pub max_concurrency: usize,
    /// Upper bound on a single entity load
    pub load_timeout: Duration,
    pub hot: HotDataConfig,
    /// Spread of warmed TTLs, so entries warmed together do not expire together
    pub ttl: TtlJitterConfig,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            strategies: WarmupStrategy::ALL.to_vec(),
            batch_size: 10,
            max_concurrency: 5,
            load_timeout: Duration::from_secs(10),
            hot: HotDataConfig::default(),
            ttl: TtlJitterConfig::default(),
        }
    }
}

/// Clears the running flag when a run ends, however it ends
struct RunGuard {
    inner: Arc<Inner>,
    cancel: CancellationToken,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
    }
}

struct Inner {
    mode: CacheMode,
    keys: KeyBuilder,
    source: Arc<dyn WarmupSource>,
    ttl_table: Arc<TtlTable>,
    jitter: JitteredTtl,
    shield: Option<Arc<ProtectionShield>>,
    identifier: HotDataIdentifier,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    progress: ProgressCell,
    stats: WarmupStatsCell,
    last_tasks: RwLock<Vec<WarmupTask>>,
    config: WarmupConfig,
}

pub struct WarmupOrchestrator {
    inner: Arc<Inner>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
}

impl WarmupOrchestrator {
    #[must_use]
    pub fn new(
        mode: CacheMode,
        keys: KeyBuilder,
        source: Arc<dyn WarmupSource>,
        ttl_table: Arc<TtlTable>,
        shield: Option<Arc<ProtectionShield>>,
        config: WarmupConfig,
    ) -> Self {
        info!(
            strategies = config.strategies.len(),
            batch_size = config.batch_size,
            max_concurrency = config.max_concurrency,
            "Warmup orchestrator initialized"
        );
        Self {
            inner: Arc::new(Inner {
                mode,
                keys,
                source,
                ttl_table,
                jitter: JitteredTtl::new(config.ttl.clone()),
                shield,
                identifier: HotDataIdentifier::new(config.hot.clone()),
                running: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
                progress: ProgressCell::default(),
                stats: WarmupStatsCell::default(),
                last_tasks: RwLock::new(Vec::new()),
                config,
            }),
            scheduler: Mutex::new(None),
            stop: CancellationToken::new(),
        }
    }

    /// Warm every configured strategy; returns once all tasks have finished
    ///
    /// A strategy whose candidates cannot be listed is skipped and logged.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if another run is in progress, `Cancelled` if
    /// [`WarmupOrchestrator::cancel`] is called mid-run.
    pub async fn warmup_all(&self) -> Result<WarmupProgress> {
        let guard = Inner::begin(&self.inner)?;
        let strategies = self.inner.config.strategies.clone();
        Inner::run(&guard, &strategies, false).await
    }

    /// Warm a single strategy; returns once all its tasks have finished
    ///
    /// # Errors
    ///
    /// `Source` if the candidates cannot be listed, otherwise as
    /// [`WarmupOrchestrator::warmup_all`].
    pub async fn warmup_strategy(&self, strategy: WarmupStrategy) -> Result<WarmupProgress> {
        let guard = Inner::begin(&self.inner)?;
        Inner::run(&guard, &[strategy], true).await
    }

    /// Start a run in the background and return immediately
    ///
    /// `None` warms every configured strategy. Progress is available through
    /// [`WarmupOrchestrator::get_progress`].
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if another run is in progress.
    pub fn start_async(
        &self,
        strategy: Option<WarmupStrategy>,
    ) -> Result<JoinHandle<Result<WarmupProgress>>> {
        let guard = Inner::begin(&self.inner)?;
        let (strategies, strict) = match strategy {
            Some(strategy) => (vec![strategy], true),
            None => (self.inner.config.strategies.clone(), false),
        };
        Ok(tokio::spawn(async move {
            Inner::run(&guard, &strategies, strict).await
        }))
    }

    /// Run `warmup_all` every `interval`; ticks that find a run in progress are skipped
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if the scheduler is already started.
    pub fn start_scheduler(&self, interval: Duration) -> Result<()> {
        let mut scheduler = self.scheduler.lock();
        if scheduler.is_some() {
            return Err(CacheError::AlreadyRunning("warmup scheduler"));
        }
        let inner = Arc::clone(&self.inner);
        *scheduler = Some(spawn_periodic(
            "warmup-scheduler",
            interval,
            self.stop.clone(),
            move || {
                let inner = Arc::clone(&inner);
                async move {
                    match Inner::begin(&inner) {
                        Ok(guard) => {
                            let strategies = inner.config.strategies.clone();
                            if let Err(e) = Inner::run(&guard, &strategies, false).await {
                                warn!(error = %e, "Scheduled warmup did not finish");
                            }
                        }
                        Err(e) => debug!(error = %e, "Skipping scheduled warmup"),
                    }
                }
            },
        ));
        Ok(())
    }

    /// Cancel the run in progress, if any; tasks not yet started are dropped
    pub fn cancel(&self) {
        self.inner.cancel.lock().cancel();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn get_progress(&self) -> WarmupProgress {
        self.inner.progress.snapshot()
    }

    #[must_use]
    pub fn get_stats(&self) -> WarmupStats {
        self.inner.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.inner.stats.reset();
        info!("[Warmup] Statistics reset");
    }

    /// Tasks of the most recent run, in execution order
    #[must_use]
    pub fn last_run_tasks(&self) -> Vec<WarmupTask> {
        self.inner.last_tasks.read().clone()
    }

    #[must_use]
    pub fn identifier(&self) -> &HotDataIdentifier {
        &self.inner.identifier
    }

    /// Stop the scheduler and cancel any run in progress
    pub async fn shutdown(&self) {
        self.stop.cancel();
        self.cancel();
        let handle = self.scheduler.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Warmup scheduler ended abnormally");
        }
        info!("Warmup orchestrator shut down");
    }
}

impl Inner {
    fn begin(this: &Arc<Self>) -> Result<RunGuard> {
        if this.running.swap(true, Ordering::AcqRel) {
            return Err(CacheError::AlreadyRunning("warmup"));
        }
        let cancel = CancellationToken::new();
        *this.cancel.lock() = cancel.clone();
        Ok(RunGuard {
            inner: Arc::clone(this),
            cancel,
        })
    }

    /// Build the prioritized task list; `strict` turns a candidate error into a failure
    async fn plan(&self, strategies: &[WarmupStrategy], strict: bool) -> Result<Vec<WarmupTask>> {
        let mut tasks = Vec::new();
        let (mut candidates_seen, mut hot_seen) = (0usize, 0usize);
        let now = Utc::now();

        for &strategy in strategies {
            let candidates = match self.source.candidates(strategy).await {
                Ok(candidates) => candidates,
                Err(e) if strict => return Err(CacheError::Source(e)),
                Err(e) => {
                    error!(strategy = strategy.as_str(), error = %e, "Could not list warmup candidates");
                    continue;
                }
            };
            candidates_seen += candidates.len();
            let hot = self.identifier.identify(candidates, now);
            hot_seen += hot.len();
            info!(strategy = strategy.as_str(), hot = hot.len(), "Identified hot entities");
            tasks.extend(hot.into_iter().map(|entity| {
                WarmupTask::new(strategy, entity.priority, vec![entity.metrics.id], entity.score)
            }));
        }

        // Stable, so each strategy keeps its score order within a tier
        tasks.sort_by_key(|task| std::cmp::Reverse(task.priority()));
        self.stats.record_run(candidates_seen, hot_seen);
        Ok(tasks)
    }

    async fn run(guard: &RunGuard, strategies: &[WarmupStrategy], strict: bool) -> Result<WarmupProgress> {
        let this = &guard.inner;
        let store = match &this.mode {
            CacheMode::Disabled => {
                debug!("Cache disabled, nothing to warm");
                this.progress.begin(0);
                this.progress.finish();
                return Ok(this.progress.snapshot());
            }
            CacheMode::Enabled(store) => store.clone(),
        };

        let tasks = this.plan(strategies, strict).await?;
        let batch_size = this.config.batch_size.max(1);
        this.progress.begin(tasks.len());
        info!(tasks = tasks.len(), batches = tasks.len().div_ceil(batch_size), "Warmup started");

        let semaphore = Arc::new(Semaphore::new(this.config.max_concurrency.max(1)));
        let mut finished = Vec::with_capacity(tasks.len());
        let mut pending = tasks.into_iter();

        loop {
            let batch: Vec<WarmupTask> = pending.by_ref().take(batch_size).collect();
            if batch.is_empty() || guard.cancel.is_cancelled() {
                break;
            }
            let mut set = JoinSet::new();
            let mut spawned = HashMap::with_capacity(batch.len());
            for (slot, task) in batch.into_iter().enumerate() {
                let inner = Arc::clone(this);
                let store = store.clone();
                let semaphore = Arc::clone(&semaphore);
                let cancel = guard.cancel.clone();
                let copy = task.clone();
                let handle = set.spawn(async move {
                    let task = match semaphore.acquire_owned().await {
                        Ok(_permit) => inner.execute(&store, task, &cancel).await,
                        Err(_) => task,
                    };
                    (slot, task)
                });
                spawned.insert(handle.id(), (slot, copy));
            }
            let mut done: Vec<(usize, WarmupTask)> = Vec::with_capacity(set.len());
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(entry) => done.push(entry),
                    Err(e) => {
                        error!(error = %e, "Warmup task panicked");
                        if let Some((slot, task)) = spawned.remove(&e.id()) {
                            done.push((slot, this.abandon(task, &e)));
                        }
                    }
                }
            }
            done.sort_by_key(|(slot, _)| *slot);
            finished.extend(done.into_iter().map(|(_, task)| task));
        }

        this.progress.finish();
        *this.last_tasks.write() = finished;
        let progress = this.progress.snapshot();
        if guard.cancel.is_cancelled() {
            warn!(completed = progress.completed, total = progress.total, "Warmup cancelled");
            return Err(CacheError::Cancelled);
        }
        info!(
            completed = progress.completed,
            failed = progress.failed,
            elapsed_ms = progress.elapsed.as_millis(),
            "Warmup finished"
        );
        Ok(progress)
    }

    /// Run one task to a terminal state; never fails the batch
    async fn execute(&self, store: &CacheStore, mut task: WarmupTask, cancel: &CancellationToken) -> WarmupTask {
        if cancel.is_cancelled() || task.start().is_err() {
            return task;
        }
        self.progress.task_started();

        let loaded = tokio::select! {
            () = cancel.cancelled() => Err(CacheError::Cancelled),
            result = tokio::time::timeout(self.config.load_timeout, self.warm(store, &task)) => {
                result.unwrap_or_else(|_| Err(CacheError::Source(anyhow::anyhow!(
                    "load timed out after {:?}",
                    self.config.load_timeout
                ))))
            }
        };

        let ok = match loaded {
            Ok(items) => task.complete(items).is_ok(),
            Err(e) => {
                warn!(task = %task.id(), strategy = task.strategy().as_str(), error = %e, "Warmup task failed");
                // Running -> Failed is always allowed here
                let _ = task.fail(e.to_string());
                false
            }
        };
        self.progress.task_finished(ok);
        self.stats.record_task(ok, task.items_warmed(), task.duration());
        task
    }

    /// Record a task whose worker died mid-run as failed
    fn abandon(&self, mut task: WarmupTask, cause: &tokio::task::JoinError) -> WarmupTask {
        // A fresh copy is Pending, so both transitions succeed
        let _ = task.start();
        let _ = task.fail(format!("warmup task aborted: {cause}"));
        self.progress.task_finished(false);
        self.stats.record_task(false, 0, task.duration());
        task
    }

    /// Load and cache every entity of a task, returning how many were cached
    async fn warm(&self, store: &CacheStore, task: &WarmupTask) -> Result<u64> {
        let strategy = task.strategy();
        let base = self.ttl_table.ttl_for(strategy.category());
        let mut warmed = 0;
        for id in task.entity_ids() {
            let key = self.keys.entity(strategy.entity_kind(), id)?;
            let Some(record) = self
                .source
                .load(strategy, id)
                .await
                .map_err(CacheError::Source)?
            else {
                debug!(key = %key, "Warmup candidate vanished from source");
                continue;
            };
            store.set(&key, &record, Some(self.jitter.sample(base))).await?;
            if let Some(shield) = &self.shield {
                shield.register_existing(std::iter::once(&key));
            }
            warmed += 1;
        }
        Ok(warmed)
    }
}
