use super::hot::Priority;
use super::strategy::WarmupStrategy;
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// `Pending → Running → Completed | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One unit of warmup work, owned by the worker executing it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupTask {
    id: Uuid,
    strategy: WarmupStrategy,
    priority: Priority,
    entity_ids: Vec<String>,
    score: f64,
    status: TaskStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    items_warmed: u64,
    error: Option<String>,
}

impl WarmupTask {
    #[must_use]
    pub fn new(strategy: WarmupStrategy, priority: Priority, entity_ids: Vec<String>, score: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy,
            priority,
            entity_ids,
            score,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            items_warmed: 0,
            error: None,
        }
    }

    fn transition(&mut self, to: TaskStatus) -> Result<()> {
        let allowed = matches!(
            (self.status, to),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed | TaskStatus::Failed)
        );
        if !allowed {
            return Err(CacheError::InvalidTransition {
                from: self.status.as_str(),
                to: to.as_str(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// # Errors
    ///
    /// `InvalidTransition` unless the task is `Pending`.
    pub fn start(&mut self) -> Result<()> {
        self.transition(TaskStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// # Errors
    ///
    /// `InvalidTransition` unless the task is `Running`.
    pub fn complete(&mut self, items_warmed: u64) -> Result<()> {
        self.transition(TaskStatus::Completed)?;
        self.items_warmed = items_warmed;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// # Errors
    ///
    /// `InvalidTransition` unless the task is `Running`.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn strategy(&self) -> WarmupStrategy {
        self.strategy
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[must_use]
    pub fn entity_ids(&self) -> &[String] {
        &self.entity_ids
    }

    #[must_use]
    pub fn score(&self) -> f64 {
        self.score
    }

    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn items_warmed(&self) -> u64 {
        self.items_warmed
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Time between start and finish, once the task is terminal
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        let (started, finished) = (self.started_at?, self.finished_at?);
        (finished - started).to_std().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> WarmupTask {
        WarmupTask::new(WarmupStrategy::HotProducts, Priority::High, vec!["1".into()], 1.8)
    }

    #[test]
    fn follows_the_happy_path() {
        let mut task = task();
        assert_eq!(task.status(), TaskStatus::Pending);
        task.start().unwrap_or_else(|e| panic!("{e}"));
        task.complete(1).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(task.status(), TaskStatus::Completed);
        assert!(task.status().is_terminal());
        assert_eq!(task.items_warmed(), 1);
        assert!(task.duration().is_some());
    }

    #[test]
    fn rejects_illegal_transitions() {
        let mut pending = task();
        assert!(matches!(
            pending.complete(1),
            Err(CacheError::InvalidTransition { from: "pending", to: "completed" })
        ));

        let mut failed = task();
        failed.start().unwrap_or_else(|e| panic!("{e}"));
        failed.fail("source timeout").unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(failed.error(), Some("source timeout"));
        assert!(failed.start().is_err());
        assert!(failed.complete(1).is_err());
        assert_eq!(failed.status(), TaskStatus::Failed);
    }
}
