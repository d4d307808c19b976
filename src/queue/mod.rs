//! Durable at-least-once task queue.
//!
//! Tasks are small JSON payloads naming a user. A claim is a lease: if the
//! worker dies before completing, the task becomes claimable again once the
//! lease runs out.

pub mod retry;
pub mod runner;
pub mod store;

pub use retry::RetryPolicy;
pub use runner::{DrainSummary, RunOutcome, TaskRunner};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QueueError, TaskError};

/// A unit of background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    /// Pull new messages, then schedule enrichment.
    SyncUser { user_id: i64 },
    /// Classify one batch; requeues itself while backlog remains.
    EnrichUser { user_id: i64 },
    /// Full-mailbox deletion sweep.
    ReconcileUser { user_id: i64 },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SyncUser { .. } => "sync_user",
            Self::EnrichUser { .. } => "enrich_user",
            Self::ReconcileUser { .. } => "reconcile_user",
        }
    }

    pub fn user_id(&self) -> i64 {
        match self {
            Self::SyncUser { user_id }
            | Self::EnrichUser { user_id }
            | Self::ReconcileUser { user_id } => *user_id,
        }
    }

    /// Whether transient failures go through the backoff policy.
    ///
    /// Reconciliation is expensive and runs on a schedule anyway, so a
    /// failed sweep waits for the next one.
    pub fn retries_on_transient(&self) -> bool {
        !matches!(self, Self::ReconcileUser { .. })
    }
}

/// A claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub id: Uuid,
    pub task: Task,
    /// Deliveries so far, including this one.
    pub attempts: u32,
}

/// Lifecycle state of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Persistent task storage.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Queue a task to run as soon as a worker is free.
    async fn enqueue(&self, task: &Task) -> Result<Uuid, QueueError> {
        self.enqueue_at(task, Utc::now()).await
    }

    /// Queue a task to run no earlier than `run_at`.
    ///
    /// An identical task that is still waiting is reused (and pulled
    /// forward if needed) instead of adding a duplicate.
    async fn enqueue_at(&self, task: &Task, run_at: DateTime<Utc>) -> Result<Uuid, QueueError>;

    /// Lease the next due task, if any.
    async fn claim_next(&self, lease: Duration) -> Result<Option<QueuedTask>, QueueError>;

    async fn complete(&self, id: Uuid) -> Result<(), QueueError>;

    /// Release a claimed task back to the queue, due at `run_at`.
    async fn retry_at(&self, id: Uuid, run_at: DateTime<Utc>, error: &str)
    -> Result<(), QueueError>;

    /// Park a task as permanently failed.
    async fn fail(&self, id: Uuid, error: &str) -> Result<(), QueueError>;

    /// Current status of a task.
    async fn status(&self, id: Uuid) -> Result<Option<TaskStatus>, QueueError>;

    /// Tasks that are queued or leased.
    async fn pending_count(&self) -> Result<u64, QueueError>;
}

/// Executes claimed tasks.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<(), TaskError>;
}
