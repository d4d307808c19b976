//! Claims tasks and applies the retry policy to their outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::{QueuedTask, RetryPolicy, Task, TaskHandler, TaskQueue};

/// What happened to one claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing was due.
    Idle,
    Completed(Task),
    Retrying {
        task: Task,
        delay: Duration,
    },
    Failed(Task),
    /// The stored payload could not be decoded; the row was failed.
    Discarded(Uuid),
}

/// Totals from [`TaskRunner::run_until_idle`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
}

pub struct TaskRunner {
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn TaskHandler>,
    policy: RetryPolicy,
    /// Claim lease, also the execution time limit.
    lease: Duration,
}

impl TaskRunner {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        handler: Arc<dyn TaskHandler>,
        policy: RetryPolicy,
        lease: Duration,
    ) -> Self {
        Self {
            queue,
            handler,
            policy,
            lease,
        }
    }

    /// Claim and run at most one task.
    pub async fn run_once(&self) -> Result<RunOutcome, QueueError> {
        let claimed = match self.queue.claim_next(self.lease).await {
            Ok(Some(c)) => c,
            Ok(None) => return Ok(RunOutcome::Idle),
            Err(QueueError::InvalidPayload { id, reason }) => {
                error!(%id, reason = %reason, "Discarding undecodable task");
                return Ok(RunOutcome::Discarded(id));
            }
            Err(e) => return Err(e),
        };
        let QueuedTask { id, task, attempts } = claimed;
        debug!(%id, task = task.name(), user_id = task.user_id(), attempts, "Running task");

        let (message, transient, retry_after) =
            match tokio::time::timeout(self.lease, self.handler.execute(&task)).await {
                Ok(Ok(())) => {
                    self.queue.complete(id).await?;
                    return Ok(RunOutcome::Completed(task));
                }
                Ok(Err(e)) => (e.to_string(), e.is_transient(), e.retry_after()),
                Err(_) => (format!("timed out after {:?}", self.lease), true, None),
            };

        let delay = if transient && task.retries_on_transient() {
            self.policy.next_delay(attempts, retry_after)
        } else {
            None
        };

        match delay {
            Some(delay) => {
                let run_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                warn!(
                    %id,
                    task = task.name(),
                    user_id = task.user_id(),
                    attempts,
                    retry_in_secs = delay.as_secs(),
                    error = %message,
                    "Task failed transiently, retrying"
                );
                self.queue.retry_at(id, run_at, &message).await?;
                Ok(RunOutcome::Retrying { task, delay })
            }
            None => {
                error!(
                    %id,
                    task = task.name(),
                    user_id = task.user_id(),
                    attempts,
                    transient,
                    error = %message,
                    "Task failed"
                );
                self.queue.fail(id, &message).await?;
                Ok(RunOutcome::Failed(task))
            }
        }
    }

    /// Run tasks until nothing is due.
    ///
    /// Tasks scheduled for later (including backoff retries) are left alone.
    pub async fn run_until_idle(&self) -> Result<DrainSummary, QueueError> {
        let mut summary = DrainSummary::default();
        loop {
            match self.run_once().await? {
                RunOutcome::Idle => return Ok(summary),
                RunOutcome::Completed(_) => summary.completed += 1,
                RunOutcome::Retrying { .. } => summary.retried += 1,
                RunOutcome::Failed(_) | RunOutcome::Discarded(_) => summary.failed += 1,
            }
        }
    }

    /// Spawn a worker loop. Returns its handle and a shutdown flag.
    pub fn spawn(
        self: Arc<Self>,
        worker: usize,
        poll_interval: Duration,
    ) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            info!(worker, "Task worker started");
            loop {
                if shutdown.load(Ordering::Relaxed) {
                    info!(worker, "Task worker shutting down");
                    return;
                }
                match self.run_once().await {
                    Ok(RunOutcome::Idle) => tokio::time::sleep(poll_interval).await,
                    Ok(_) => {}
                    Err(e) => {
                        error!(worker, error = %e, "Task queue error");
                        tokio::time::sleep(poll_interval).await;
                    }
                }
            }
        });

        (handle, shutdown_flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AuthError, ProviderError, SyncError, TaskError};
    use crate::queue::TaskStatus;
    use crate::store::LibSqlBackend;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Plays back scripted results, one per call.
    struct Scripted {
        results: Mutex<Vec<Result<(), TaskError>>>,
        calls: Mutex<Vec<Task>>,
    }

    impl Scripted {
        fn new(results: Vec<Result<(), TaskError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TaskHandler for Scripted {
        async fn execute(&self, task: &Task) -> Result<(), TaskError> {
            self.calls.lock().unwrap().push(*task);
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Ok(())
            } else {
                results.remove(0)
            }
        }
    }

    fn throttled() -> TaskError {
        TaskError::Sync(SyncError::Provider(ProviderError::RateLimited {
            service: "gmail".into(),
            retry_after: None,
        }))
    }

    fn runner(queue: Arc<LibSqlBackend>, handler: Arc<Scripted>, base: Duration) -> TaskRunner {
        TaskRunner::new(
            queue,
            handler,
            RetryPolicy::new(base, base * 8, 3),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn success_completes_task() {
        let q = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let id = q.enqueue(&Task::SyncUser { user_id: 1 }).await.unwrap();
        let r = runner(q.clone(), Scripted::new(vec![]), Duration::ZERO);

        assert_eq!(r.run_once().await.unwrap(), RunOutcome::Completed(Task::SyncUser { user_id: 1 }));
        assert_eq!(q.status(id).await.unwrap(), Some(TaskStatus::Done));
        assert_eq!(r.run_once().await.unwrap(), RunOutcome::Idle);
    }

    #[tokio::test]
    async fn transient_failure_is_rescheduled() {
        let q = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let id = q.enqueue(&Task::SyncUser { user_id: 1 }).await.unwrap();
        let r = runner(q.clone(), Scripted::new(vec![Err(throttled())]), Duration::from_secs(60));

        let outcome = r.run_once().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Retrying { delay, .. } if delay >= Duration::from_secs(30)));
        assert_eq!(q.status(id).await.unwrap(), Some(TaskStatus::Queued));
        // Backoff puts it in the future.
        assert_eq!(r.run_once().await.unwrap(), RunOutcome::Idle);
    }

    #[tokio::test]
    async fn retries_stop_at_the_attempt_cap() {
        let q = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let id = q.enqueue(&Task::EnrichUser { user_id: 1 }).await.unwrap();
        let handler = Scripted::new(vec![Err(throttled()), Err(throttled()), Err(throttled())]);
        let r = runner(q.clone(), handler.clone(), Duration::ZERO);

        let summary = r.run_until_idle().await.unwrap();
        assert_eq!(summary, DrainSummary { completed: 0, retried: 2, failed: 1 });
        assert_eq!(handler.calls.lock().unwrap().len(), 3);
        assert_eq!(q.status(id).await.unwrap(), Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let q = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let id = q.enqueue(&Task::SyncUser { user_id: 1 }).await.unwrap();
        let err = TaskError::Auth(AuthError::Expired { user_id: 1 });
        let r = runner(q.clone(), Scripted::new(vec![Err(err)]), Duration::ZERO);

        assert!(matches!(r.run_once().await.unwrap(), RunOutcome::Failed(_)));
        assert_eq!(q.status(id).await.unwrap(), Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn reconcile_does_not_retry_transient_errors() {
        let q = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        q.enqueue(&Task::ReconcileUser { user_id: 1 }).await.unwrap();
        let r = runner(q.clone(), Scripted::new(vec![Err(throttled())]), Duration::ZERO);

        assert!(matches!(r.run_once().await.unwrap(), RunOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn spawned_worker_drains_and_stops() {
        let q = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let id = q.enqueue(&Task::SyncUser { user_id: 4 }).await.unwrap();
        let r = Arc::new(runner(q.clone(), Scripted::new(vec![]), Duration::ZERO));

        let (handle, shutdown) = r.spawn(0, Duration::from_millis(10));
        for _ in 0..100 {
            if q.status(id).await.unwrap() == Some(TaskStatus::Done) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.store(true, Ordering::Relaxed);
        handle.await.unwrap();
        assert_eq!(q.status(id).await.unwrap(), Some(TaskStatus::Done));
    }
}
