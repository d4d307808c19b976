//! Task bodies: what each queued [`Task`] actually does.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::auth::CredentialManager;
use crate::enrich::EnrichmentWorker;
use crate::error::{SyncError, TaskError};
use crate::locks::{LockScope, UserLocks};
use crate::queue::{Task, TaskHandler, TaskQueue};
use crate::store::{Database, User};
use crate::sync::{Reconciler, SyncEngine};

/// Everything a task needs, constructed once at bootstrap.
pub struct TaskContext {
    db: Arc<dyn Database>,
    queue: Arc<dyn TaskQueue>,
    credentials: Arc<CredentialManager>,
    sync: Arc<SyncEngine>,
    reconciler: Arc<Reconciler>,
    enrichment: Arc<EnrichmentWorker>,
    locks: Arc<UserLocks>,
}

impl TaskContext {
    pub fn new(
        db: Arc<dyn Database>,
        queue: Arc<dyn TaskQueue>,
        credentials: Arc<CredentialManager>,
        sync: Arc<SyncEngine>,
        reconciler: Arc<Reconciler>,
        enrichment: Arc<EnrichmentWorker>,
        locks: Arc<UserLocks>,
    ) -> Self {
        Self {
            db,
            queue,
            credentials,
            sync,
            reconciler,
            enrichment,
            locks,
        }
    }

    /// Resolve the task's user. A missing user means the task is moot.
    async fn load_user(&self, task: &Task) -> Result<Option<User>, TaskError> {
        let user = self.db.get_user(task.user_id()).await?;
        if user.is_none() {
            info!(task = task.name(), user_id = task.user_id(), "User not found, nothing to do");
        }
        Ok(user)
    }

    async fn sync_user(&self, user: &User) -> Result<(), TaskError> {
        let Some(guard) = self.locks.try_acquire(LockScope::Sync, user.id) else {
            info!(user_id = user.id, "Sync already in progress, skipping");
            return Ok(());
        };
        let result = self.sync.sync_new_messages(user).await;
        drop(guard);

        let result = result.inspect_err(|e| log_reauth(user.id, e))?;
        debug!(user_id = user.id, fetched = result.fetched, "Scheduling enrichment");
        self.queue.enqueue(&Task::EnrichUser { user_id: user.id }).await?;
        Ok(())
    }

    async fn enrich_user(&self, user: &User) -> Result<(), TaskError> {
        let guard = self.locks.acquire(LockScope::Enrich, user.id).await;
        let outcome = self.enrichment.run_batch(user.id).await;
        drop(guard);

        let outcome = outcome?;
        if outcome.has_backlog() {
            debug!(user_id = user.id, remaining = outcome.remaining, "Backlog remains, requeueing");
            self.queue.enqueue(&Task::EnrichUser { user_id: user.id }).await?;
        }
        Ok(())
    }

    async fn reconcile_user(&self, user: &User) -> Result<(), TaskError> {
        let credential = self
            .credentials
            .obtain_usable_credential(user)
            .await
            .inspect_err(|e| {
                if e.requires_reauth() {
                    warn!(user_id = user.id, error = %e, "User must re-authorize");
                }
            })?;
        let deleted = self
            .reconciler
            .reconcile_deletions(user, &credential)
            .await
            .inspect_err(|e| log_reauth(user.id, e))?;
        debug!(user_id = user.id, deleted, "Reconciliation finished");
        Ok(())
    }
}

fn log_reauth(user_id: i64, e: &SyncError) {
    if let SyncError::Auth(auth) = e
        && auth.requires_reauth()
    {
        warn!(user_id, error = %auth, "User must re-authorize");
    }
}

#[async_trait]
impl TaskHandler for TaskContext {
    async fn execute(&self, task: &Task) -> Result<(), TaskError> {
        let Some(user) = self.load_user(task).await? else {
            return Ok(());
        };
        match task {
            Task::SyncUser { .. } => self.sync_user(&user).await,
            Task::EnrichUser { .. } => self.enrich_user(&user).await,
            Task::ReconcileUser { .. } => self.reconcile_user(&user).await,
        }
    }
}
