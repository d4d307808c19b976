//! `TaskQueue` over the `tasks` table of the libSQL backend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Value, params};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, QueueError};
use crate::queue::{QueuedTask, Task, TaskQueue, TaskStatus};
use crate::store::LibSqlBackend;
use crate::store::libsql_backend::count;

/// Fixed-width timestamps so `run_at` and `lease_until` compare as text.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn query_err(op: &str, e: libsql::Error) -> QueueError {
    QueueError::Database(DatabaseError::Query(format!("{op}: {e}")))
}

#[async_trait]
impl TaskQueue for LibSqlBackend {
    async fn enqueue_at(&self, task: &Task, run_at: DateTime<Utc>) -> Result<Uuid, QueueError> {
        let payload = serde_json::to_string(task)?;
        let now = ts(Utc::now());
        let run_at = ts(run_at);

        let _guard = self.write_guard().await;

        let mut rows = self
            .conn()
            .query(
                "SELECT id, attempts FROM tasks WHERE payload = ?1 AND status = 'queued' LIMIT 1",
                params![payload.as_str()],
            )
            .await
            .map_err(|e| query_err("enqueue lookup", e))?;
        let existing: Option<(String, i64)> = match rows
            .next()
            .await
            .map_err(|e| query_err("enqueue lookup", e))?
        {
            Some(row) => Some((
                row.get(0).map_err(|e| query_err("enqueue lookup", e))?,
                row.get(1).map_err(|e| query_err("enqueue lookup", e))?,
            )),
            None => None,
        };
        drop(rows);

        if let Some((existing, attempts)) = existing {
            if attempts > 0 {
                // A queued row that has already run is sitting out a retry
                // backoff; the duplicate must not pull it forward.
                debug!(
                    task = task.name(),
                    user_id = task.user_id(),
                    id = %existing,
                    attempts,
                    "Task already queued, waiting on retry backoff"
                );
            } else {
                self.conn()
                    .execute(
                        "UPDATE tasks SET run_at = MIN(run_at, ?2), updated_at = ?3 WHERE id = ?1",
                        params![existing.as_str(), run_at.as_str(), now.as_str()],
                    )
                    .await
                    .map_err(|e| query_err("enqueue merge", e))?;
                debug!(task = task.name(), user_id = task.user_id(), id = %existing, "Task already queued");
            }
            return Uuid::parse_str(&existing).map_err(|e| {
                QueueError::Database(DatabaseError::Serialization(format!("task id: {e}")))
            });
        }

        let id = Uuid::new_v4();
        self.conn()
            .execute(
                "INSERT INTO tasks (id, name, payload, status, attempts, run_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?5, ?5)",
                params![
                    id.to_string(),
                    task.name(),
                    payload.as_str(),
                    run_at.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(|e| query_err("enqueue", e))?;
        debug!(task = task.name(), user_id = task.user_id(), %id, "Task queued");
        Ok(id)
    }

    async fn claim_next(&self, lease: Duration) -> Result<Option<QueuedTask>, QueueError> {
        let now_dt = Utc::now();
        let now = ts(now_dt);
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero());
        let lease_until = ts(now_dt + lease);

        let _guard = self.write_guard().await;

        let mut rows = self
            .conn()
            .query(
                "SELECT id, payload, attempts, status FROM tasks
                 WHERE (status = 'queued' AND run_at <= ?1)
                    OR (status = 'running' AND lease_until <= ?1)
                 ORDER BY run_at ASC
                 LIMIT 1",
                params![now.as_str()],
            )
            .await
            .map_err(|e| query_err("claim", e))?;
        let Some(row) = rows.next().await.map_err(|e| query_err("claim", e))? else {
            return Ok(None);
        };
        let id_str: String = row.get(0).map_err(|e| query_err("claim", e))?;
        let payload: String = row.get(1).map_err(|e| query_err("claim", e))?;
        let attempts: i64 = row.get(2).map_err(|e| query_err("claim", e))?;
        let status: String = row.get(3).map_err(|e| query_err("claim", e))?;
        drop(rows);

        let id = Uuid::parse_str(&id_str).map_err(|e| {
            QueueError::Database(DatabaseError::Serialization(format!("task id: {e}")))
        })?;
        if status == TaskStatus::Running.as_str() {
            warn!(%id, attempts, "Lease expired, redelivering task");
        }

        let task: Task = match serde_json::from_str(&payload) {
            Ok(t) => t,
            Err(e) => {
                let reason = e.to_string();
                self.conn()
                    .execute(
                        "UPDATE tasks SET status = 'failed', last_error = ?2, lease_until = NULL,
                                updated_at = ?3
                         WHERE id = ?1",
                        params![id_str.as_str(), reason.as_str(), now.as_str()],
                    )
                    .await
                    .map_err(|e| query_err("claim", e))?;
                return Err(QueueError::InvalidPayload { id, reason });
            }
        };

        self.conn()
            .execute(
                "UPDATE tasks SET status = 'running', attempts = attempts + 1, lease_until = ?2,
                        updated_at = ?3
                 WHERE id = ?1",
                params![id_str.as_str(), lease_until.as_str(), now.as_str()],
            )
            .await
            .map_err(|e| query_err("claim", e))?;

        Ok(Some(QueuedTask {
            id,
            task,
            attempts: u32::try_from(attempts + 1).unwrap_or(u32::MAX),
        }))
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        let _guard = self.write_guard().await;
        self.conn()
            .execute(
                "UPDATE tasks SET status = 'done', lease_until = NULL, last_error = NULL,
                        updated_at = ?2
                 WHERE id = ?1",
                params![id.to_string(), ts(Utc::now())],
            )
            .await
            .map_err(|e| query_err("complete", e))?;
        Ok(())
    }

    async fn retry_at(&self, id: Uuid, run_at: DateTime<Utc>, error: &str) -> Result<(), QueueError> {
        let _guard = self.write_guard().await;
        self.conn()
            .execute(
                "UPDATE tasks SET status = 'queued', run_at = ?2, lease_until = NULL,
                        last_error = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id.to_string(), ts(run_at), error, ts(Utc::now())],
            )
            .await
            .map_err(|e| query_err("retry", e))?;
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        let _guard = self.write_guard().await;
        self.conn()
            .execute(
                "UPDATE tasks SET status = 'failed', lease_until = NULL, last_error = ?2,
                        updated_at = ?3
                 WHERE id = ?1",
                params![id.to_string(), error, ts(Utc::now())],
            )
            .await
            .map_err(|e| query_err("fail", e))?;
        Ok(())
    }

    async fn status(&self, id: Uuid) -> Result<Option<TaskStatus>, QueueError> {
        let mut rows = self
            .conn()
            .query("SELECT status FROM tasks WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| query_err("status", e))?;
        let Some(row) = rows.next().await.map_err(|e| query_err("status", e))? else {
            return Ok(None);
        };
        let raw: String = row.get(0).map_err(|e| query_err("status", e))?;
        raw.parse::<TaskStatus>()
            .map(Some)
            .map_err(|e| QueueError::Database(DatabaseError::Serialization(e)))
    }

    async fn pending_count(&self) -> Result<u64, QueueError> {
        Ok(count(
            self.conn(),
            "SELECT COUNT(*) FROM tasks WHERE status IN ('queued', 'running')",
            Vec::<Value>::new(),
        )
        .await?)
    }
}
