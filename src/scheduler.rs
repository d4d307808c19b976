//! Cron-driven fan-out of periodic per-user tasks.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::ScheduleConfig;
use crate::error::{ConfigError, TaskError};
use crate::queue::{Task, TaskQueue};
use crate::store::Database;

/// How often the ticker checks whether a job is due.
const TICK: Duration = Duration::from_secs(1);

/// One recurring job: a schedule plus the task it fans out per user.
struct CronJob {
    name: &'static str,
    schedule: Schedule,
    next: Option<DateTime<Utc>>,
    make: fn(i64) -> Task,
}

impl CronJob {
    fn new(
        name: &'static str,
        key: &str,
        expr: &str,
        make: fn(i64) -> Task,
        now: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        let schedule = Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        let next = schedule.after(&now).next();
        Ok(Self {
            name,
            schedule,
            next,
            make,
        })
    }

    /// True when the job is due at `now`. Advances to the following slot,
    /// so missed slots collapse into one firing.
    fn poll(&mut self, now: DateTime<Utc>) -> bool {
        match self.next {
            Some(due) if due <= now => {
                self.next = self.schedule.after(&now).next();
                true
            }
            _ => false,
        }
    }
}

pub struct Scheduler {
    db: Arc<dyn Database>,
    queue: Arc<dyn TaskQueue>,
    jobs: Vec<CronJob>,
}

impl Scheduler {
    pub fn new(
        db: Arc<dyn Database>,
        queue: Arc<dyn TaskQueue>,
        config: &ScheduleConfig,
    ) -> Result<Self, ConfigError> {
        let now = Utc::now();
        let jobs = vec![
            CronJob::new(
                "sync",
                "SYNC_SCHEDULE",
                &config.sync,
                |user_id| Task::SyncUser { user_id },
                now,
            )?,
            CronJob::new(
                "reconcile",
                "RECONCILE_SCHEDULE",
                &config.reconcile,
                |user_id| Task::ReconcileUser { user_id },
                now,
            )?,
        ];
        for job in &jobs {
            info!(job = job.name, next = ?job.next, "Scheduled job registered");
        }
        Ok(Self { db, queue, jobs })
    }

    /// Queue `make(user_id)` for every known user.
    pub async fn enqueue_for_all(&self, make: fn(i64) -> Task) -> Result<usize, TaskError> {
        let user_ids = self.db.list_user_ids().await?;
        for user_id in &user_ids {
            self.queue.enqueue(&make(*user_id)).await?;
        }
        Ok(user_ids.len())
    }

    /// Fire every job due at `now`. Returns the names of the jobs fired.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<&'static str> {
        let mut fired = Vec::new();
        let due: Vec<(&'static str, fn(i64) -> Task)> = self
            .jobs
            .iter_mut()
            .filter_map(|job| job.poll(now).then_some((job.name, job.make)))
            .collect();

        for (name, make) in due {
            match self.enqueue_for_all(make).await {
                Ok(users) => info!(job = name, users, "Scheduled job fired"),
                Err(e) => error!(job = name, error = %e, "Scheduled job failed to enqueue"),
            }
            fired.push(name);
        }
        fired
    }

    /// Spawn the ticker. Returns its handle and a shutdown flag.
    pub fn spawn(mut self) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    info!("Scheduler shutting down");
                    return;
                }
                self.tick(Utc::now()).await;
            }
        });

        (handle, shutdown_flag)
    }
}
