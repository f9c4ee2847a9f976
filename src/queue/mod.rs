//! Durable background job queue stored in SQLite.
//!
//! Jobs are rows in the `jobs` table. Each named queue has one worker that
//! receives job ids over a channel and runs every job in its own task, so a
//! long deployment never blocks the rest of its queue. Failed jobs are retried
//! with capped exponential backoff and moved to the dead letter list once they
//! run out of attempts. Pending and interrupted jobs are picked up again when
//! a processor registers after a restart.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::config::QueueSettings;
use crate::db::{DbPool, Job, JobStatus};
use crate::engine::retry::backoff_delay;

pub const DEPLOYMENTS_QUEUE: &str = "deployments";
pub const PIPELINES_QUEUE: &str = "pipelines";
pub const QUALITY_MONITOR_QUEUE: &str = "quality-monitor";

#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Overrides the queue-wide attempt limit
    pub max_attempts: Option<u32>,
    /// Delay before the first attempt
    pub delay: Duration,
}

impl JobOptions {
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: Some(1),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            delay,
        }
    }
}

#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

struct Inner {
    db: DbPool,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
    senders: DashMap<String, mpsc::UnboundedSender<String>>,
    shutdown: watch::Sender<bool>,
}

fn run_at_after(delay: Duration) -> String {
    let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    (chrono::Utc::now() + delay).to_rfc3339()
}

fn delay_until(run_at: &str) -> Duration {
    chrono::DateTime::parse_from_rfc3339(run_at)
        .ok()
        .and_then(|t| (t.with_timezone(&chrono::Utc) - chrono::Utc::now()).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

impl JobQueue {
    pub fn new(db: DbPool, settings: &QueueSettings) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                db,
                max_attempts: settings.max_attempts.max(1),
                backoff_base: Duration::from_millis(settings.backoff_base_ms),
                backoff_cap: Duration::from_millis(settings.backoff_cap_ms),
                senders: DashMap::new(),
                shutdown,
            }),
        }
    }

    /// Persist a job and hand it to the queue's worker once it is due
    pub async fn add_job<T: Serialize>(
        &self,
        queue: &str,
        payload: &T,
        options: JobOptions,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let payload = serde_json::to_string(payload).context("Failed to serialize job payload")?;
        let max_attempts = options.max_attempts.unwrap_or(self.inner.max_attempts).max(1);

        sqlx::query(
            r#"
            INSERT INTO jobs (id, queue, payload, status, attempts, max_attempts, run_at, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', 0, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(queue)
        .bind(&payload)
        .bind(max_attempts as i64)
        .bind(run_at_after(options.delay))
        .bind(&now)
        .bind(&now)
        .execute(&self.inner.db)
        .await
        .context("Failed to enqueue job")?;

        tracing::debug!(job_id = %id, queue = %queue, delay_ms = options.delay.as_millis() as u64, "Job enqueued");
        self.schedule(queue, id.clone(), options.delay);
        Ok(id)
    }

    /// Start the worker for `queue`. Jobs left pending or active by a previous
    /// process are recovered first.
    pub async fn register_processor(
        &self,
        queue: &str,
        processor: Arc<dyn JobProcessor>,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.inner.senders.insert(queue.to_string(), tx);

        let recovered = self.recover(queue).await?;
        if recovered > 0 {
            tracing::info!(queue = %queue, jobs = recovered, "Recovered pending jobs");
        }

        let this = self.clone();
        let queue_name = queue.to_string();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            tracing::info!(queue = %queue_name, "Job worker started");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    next = rx.recv() => match next {
                        Some(job_id) => {
                            let worker = this.clone();
                            let processor = processor.clone();
                            let queue_name = queue_name.clone();
                            tokio::spawn(async move {
                                if let Err(e) = worker.run_job(&queue_name, &job_id, processor).await {
                                    tracing::error!(job_id = %job_id, error = %e, "Job bookkeeping failed");
                                }
                            });
                        }
                        None => break,
                    },
                }
            }
            tracing::info!(queue = %queue_name, "Job worker stopped");
        });

        Ok(())
    }

    /// Stop all workers. Jobs already running finish on their own.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.inner.db)
            .await?;
        Ok(job)
    }

    pub async fn list_dead_letter(&self, queue: Option<&str>) -> Result<Vec<Job>> {
        let jobs = match queue {
            Some(queue) => {
                sqlx::query_as::<_, Job>(
                    "SELECT * FROM jobs WHERE status = 'dead_letter' AND queue = ? ORDER BY updated_at DESC",
                )
                .bind(queue)
                .fetch_all(&self.inner.db)
                .await?
            }
            None => {
                sqlx::query_as::<_, Job>(
                    "SELECT * FROM jobs WHERE status = 'dead_letter' ORDER BY updated_at DESC",
                )
                .fetch_all(&self.inner.db)
                .await?
            }
        };
        Ok(jobs)
    }

    fn schedule(&self, queue: &str, job_id: String, delay: Duration) {
        // Without a worker the row stays pending until one registers
        let Some(sender) = self.inner.senders.get(queue).map(|s| s.clone()) else {
            return;
        };

        if delay.is_zero() {
            let _ = sender.send(job_id);
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = sender.send(job_id);
            });
        }
    }

    async fn recover(&self, queue: &str) -> Result<usize> {
        // Active rows belong to a process that died mid-job
        sqlx::query("UPDATE jobs SET status = 'pending' WHERE queue = ? AND status = 'active'")
            .bind(queue)
            .execute(&self.inner.db)
            .await?;

        let pending: Vec<(String, String)> = sqlx::query_as(
            "SELECT id, run_at FROM jobs WHERE queue = ? AND status = 'pending' ORDER BY run_at",
        )
        .bind(queue)
        .fetch_all(&self.inner.db)
        .await?;

        let count = pending.len();
        for (id, run_at) in pending {
            self.schedule(queue, id, delay_until(&run_at));
        }
        Ok(count)
    }

    async fn run_job(
        &self,
        queue: &str,
        job_id: &str,
        processor: Arc<dyn JobProcessor>,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let claimed = sqlx::query(
            "UPDATE jobs SET status = 'active', attempts = attempts + 1, updated_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(&now)
        .bind(job_id)
        .execute(&self.inner.db)
        .await?;
        if claimed.rows_affected() == 0 {
            // Claimed elsewhere or already finished
            return Ok(());
        }

        let job = self
            .get_job(job_id)
            .await?
            .with_context(|| format!("Job {} disappeared", job_id))?;

        match processor.process(&job).await {
            Ok(()) => {
                self.set_status(job_id, JobStatus::Completed, None, None).await?;
                tracing::debug!(job_id = %job_id, queue = %queue, "Job completed");
            }
            Err(e) => {
                let error = format!("{:#}", e);
                if job.attempts >= job.max_attempts {
                    self.set_status(job_id, JobStatus::DeadLetter, Some(&error), None)
                        .await?;
                    tracing::warn!(
                        job_id = %job_id,
                        queue = %queue,
                        attempts = job.attempts,
                        error = %error,
                        "Job moved to dead letter"
                    );
                } else {
                    let delay = backoff_delay(
                        (job.attempts - 1).max(0) as u32,
                        self.inner.backoff_base,
                        self.inner.backoff_cap,
                    );
                    self.set_status(
                        job_id,
                        JobStatus::Pending,
                        Some(&error),
                        Some(run_at_after(delay)),
                    )
                    .await?;
                    tracing::warn!(
                        job_id = %job_id,
                        queue = %queue,
                        attempt = job.attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %error,
                        "Job failed, retrying"
                    );
                    self.schedule(queue, job_id.to_string(), delay);
                }
            }
        }
        Ok(())
    }

    async fn set_status(
        &self,
        job_id: &str,
        status: JobStatus,
        last_error: Option<&str>,
        run_at: Option<String>,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, last_error = COALESCE(?, last_error), run_at = COALESCE(?, run_at), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(last_error)
        .bind(run_at)
        .bind(&now)
        .bind(job_id)
        .execute(&self.inner.db)
        .await?;
        Ok(())
    }
}
