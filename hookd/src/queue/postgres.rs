//! PostgreSQL job queue over the `delivery_jobs` table.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, error};

use super::{ClaimedJob, FailOutcome, JobPayload, JobQueue, JobSnapshot, JobStatus, QueueError, RetryPolicy, run_at};
use crate::db::errors::DbError;
use crate::db::handlers::Jobs;
use crate::db::models::jobs::{DeliveryJob, DeliveryJobCreateDBRequest};
use crate::types::{JobId, SubscriptionId};

/// Durable implementation of [`JobQueue`].
///
/// Safe to share between any number of daemons and processes: claims go through
/// `FOR UPDATE SKIP LOCKED`, and every completion is fenced on the attempt
/// number it was claimed with.
#[derive(Clone)]
pub struct PostgresJobQueue {
    pool: PgPool,
    claim_timeout: Duration,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool, claim_timeout: Duration) -> Self {
        Self { pool, claim_timeout }
    }

    fn lease_ms(&self) -> i64 {
        i64::try_from(self.claim_timeout.as_millis()).unwrap_or(i64::MAX)
    }
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn policy_of(job: &DeliveryJob) -> RetryPolicy {
    RetryPolicy {
        max_attempts: to_u32(job.max_attempts),
        base_delay: Duration::from_millis(u64::try_from(job.base_delay_ms).unwrap_or(0)),
    }
}

impl From<DeliveryJob> for ClaimedJob {
    fn from(job: DeliveryJob) -> Self {
        let policy = policy_of(&job);
        Self {
            id: job.id,
            payload: job.payload,
            attempt: to_u32(job.attempt_count),
            policy,
            delivered: job.delivered_subscriptions,
        }
    }
}

impl TryFrom<DeliveryJob> for JobSnapshot {
    type Error = QueueError;

    fn try_from(job: DeliveryJob) -> Result<Self, Self::Error> {
        let status = job
            .status
            .parse::<JobStatus>()
            .map_err(|e| QueueError::Database(DbError::Other(anyhow::anyhow!(e))))?;

        Ok(Self {
            id: job.id,
            payload: job.payload,
            status,
            attempt_count: to_u32(job.attempt_count),
            max_attempts: to_u32(job.max_attempts),
            next_run_at: job.next_run_at,
            last_error: job.last_error,
            delivered: job.delivered_subscriptions,
        })
    }
}

fn attempt_of(job: &ClaimedJob) -> i32 {
    i32::try_from(job.attempt).unwrap_or(i32::MAX)
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(&self, payload: &JobPayload, policy: &RetryPolicy) -> Result<JobId, QueueError> {
        let request = DeliveryJobCreateDBRequest {
            payload: serde_json::to_value(payload)?,
            max_attempts: i32::try_from(policy.max_attempts).unwrap_or(i32::MAX),
            base_delay_ms: i64::try_from(policy.base_delay.as_millis()).unwrap_or(i64::MAX),
        };

        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let job = Jobs::new(&mut conn).create(&request).await?;
        Ok(job.id)
    }

    async fn dequeue(&self, limit: usize) -> Result<Vec<ClaimedJob>, QueueError> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut jobs = Jobs::new(&mut conn);

        for id in jobs.fail_expired_final_attempts().await? {
            error!(job_id = %id, "Job lease expired during final attempt, marking failed");
        }

        let lease_ms = self.lease_ms();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let claimed: Vec<ClaimedJob> = jobs
            .claim(limit, lease_ms)
            .await?
            .into_iter()
            .map(ClaimedJob::from)
            .collect();

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "Claimed jobs");
        }
        Ok(claimed)
    }

    async fn extend_lease(&self, job: &ClaimedJob) -> Result<(), QueueError> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let held = Jobs::new(&mut conn)
            .extend_lease(job.id, attempt_of(job), self.lease_ms())
            .await?;

        if !held {
            return Err(QueueError::JobNotFound(job.id));
        }
        Ok(())
    }

    async fn complete(&self, job: &ClaimedJob, delivered: &[SubscriptionId]) -> Result<(), QueueError> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        Jobs::new(&mut conn)
            .mark_succeeded(job.id, attempt_of(job), delivered)
            .await?
            .ok_or(QueueError::JobNotFound(job.id))?;
        Ok(())
    }

    async fn fail(
        &self,
        job: &ClaimedJob,
        error: &str,
        delivered: &[SubscriptionId],
    ) -> Result<FailOutcome, QueueError> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut jobs = Jobs::new(&mut conn);

        if job.is_final_attempt() {
            jobs.mark_failed(job.id, attempt_of(job), error, delivered)
                .await?
                .ok_or(QueueError::JobNotFound(job.id))?;
            error!(job_id = %job.id, attempts = job.attempt, error, "Job failed after final attempt");
            return Ok(FailOutcome::Exhausted);
        }

        let delay = job.policy.delay_for(job.attempt);
        let next_run_at = run_at(delay);
        jobs.reschedule(job.id, attempt_of(job), next_run_at, error, delivered)
            .await?
            .ok_or(QueueError::JobNotFound(job.id))?;

        Ok(FailOutcome::Retrying { next_run_at, delay })
    }

    async fn reject(&self, job: &ClaimedJob, reason: &str) -> Result<(), QueueError> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        Jobs::new(&mut conn)
            .mark_failed(job.id, attempt_of(job), reason, &job.delivered)
            .await?
            .ok_or(QueueError::JobNotFound(job.id))?;

        error!(job_id = %job.id, reason, "Job rejected");
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobSnapshot>, QueueError> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        Jobs::new(&mut conn)
            .get_by_id(id)
            .await?
            .map(JobSnapshot::try_from)
            .transpose()
    }
}
