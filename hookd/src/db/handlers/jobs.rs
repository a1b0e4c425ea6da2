//! Database repository for queued delivery jobs.
//!
//! Claiming uses `SELECT ... FOR UPDATE SKIP LOCKED` so concurrent workers never
//! receive the same job. A claim holds a lease (`locked_until`); if the worker
//! dies mid-job, the job becomes claimable again once the lease expires.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::jobs::{DeliveryJob, DeliveryJobCreateDBRequest};
use crate::types::{JobId, SubscriptionId, abbrev_uuid};

const JOB_COLUMNS: &str = "id, payload, status, attempt_count, max_attempts, base_delay_ms, next_run_at, \
                           locked_until, last_error, delivered_subscriptions, created_at, updated_at";

/// Repository for delivery job operations.
pub struct Jobs<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Jobs<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Insert a new pending job, runnable immediately.
    #[instrument(skip(self, request), err)]
    pub async fn create(&mut self, request: &DeliveryJobCreateDBRequest) -> Result<DeliveryJob> {
        let job = sqlx::query_as::<_, DeliveryJob>(&format!(
            r#"
            INSERT INTO delivery_jobs (payload, max_attempts, base_delay_ms)
            VALUES ($1, $2, $3)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(&request.payload)
        .bind(request.max_attempts)
        .bind(request.base_delay_ms)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(job)
    }

    /// Fail jobs whose lease expired during their final attempt.
    ///
    /// These can't be reclaimed without exceeding `max_attempts`.
    #[instrument(skip(self), err)]
    pub async fn fail_expired_final_attempts(&mut self) -> Result<Vec<JobId>> {
        let ids = sqlx::query_scalar::<_, JobId>(
            r#"
            UPDATE delivery_jobs
            SET
                status = 'failed',
                locked_until = NULL,
                last_error = 'lease expired during final attempt',
                updated_at = now()
            WHERE status = 'processing'
              AND locked_until < now()
              AND attempt_count >= max_attempts
            RETURNING id
            "#,
        )
        .fetch_all(&mut *self.db)
        .await?;

        Ok(ids)
    }

    /// Atomically claim due jobs, starting a new attempt on each.
    ///
    /// Due means pending with `next_run_at` in the past, or processing with an
    /// expired lease.
    #[instrument(skip(self), err)]
    pub async fn claim(&mut self, limit: i64, lease_ms: i64) -> Result<Vec<DeliveryJob>> {
        let jobs = sqlx::query_as::<_, DeliveryJob>(&format!(
            r#"
            UPDATE delivery_jobs
            SET
                status = 'processing',
                attempt_count = attempt_count + 1,
                locked_until = now() + ($2::bigint * interval '1 millisecond'),
                updated_at = now()
            WHERE id IN (
                SELECT id
                FROM delivery_jobs
                WHERE (status = 'pending' AND next_run_at <= now())
                   OR (status = 'processing' AND locked_until < now() AND attempt_count < max_attempts)
                ORDER BY next_run_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(limit)
        .bind(lease_ms)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(jobs)
    }

    /// Push out the lease of a job still held by `attempt`.
    ///
    /// Returns `false` if the job is no longer processing under that attempt.
    #[instrument(skip(self), fields(job_id = %abbrev_uuid(&id)), err)]
    pub async fn extend_lease(&mut self, id: JobId, attempt: i32, lease_ms: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET
                locked_until = now() + ($3::bigint * interval '1 millisecond'),
                updated_at = now()
            WHERE id = $1 AND status = 'processing' AND attempt_count = $2
            "#,
        )
        .bind(id)
        .bind(attempt)
        .bind(lease_ms)
        .execute(&mut *self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark a processing job as succeeded.
    ///
    /// The update is fenced on `attempt`, so a worker whose lease expired and
    /// whose job was reclaimed cannot finish it. Returns `None` in that case.
    #[instrument(skip(self, delivered), fields(job_id = %abbrev_uuid(&id)), err)]
    pub async fn mark_succeeded(
        &mut self,
        id: JobId,
        attempt: i32,
        delivered: &[SubscriptionId],
    ) -> Result<Option<DeliveryJob>> {
        let job = sqlx::query_as::<_, DeliveryJob>(&format!(
            r#"
            UPDATE delivery_jobs
            SET
                status = 'succeeded',
                locked_until = NULL,
                delivered_subscriptions = $3,
                updated_at = now()
            WHERE id = $1 AND status = 'processing' AND attempt_count = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(attempt)
        .bind(delivered)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(job)
    }

    /// Put a processing job back to pending, runnable at `next_run_at`.
    #[instrument(skip(self, error, delivered), fields(job_id = %abbrev_uuid(&id)), err)]
    pub async fn reschedule(
        &mut self,
        id: JobId,
        attempt: i32,
        next_run_at: DateTime<Utc>,
        error: &str,
        delivered: &[SubscriptionId],
    ) -> Result<Option<DeliveryJob>> {
        let job = sqlx::query_as::<_, DeliveryJob>(&format!(
            r#"
            UPDATE delivery_jobs
            SET
                status = 'pending',
                locked_until = NULL,
                next_run_at = $3,
                last_error = $4,
                delivered_subscriptions = $5,
                updated_at = now()
            WHERE id = $1 AND status = 'processing' AND attempt_count = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(attempt)
        .bind(next_run_at)
        .bind(error)
        .bind(delivered)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(job)
    }

    /// Terminally fail a processing job.
    #[instrument(skip(self, error, delivered), fields(job_id = %abbrev_uuid(&id)), err)]
    pub async fn mark_failed(
        &mut self,
        id: JobId,
        attempt: i32,
        error: &str,
        delivered: &[SubscriptionId],
    ) -> Result<Option<DeliveryJob>> {
        let job = sqlx::query_as::<_, DeliveryJob>(&format!(
            r#"
            UPDATE delivery_jobs
            SET
                status = 'failed',
                locked_until = NULL,
                last_error = $3,
                delivered_subscriptions = $4,
                updated_at = now()
            WHERE id = $1 AND status = 'processing' AND attempt_count = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(attempt)
        .bind(error)
        .bind(delivered)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(job)
    }

    /// Get a job by ID.
    #[instrument(skip(self), fields(job_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: JobId) -> Result<Option<DeliveryJob>> {
        let job = sqlx::query_as::<_, DeliveryJob>(&format!("SELECT {JOB_COLUMNS} FROM delivery_jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(job)
    }
}
