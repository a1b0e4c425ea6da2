//! Durable delivery job queue.
//!
//! One job is enqueued per ingested event. The queue owns retry scheduling:
//! consumers claim jobs with [`JobQueue::dequeue`], run them, and report back
//! with [`JobQueue::complete`], [`JobQueue::fail`] or [`JobQueue::reject`].
//!
//! ```text
//!             dequeue                complete
//!  pending ───────────▶ processing ───────────▶ succeeded
//!     ▲                    │  │
//!     │   fail (retrying)  │  │ fail (exhausted) / reject
//!     └────────────────────┘  └──────────────────────────▶ failed
//! ```
//!
//! Every claim takes a lease, which the consumer renews with
//! [`JobQueue::extend_lease`] for as long as the attempt runs. A `processing`
//! job whose lease has expired is treated as abandoned by a crashed worker and
//! may be claimed again, which is where at-least-once delivery comes from. The
//! abandoned attempt still counts towards `max_attempts`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::QueueConfig;
use crate::db::errors::DbError;
use crate::types::{EventId, JobId, SubscriptionId};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryJobQueue;
pub use postgres::PostgresJobQueue;

/// Current version of the serialized [`JobPayload`].
pub const JOB_SCHEMA_VERSION: u16 = 1;

/// The record carried by every delivery job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobPayload {
    pub version: u16,
    pub event_id: EventId,
    pub event_type: String,
}

impl JobPayload {
    pub fn new(event_id: EventId, event_type: impl Into<String>) -> Self {
        Self {
            version: JOB_SCHEMA_VERSION,
            event_id,
            event_type: event_type.into(),
        }
    }

    /// Validate and decode a raw job payload.
    pub fn decode(value: &serde_json::Value) -> Result<Self, QueueError> {
        let payload: JobPayload = serde_json::from_value(value.clone()).map_err(|e| QueueError::MalformedJob {
            job_id: None,
            reason: e.to_string(),
        })?;

        if payload.version != JOB_SCHEMA_VERSION {
            return Err(QueueError::MalformedJob {
                job_id: None,
                reason: format!("unsupported payload version {}", payload.version),
            });
        }
        if payload.event_type.trim().is_empty() {
            return Err(QueueError::MalformedJob {
                job_id: None,
                reason: "event_type is empty".to_string(),
            });
        }

        Ok(payload)
    }
}

/// How many times a job runs and how long to wait between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    /// Delay before the run following failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

impl From<&QueueConfig> for RetryPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// A job held by a consumer for the duration of one attempt.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: JobId,
    pub payload: serde_json::Value,
    /// 1-based number of this attempt.
    pub attempt: u32,
    pub policy: RetryPolicy,
    /// Subscriptions already delivered by earlier attempts.
    pub delivered: Vec<SubscriptionId>,
}

impl ClaimedJob {
    /// Decode the job's payload, tagging errors with the job ID.
    pub fn payload(&self) -> Result<JobPayload, QueueError> {
        JobPayload::decode(&self.payload).map_err(|e| match e {
            QueueError::MalformedJob { reason, .. } => QueueError::MalformedJob {
                job_id: Some(self.id),
                reason,
            },
            other => other,
        })
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.policy.max_attempts
    }
}

/// Wall-clock time `delay` from now, saturating far in the future.
pub(crate) fn run_at(delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| Utc::now().checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Rescheduled; claimable again at `next_run_at`.
    Retrying { next_run_at: DateTime<Utc>, delay: Duration },
    /// No attempts left; the job is terminally failed.
    Exhausted,
}

/// Point-in-time view of a job.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub id: JobId,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub delivered: Vec<SubscriptionId>,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue storage error: {0}")]
    Database(#[from] DbError),

    #[error("Malformed job payload: {reason}")]
    MalformedJob { job_id: Option<JobId>, reason: String },

    /// The job doesn't exist, or is not held in `processing` by this attempt.
    #[error("Job {0} not found or not held")]
    JobNotFound(JobId),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A durable, at-least-once job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Persist a new job, runnable immediately.
    async fn enqueue(&self, payload: &JobPayload, policy: &RetryPolicy) -> Result<JobId, QueueError>;

    /// Claim up to `limit` due jobs, starting a new attempt on each.
    async fn dequeue(&self, limit: usize) -> Result<Vec<ClaimedJob>, QueueError>;

    /// Renew the lease on a job this attempt still holds.
    ///
    /// Fails with [`QueueError::JobNotFound`] once the job was finished or
    /// reclaimed by a later attempt.
    async fn extend_lease(&self, job: &ClaimedJob) -> Result<(), QueueError>;

    /// Mark the attempt successful. The job is finished.
    async fn complete(&self, job: &ClaimedJob, delivered: &[SubscriptionId]) -> Result<(), QueueError>;

    /// Record a failed attempt and reschedule per the job's policy.
    async fn fail(&self, job: &ClaimedJob, error: &str, delivered: &[SubscriptionId])
    -> Result<FailOutcome, QueueError>;

    /// Terminally fail a job that can never succeed, regardless of attempts left.
    async fn reject(&self, job: &ClaimedJob, reason: &str) -> Result<(), QueueError>;

    async fn get(&self, id: JobId) -> Result<Option<JobSnapshot>, QueueError>;
}
