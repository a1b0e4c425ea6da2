//! In-memory job queue.
//!
//! Live jobs sit in a `Vec` behind a mutex and are claimed in enqueue order.
//! Jobs that reach `succeeded` or `failed` move to a bounded history, so memory
//! and claim scans track the live backlog only. Readiness and leases are
//! tracked with [`tokio::time::Instant`], so tests can drive backoff with a
//! paused clock. Everything is lost on restart.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error};
use uuid::Uuid;

use super::{ClaimedJob, FailOutcome, JobPayload, JobQueue, JobSnapshot, JobStatus, QueueError, RetryPolicy};
use crate::types::{JobId, SubscriptionId};

struct StoredJob {
    snapshot: JobSnapshot,
    policy: RetryPolicy,
    ready_at: Instant,
    lease_until: Option<Instant>,
}

impl StoredJob {
    fn is_claimable(&self, now: Instant) -> bool {
        match self.snapshot.status {
            JobStatus::Pending => self.ready_at <= now,
            JobStatus::Processing => {
                self.lease_until.is_some_and(|lease| lease <= now)
                    && self.snapshot.attempt_count < self.snapshot.max_attempts
            }
            _ => false,
        }
    }

    fn is_held_by(&self, job: &ClaimedJob) -> bool {
        self.snapshot.status == JobStatus::Processing && self.snapshot.attempt_count == job.attempt
    }

    fn is_finished(&self) -> bool {
        matches!(self.snapshot.status, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Finished jobs kept for [`JobQueue::get`] by default.
pub const DEFAULT_FINISHED_HISTORY: usize = 1024;

#[derive(Default)]
struct JobTable {
    live: Vec<StoredJob>,
    // Oldest first
    finished: VecDeque<JobSnapshot>,
}

impl JobTable {
    /// Move finished jobs out of `live`, dropping the oldest beyond `history`.
    fn retire_finished(&mut self, history: usize) {
        if !self.live.iter().any(StoredJob::is_finished) {
            return;
        }

        let (finished, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.live)
            .into_iter()
            .partition(StoredJob::is_finished);
        self.live = live;
        self.finished.extend(finished.into_iter().map(|stored| stored.snapshot));

        while self.finished.len() > history {
            self.finished.pop_front();
        }
    }
}

/// In-memory implementation of [`JobQueue`].
#[derive(Clone)]
pub struct InMemoryJobQueue {
    jobs: Arc<Mutex<JobTable>>,
    claim_timeout: Duration,
    finished_history: usize,
}

impl InMemoryJobQueue {
    pub fn new(claim_timeout: Duration) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(JobTable::default())),
            claim_timeout,
            finished_history: DEFAULT_FINISHED_HISTORY,
        }
    }

    /// Keep at most `capacity` finished jobs visible to [`JobQueue::get`].
    pub fn with_finished_history(mut self, capacity: usize) -> Self {
        self.finished_history = capacity;
        self
    }

    /// Enqueue a raw payload without validation.
    ///
    /// Lets tests plant payloads that a well-behaved producer never writes.
    pub fn enqueue_raw(&self, payload: serde_json::Value, policy: &RetryPolicy) -> JobId {
        let id = Uuid::new_v4();
        self.jobs.lock().live.push(StoredJob {
            snapshot: JobSnapshot {
                id,
                payload,
                status: JobStatus::Pending,
                attempt_count: 0,
                max_attempts: policy.max_attempts,
                next_run_at: Utc::now(),
                last_error: None,
                delivered: Vec::new(),
            },
            policy: *policy,
            ready_at: Instant::now(),
            lease_until: None,
        });
        id
    }

    fn with_held_job<T>(&self, job: &ClaimedJob, f: impl FnOnce(&mut StoredJob) -> T) -> Result<T, QueueError> {
        let mut jobs = self.jobs.lock();
        let stored = jobs
            .live
            .iter_mut()
            .find(|stored| stored.snapshot.id == job.id && stored.is_held_by(job))
            .ok_or(QueueError::JobNotFound(job.id))?;
        let result = f(stored);

        jobs.retire_finished(self.finished_history);
        Ok(result)
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, payload: &JobPayload, policy: &RetryPolicy) -> Result<JobId, QueueError> {
        let value = serde_json::to_value(payload)?;
        Ok(self.enqueue_raw(value, policy))
    }

    async fn dequeue(&self, limit: usize) -> Result<Vec<ClaimedJob>, QueueError> {
        let now = Instant::now();
        let mut jobs = self.jobs.lock();

        for stored in jobs.live.iter_mut() {
            let abandoned = stored.snapshot.status == JobStatus::Processing
                && stored.lease_until.is_some_and(|lease| lease <= now)
                && stored.snapshot.attempt_count >= stored.snapshot.max_attempts;
            if abandoned {
                stored.snapshot.status = JobStatus::Failed;
                stored.snapshot.last_error = Some("lease expired during final attempt".to_string());
                stored.lease_until = None;
                error!(job_id = %stored.snapshot.id, "Job lease expired during final attempt, marking failed");
            }
        }

        jobs.retire_finished(self.finished_history);

        let mut claimed = Vec::new();
        for stored in jobs.live.iter_mut().filter(|stored| stored.is_claimable(now)).take(limit) {
            stored.snapshot.status = JobStatus::Processing;
            stored.snapshot.attempt_count += 1;
            stored.lease_until = Some(now + self.claim_timeout);

            claimed.push(ClaimedJob {
                id: stored.snapshot.id,
                payload: stored.snapshot.payload.clone(),
                attempt: stored.snapshot.attempt_count,
                policy: stored.policy,
                delivered: stored.snapshot.delivered.clone(),
            });
        }

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "Claimed jobs");
        }
        Ok(claimed)
    }

    async fn extend_lease(&self, job: &ClaimedJob) -> Result<(), QueueError> {
        let lease_until = Instant::now() + self.claim_timeout;
        self.with_held_job(job, |stored| {
            stored.lease_until = Some(lease_until);
        })
    }

    async fn complete(&self, job: &ClaimedJob, delivered: &[SubscriptionId]) -> Result<(), QueueError> {
        self.with_held_job(job, |stored| {
            stored.snapshot.status = JobStatus::Succeeded;
            stored.snapshot.delivered = delivered.to_vec();
            stored.lease_until = None;
        })
    }

    async fn fail(
        &self,
        job: &ClaimedJob,
        error: &str,
        delivered: &[SubscriptionId],
    ) -> Result<FailOutcome, QueueError> {
        let outcome = self.with_held_job(job, |stored| {
            stored.snapshot.last_error = Some(error.to_string());
            stored.snapshot.delivered = delivered.to_vec();
            stored.lease_until = None;

            if stored.snapshot.attempt_count >= stored.snapshot.max_attempts {
                stored.snapshot.status = JobStatus::Failed;
                return FailOutcome::Exhausted;
            }

            let delay = stored.policy.delay_for(stored.snapshot.attempt_count);
            let next_run_at = super::run_at(delay);
            stored.snapshot.status = JobStatus::Pending;
            stored.snapshot.next_run_at = next_run_at;
            stored.ready_at = Instant::now() + delay;
            FailOutcome::Retrying { next_run_at, delay }
        })?;

        if outcome == FailOutcome::Exhausted {
            error!(job_id = %job.id, attempts = job.attempt, error, "Job failed after final attempt");
        }
        Ok(outcome)
    }

    async fn reject(&self, job: &ClaimedJob, reason: &str) -> Result<(), QueueError> {
        self.with_held_job(job, |stored| {
            stored.snapshot.status = JobStatus::Failed;
            stored.snapshot.last_error = Some(reason.to_string());
            stored.lease_until = None;
        })?;

        error!(job_id = %job.id, reason, "Job rejected");
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobSnapshot>, QueueError> {
        let jobs = self.jobs.lock();
        let live = jobs
            .live
            .iter()
            .find(|stored| stored.snapshot.id == id)
            .map(|stored| stored.snapshot.clone());

        Ok(live.or_else(|| jobs.finished.iter().find(|snapshot| snapshot.id == id).cloned()))
    }
}
