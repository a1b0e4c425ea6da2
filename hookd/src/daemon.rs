//! Long-running consumer that drains the delivery job queue.
//!
//! ```text
//! run()
//!   loop
//!     ├─ reap finished tasks (JoinSet::try_join_next)
//!     ├─ no free permits?  wait for a task or shutdown
//!     ├─ JobQueue::dequeue(free permits)
//!     │    └─ empty?  sleep(poll_interval) or shutdown
//!     └─ per job: spawn handle_job()
//!           ├─ malformed payload → reject
//!           ├─ spawn lease renewal (every lease_renewal_interval)
//!           ├─ DeliveryWorker::process()
//!           ├─ stop lease renewal
//!           ├─ Ok  → complete
//!           └─ Err → fail (queue reschedules or exhausts)
//! ```
//!
//! A job can legitimately run far longer than its lease (many slow subscribers
//! in sequence), so the lease is renewed for as long as the attempt runs. Only
//! a daemon that stops renewing, i.e. one that crashed, loses its jobs.
//!
//! On shutdown the daemon stops claiming and waits for in-flight jobs to
//! finish. Jobs are never cancelled mid-delivery; the HTTP timeout bounds how
//! long that takes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use metrics::counter;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::queue::{ClaimedJob, FailOutcome, JobQueue, QueueError};
use crate::webhooks::DeliveryWorker;

/// Configuration for the daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Jobs processed concurrently
    pub max_concurrent_jobs: usize,
    /// How long to sleep when the queue is empty or unavailable
    pub poll_interval: Duration,
    /// How often a running job's lease is renewed
    pub lease_renewal_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            poll_interval: Duration::from_secs(1),
            lease_renewal_interval: Duration::from_secs(100),
        }
    }
}

impl From<&Config> for DaemonConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrent_jobs: config.delivery.max_concurrent_jobs,
            poll_interval: config.queue.poll_interval,
            lease_renewal_interval: config.queue.claim_timeout / 3,
        }
    }
}

/// Daemon that claims delivery jobs and runs them through the worker.
pub struct Daemon {
    daemon_id: Uuid,
    queue: Arc<dyn JobQueue>,
    worker: Arc<DeliveryWorker>,
    config: DaemonConfig,
    semaphore: Arc<Semaphore>,
    jobs_in_flight: Arc<AtomicUsize>,
}

impl Daemon {
    pub fn new(queue: Arc<dyn JobQueue>, worker: Arc<DeliveryWorker>, config: DaemonConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            daemon_id: Uuid::new_v4(),
            queue,
            worker,
            config,
            semaphore,
            jobs_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn jobs_in_flight(&self) -> usize {
        self.jobs_in_flight.load(Ordering::Relaxed)
    }

    /// Run until `shutdown` is cancelled, then drain in-flight jobs.
    #[tracing::instrument(skip_all, fields(daemon_id = %self.daemon_id))]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "Daemon starting main processing loop"
        );

        let mut join_set: JoinSet<()> = JoinSet::new();

        while !shutdown.is_cancelled() {
            while let Some(result) = join_set.try_join_next() {
                if let Err(join_error) = result {
                    error!(error = %join_error, "Job task panicked");
                }
            }

            let available = self.semaphore.available_permits();
            if available == 0 {
                tokio::select! {
                    Some(result) = join_set.join_next() => {
                        if let Err(join_error) = result {
                            error!(error = %join_error, "Job task panicked");
                        }
                    }
                    _ = shutdown.cancelled() => {}
                }
                continue;
            }

            let claimed = match self.queue.dequeue(available).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(error = %e, "Failed to claim jobs");
                    self.idle(&shutdown).await;
                    continue;
                }
            };

            if claimed.is_empty() {
                self.idle(&shutdown).await;
                continue;
            }

            debug!(claimed_count = claimed.len(), "Claimed jobs from queue");

            for job in claimed {
                // Never blocks: we claimed at most `available` jobs
                let permit = match self.semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("Daemon semaphore closed");
                        break;
                    }
                };

                let queue = self.queue.clone();
                let worker = self.worker.clone();
                let lease_renewal_interval = self.config.lease_renewal_interval;
                let jobs_in_flight = self.jobs_in_flight.clone();
                jobs_in_flight.fetch_add(1, Ordering::Relaxed);

                join_set.spawn(async move {
                    let _permit = permit;
                    let _guard = scopeguard::guard((), |_| {
                        jobs_in_flight.fetch_sub(1, Ordering::Relaxed);
                    });

                    handle_job(queue, worker.as_ref(), job, lease_renewal_interval).await;
                });
            }
        }

        if !join_set.is_empty() {
            info!(in_flight = join_set.len(), "Shutdown requested, waiting for in-flight jobs");
        }
        while let Some(result) = join_set.join_next().await {
            if let Err(join_error) = result {
                error!(error = %join_error, "Job task panicked");
            }
        }

        info!("Daemon stopped");
    }

    async fn idle(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = shutdown.cancelled() => {}
        }
    }
}

/// Run one claimed job and report the result back to the queue.
async fn handle_job(queue: Arc<dyn JobQueue>, worker: &DeliveryWorker, job: ClaimedJob, lease_renewal: Duration) {
    let payload = match job.payload() {
        Ok(payload) => payload,
        Err(e) => {
            counter!("hookd_jobs_total", "outcome" => "rejected").increment(1);
            if let Err(reject_err) = queue.reject(&job, &e.to_string()).await {
                error!(job_id = %job.id, error = %reject_err, "Failed to reject malformed job");
            }
            return;
        }
    };

    info!(
        job_id = %job.id,
        event_id = %payload.event_id,
        attempt = job.attempt,
        max_attempts = job.policy.max_attempts,
        "Processing delivery job"
    );

    let lease = renew_lease(queue.clone(), job.clone(), lease_renewal);
    let mut delivered = job.delivered.clone();
    let result = worker.process(&payload, &mut delivered).await;
    drop(lease);

    match result {
        Ok(()) => {
            counter!("hookd_jobs_total", "outcome" => "succeeded").increment(1);
            report(&job, queue.complete(&job, &delivered).await);
        }
        Err(e) => match queue.fail(&job, &e.to_string(), &delivered).await {
            Ok(FailOutcome::Retrying { next_run_at, delay }) => {
                counter!("hookd_jobs_total", "outcome" => "retrying").increment(1);
                warn!(
                    job_id = %job.id,
                    attempt = job.attempt,
                    error = %e,
                    retry_in = ?delay,
                    %next_run_at,
                    "Delivery job failed, scheduled for retry"
                );
            }
            Ok(FailOutcome::Exhausted) => {
                counter!("hookd_jobs_total", "outcome" => "failed").increment(1);
            }
            Err(queue_err) => report::<FailOutcome>(&job, Err(queue_err)),
        },
    }
}

/// Renew `job`'s lease every `every` until the returned guard is dropped.
fn renew_lease(queue: Arc<dyn JobQueue>, job: ClaimedJob, every: Duration) -> DropGuard {
    let stop = CancellationToken::new();
    let guard = stop.clone().drop_guard();

    tokio::spawn(async move {
        // tokio panics on a zero period
        let mut interval = tokio::time::interval(every.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the claim itself set the lease
        interval.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {}
            }

            match queue.extend_lease(&job).await {
                Ok(()) => debug!(job_id = %job.id, attempt = job.attempt, "Renewed job lease"),
                Err(_) if stop.is_cancelled() => break,
                Err(QueueError::JobNotFound(_)) => {
                    warn!(job_id = %job.id, attempt = job.attempt, "Job lease lost, another attempt holds the job");
                    break;
                }
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to renew job lease"),
            }
        }
    });

    guard
}

fn report<T>(job: &ClaimedJob, result: Result<T, QueueError>) {
    match result {
        Ok(_) => {}
        Err(QueueError::JobNotFound(_)) => {
            // Lease expired and another worker has the job now
            warn!(job_id = %job.id, attempt = job.attempt, "Job no longer held, result discarded");
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "Failed to report job result, it will be retried after its lease expires");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryMode;
    use crate::db::models::events::EventCreateDBRequest;
    use crate::queue::{InMemoryJobQueue, JobPayload, JobStatus, RetryPolicy};
    use crate::storage::{EventStore, InMemoryStore};
    use crate::subscribers::SubscriberCache;
    use crate::webhooks::{DeliveryLogRecorder, WebhookClient};
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> DaemonConfig {
        DaemonConfig {
            max_concurrent_jobs: 4,
            poll_interval: Duration::from_millis(10),
            lease_renewal_interval: Duration::from_secs(20),
        }
    }

    fn daemon(store: &InMemoryStore, queue: &InMemoryJobQueue) -> Arc<Daemon> {
        daemon_with(store, queue, test_config())
    }

    fn daemon_with(store: &InMemoryStore, queue: &InMemoryJobQueue, config: DaemonConfig) -> Arc<Daemon> {
        let store = Arc::new(store.clone());
        let worker = DeliveryWorker::new(
            store.clone(),
            SubscriberCache::new(store.clone(), Duration::from_secs(60), 100),
            WebhookClient::new(Duration::from_secs(5), "X-Hookd-Signature").unwrap(),
            DeliveryLogRecorder::new(store),
            DeliveryMode::WholeJob,
        );
        Arc::new(Daemon::new(Arc::new(queue.clone()), Arc::new(worker), config))
    }

    async fn wait_for_status(queue: &InMemoryJobQueue, id: Uuid, status: JobStatus) {
        for _ in 0..500 {
            if queue.get(id).await.unwrap().is_some_and(|job| job.status == status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached {status:?}");
    }

    #[tokio::test]
    async fn test_daemon_processes_jobs() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(3)
            .mount(&mock_server)
            .await;

        let store = InMemoryStore::new();
        let queue = InMemoryJobQueue::default();
        store.add_subscription("job.posted", &mock_server.uri()).unwrap();

        let mut ids = Vec::new();
        for n in 0..3 {
            let event = store
                .insert_event(&EventCreateDBRequest {
                    event_type: "job.posted".to_string(),
                    payload: json!({"id": n}),
                })
                .await
                .unwrap();
            let payload = JobPayload::new(event.id, "job.posted");
            ids.push(queue.enqueue(&payload, &RetryPolicy::default()).await.unwrap());
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(daemon(&store, &queue).run(shutdown.clone()));

        for id in ids {
            wait_for_status(&queue, id, JobStatus::Succeeded).await;
        }

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("daemon should stop after shutdown")
            .expect("daemon should not panic");

        assert_eq!(store.delivery_logs().len(), 3);
    }

    #[tokio::test]
    async fn test_daemon_rejects_malformed_job() {
        let store = InMemoryStore::new();
        let queue = InMemoryJobQueue::default();
        let id = queue.enqueue_raw(json!({"version": 1, "event_type": "job.posted"}), &RetryPolicy::default());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(daemon(&store, &queue).run(shutdown.clone()));

        wait_for_status(&queue, id, JobStatus::Failed).await;
        shutdown.cancel();
        handle.await.unwrap();

        let snapshot = queue.get(id).await.unwrap().unwrap();
        assert_eq!(snapshot.attempt_count, 1);
        assert!(snapshot.last_error.unwrap().contains("Malformed"));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_job() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
            .expect(1)
            .mount(&mock_server)
            .await;

        let store = InMemoryStore::new();
        let queue = InMemoryJobQueue::default();
        store.add_subscription("job.posted", &mock_server.uri()).unwrap();
        let event = store
            .insert_event(&EventCreateDBRequest {
                event_type: "job.posted".to_string(),
                payload: json!({}),
            })
            .await
            .unwrap();
        let id = queue
            .enqueue(&JobPayload::new(event.id, "job.posted"), &RetryPolicy::default())
            .await
            .unwrap();

        let daemon = daemon(&store, &queue);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(daemon.clone().run(shutdown.clone()));

        wait_for_status(&queue, id, JobStatus::Processing).await;
        shutdown.cancel();
        handle.await.unwrap();

        // The claimed job ran to completion before run() returned
        assert_eq!(daemon.jobs_in_flight(), 0);
        assert_eq!(queue.get(id).await.unwrap().unwrap().status, JobStatus::Succeeded);
        assert_eq!(store.delivery_logs().len(), 1);
    }

    #[tokio::test]
    async fn test_job_outliving_its_lease_runs_once() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(600)))
            .expect(3)
            .mount(&mock_server)
            .await;

        let store = InMemoryStore::new();
        let queue = InMemoryJobQueue::new(Duration::from_secs(1));
        for route in ["/a", "/b", "/c"] {
            store
                .add_subscription("job.posted", &format!("{}{}", mock_server.uri(), route))
                .unwrap();
        }
        let event = store
            .insert_event(&EventCreateDBRequest {
                event_type: "job.posted".to_string(),
                payload: json!({}),
            })
            .await
            .unwrap();
        let id = queue
            .enqueue(&JobPayload::new(event.id, "job.posted"), &RetryPolicy::default())
            .await
            .unwrap();

        // Three sequential 600ms deliveries against a 1s lease
        let config = DaemonConfig {
            lease_renewal_interval: Duration::from_secs(1) / 3,
            ..test_config()
        };
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(daemon_with(&store, &queue, config).run(shutdown.clone()));

        wait_for_status(&queue, id, JobStatus::Succeeded).await;
        shutdown.cancel();
        handle.await.unwrap();

        let snapshot = queue.get(id).await.unwrap().unwrap();
        assert_eq!(snapshot.attempt_count, 1);
        assert_eq!(store.delivery_logs().len(), 3);
    }

    #[tokio::test]
    async fn test_store_read_failure_reschedules_without_delivering() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let store = InMemoryStore::new();
        let queue = InMemoryJobQueue::default();
        store.add_subscription("job.posted", &mock_server.uri()).unwrap();
        let event = store
            .insert_event(&EventCreateDBRequest {
                event_type: "job.posted".to_string(),
                payload: json!({}),
            })
            .await
            .unwrap();
        let id = queue
            .enqueue(&JobPayload::new(event.id, "job.posted"), &RetryPolicy::default())
            .await
            .unwrap();
        store.fail_reads(true);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(daemon(&store, &queue).run(shutdown.clone()));

        let mut snapshot = None;
        for _ in 0..500 {
            let job = queue.get(id).await.unwrap().unwrap();
            if job.attempt_count == 1 && job.status == JobStatus::Pending {
                snapshot = Some(job);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        // Default backoff is 5s, so the job is still waiting for its retry
        let snapshot = snapshot.expect("job should be rescheduled after the failed read");
        assert!(snapshot.last_error.unwrap().contains("store unavailable"));
        assert!(store.delivery_logs().is_empty());
    }

    #[test]
    fn test_lease_renewed_three_times_per_claim_timeout() {
        let mut config = Config::default();
        config.queue.claim_timeout = Duration::from_secs(90);

        let daemon_config = DaemonConfig::from(&config);
        assert_eq!(daemon_config.lease_renewal_interval, Duration::from_secs(30));
        assert_eq!(daemon_config.poll_interval, config.queue.poll_interval);
    }
}
