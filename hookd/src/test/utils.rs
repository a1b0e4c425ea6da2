//! Shared fixtures for end-to-end tests.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::DeliveryMode;
use crate::daemon::{Daemon, DaemonConfig};
use crate::ingest::EventPublisher;
use crate::queue::{InMemoryJobQueue, JobQueue, JobSnapshot, JobStatus, RetryPolicy};
use crate::storage::InMemoryStore;
use crate::subscribers::SubscriberCache;
use crate::webhooks::{DeliveryLogRecorder, DeliveryWorker, WebhookClient};

/// Retry policy with the production shape but millisecond delays.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(20),
    }
}

/// A running relay over in-memory backends.
pub struct Harness {
    pub store: InMemoryStore,
    pub queue: InMemoryJobQueue,
    pub publisher: EventPublisher,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Harness {
    pub fn start(mode: DeliveryMode, policy: RetryPolicy) -> Self {
        let store = InMemoryStore::new();
        let queue = InMemoryJobQueue::new(Duration::from_secs(60));
        let shared = Arc::new(store.clone());

        let worker = DeliveryWorker::new(
            shared.clone(),
            SubscriberCache::new(shared.clone(), Duration::from_secs(60), 100),
            WebhookClient::new(Duration::from_secs(2), "X-Hookd-Signature").unwrap(),
            DeliveryLogRecorder::new(shared.clone()),
            mode,
        );
        let daemon = Arc::new(Daemon::new(
            Arc::new(queue.clone()),
            Arc::new(worker),
            DaemonConfig {
                max_concurrent_jobs: 4,
                poll_interval: Duration::from_millis(5),
                lease_renewal_interval: Duration::from_secs(20),
            },
        ));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(daemon.run(shutdown.clone()));
        let publisher = EventPublisher::new(shared, Arc::new(queue.clone()), policy);

        Self {
            store,
            queue,
            publisher,
            shutdown,
            handle,
        }
    }

    /// Poll until the job is succeeded or failed.
    pub async fn wait_for_terminal(&self, job_id: Uuid) -> JobSnapshot {
        let wait = async {
            loop {
                if let Some(job) = self.queue.get(job_id).await.unwrap()
                    && matches!(job.status, JobStatus::Succeeded | JobStatus::Failed)
                {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };

        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("job should reach a terminal state")
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap();
    }
}
