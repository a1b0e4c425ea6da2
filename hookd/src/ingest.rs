//! Event ingestion.
//!
//! The write order is fixed: the event row is persisted first, then its
//! delivery job is enqueued. A worker can therefore always find the event a job
//! points at, except when the row was deleted out from under it.

use std::sync::Arc;

use tracing::{error, info, instrument};

use crate::db::models::events::EventCreateDBRequest;
use crate::errors::IngestError;
use crate::queue::{JobPayload, JobQueue, RetryPolicy};
use crate::storage::EventStore;
use crate::types::{EventId, JobId};

/// Identifiers assigned to a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedEvent {
    pub event_id: EventId,
    pub job_id: JobId,
}

/// Persists events and enqueues their delivery jobs.
#[derive(Clone)]
pub struct EventPublisher {
    events: Arc<dyn EventStore>,
    queue: Arc<dyn JobQueue>,
    policy: RetryPolicy,
}

impl EventPublisher {
    pub fn new(events: Arc<dyn EventStore>, queue: Arc<dyn JobQueue>, policy: RetryPolicy) -> Self {
        Self { events, queue, policy }
    }

    /// Record an event and schedule its delivery.
    #[instrument(skip(self, payload), err)]
    pub async fn publish(&self, event_type: &str, payload: serde_json::Value) -> Result<PublishedEvent, IngestError> {
        if event_type.trim().is_empty() {
            return Err(IngestError::InvalidEvent("event_type must not be empty".to_string()));
        }

        let event = self
            .events
            .insert_event(&EventCreateDBRequest {
                event_type: event_type.to_string(),
                payload,
            })
            .await?;

        let job = JobPayload::new(event.id, &event.event_type);
        let job_id = self.queue.enqueue(&job, &self.policy).await.map_err(|source| {
            error!(event_id = %event.id, error = %source, "Event persisted but its delivery job was not enqueued");
            IngestError::Queue {
                event_id: event.id,
                source,
            }
        })?;

        info!(event_id = %event.id, job_id = %job_id, "Event published");
        Ok(PublishedEvent {
            event_id: event.id,
            job_id,
        })
    }
}
