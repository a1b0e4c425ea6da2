use crate::db::errors::DbError;
use crate::queue::QueueError;
use crate::types::{EventId, SubscriptionId};
use thiserror::Error as ThisError;

/// Why a delivery job attempt failed.
///
/// Every variant is retried by the queue; only reaching `max_attempts` ends
/// the cycle.
#[derive(ThisError, Debug)]
pub enum DeliveryError {
    /// The job references an event that isn't in the event store
    #[error("Event {event_id} not found")]
    EventNotFound { event_id: EventId },

    /// A subscriber answered non-2xx, or the request never completed
    #[error("Delivery to subscription {subscription_id} failed with status {status_code}: {message}")]
    Delivery {
        subscription_id: SubscriptionId,
        status_code: i32,
        message: String,
    },

    /// Some subscribers in a fan-out failed; the rest were delivered
    #[error("{failed} of {total} subscriber deliveries failed")]
    PartialDelivery { failed: usize, total: usize },

    /// Event or subscription lookup failed before delivery
    #[error(transparent)]
    Persistence(#[from] DbError),

    #[error("Failed to serialize event payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why publishing an event failed.
#[derive(ThisError, Debug)]
pub enum IngestError {
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// The event row couldn't be written. Nothing was enqueued.
    #[error("Failed to persist event: {0}")]
    Persistence(#[from] DbError),

    /// The event row exists but its delivery job couldn't be enqueued
    #[error("Failed to enqueue delivery job for event {event_id}: {source}")]
    Queue {
        event_id: EventId,
        #[source]
        source: QueueError,
    },
}
