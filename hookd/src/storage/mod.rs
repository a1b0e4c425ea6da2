//! Storage seams for the relay's collaborators.
//!
//! The delivery pipeline only needs three narrow capabilities from the outside
//! world: read an event, list the active subscribers for an event type, and
//! append a delivery log row. Each is a trait so the daemon can run against
//! PostgreSQL in production and [`in_memory::InMemoryStore`] in tests.

use async_trait::async_trait;

use crate::db::errors::Result;
use crate::db::models::delivery_logs::{DeliveryLog, DeliveryLogCreateDBRequest};
use crate::db::models::events::{Event, EventCreateDBRequest};
use crate::db::models::subscriptions::Subscriber;
use crate::types::EventId;

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Read and write access to ingested events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist a new event and return the stored row.
    async fn insert_event(&self, request: &EventCreateDBRequest) -> Result<Event>;

    /// Fetch an event by ID. `Ok(None)` if it doesn't exist.
    async fn get_event(&self, id: EventId) -> Result<Option<Event>>;
}

/// Read-only access to subscriptions.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Active subscribers for `event_type`, in a stable order.
    async fn active_subscribers(&self, event_type: &str) -> Result<Vec<Subscriber>>;
}

/// Append-only access to the delivery audit trail.
#[async_trait]
pub trait DeliveryLogStore: Send + Sync {
    async fn append(&self, request: &DeliveryLogCreateDBRequest) -> Result<DeliveryLog>;
}
