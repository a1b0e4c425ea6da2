use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::EventId;

/// An ingested event. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub id: EventId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Request to persist a new event.
#[derive(Debug, Clone)]
pub struct EventCreateDBRequest {
    pub event_type: String,
    pub payload: serde_json::Value,
}
