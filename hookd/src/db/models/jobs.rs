use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::types::{JobId, SubscriptionId};

/// Database model for a queued delivery job.
#[derive(Debug, Clone, FromRow)]
pub struct DeliveryJob {
    pub id: JobId,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub base_delay_ms: i64,
    pub next_run_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub delivered_subscriptions: Vec<SubscriptionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to enqueue a delivery job.
#[derive(Debug, Clone)]
pub struct DeliveryJobCreateDBRequest {
    pub payload: serde_json::Value,
    pub max_attempts: i32,
    pub base_delay_ms: i64,
}
