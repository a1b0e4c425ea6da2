use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{DeliveryLogId, EventId, SubscriptionId};

/// Outcome recorded for a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown delivery status: {}", s)),
        }
    }
}

/// Append-only audit row for one delivery attempt.
#[derive(Debug, Clone, FromRow)]
pub struct DeliveryLog {
    pub id: DeliveryLogId,
    pub subscription_id: SubscriptionId,
    pub event_id: EventId,
    pub status: String,
    pub response_status_code: Option<i32>,
    pub response_body: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl DeliveryLog {
    /// Get the parsed delivery status.
    pub fn delivery_status(&self) -> DeliveryStatus {
        self.status.parse().unwrap_or(DeliveryStatus::Failed)
    }
}

/// Request to append a delivery log row.
#[derive(Debug, Clone)]
pub struct DeliveryLogCreateDBRequest {
    pub subscription_id: SubscriptionId,
    pub event_id: EventId,
    pub status: DeliveryStatus,
    pub response_status_code: Option<i32>,
    pub response_body: Option<String>,
}
