use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::SubscriptionId;

/// Database model for a subscriber's endpoint registration.
///
/// Unique on `(event_type, endpoint_url)`. The relay only reads these rows.
#[derive(Debug, Clone, FromRow)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub event_type: String,
    pub endpoint_url: String,
    pub secret_key: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The slice of a subscription needed to sign and deliver a webhook.
///
/// This is also the cached value shape for `subscribers:<event_type>`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Subscriber {
    pub id: SubscriptionId,
    pub endpoint_url: String,
    pub secret_key: String,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("endpoint_url", &self.endpoint_url)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl From<&Subscription> for Subscriber {
    fn from(subscription: &Subscription) -> Self {
        Self {
            id: subscription.id,
            endpoint_url: subscription.endpoint_url.clone(),
            secret_key: subscription.secret_key.clone(),
        }
    }
}
