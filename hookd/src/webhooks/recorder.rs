//! Delivery audit trail writer.

use std::sync::Arc;

use metrics::counter;
use tracing::error;

use crate::db::errors::Result;
use crate::db::models::delivery_logs::{DeliveryLog, DeliveryLogCreateDBRequest};
use crate::storage::DeliveryLogStore;
use crate::types::{EventId, SubscriptionId};
use crate::webhooks::client::DeliveryOutcome;

/// Appends one log row per delivery attempt.
///
/// Write failures are reported at error level and counted in
/// `hookd_delivery_log_write_failures_total`, then returned. Deciding whether a
/// failed write should fail the job is the caller's business.
#[derive(Clone)]
pub struct DeliveryLogRecorder {
    store: Arc<dyn DeliveryLogStore>,
}

impl DeliveryLogRecorder {
    pub fn new(store: Arc<dyn DeliveryLogStore>) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        subscription_id: SubscriptionId,
        event_id: EventId,
        outcome: &DeliveryOutcome,
    ) -> Result<DeliveryLog> {
        let request = DeliveryLogCreateDBRequest {
            subscription_id,
            event_id,
            status: outcome.status,
            response_status_code: Some(outcome.response_status_code),
            response_body: Some(outcome.response_body.clone()),
        };

        self.store.append(&request).await.inspect_err(|e| {
            counter!("hookd_delivery_log_write_failures_total").increment(1);
            error!(
                subscription_id = %subscription_id,
                event_id = %event_id,
                status = %outcome.status,
                error = %e,
                "Failed to write delivery log"
            );
        })
    }
}
