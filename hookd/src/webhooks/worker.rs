//! Runs one delivery job: event lookup, subscriber resolution, signed fan-out.
//!
//! ```text
//! process(job)
//!   ├─ EventStore::get_event()          // missing → EventNotFound, no logs
//!   ├─ serialize payload once           // these bytes are signed and sent
//!   ├─ SubscriberCache::resolve_subscribers()
//!   └─ per subscriber:
//!        ├─ WebhookClient::deliver()    // always yields a DeliveryOutcome
//!        ├─ DeliveryLogRecorder::record()
//!        └─ outcome → Ok / DeliveryError
//! ```
//!
//! In [`DeliveryMode::WholeJob`] subscribers are visited in order and the first
//! failure aborts the job, so a retry re-delivers to everyone. In
//! [`DeliveryMode::PerSubscriber`] all pending subscribers are delivered
//! concurrently and successes are remembered in the job's progress, so a retry
//! only targets the subscribers that failed.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use metrics::counter;
use tracing::{debug, info, instrument, warn};

use crate::config::DeliveryMode;
use crate::db::models::subscriptions::Subscriber;
use crate::errors::DeliveryError;
use crate::queue::JobPayload;
use crate::storage::EventStore;
use crate::subscribers::SubscriberCache;
use crate::types::{EventId, SubscriptionId, abbrev_uuid};
use crate::webhooks::client::WebhookClient;
use crate::webhooks::recorder::DeliveryLogRecorder;

pub struct DeliveryWorker {
    events: Arc<dyn EventStore>,
    subscribers: SubscriberCache,
    client: WebhookClient,
    recorder: DeliveryLogRecorder,
    mode: DeliveryMode,
}

impl DeliveryWorker {
    pub fn new(
        events: Arc<dyn EventStore>,
        subscribers: SubscriberCache,
        client: WebhookClient,
        recorder: DeliveryLogRecorder,
        mode: DeliveryMode,
    ) -> Self {
        Self {
            events,
            subscribers,
            client,
            recorder,
            mode,
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Deliver one job's event to its subscribers.
    ///
    /// `delivered` is the job's progress: subscriptions that have received this
    /// event. It is updated in place even when an error is returned.
    #[instrument(
        skip_all,
        fields(event_id = %abbrev_uuid(&job.event_id), event_type = %job.event_type, mode = ?self.mode),
        err
    )]
    pub async fn process(&self, job: &JobPayload, delivered: &mut Vec<SubscriptionId>) -> Result<(), DeliveryError> {
        let event = self
            .events
            .get_event(job.event_id)
            .await?
            .ok_or(DeliveryError::EventNotFound { event_id: job.event_id })?;

        let body = Bytes::from(serde_json::to_vec(&event.payload)?);
        let subscribers = self.subscribers.resolve_subscribers(&job.event_type).await?;

        if subscribers.is_empty() {
            debug!("No active subscribers, nothing to deliver");
            return Ok(());
        }

        match self.mode {
            DeliveryMode::WholeJob => {
                delivered.clear();
                for subscriber in subscribers.iter() {
                    self.deliver_one(subscriber, event.id, body.clone()).await?;
                    delivered.push(subscriber.id);
                }
            }
            DeliveryMode::PerSubscriber => {
                let pending: Vec<&Subscriber> = subscribers.iter().filter(|s| !delivered.contains(&s.id)).collect();
                if pending.len() < subscribers.len() {
                    debug!(
                        skipped = subscribers.len() - pending.len(),
                        "Skipping subscribers delivered by an earlier attempt"
                    );
                }

                let results = join_all(
                    pending
                        .iter()
                        .map(|subscriber| self.deliver_one(subscriber, event.id, body.clone())),
                )
                .await;

                let mut failed = 0;
                for (subscriber, result) in pending.iter().zip(results) {
                    match result {
                        Ok(()) => delivered.push(subscriber.id),
                        Err(_) => failed += 1,
                    }
                }

                if failed > 0 {
                    return Err(DeliveryError::PartialDelivery {
                        failed,
                        total: subscribers.len(),
                    });
                }
            }
        }

        info!(subscribers = subscribers.len(), "Event delivered to all subscribers");
        Ok(())
    }

    /// Deliver to one subscriber and record the attempt.
    ///
    /// The log row is written before the outcome is turned into a result. A
    /// failed log write never turns a successful delivery into a failure.
    async fn deliver_one(&self, subscriber: &Subscriber, event_id: EventId, body: Bytes) -> Result<(), DeliveryError> {
        let outcome = self.client.deliver(subscriber, body).await;
        let _ = self.recorder.record(subscriber.id, event_id, &outcome).await;

        counter!("hookd_deliveries_total", "outcome" => outcome.status.as_str()).increment(1);

        if outcome.is_success() {
            return Ok(());
        }

        warn!(
            subscription_id = %subscriber.id,
            status_code = outcome.response_status_code,
            "Webhook delivery failed"
        );
        Err(DeliveryError::Delivery {
            subscription_id: subscriber.id,
            status_code: outcome.response_status_code,
            message: outcome.response_body,
        })
    }
}
