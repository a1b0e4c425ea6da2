//! In-memory store implementation.
//!
//! Holds events, subscriptions and delivery logs behind a single lock. Suitable
//! for tests and single-process runs; everything is lost on restart. It also
//! exposes the management-side writes (adding and toggling subscriptions) that
//! the relay itself never performs, so tests can set up and mutate fixtures.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{DeliveryLogStore, EventStore, SubscriptionStore};
use crate::db::errors::{DbError, Result};
use crate::db::models::delivery_logs::{DeliveryLog, DeliveryLogCreateDBRequest};
use crate::db::models::events::{Event, EventCreateDBRequest};
use crate::db::models::subscriptions::{Subscriber, Subscription};
use crate::types::{EventId, SubscriptionId};
use crate::webhooks::signing;

#[derive(Default)]
struct Inner {
    events: HashMap<EventId, Event>,
    // Insertion order doubles as `created_at` order.
    subscriptions: Vec<Subscription>,
    delivery_logs: Vec<DeliveryLog>,
}

/// In-memory implementation of every storage trait.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
    fail_log_writes: Arc<AtomicBool>,
    fail_reads: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an active subscription with a freshly generated secret.
    ///
    /// # Errors
    /// - `UniqueViolation` if `(event_type, endpoint_url)` is already registered
    pub fn add_subscription(&self, event_type: &str, endpoint_url: &str) -> Result<Subscription> {
        let mut inner = self.inner.write();

        if inner
            .subscriptions
            .iter()
            .any(|s| s.event_type == event_type && s.endpoint_url == endpoint_url)
        {
            return Err(DbError::UniqueViolation {
                constraint: Some("unique_event_endpoint".to_string()),
                table: Some("subscriptions".to_string()),
                message: format!("subscription for {event_type} -> {endpoint_url} already exists"),
            });
        }

        let now = Utc::now();
        let subscription = Subscription {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            endpoint_url: endpoint_url.to_string(),
            secret_key: signing::generate_secret(),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        inner.subscriptions.push(subscription.clone());

        Ok(subscription)
    }

    /// Enable or disable a subscription.
    pub fn set_subscription_active(&self, id: SubscriptionId, is_active: bool) -> Result<()> {
        let mut inner = self.inner.write();
        let subscription = inner
            .subscriptions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(DbError::NotFound)?;

        subscription.is_active = is_active;
        subscription.updated_at = Utc::now();
        Ok(())
    }

    /// All delivery log rows, in append order.
    pub fn delivery_logs(&self) -> Vec<DeliveryLog> {
        self.inner.read().delivery_logs.clone()
    }

    /// Delivery log rows for one event, in append order.
    pub fn delivery_logs_for_event(&self, event_id: EventId) -> Vec<DeliveryLog> {
        self.inner
            .read()
            .delivery_logs
            .iter()
            .filter(|log| log.event_id == event_id)
            .cloned()
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.inner.read().events.len()
    }

    /// Make subsequent delivery log appends fail, simulating an unavailable store.
    pub fn fail_log_writes(&self, fail: bool) {
        self.fail_log_writes.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent event and subscriber reads fail.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_reads(&self, store: &str) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DbError::Other(anyhow!("{store} store unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn insert_event(&self, request: &EventCreateDBRequest) -> Result<Event> {
        let event = Event {
            id: Uuid::new_v4(),
            event_type: request.event_type.clone(),
            payload: request.payload.clone(),
            received_at: Utc::now(),
        };

        self.inner.write().events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn get_event(&self, id: EventId) -> Result<Option<Event>> {
        self.check_reads("event")?;
        Ok(self.inner.read().events.get(&id).cloned())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn active_subscribers(&self, event_type: &str) -> Result<Vec<Subscriber>> {
        self.check_reads("subscription")?;
        Ok(self
            .inner
            .read()
            .subscriptions
            .iter()
            .filter(|s| s.is_active && s.event_type == event_type)
            .map(Subscriber::from)
            .collect())
    }
}

#[async_trait]
impl DeliveryLogStore for InMemoryStore {
    async fn append(&self, request: &DeliveryLogCreateDBRequest) -> Result<DeliveryLog> {
        if self.fail_log_writes.load(Ordering::SeqCst) {
            return Err(DbError::Other(anyhow!("delivery log store unavailable")));
        }

        let mut inner = self.inner.write();

        if !inner.events.contains_key(&request.event_id) {
            return Err(DbError::ForeignKeyViolation {
                constraint: Some("delivery_logs_event_id_fkey".to_string()),
                table: Some("delivery_logs".to_string()),
                message: format!("event {} does not exist", request.event_id),
            });
        }
        if !inner.subscriptions.iter().any(|s| s.id == request.subscription_id) {
            return Err(DbError::ForeignKeyViolation {
                constraint: Some("delivery_logs_subscription_id_fkey".to_string()),
                table: Some("delivery_logs".to_string()),
                message: format!("subscription {} does not exist", request.subscription_id),
            });
        }

        let log = DeliveryLog {
            id: Uuid::new_v4(),
            subscription_id: request.subscription_id,
            event_id: request.event_id,
            status: request.status.as_str().to_string(),
            response_status_code: request.response_status_code,
            response_body: request.response_body.clone(),
            attempted_at: Utc::now(),
        };
        inner.delivery_logs.push(log.clone());

        Ok(log)
    }
}
