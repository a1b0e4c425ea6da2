//! PostgreSQL-backed stores.

use async_trait::async_trait;
use sqlx::PgPool;

use super::{DeliveryLogStore, EventStore, SubscriptionStore};
use crate::db::errors::Result;
use crate::db::handlers::{DeliveryLogs, Events, Subscriptions};
use crate::db::models::delivery_logs::{DeliveryLog, DeliveryLogCreateDBRequest};
use crate::db::models::events::{Event, EventCreateDBRequest};
use crate::db::models::subscriptions::Subscriber;
use crate::types::EventId;

/// Implements every storage trait over a shared connection pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn insert_event(&self, request: &EventCreateDBRequest) -> Result<Event> {
        let mut conn = self.pool.acquire().await?;
        Events::new(&mut conn).create(request).await
    }

    async fn get_event(&self, id: EventId) -> Result<Option<Event>> {
        let mut conn = self.pool.acquire().await?;
        Events::new(&mut conn).get_by_id(id).await
    }
}

#[async_trait]
impl SubscriptionStore for PostgresStore {
    async fn active_subscribers(&self, event_type: &str) -> Result<Vec<Subscriber>> {
        let mut conn = self.pool.acquire().await?;
        Subscriptions::new(&mut conn).list_active_for_event_type(event_type).await
    }
}

#[async_trait]
impl DeliveryLogStore for PostgresStore {
    async fn append(&self, request: &DeliveryLogCreateDBRequest) -> Result<DeliveryLog> {
        let mut conn = self.pool.acquire().await?;
        DeliveryLogs::new(&mut conn).create(request).await
    }
}
