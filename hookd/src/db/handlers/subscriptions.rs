//! Database repository for subscriptions. Read-only from the relay's side.

use sqlx::PgConnection;
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::subscriptions::Subscriber;

/// Repository for subscription lookups.
pub struct Subscriptions<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Subscriptions<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Active subscribers for an event type, in insertion order.
    #[instrument(skip(self), err)]
    pub async fn list_active_for_event_type(&mut self, event_type: &str) -> Result<Vec<Subscriber>> {
        let subscribers = sqlx::query_as::<_, Subscriber>(
            r#"
            SELECT id, endpoint_url, secret_key
            FROM subscriptions
            WHERE event_type = $1
              AND is_active = TRUE
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(event_type)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(subscribers)
    }
}
