//! Database repository for ingested events.

use sqlx::PgConnection;
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::events::{Event, EventCreateDBRequest};
use crate::types::{EventId, abbrev_uuid};

/// Repository for event operations.
pub struct Events<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Events<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Persist a new event.
    #[instrument(skip(self, request), fields(event_type = %request.event_type), err)]
    pub async fn create(&mut self, request: &EventCreateDBRequest) -> Result<Event> {
        let event = sqlx::query_as::<_, Event>(
            r#"
            INSERT INTO events (event_type, payload)
            VALUES ($1, $2)
            RETURNING id, event_type, payload, received_at
            "#,
        )
        .bind(&request.event_type)
        .bind(&request.payload)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(event)
    }

    /// Get an event by ID.
    #[instrument(skip(self), fields(event_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: EventId) -> Result<Option<Event>> {
        let event = sqlx::query_as::<_, Event>(r#"SELECT id, event_type, payload, received_at FROM events WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(event)
    }
}
