//! Database repository for the delivery audit trail. Rows are only ever inserted.

use sqlx::PgConnection;
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::delivery_logs::{DeliveryLog, DeliveryLogCreateDBRequest};
use crate::types::abbrev_uuid;

/// Repository for delivery log operations.
pub struct DeliveryLogs<'c> {
    db: &'c mut PgConnection,
}

impl<'c> DeliveryLogs<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Append one delivery log row.
    #[instrument(
        skip(self, request),
        fields(
            subscription_id = %abbrev_uuid(&request.subscription_id),
            event_id = %abbrev_uuid(&request.event_id),
            status = %request.status,
        ),
        err
    )]
    pub async fn create(&mut self, request: &DeliveryLogCreateDBRequest) -> Result<DeliveryLog> {
        let log = sqlx::query_as::<_, DeliveryLog>(
            r#"
            INSERT INTO delivery_logs (subscription_id, event_id, status, response_status_code, response_body)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, subscription_id, event_id, status, response_status_code, response_body, attempted_at
            "#,
        )
        .bind(request.subscription_id)
        .bind(request.event_id)
        .bind(request.status.as_str())
        .bind(request.response_status_code)
        .bind(request.response_body.as_deref())
        .fetch_one(&mut *self.db)
        .await?;

        Ok(log)
    }
}
