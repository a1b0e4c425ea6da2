//! Common identifier types.
//!
//! All entity IDs are UUIDs wrapped in type aliases for readability at call sites:
//!
//! - [`EventId`]: ingested event identifier
//! - [`SubscriptionId`]: subscriber endpoint registration
//! - [`DeliveryLogId`]: audit row for a single delivery attempt
//! - [`JobId`]: queued delivery job
//!
//! [`abbrev_uuid`] shortens UUIDs to their first 8 chars for log fields.

use uuid::Uuid;

pub type EventId = Uuid;
pub type SubscriptionId = Uuid;
pub type DeliveryLogId = Uuid;
pub type JobId = Uuid;

/// Abbreviate a UUID to its first 8 characters for logging.
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}
