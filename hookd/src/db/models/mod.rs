//! Row structs for the relay's tables, plus the insert requests that create them.

pub mod delivery_logs;
pub mod events;
pub mod jobs;
pub mod subscriptions;
