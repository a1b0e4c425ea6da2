//! Repository implementations, one per table.

pub mod delivery_logs;
pub mod events;
pub mod jobs;
pub mod subscriptions;

pub use delivery_logs::DeliveryLogs;
pub use events::Events;
pub use jobs::Jobs;
pub use subscriptions::Subscriptions;
