//! Subscriber resolution for an event type.

pub mod cache;

pub use cache::SubscriberCache;
