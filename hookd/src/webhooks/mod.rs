//! Webhook delivery.
//!
//! - [`signing`]: HMAC-SHA256 body signatures and subscription secrets
//! - [`client`]: signed HTTP POST, folded into a [`DeliveryOutcome`]
//! - [`recorder`]: one delivery log row per attempt
//! - [`worker`]: runs a claimed job end to end

pub mod client;
pub mod recorder;
pub mod signing;
pub mod worker;

pub use client::{DeliveryOutcome, WebhookClient};
pub use recorder::DeliveryLogRecorder;
pub use worker::DeliveryWorker;
