//! PostgreSQL persistence for events, subscriptions, delivery logs and queued jobs.
//!
//! ```text
//! ┌──────────────────────────┐
//! │ storage / queue backends │  (trait implementations used by the worker)
//! └────────────┬─────────────┘
//!              │
//!              ↓
//! ┌──────────────────────────┐
//! │ Repositories             │  (db::handlers - one per table)
//! └────────────┬─────────────┘
//!              │
//!              ↓
//! ┌──────────────────────────┐
//! │ Models                   │  (db::models - row structs)
//! └──────────────────────────┘
//! ```
//!
//! Repositories borrow a `PgConnection` for the duration of a call:
//!
//! ```ignore
//! let mut conn = pool.acquire().await?;
//! let event = Events::new(&mut conn).get_by_id(event_id).await?;
//! ```
//!
//! The schema lives in `migrations/` and is applied by [`crate::migrator`].

pub mod errors;
pub mod handlers;
pub mod models;
