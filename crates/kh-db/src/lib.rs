//! SQLite persistence layer for KrakenHashes.
//!
//! One module per entity from the data model, each a thin repository of
//! free functions over a shared `DbPool` rather than a repository struct —
//! every state-changing operation is a single `UPDATE ... WHERE` guarded
//! on the expected prior state, so optimistic concurrency lives in SQL,
//! not in application-level locking.

pub mod agents;
pub mod artifacts;
pub mod claim_codes;
pub mod devices;
pub mod error;
pub mod hashlists;
pub mod jobs;
pub mod pool;
mod schema;
pub mod tasks;

pub use error::{DbError, Result};
pub use pool::{create_pool, DbConfig, DbPool};
