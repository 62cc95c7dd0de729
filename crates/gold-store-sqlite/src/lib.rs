//! SQLite backend for the Gold history store.
//!
//! Hosts the batch registry, the reconciliation run log and lock, and one
//! append-only history table per entity. Wraps [`tokio_rusqlite`] so all
//! database access runs on a dedicated thread without blocking the async
//! runtime.

mod encode;
mod registry;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use registry::{BatchRun, BatchStatus, RunLogEntry};
pub use store::{SqliteStore, StoreOptions};
