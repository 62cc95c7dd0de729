//! Core types and the SCD2 reconciliation engine for the Gold history store.
//!
//! No database dependencies live here. Storage backends (e.g.
//! `gold-store-sqlite`) implement the adapter traits in [`store`]; the binary
//! wires them together through [`pipeline`].

// Trait methods spell out `impl Future + Send`; implementors use `async fn`.
#![allow(async_fn_in_trait)]

pub mod error;
pub mod hash;
pub mod pipeline;
pub mod reconcile;
pub mod record;
pub mod schema;
pub mod store;
pub mod value;

pub use error::{Error, ErrorCategory, Result};
