//! Error type for `gold-store-sqlite`.

use gold_core::{ErrorCategory, value::BatchId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Core(#[from] gold_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("unknown {what}: {value:?}")]
  UnknownDiscriminant { what: &'static str, value: String },

  #[error("duration out of range: {0}")]
  Duration(String),

  #[error("batch not found: {0}")]
  BatchNotFound(BatchId),

  #[error("reconciliation run not found: {0}")]
  RunNotFound(uuid::Uuid),
}

impl Error {
  /// Where this failure sits in the run error taxonomy. Anything raised by
  /// the database layer itself counts as a storage failure.
  pub fn category(&self) -> ErrorCategory {
    match self {
      Self::Core(e) => e.category(),
      _ => ErrorCategory::Storage,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
