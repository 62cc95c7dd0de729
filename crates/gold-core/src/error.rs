//! Error types for `gold-core`.

use chrono::NaiveDate;
use thiserror::Error;

/// The failure classes a reconciliation run can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
  /// The run must not start or continue (no provenance batch, out-of-order
  /// date, lock held or lost). Nothing was written.
  Precondition,
  /// The entity schema or the snapshot's shape is unusable.
  Schema,
  /// The backing store failed; the transaction was rolled back.
  Storage,
  /// The history already breaks the one-current-row invariant.
  Invariant,
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("no successful batch for dataset={dataset} as_of_date={as_of}")]
  NoSuccessfulBatch { dataset: String, as_of: NaiveDate },

  #[error(
    "as_of {as_of} precedes the current version of {key:?} (valid_from {valid_from})"
  )]
  AsOfBeforeCurrentVersion {
    key:        String,
    valid_from: NaiveDate,
    as_of:      NaiveDate,
  },

  #[error("entity {entity} is locked by {holder} until {expires_at}")]
  LockHeld {
    entity:     String,
    holder:     String,
    expires_at: String,
  },

  #[error("lock on {entity} held by {holder} was taken over by another run")]
  LockLost { entity: String, holder: uuid::Uuid },

  #[error("invalid identifier: {0:?}")]
  InvalidIdentifier(String),

  #[error("invalid schema for {entity}: {reason}")]
  InvalidSchema { entity: String, reason: String },

  #[error("unknown entity: {0}")]
  UnknownEntity(String),

  #[error("source relation {0} does not exist")]
  MissingRelation(String),

  #[error("source relation {relation} is missing columns {columns:?}")]
  MissingColumns {
    relation: String,
    columns:  Vec<String>,
  },

  #[error("source relation {0} yielded a row with a null key")]
  NullKey(String),

  #[error("closing {key:?} in {table} affected {affected} rows, expected 1")]
  CurrentVersionMismatch {
    table:    String,
    key:      String,
    affected: usize,
  },
}

impl Error {
  pub fn category(&self) -> ErrorCategory {
    match self {
      Self::NoSuccessfulBatch { .. }
      | Self::AsOfBeforeCurrentVersion { .. }
      | Self::LockHeld { .. }
      | Self::LockLost { .. } => ErrorCategory::Precondition,
      Self::InvalidIdentifier(_)
      | Self::InvalidSchema { .. }
      | Self::UnknownEntity(_)
      | Self::MissingRelation(_)
      | Self::MissingColumns { .. }
      | Self::NullKey(_) => ErrorCategory::Schema,
      Self::CurrentVersionMismatch { .. } => ErrorCategory::Invariant,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
