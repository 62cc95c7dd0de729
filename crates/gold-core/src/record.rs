//! Snapshot rows, history versions and the operations that connect them.
//!
//! A version is never updated in place: the only permitted transition is
//! "close" (set `valid_to`, clear `is_current`). New states are always new
//! rows, including deletions, which are recorded as tombstone versions.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::{AttrValue, BatchId};

/// The `valid_to` of a version that is still current.
pub fn open_end() -> NaiveDate {
  NaiveDate::from_ymd_opt(9999, 12, 31).unwrap_or(NaiveDate::MAX)
}

// ─── Inputs ──────────────────────────────────────────────────────────────────

/// One row of the upstream snapshot. `attributes` follow the schema's field
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
  pub key:        String,
  pub attributes: Vec<AttrValue>,
}

/// A persisted history row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
  /// Store-assigned row id; increases with insertion order.
  pub version_id:  i64,
  pub key:         String,
  pub attributes:  Vec<AttrValue>,
  pub valid_from:  NaiveDate,
  /// [`open_end()`] while the version is current.
  pub valid_to:    NaiveDate,
  pub is_current:  bool,
  pub is_deleted:  bool,
  pub record_hash: String,
  pub batch_id:    BatchId,
}

impl VersionedRecord {
  /// Closed-open visibility: `valid_from <= date < valid_to`.
  pub fn is_visible_at(&self, date: NaiveDate) -> bool {
    self.valid_from <= date && date < self.valid_to
  }
}

// ─── Operations ──────────────────────────────────────────────────────────────

/// A single key-scoped history transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
  /// End the current version of `key` at the plan's as-of date.
  Close { key: String },
  /// Write a new current version of `key` starting at the plan's as-of date.
  Insert {
    key:        String,
    attributes: Vec<AttrValue>,
    is_deleted: bool,
  },
}

impl Operation {
  pub fn key(&self) -> &str {
    match self {
      Self::Close { key } | Self::Insert { key, .. } => key,
    }
  }
}

/// How the engine classified one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
  New,
  Changed,
  Unchanged,
  /// Vanished from the snapshot; a tombstone is written.
  Deleted,
  /// Back in the snapshot after a tombstone.
  Resurrected,
  /// Still missing from the snapshot and already tombstoned.
  AlreadyDeleted,
}

/// Per-class key counts for one plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
  pub new:             usize,
  pub changed:         usize,
  pub unchanged:       usize,
  pub deleted:         usize,
  pub resurrected:     usize,
  pub already_deleted: usize,
}

impl PlanSummary {
  pub fn record(&mut self, class: Classification) {
    let slot = match class {
      Classification::New => &mut self.new,
      Classification::Changed => &mut self.changed,
      Classification::Unchanged => &mut self.unchanged,
      Classification::Deleted => &mut self.deleted,
      Classification::Resurrected => &mut self.resurrected,
      Classification::AlreadyDeleted => &mut self.already_deleted,
    };
    *slot += 1;
  }
}

/// The output of [`crate::reconcile::reconcile`]: the ordered operations for
/// one entity and as-of date, plus the context the writer stamps onto them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilePlan {
  pub entity:     String,
  pub as_of:      NaiveDate,
  pub batch_id:   BatchId,
  pub operations: Vec<Operation>,
  pub summary:    PlanSummary,
}

impl ReconcilePlan {
  pub fn is_empty(&self) -> bool { self.operations.is_empty() }
}

// ─── Outcomes ────────────────────────────────────────────────────────────────

/// Rows touched by the version writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyCounts {
  pub inserted: usize,
  pub closed:   usize,
}

/// Terminal state of a run attempt, as recorded in the run log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
  Succeeded { counts: ApplyCounts },
  Failed { message: String },
}

/// What a finished run reports back to its caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
  pub entity:        String,
  pub history_table: String,
  pub as_of:         NaiveDate,
  pub batch_id:      BatchId,
  /// `None` for dry runs, which are not logged.
  pub run_id:        Option<Uuid>,
  pub summary:       PlanSummary,
  pub counts:        ApplyCounts,
  pub dry_run:       bool,
}
