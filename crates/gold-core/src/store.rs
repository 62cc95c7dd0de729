//! Adapter traits consumed by the reconciliation pipeline.
//!
//! The traits are implemented by storage backends (e.g. `gold-store-sqlite`).
//! The pipeline and the binary depend on these abstractions, not on any
//! concrete backend.

use std::{collections::BTreeMap, future::Future, time::Duration};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  record::{ApplyCounts, ReconcilePlan, RunOutcome, SourceRecord, VersionedRecord},
  schema::EntitySchema,
  value::BatchId,
};

/// Proof of holding the reconciliation lock for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
  pub entity:     String,
  pub as_of:      NaiveDate,
  pub holder_id:  Uuid,
  pub expires_at: DateTime<Utc>,
}

// ─── Batch Registry ──────────────────────────────────────────────────────────

/// The record of ingestion batches and reconciliation attempts.
pub trait BatchRegistry: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// The latest successfully completed batch for `(dataset, as_of)`, if any.
  fn resolve_batch<'a>(
    &'a self,
    dataset: &'a str,
    as_of: NaiveDate,
  ) -> impl Future<Output = Result<Option<BatchId>, Self::Error>> + Send + 'a;

  /// Log the start of a reconciliation attempt and return its run id.
  fn begin_run<'a>(
    &'a self,
    entity: &'a str,
    as_of: NaiveDate,
    batch_id: BatchId,
  ) -> impl Future<Output = Result<Uuid, Self::Error>> + Send + 'a;

  /// Record how the attempt `run_id` ended.
  fn finish_run<'a>(
    &'a self,
    run_id: Uuid,
    outcome: &'a RunOutcome,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}

// ─── Snapshot source ─────────────────────────────────────────────────────────

/// The authoritative upstream view of an entity.
pub trait SnapshotSource: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// One record per natural key, attributes in schema field order.
  ///
  /// Must fail before returning anything if the source relation lacks a
  /// schema field. Duplicate keys resolve last-write-wins.
  fn load_snapshot<'a>(
    &'a self,
    schema: &'a EntitySchema,
  ) -> impl Future<Output = Result<BTreeMap<String, SourceRecord>, Self::Error>> + Send + 'a;
}

// ─── History store ───────────────────────────────────────────────────────────

/// The append-only, versioned history of an entity.
pub trait HistoryStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// All rows with `is_current = true`, keyed by natural key.
  fn load_current<'a>(
    &'a self,
    schema: &'a EntitySchema,
  ) -> impl Future<Output = Result<BTreeMap<String, VersionedRecord>, Self::Error>> + Send + 'a;

  /// Apply every operation of `plan` in a single transaction.
  ///
  /// The transaction first checks that `lock` is still the entity's holder
  /// and fails with [`crate::Error::LockLost`] if it was taken over. A
  /// `Close` that does not affect exactly one row aborts the whole plan.
  fn apply<'a>(
    &'a self,
    schema: &'a EntitySchema,
    plan: &'a ReconcilePlan,
    lock: &'a LockToken,
  ) -> impl Future<Output = Result<ApplyCounts, Self::Error>> + Send + 'a;

  /// Take the per-entity reconciliation lock for `ttl`. Fails if another
  /// holder has an unexpired lock.
  fn acquire_lock<'a>(
    &'a self,
    entity: &'a str,
    as_of: NaiveDate,
    ttl: Duration,
  ) -> impl Future<Output = Result<LockToken, Self::Error>> + Send + 'a;

  /// Release a lock taken with [`HistoryStore::acquire_lock`]. Releasing a
  /// lock that has since been taken over is a no-op.
  fn release_lock<'a>(
    &'a self,
    token: &'a LockToken,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  // ── Reads ─────────────────────────────────────────────────────────────

  /// Every version of `key`, oldest first.
  fn history<'a>(
    &'a self,
    schema: &'a EntitySchema,
    key: &'a str,
  ) -> impl Future<Output = Result<Vec<VersionedRecord>, Self::Error>> + Send + 'a;

  /// The version of every key visible at `date` under the closed-open
  /// convention `valid_from <= date < valid_to`.
  ///
  /// Tombstones are left out unless `include_deleted` is set.
  fn versions_as_of<'a>(
    &'a self,
    schema: &'a EntitySchema,
    date: NaiveDate,
    include_deleted: bool,
  ) -> impl Future<Output = Result<Vec<VersionedRecord>, Self::Error>> + Send + 'a;
}
