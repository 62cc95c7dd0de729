//! Batch Registry and reconciliation run log.
//!
//! `batch_runs` is written by the ingestion side; the reconciler only reads
//! it to resolve provenance. `reconcile_runs` records every non-dry
//! reconciliation attempt.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::OptionalExtension as _;
use tracing::{debug, info};
use uuid::Uuid;

use gold_core::{
  record::{ApplyCounts, RunOutcome},
  store::BatchRegistry,
  value::BatchId,
};

use crate::{
  Error, Result,
  encode::{
    decode_batch_status, decode_date, decode_dt, decode_uuid, encode_batch_status, encode_date,
    encode_dt, encode_uuid,
  },
  store::SqliteStore,
};

/// Lifecycle of one ingestion batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
  Started,
  Success,
  Failed,
  /// The same source file had already been ingested.
  Skipped,
}

/// One row of `batch_runs`.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRun {
  pub batch_id:    BatchId,
  pub dataset:     String,
  pub as_of:       NaiveDate,
  pub source_name: String,
  pub checksum:    String,
  pub status:      BatchStatus,
  pub message:     Option<String>,
  pub started_at:  DateTime<Utc>,
  pub finished_at: Option<DateTime<Utc>>,
}

/// One row of `reconcile_runs`. `outcome` is `None` while the run is still
/// in progress, or if it died before recording how it ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RunLogEntry {
  pub run_id:      Uuid,
  pub entity:      String,
  pub as_of:       NaiveDate,
  pub batch_id:    BatchId,
  pub outcome:     Option<RunOutcome>,
  pub started_at:  DateTime<Utc>,
  pub finished_at: Option<DateTime<Utc>>,
}

// ─── Raw rows ────────────────────────────────────────────────────────────────

struct RawBatchRun {
  batch_id:    i64,
  dataset:     String,
  as_of:       String,
  source_name: String,
  checksum:    String,
  status:      String,
  message:     Option<String>,
  started_at:  String,
  finished_at: Option<String>,
}

impl RawBatchRun {
  fn into_batch_run(self) -> Result<BatchRun> {
    Ok(BatchRun {
      batch_id:    BatchId(self.batch_id),
      dataset:     self.dataset,
      as_of:       decode_date(&self.as_of)?,
      source_name: self.source_name,
      checksum:    self.checksum,
      status:      decode_batch_status(&self.status)?,
      message:     self.message,
      started_at:  decode_dt(&self.started_at)?,
      finished_at: self.finished_at.as_deref().map(decode_dt).transpose()?,
    })
  }
}

struct RawRunLogEntry {
  run_id:      String,
  entity:      String,
  as_of:       String,
  batch_id:    i64,
  status:      String,
  inserted:    Option<i64>,
  closed:      Option<i64>,
  message:     Option<String>,
  started_at:  String,
  finished_at: Option<String>,
}

impl RawRunLogEntry {
  fn into_entry(self) -> Result<RunLogEntry> {
    let outcome = match self.status.as_str() {
      "started" => None,
      "succeeded" => Some(RunOutcome::Succeeded {
        counts: ApplyCounts {
          inserted: self.inserted.unwrap_or(0) as usize,
          closed:   self.closed.unwrap_or(0) as usize,
        },
      }),
      "failed" => Some(RunOutcome::Failed {
        message: self.message.unwrap_or_default(),
      }),
      other => {
        return Err(Error::UnknownDiscriminant {
          what:  "run status",
          value: other.to_owned(),
        });
      }
    };
    Ok(RunLogEntry {
      run_id: decode_uuid(&self.run_id)?,
      entity: self.entity,
      as_of: decode_date(&self.as_of)?,
      batch_id: BatchId(self.batch_id),
      outcome,
      started_at: decode_dt(&self.started_at)?,
      finished_at: self.finished_at.as_deref().map(decode_dt).transpose()?,
    })
  }
}

// ─── Ingestion side ──────────────────────────────────────────────────────────

impl SqliteStore {
  /// Start an ingestion batch for `(dataset, as_of)` reading `source_name`.
  ///
  /// Returns `None` without writing anything if a batch with the same
  /// dataset, date and `checksum` already succeeded or was skipped: the file
  /// has been ingested.
  pub async fn register_batch(
    &self,
    dataset: &str,
    as_of: NaiveDate,
    source_name: &str,
    checksum: &str,
  ) -> Result<Option<BatchId>> {
    let dataset_str = dataset.to_owned();
    let as_of_str = encode_date(as_of);
    let source_str = source_name.to_owned();
    let checksum = checksum.to_owned();
    let now = encode_dt(Utc::now());

    let id: Option<i64> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let seen = tx
          .query_row(
            "SELECT batch_id FROM batch_runs
             WHERE dataset = ?1 AND as_of_date = ?2 AND source_checksum = ?3
               AND status IN ('success', 'skipped')
             LIMIT 1",
            rusqlite::params![dataset_str, as_of_str, checksum],
            |r| r.get::<_, i64>(0),
          )
          .optional()?;
        if seen.is_some() {
          return Ok(None);
        }
        tx.execute(
          "INSERT INTO batch_runs
             (dataset, as_of_date, source_name, source_checksum, status, started_at)
           VALUES (?1, ?2, ?3, ?4, 'started', ?5)",
          rusqlite::params![dataset_str, as_of_str, source_str, checksum, now],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(Some(id))
      })
      .await?;

    match id {
      Some(id) => info!(dataset, %as_of, source_name, batch_id = id, "registered batch"),
      None => info!(dataset, %as_of, source_name, "source already ingested; skipping"),
    }
    Ok(id.map(BatchId))
  }

  /// Record how batch `batch_id` ended.
  pub async fn finish_batch(
    &self,
    batch_id: BatchId,
    status: BatchStatus,
    message: Option<String>,
  ) -> Result<()> {
    let status_str = encode_batch_status(status);
    let now = encode_dt(Utc::now());

    let affected = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE batch_runs SET status = ?1, message = ?2, finished_at = ?3
           WHERE batch_id = ?4",
          rusqlite::params![status_str, message, now, batch_id.0],
        )?)
      })
      .await?;

    if affected == 0 {
      return Err(Error::BatchNotFound(batch_id));
    }
    debug!(%batch_id, status = status_str, "finished batch");
    Ok(())
  }

  pub async fn batch_run(&self, batch_id: BatchId) -> Result<Option<BatchRun>> {
    let raw: Option<RawBatchRun> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT batch_id, dataset, as_of_date, source_name, source_checksum,
                    status, message, started_at, finished_at
             FROM batch_runs WHERE batch_id = ?1",
            rusqlite::params![batch_id.0],
            |row| {
              Ok(RawBatchRun {
                batch_id:    row.get(0)?,
                dataset:     row.get(1)?,
                as_of:       row.get(2)?,
                source_name: row.get(3)?,
                checksum:    row.get(4)?,
                status:      row.get(5)?,
                message:     row.get(6)?,
                started_at:  row.get(7)?,
                finished_at: row.get(8)?,
              })
            },
          )
          .optional()?)
      })
      .await?;

    raw.map(RawBatchRun::into_batch_run).transpose()
  }

  /// Every logged reconciliation attempt for `entity`, oldest first.
  pub async fn run_log(&self, entity: &str) -> Result<Vec<RunLogEntry>> {
    let entity = entity.to_owned();

    let raws: Vec<RawRunLogEntry> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT run_id, entity, as_of_date, batch_id, status, inserted, closed,
                  message, started_at, finished_at
           FROM reconcile_runs WHERE entity = ?1
           ORDER BY started_at, rowid",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![entity], |row| {
            Ok(RawRunLogEntry {
              run_id:      row.get(0)?,
              entity:      row.get(1)?,
              as_of:       row.get(2)?,
              batch_id:    row.get(3)?,
              status:      row.get(4)?,
              inserted:    row.get(5)?,
              closed:      row.get(6)?,
              message:     row.get(7)?,
              started_at:  row.get(8)?,
              finished_at: row.get(9)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawRunLogEntry::into_entry).collect()
  }
}

// ─── BatchRegistry impl ──────────────────────────────────────────────────────

impl BatchRegistry for SqliteStore {
  type Error = Error;

  async fn resolve_batch(&self, dataset: &str, as_of: NaiveDate) -> Result<Option<BatchId>> {
    let dataset = dataset.to_owned();
    let as_of_str = encode_date(as_of);

    let id: Option<i64> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT batch_id FROM batch_runs
             WHERE dataset = ?1 AND as_of_date = ?2 AND status = 'success'
             ORDER BY batch_id DESC
             LIMIT 1",
            rusqlite::params![dataset, as_of_str],
            |r| r.get(0),
          )
          .optional()?)
      })
      .await?;

    Ok(id.map(BatchId))
  }

  async fn begin_run(&self, entity: &str, as_of: NaiveDate, batch_id: BatchId) -> Result<Uuid> {
    let run_id = Uuid::new_v4();
    let run_id_str = encode_uuid(run_id);
    let entity = entity.to_owned();
    let as_of_str = encode_date(as_of);
    let now = encode_dt(Utc::now());

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO reconcile_runs (run_id, entity, as_of_date, batch_id, status, started_at)
           VALUES (?1, ?2, ?3, ?4, 'started', ?5)",
          rusqlite::params![run_id_str, entity, as_of_str, batch_id.0, now],
        )?;
        Ok(())
      })
      .await?;

    Ok(run_id)
  }

  async fn finish_run(&self, run_id: Uuid, outcome: &RunOutcome) -> Result<()> {
    let run_id_str = encode_uuid(run_id);
    let now = encode_dt(Utc::now());
    let (status, inserted, closed, message) = match outcome {
      RunOutcome::Succeeded { counts } => (
        "succeeded",
        Some(counts.inserted as i64),
        Some(counts.closed as i64),
        None,
      ),
      RunOutcome::Failed { message } => ("failed", None, None, Some(message.clone())),
    };

    let affected = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE reconcile_runs
           SET status = ?1, inserted = ?2, closed = ?3, message = ?4, finished_at = ?5
           WHERE run_id = ?6",
          rusqlite::params![status, inserted, closed, message, now, run_id_str],
        )?)
      })
      .await?;

    if affected == 0 {
      return Err(Error::RunNotFound(run_id));
    }
    Ok(())
  }
}
