//! Encoding and decoding helpers between domain types and the plain
//! representations stored in SQLite columns.
//!
//! As-of dates are stored as `YYYY-MM-DD`. Timestamps are fixed-width
//! RFC 3339 UTC strings (microseconds, `Z` suffix) so they compare correctly
//! as text. UUIDs are stored as hyphenated lowercase strings.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use gold_core::{
  record::VersionedRecord,
  value::{AttrValue, BatchId},
};
use rusqlite::types::{Value, ValueRef};
use uuid::Uuid;

use crate::{Error, Result, registry::BatchStatus};

// ─── Uuid ────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── NaiveDate ───────────────────────────────────────────────────────────────

pub fn encode_date(d: NaiveDate) -> String { d.format("%Y-%m-%d").to_string() }

pub fn decode_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, "%Y-%m-%d")
    .map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

// ─── AttrValue ───────────────────────────────────────────────────────────────

pub fn encode_value(v: &AttrValue) -> Value {
  match v {
    AttrValue::Null => Value::Null,
    AttrValue::Integer(i) => Value::Integer(*i),
    AttrValue::Real(r) => Value::Real(*r),
    AttrValue::Text(s) => Value::Text(s.clone()),
    AttrValue::Blob(b) => Value::Blob(b.clone()),
  }
}

/// Text that is not valid UTF-8 is kept byte-for-byte as a blob.
pub fn decode_value(v: ValueRef<'_>) -> AttrValue {
  match v {
    ValueRef::Null => AttrValue::Null,
    ValueRef::Integer(i) => AttrValue::Integer(i),
    ValueRef::Real(r) => AttrValue::Real(r),
    ValueRef::Text(t) => match std::str::from_utf8(t) {
      Ok(s) => AttrValue::Text(s.to_owned()),
      Err(_) => AttrValue::Blob(t.to_vec()),
    },
    ValueRef::Blob(b) => AttrValue::Blob(b.to_vec()),
  }
}

// ─── BatchStatus ─────────────────────────────────────────────────────────────

pub fn encode_batch_status(s: BatchStatus) -> &'static str {
  match s {
    BatchStatus::Started => "started",
    BatchStatus::Success => "success",
    BatchStatus::Failed => "failed",
    BatchStatus::Skipped => "skipped",
  }
}

pub fn decode_batch_status(s: &str) -> Result<BatchStatus> {
  match s {
    "started" => Ok(BatchStatus::Started),
    "success" => Ok(BatchStatus::Success),
    "failed" => Ok(BatchStatus::Failed),
    "skipped" => Ok(BatchStatus::Skipped),
    other => Err(Error::UnknownDiscriminant {
      what:  "batch status",
      value: other.to_owned(),
    }),
  }
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw values read directly from a history row, in
/// [`crate::schema::version_columns`] order.
pub struct RawVersion {
  pub version_id:  i64,
  pub key:         String,
  pub attributes:  Vec<AttrValue>,
  pub valid_from:  String,
  pub valid_to:    String,
  pub is_current:  bool,
  pub is_deleted:  bool,
  pub record_hash: String,
  pub batch_id:    i64,
}

impl RawVersion {
  /// Read a row selected with `version_columns` for a schema with
  /// `field_count` business fields.
  pub fn from_row(row: &rusqlite::Row<'_>, field_count: usize) -> rusqlite::Result<Self> {
    let attributes = (0..field_count)
      .map(|i| row.get_ref(2 + i).map(decode_value))
      .collect::<rusqlite::Result<Vec<_>>>()?;
    let base = 2 + field_count;
    Ok(Self {
      version_id: row.get(0)?,
      key: row.get(1)?,
      attributes,
      valid_from: row.get(base)?,
      valid_to: row.get(base + 1)?,
      is_current: row.get(base + 2)?,
      is_deleted: row.get(base + 3)?,
      record_hash: row.get(base + 4)?,
      batch_id: row.get(base + 5)?,
    })
  }

  pub fn into_record(self) -> Result<VersionedRecord> {
    Ok(VersionedRecord {
      version_id:  self.version_id,
      key:         self.key,
      attributes:  self.attributes,
      valid_from:  decode_date(&self.valid_from)?,
      valid_to:    decode_date(&self.valid_to)?,
      is_current:  self.is_current,
      is_deleted:  self.is_deleted,
      record_hash: self.record_hash,
      batch_id:    BatchId(self.batch_id),
    })
  }
}
