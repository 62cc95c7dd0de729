//! SQL schema for the Gold SQLite store.
//!
//! The registry tables are created once at connection startup. History tables
//! depend on the entity schema and are created on first use with
//! [`history_ddl`].

use gold_core::schema::EntitySchema;

/// Registry, run log and lock DDL; idempotent thanks to `IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- One row per ingestion attempt, written by the ingestion side.
CREATE TABLE IF NOT EXISTS batch_runs (
    batch_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    dataset         TEXT NOT NULL,
    as_of_date      TEXT NOT NULL,   -- YYYY-MM-DD
    source_name     TEXT NOT NULL,
    source_checksum TEXT NOT NULL,
    status          TEXT NOT NULL,   -- 'started' | 'success' | 'failed' | 'skipped'
    message         TEXT,
    started_at      TEXT NOT NULL,
    finished_at     TEXT
);

CREATE INDEX IF NOT EXISTS batch_runs_lookup_idx
    ON batch_runs(dataset, as_of_date, status);

-- One row per reconciliation attempt.
CREATE TABLE IF NOT EXISTS reconcile_runs (
    run_id      TEXT PRIMARY KEY,
    entity      TEXT NOT NULL,
    as_of_date  TEXT NOT NULL,
    batch_id    INTEGER NOT NULL REFERENCES batch_runs(batch_id),
    status      TEXT NOT NULL,       -- 'started' | 'succeeded' | 'failed'
    inserted    INTEGER,
    closed      INTEGER,
    message     TEXT,
    started_at  TEXT NOT NULL,
    finished_at TEXT
);

CREATE INDEX IF NOT EXISTS reconcile_runs_entity_idx
    ON reconcile_runs(entity, started_at);

-- At most one reconciliation per entity at a time.
CREATE TABLE IF NOT EXISTS reconcile_locks (
    entity      TEXT PRIMARY KEY,
    as_of_date  TEXT NOT NULL,
    holder_id   TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at  TEXT NOT NULL
);

PRAGMA user_version = 1;
";

/// DDL for `schema`'s history table.
///
/// Business columns carry no declared type so values keep the storage class
/// they had in the snapshot. Versions are only ever inserted or closed; the
/// partial unique index rejects a second current row for a key.
pub fn history_ddl(schema: &EntitySchema) -> String {
  let table = schema.history_table();
  let key = schema.key();
  let fields: String = schema
    .fields()
    .iter()
    .map(|f| format!("    \"{f}\",\n"))
    .collect();

  format!(
    "
CREATE TABLE IF NOT EXISTS \"{table}\" (
    version_id  INTEGER PRIMARY KEY AUTOINCREMENT,
    \"{key}\" TEXT NOT NULL,
{fields}    valid_from  TEXT NOT NULL,
    valid_to    TEXT NOT NULL,
    is_current  INTEGER NOT NULL CHECK (is_current IN (0, 1)),
    is_deleted  INTEGER NOT NULL CHECK (is_deleted IN (0, 1)),
    record_hash TEXT NOT NULL,
    batch_id    INTEGER NOT NULL REFERENCES batch_runs(batch_id),
    CHECK (valid_from <= valid_to)
);

CREATE UNIQUE INDEX IF NOT EXISTS \"{table}_current_uidx\"
    ON \"{table}\"(\"{key}\") WHERE is_current = 1;

CREATE INDEX IF NOT EXISTS \"{table}_key_idx\"
    ON \"{table}\"(\"{key}\", valid_from);
"
  )
}

/// Quoted, comma-separated column list: key, business fields, then the
/// version bookkeeping columns.
pub fn version_columns(schema: &EntitySchema) -> String {
  let mut cols = vec!["version_id".to_owned(), quote(schema.key())];
  cols.extend(schema.fields().iter().map(|f| quote(f)));
  cols.extend(
    ["valid_from", "valid_to", "is_current", "is_deleted", "record_hash", "batch_id"]
      .map(str::to_owned),
  );
  cols.join(", ")
}

/// Quote an identifier already checked by
/// [`gold_core::schema::validate_identifier`].
pub fn quote(ident: &str) -> String { format!("\"{ident}\"") }
