//! [`SqliteStore`], the SQLite implementation of the snapshot, history and
//! registry adapters.

use std::{collections::BTreeMap, path::Path, time::Duration};

use chrono::{NaiveDate, Utc};
use rusqlite::{OptionalExtension as _, TransactionBehavior, types::Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use gold_core::{
  hash::fingerprint,
  record::{ApplyCounts, Operation, ReconcilePlan, SourceRecord, VersionedRecord, open_end},
  schema::EntitySchema,
  store::{HistoryStore, LockToken, SnapshotSource},
  value::AttrValue,
};

use crate::{
  Error, Result,
  encode::{RawVersion, decode_dt, decode_value, encode_date, encode_dt, encode_uuid, encode_value},
  schema::{SCHEMA, history_ddl, quote, version_columns},
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// Connection-level settings.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
  /// How long a statement waits for a competing writer before failing.
  pub busy_timeout: Duration,
}

impl Default for StoreOptions {
  fn default() -> Self {
    Self {
      busy_timeout: Duration::from_millis(5000),
    }
  }
}

/// A Gold store backed by a single SQLite file. Snapshot relations, history
/// tables and the registry live side by side.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  pub(crate) conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    Self::open_with(path, StoreOptions::default()).await
  }

  pub async fn open_with(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema(options).await?;
    Ok(store)
  }

  /// Open an in-memory store, for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema(StoreOptions::default()).await?;
    Ok(store)
  }

  async fn init_schema(&self, options: StoreOptions) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn.busy_timeout(options.busy_timeout)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Create `schema`'s history table and indexes if they do not exist yet.
  pub async fn ensure_history(&self, schema: &EntitySchema) -> Result<()> {
    let ddl = history_ddl(schema);
    self
      .conn
      .call(move |conn| {
        conn.execute_batch(&ddl)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Whether a table or view called `name` exists.
  pub(crate) async fn table_exists(&self, name: &str) -> Result<bool> {
    let name = name.to_owned();
    let exists = self
      .conn
      .call(move |conn| {
        let found = conn
          .query_row(
            "SELECT 1 FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
            rusqlite::params![name],
            |_| Ok(()),
          )
          .optional()?;
        Ok(found.is_some())
      })
      .await?;
    Ok(exists)
  }

  /// Run an arbitrary batch of SQL. Used by ingestion jobs and tests to
  /// (re)build snapshot relations.
  pub async fn execute_batch(&self, sql: &str) -> Result<()> {
    let sql = sql.to_owned();
    self
      .conn
      .call(move |conn| {
        conn.execute_batch(&sql)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn select_versions(
    &self,
    schema: &EntitySchema,
    filter: &str,
    params: Vec<Value>,
  ) -> Result<Vec<VersionedRecord>> {
    // Reads never create the table; an entity with no history has no rows.
    if !self.table_exists(schema.history_table()).await? {
      return Ok(Vec::new());
    }

    let field_count = schema.fields().len();
    let sql = format!(
      "SELECT {} FROM {} {filter}",
      version_columns(schema),
      quote(schema.history_table()),
    );

    let raws: Vec<RawVersion> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params), |row| {
            RawVersion::from_row(row, field_count)
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawVersion::into_record).collect()
  }
}

// ─── SnapshotSource impl ─────────────────────────────────────────────────────

impl SnapshotSource for SqliteStore {
  type Error = Error;

  async fn load_snapshot(&self, schema: &EntitySchema) -> Result<BTreeMap<String, SourceRecord>> {
    let relation = schema.source().to_owned();

    let present: Vec<String> = {
      let relation = relation.clone();
      self
        .conn
        .call(move |conn| {
          let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
          let names = stmt
            .query_map(rusqlite::params![relation], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
          Ok(names)
        })
        .await?
    };

    if present.is_empty() {
      return Err(gold_core::Error::MissingRelation(relation).into());
    }
    let present: Vec<String> = present.iter().map(|c| c.to_ascii_lowercase()).collect();
    let missing: Vec<String> = std::iter::once(schema.key())
      .chain(schema.fields().iter().map(String::as_str))
      .filter(|c| !present.contains(&c.to_ascii_lowercase()))
      .map(str::to_owned)
      .collect();
    if !missing.is_empty() {
      return Err(
        gold_core::Error::MissingColumns {
          relation,
          columns: missing,
        }
        .into(),
      );
    }

    let columns: Vec<String> = std::iter::once(schema.key())
      .chain(schema.fields().iter().map(String::as_str))
      .map(quote)
      .collect();
    let sql = format!("SELECT {} FROM {}", columns.join(", "), quote(&relation));
    let field_count = schema.fields().len();

    let rows: Vec<(AttrValue, Vec<AttrValue>)> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map([], |row| {
            let key = decode_value(row.get_ref(0)?);
            let attributes = (1..=field_count)
              .map(|i| row.get_ref(i).map(decode_value))
              .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok((key, attributes))
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    let mut snapshot = BTreeMap::new();
    let mut duplicates = 0usize;
    for (key, attributes) in rows {
      if key.is_null() {
        return Err(gold_core::Error::NullKey(relation).into());
      }
      let key = key.canonical();
      let record = SourceRecord {
        key: key.clone(),
        attributes,
      };
      if snapshot.insert(key, record).is_some() {
        duplicates += 1;
      }
    }
    if duplicates > 0 {
      warn!(
        entity = schema.name(),
        relation = %relation,
        duplicates,
        "snapshot has duplicate keys; keeping the last row for each"
      );
    }

    debug!(entity = schema.name(), rows = snapshot.len(), "loaded snapshot");
    Ok(snapshot)
  }
}

// ─── HistoryStore impl ───────────────────────────────────────────────────────

impl HistoryStore for SqliteStore {
  type Error = Error;

  async fn load_current(
    &self,
    schema: &EntitySchema,
  ) -> Result<BTreeMap<String, VersionedRecord>> {
    let rows = self
      .select_versions(schema, "WHERE is_current = 1", Vec::new())
      .await?;
    Ok(rows.into_iter().map(|r| (r.key.clone(), r)).collect())
  }

  async fn apply(
    &self,
    schema: &EntitySchema,
    plan: &ReconcilePlan,
    lock: &LockToken,
  ) -> Result<ApplyCounts> {
    self.ensure_history(schema).await?;

    let table = quote(schema.history_table());
    let key_col = quote(schema.key());
    let close_sql = format!(
      "UPDATE {table} SET valid_to = ?1, is_current = 0
       WHERE {key_col} = ?2 AND is_current = 1"
    );
    let mut insert_cols = vec![key_col.clone()];
    insert_cols.extend(schema.fields().iter().map(|f| quote(f)));
    insert_cols.extend(
      ["valid_from", "valid_to", "is_current", "is_deleted", "record_hash", "batch_id"]
        .map(str::to_owned),
    );
    let placeholders: Vec<String> = (1..=insert_cols.len()).map(|i| format!("?{i}")).collect();
    let insert_sql = format!(
      "INSERT INTO {table} ({}) VALUES ({})",
      insert_cols.join(", "),
      placeholders.join(", "),
    );

    let history_table = schema.history_table().to_owned();
    let operations = plan.operations.clone();
    let as_of = encode_date(plan.as_of);
    let open = encode_date(open_end());
    let batch_id = plan.batch_id.0;
    let lock_entity = lock.entity.clone();
    let lock_holder = lock.holder_id;

    let applied = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let holder: Option<String> = tx
          .query_row(
            "SELECT holder_id FROM reconcile_locks WHERE entity = ?1",
            rusqlite::params![lock_entity],
            |r| r.get(0),
          )
          .optional()?;
        if holder.as_deref() != Some(encode_uuid(lock_holder).as_str()) {
          return Ok(Err(gold_core::Error::LockLost {
            entity: lock_entity,
            holder: lock_holder,
          }));
        }

        let mut counts = ApplyCounts::default();
        {
          let mut close = tx.prepare(&close_sql)?;
          let mut insert = tx.prepare(&insert_sql)?;

          for op in &operations {
            match op {
              Operation::Close { key } => {
                let affected = close.execute(rusqlite::params![as_of, key])?;
                if affected != 1 {
                  // Dropping `tx` without committing rolls back.
                  return Ok(Err(gold_core::Error::CurrentVersionMismatch {
                    table: history_table,
                    key: key.clone(),
                    affected,
                  }));
                }
                counts.closed += 1;
              }
              Operation::Insert {
                key,
                attributes,
                is_deleted,
              } => {
                let mut values = Vec::with_capacity(attributes.len() + 7);
                values.push(Value::Text(key.clone()));
                values.extend(attributes.iter().map(encode_value));
                values.push(Value::Text(as_of.clone()));
                values.push(Value::Text(open.clone()));
                values.push(Value::Integer(1));
                values.push(Value::Integer(i64::from(*is_deleted)));
                values.push(Value::Text(fingerprint(attributes, *is_deleted)));
                values.push(Value::Integer(batch_id));
                insert.execute(rusqlite::params_from_iter(values))?;
                counts.inserted += 1;
              }
            }
          }
        }
        tx.commit()?;
        Ok(Ok(counts))
      })
      .await?;

    let counts = applied?;
    info!(
      entity = schema.name(),
      table = schema.history_table(),
      as_of = %plan.as_of,
      batch_id = %plan.batch_id,
      inserted = counts.inserted,
      closed = counts.closed,
      "applied plan"
    );
    Ok(counts)
  }

  async fn acquire_lock(&self, entity: &str, as_of: NaiveDate, ttl: Duration) -> Result<LockToken> {
    let ttl = chrono::Duration::from_std(ttl).map_err(|e| Error::Duration(e.to_string()))?;
    let now = Utc::now();
    let expires_at = now
      .checked_add_signed(ttl)
      .ok_or_else(|| Error::Duration(format!("lock ttl of {ttl} overflows the clock")))?;
    let token = LockToken {
      entity: entity.to_owned(),
      as_of,
      holder_id: Uuid::new_v4(),
      expires_at,
    };

    let entity_str = token.entity.clone();
    let as_of_str = encode_date(as_of);
    let holder_str = encode_uuid(token.holder_id);
    let now_str = encode_dt(now);
    let expires_str = encode_dt(token.expires_at);

    let (stale, held): (Option<String>, Option<(String, String)>) = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stale: Option<String> = tx
          .query_row(
            "SELECT holder_id FROM reconcile_locks WHERE entity = ?1 AND expires_at <= ?2",
            rusqlite::params![entity_str, now_str],
            |r| r.get(0),
          )
          .optional()?;
        if stale.is_some() {
          tx.execute(
            "DELETE FROM reconcile_locks WHERE entity = ?1",
            rusqlite::params![entity_str],
          )?;
        }

        let inserted = tx.execute(
          "INSERT INTO reconcile_locks (entity, as_of_date, holder_id, acquired_at, expires_at)
           VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT(entity) DO NOTHING",
          rusqlite::params![entity_str, as_of_str, holder_str, now_str, expires_str],
        )?;

        let held = if inserted == 1 {
          None
        } else {
          Some(tx.query_row(
            "SELECT holder_id, expires_at FROM reconcile_locks WHERE entity = ?1",
            rusqlite::params![entity_str],
            |r| Ok((r.get(0)?, r.get(1)?)),
          )?)
        };

        tx.commit()?;
        Ok((stale, held))
      })
      .await?;

    if let Some((holder, expires_at)) = held {
      return Err(
        gold_core::Error::LockHeld {
          entity: token.entity,
          holder,
          expires_at,
        }
        .into(),
      );
    }
    if let Some(previous) = stale {
      warn!(entity, previous_holder = %previous, "took over expired reconciliation lock");
    }
    debug!(entity, holder = %token.holder_id, expires_at = %token.expires_at, "acquired lock");
    Ok(token)
  }

  async fn release_lock(&self, token: &LockToken) -> Result<()> {
    let entity = token.entity.clone();
    let holder = encode_uuid(token.holder_id);

    let released = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "DELETE FROM reconcile_locks WHERE entity = ?1 AND holder_id = ?2",
          rusqlite::params![entity, holder],
        )?)
      })
      .await?;

    if released == 0 {
      debug!(entity = %token.entity, holder = %token.holder_id, "lock was already taken over");
    }
    Ok(())
  }

  async fn history(&self, schema: &EntitySchema, key: &str) -> Result<Vec<VersionedRecord>> {
    let filter = format!(
      "WHERE {} = ?1 ORDER BY valid_from, version_id",
      quote(schema.key())
    );
    self
      .select_versions(schema, &filter, vec![Value::Text(key.to_owned())])
      .await
  }

  async fn versions_as_of(
    &self,
    schema: &EntitySchema,
    date: NaiveDate,
    include_deleted: bool,
  ) -> Result<Vec<VersionedRecord>> {
    let deleted = if include_deleted { "" } else { "AND is_deleted = 0" };
    let filter = format!(
      "WHERE valid_from <= ?1 AND ?1 < valid_to {deleted} ORDER BY {}, version_id",
      quote(schema.key())
    );
    self
      .select_versions(schema, &filter, vec![Value::Text(encode_date(date))])
      .await
  }
}

impl SqliteStore {
  /// Expiry of the lock currently recorded for `entity`, if any.
  pub async fn lock_expiry(&self, entity: &str) -> Result<Option<chrono::DateTime<Utc>>> {
    let entity = entity.to_owned();
    let raw: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT expires_at FROM reconcile_locks WHERE entity = ?1",
            rusqlite::params![entity],
            |r| r.get(0),
          )
          .optional()?)
      })
      .await?;
    raw.as_deref().map(decode_dt).transpose()
  }
}
