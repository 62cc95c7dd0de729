//! SCD2 diff: snapshot + current versions → minimal history operations.
//!
//! Two passes over the inputs:
//!
//! - **upsert**: every snapshot key is new, changed, resurrected or
//!   unchanged relative to its current version;
//! - **tombstone**: every current key missing from the snapshot gets a
//!   deleted version carrying its last known attributes, unless it already is
//!   one.
//!
//! Operations are key-scoped and never read each other's output, so the only
//! ordering that matters is `Close` before `Insert` for the same key. Inputs
//! are ordered maps, which makes the emitted plan deterministic.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::{
  Error, Result,
  hash::fingerprint,
  record::{Classification, Operation, PlanSummary, ReconcilePlan, SourceRecord, VersionedRecord},
  value::BatchId,
};

/// Compute the operations that bring `current` in line with `source` as of
/// `as_of`.
///
/// Fails if a key that needs closing has a current version starting after
/// `as_of`: closing it would produce `valid_to < valid_from`.
pub fn reconcile(
  entity: &str,
  source: &BTreeMap<String, SourceRecord>,
  current: &BTreeMap<String, VersionedRecord>,
  as_of: NaiveDate,
  batch_id: BatchId,
) -> Result<ReconcilePlan> {
  let mut operations = Vec::new();
  let mut summary = PlanSummary::default();

  // Pass A: upsert.
  for (key, record) in source {
    let class = match current.get(key) {
      None => Classification::New,
      Some(existing) if existing.is_deleted => Classification::Resurrected,
      Some(existing) => {
        if existing.record_hash == fingerprint(&record.attributes, false) {
          Classification::Unchanged
        } else {
          Classification::Changed
        }
      }
    };
    summary.record(class);

    match class {
      Classification::New => {}
      Classification::Changed | Classification::Resurrected => {
        close(&mut operations, current, key, as_of)?;
      }
      _ => continue,
    }
    operations.push(Operation::Insert {
      key:        key.clone(),
      attributes: record.attributes.clone(),
      is_deleted: false,
    });
  }

  // Pass B: tombstone.
  for (key, existing) in current {
    if source.contains_key(key) {
      continue;
    }
    if existing.is_deleted {
      summary.record(Classification::AlreadyDeleted);
      continue;
    }
    summary.record(Classification::Deleted);
    close(&mut operations, current, key, as_of)?;
    operations.push(Operation::Insert {
      key:        key.clone(),
      attributes: existing.attributes.clone(),
      is_deleted: true,
    });
  }

  Ok(ReconcilePlan {
    entity: entity.to_owned(),
    as_of,
    batch_id,
    operations,
    summary,
  })
}

fn close(
  operations: &mut Vec<Operation>,
  current: &BTreeMap<String, VersionedRecord>,
  key: &str,
  as_of: NaiveDate,
) -> Result<()> {
  if let Some(existing) = current.get(key)
    && as_of < existing.valid_from
  {
    return Err(Error::AsOfBeforeCurrentVersion {
      key:        key.to_owned(),
      valid_from: existing.valid_from,
      as_of,
    });
  }
  operations.push(Operation::Close { key: key.to_owned() });
  Ok(())
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{ErrorCategory, record::open_end, value::AttrValue};

  const ENTITY: &str = "salarie";
  const BATCH: BatchId = BatchId(7);

  fn date(s: &str) -> NaiveDate { s.parse().unwrap() }

  fn attrs(values: &[&str]) -> Vec<AttrValue> {
    values.iter().map(|v| AttrValue::from(*v)).collect()
  }

  /// Snapshot rows with a single business attribute each.
  fn source(rows: &[(&str, &str)]) -> BTreeMap<String, SourceRecord> {
    rows
      .iter()
      .map(|(k, v)| {
        ((*k).to_owned(), SourceRecord {
          key:        (*k).to_owned(),
          attributes: attrs(&[*v]),
        })
      })
      .collect()
  }

  fn version(key: &str, values: &[&str], is_deleted: bool) -> VersionedRecord {
    let attributes = attrs(values);
    VersionedRecord {
      version_id: 1,
      key: key.to_owned(),
      record_hash: fingerprint(&attributes, is_deleted),
      attributes,
      valid_from: date("2024-08-25"),
      valid_to: open_end(),
      is_current: true,
      is_deleted,
      batch_id: BatchId(1),
    }
  }

  fn current(rows: Vec<VersionedRecord>) -> BTreeMap<String, VersionedRecord> {
    rows.into_iter().map(|r| (r.key.clone(), r)).collect()
  }

  fn plan(
    src: &BTreeMap<String, SourceRecord>,
    cur: &BTreeMap<String, VersionedRecord>,
  ) -> ReconcilePlan {
    reconcile(ENTITY, src, cur, date("2024-09-02"), BATCH).unwrap()
  }

  #[test]
  fn new_key_is_inserted() {
    let p = plan(&source(&[("A", "1")]), &BTreeMap::new());
    assert_eq!(p.operations, vec![Operation::Insert {
      key:        "A".into(),
      attributes: attrs(&["1"]),
      is_deleted: false,
    }]);
    assert_eq!(p.summary.new, 1);
    assert_eq!(p.batch_id, BATCH);
    assert_eq!(p.as_of, date("2024-09-02"));
  }

  #[test]
  fn changed_attribute_closes_then_inserts() {
    let p = plan(
      &source(&[("A", "Dupont_CORR")]),
      &current(vec![version("A", &["Dupont"], false)]),
    );
    assert_eq!(p.operations, vec![
      Operation::Close { key: "A".into() },
      Operation::Insert {
        key:        "A".into(),
        attributes: attrs(&["Dupont_CORR"]),
        is_deleted: false,
      },
    ]);
    assert_eq!(p.summary.changed, 1);
  }

  #[test]
  fn missing_key_is_tombstoned_with_last_known_attributes() {
    let p = plan(&BTreeMap::new(), &current(vec![version("B", &["x", "y"], false)]));
    assert_eq!(p.operations, vec![
      Operation::Close { key: "B".into() },
      Operation::Insert {
        key:        "B".into(),
        attributes: attrs(&["x", "y"]),
        is_deleted: true,
      },
    ]);
    assert_eq!(p.summary.deleted, 1);
  }

  #[test]
  fn tombstoned_key_reappearing_unchanged_is_resurrected() {
    let p = plan(
      &source(&[("C", "same")]),
      &current(vec![version("C", &["same"], true)]),
    );
    assert_eq!(p.operations, vec![
      Operation::Close { key: "C".into() },
      Operation::Insert {
        key:        "C".into(),
        attributes: attrs(&["same"]),
        is_deleted: false,
      },
    ]);
    assert_eq!(p.summary.resurrected, 1);
  }

  #[test]
  fn unchanged_key_is_a_no_op() {
    let p = plan(
      &source(&[("D", "v")]),
      &current(vec![version("D", &["v"], false)]),
    );
    assert!(p.is_empty());
    assert_eq!(p.summary.unchanged, 1);
  }

  #[test]
  fn repeated_tombstone_is_a_no_op() {
    let p = plan(&BTreeMap::new(), &current(vec![version("E", &["v"], true)]));
    assert!(p.is_empty());
    assert_eq!(p.summary.already_deleted, 1);
  }

  #[test]
  fn mixed_snapshot_orders_upserts_before_tombstones() {
    let p = plan(
      &source(&[("A", "new"), ("C", "c2"), ("D", "d")]),
      &current(vec![
        version("B", &["b"], false),
        version("C", &["c1"], false),
        version("D", &["d"], false),
      ]),
    );
    let keys: Vec<&str> = p.operations.iter().map(Operation::key).collect();
    assert_eq!(keys, ["A", "C", "C", "B", "B"]);
    assert_eq!(
      p.summary,
      PlanSummary {
        new: 1,
        changed: 1,
        unchanged: 1,
        deleted: 1,
        ..PlanSummary::default()
      }
    );
  }

  #[test]
  fn as_of_before_current_version_is_rejected() {
    let err = reconcile(
      ENTITY,
      &source(&[("A", "changed")]),
      &current(vec![version("A", &["orig"], false)]),
      date("2024-08-01"),
      BATCH,
    )
    .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Precondition);
  }

  #[test]
  fn as_of_equal_to_valid_from_is_allowed() {
    let p = reconcile(
      ENTITY,
      &source(&[("A", "changed")]),
      &current(vec![version("A", &["orig"], false)]),
      date("2024-08-25"),
      BATCH,
    )
    .unwrap();
    assert_eq!(p.operations.len(), 2);
  }

  #[test]
  fn null_to_empty_string_change_goes_undetected() {
    let mut cur = version("F", &["x"], false);
    cur.attributes = vec![AttrValue::Null];
    cur.record_hash = fingerprint(&cur.attributes, false);
    let p = plan(&source(&[("F", "")]), &current(vec![cur]));
    assert!(p.is_empty());
  }
}
