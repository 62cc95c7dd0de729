//! One reconciliation run, end to end.
//!
//! Resolve provenance → lock the entity → load snapshot and current versions
//! → diff → apply in one transaction → record the outcome. Every run starts
//! from a fresh read of the current versions; nothing is cached between runs.

use std::time::Duration;

use chrono::NaiveDate;
use tracing::{debug, error, info, warn};

use crate::{
  Error,
  reconcile::reconcile,
  record::{ApplyCounts, ReconcilePlan, RunOutcome, RunReport},
  schema::EntitySchema,
  store::{BatchRegistry, HistoryStore, LockToken, SnapshotSource},
  value::BatchId,
};

/// Lock lifetime when the caller does not configure one.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(15 * 60);

/// Parameters for [`reconcile_entity`].
#[derive(Debug, Clone)]
pub struct RunRequest {
  pub as_of:         NaiveDate,
  /// Batch Registry dataset; defaults to the schema's dataset.
  pub batch_dataset: Option<String>,
  pub lock_ttl:      Duration,
  /// Compute and report the plan without locking or writing.
  pub dry_run:       bool,
}

impl RunRequest {
  pub fn new(as_of: NaiveDate) -> Self {
    Self {
      as_of,
      batch_dataset: None,
      lock_ttl: DEFAULT_LOCK_TTL,
      dry_run: false,
    }
  }
}

/// Reconcile `schema`'s history against its snapshot as of `request.as_of`.
///
/// Fails without writing anything if no successful batch exists for the
/// dataset and date. Any failure after the lock is taken is recorded in the
/// run log and propagated; the store's transaction guarantees no partial
/// version set is left behind.
pub async fn reconcile_entity<S, E>(
  store: &S,
  schema: &EntitySchema,
  request: &RunRequest,
) -> Result<RunReport, E>
where
  S: BatchRegistry<Error = E> + SnapshotSource<Error = E> + HistoryStore<Error = E>,
  E: std::error::Error + Send + Sync + 'static + From<Error>,
{
  let dataset = request
    .batch_dataset
    .as_deref()
    .unwrap_or(schema.dataset());
  let batch_id = store
    .resolve_batch(dataset, request.as_of)
    .await?
    .ok_or_else(|| Error::NoSuccessfulBatch {
      dataset: dataset.to_owned(),
      as_of:   request.as_of,
    })?;

  info!(
    entity = schema.name(),
    as_of = %request.as_of,
    %batch_id,
    dry_run = request.dry_run,
    "starting reconciliation"
  );

  if request.dry_run {
    let plan = compute_plan(store, schema, request.as_of, batch_id).await?;
    return Ok(report(schema, &plan, None, ApplyCounts::default(), true));
  }

  let lock = store
    .acquire_lock(schema.name(), request.as_of, request.lock_ttl)
    .await?;

  let run_id = match store.begin_run(schema.name(), request.as_of, batch_id).await {
    Ok(id) => id,
    Err(e) => {
      release(store, &lock).await;
      return Err(e);
    }
  };

  let result = execute(store, schema, request.as_of, batch_id, &lock).await;

  let outcome = match &result {
    Ok((_, counts)) => RunOutcome::Succeeded { counts: *counts },
    Err(e) => RunOutcome::Failed { message: e.to_string() },
  };
  let finished = store.finish_run(run_id, &outcome).await;
  release(store, &lock).await;

  match result {
    Ok((plan, counts)) => {
      // The plan is committed; a run-log failure must not turn it into an error.
      if let Err(log_err) = finished {
        warn!(%run_id, error = %log_err, "could not record committed run");
      }
      info!(
        entity = schema.name(),
        as_of = %request.as_of,
        %batch_id,
        %run_id,
        inserted = counts.inserted,
        closed = counts.closed,
        "reconciliation committed"
      );
      Ok(report(schema, &plan, Some(run_id), counts, false))
    }
    Err(e) => {
      if let Err(log_err) = finished {
        warn!(%run_id, error = %log_err, "could not record failed run");
      }
      error!(entity = schema.name(), as_of = %request.as_of, %run_id, error = %e, "reconciliation failed");
      Err(e)
    }
  }
}

async fn compute_plan<S, E>(
  store: &S,
  schema: &EntitySchema,
  as_of: NaiveDate,
  batch_id: BatchId,
) -> Result<ReconcilePlan, E>
where
  S: SnapshotSource<Error = E> + HistoryStore<Error = E>,
  E: From<Error>,
{
  let source = store.load_snapshot(schema).await?;
  let current = store.load_current(schema).await?;
  let plan = reconcile(schema.name(), &source, &current, as_of, batch_id)?;
  debug!(
    entity = schema.name(),
    snapshot = source.len(),
    current = current.len(),
    operations = plan.operations.len(),
    summary = ?plan.summary,
    "computed plan"
  );
  Ok(plan)
}

async fn execute<S, E>(
  store: &S,
  schema: &EntitySchema,
  as_of: NaiveDate,
  batch_id: BatchId,
  lock: &LockToken,
) -> Result<(ReconcilePlan, ApplyCounts), E>
where
  S: SnapshotSource<Error = E> + HistoryStore<Error = E>,
  E: From<Error>,
{
  let plan = compute_plan(store, schema, as_of, batch_id).await?;
  let counts = store.apply(schema, &plan, lock).await?;
  Ok((plan, counts))
}

async fn release<S: HistoryStore>(store: &S, lock: &LockToken) {
  if let Err(e) = store.release_lock(lock).await {
    warn!(entity = %lock.entity, holder = %lock.holder_id, error = %e, "could not release lock");
  }
}

fn report(
  schema: &EntitySchema,
  plan: &ReconcilePlan,
  run_id: Option<uuid::Uuid>,
  counts: ApplyCounts,
  dry_run: bool,
) -> RunReport {
  RunReport {
    entity: schema.name().to_owned(),
    history_table: schema.history_table().to_owned(),
    as_of: plan.as_of,
    batch_id: plan.batch_id,
    run_id,
    summary: plan.summary,
    counts,
    dry_run,
  }
}

#[cfg(test)]
mod tests {
  //! Pipeline behaviour against an in-memory fake; the SQLite backend has its
  //! own end-to-end tests.

  use std::{collections::BTreeMap, sync::Mutex};

  use chrono::Utc;
  use uuid::Uuid;

  use super::*;
  use crate::{
    ErrorCategory,
    hash::fingerprint,
    record::{Operation, SourceRecord, VersionedRecord, open_end},
    value::AttrValue,
  };

  #[derive(Debug, thiserror::Error)]
  enum FakeError {
    #[error(transparent)]
    Core(#[from] Error),
    #[error("injected apply failure")]
    Apply,
    #[error("injected run-log failure")]
    Finish,
  }

  #[derive(Default)]
  struct Fake {
    batch:       Option<BatchId>,
    snapshot:    BTreeMap<String, SourceRecord>,
    history:     Mutex<Vec<VersionedRecord>>,
    runs:        Mutex<Vec<(Uuid, Option<RunOutcome>)>>,
    locked:      Mutex<bool>,
    fail_apply:  bool,
    fail_finish: bool,
  }

  impl BatchRegistry for Fake {
    type Error = FakeError;

    async fn resolve_batch(&self, _: &str, _: NaiveDate) -> Result<Option<BatchId>, FakeError> {
      Ok(self.batch)
    }

    async fn begin_run(&self, _: &str, _: NaiveDate, _: BatchId) -> Result<Uuid, FakeError> {
      let id = Uuid::new_v4();
      self.runs.lock().unwrap().push((id, None));
      Ok(id)
    }

    async fn finish_run(&self, run_id: Uuid, outcome: &RunOutcome) -> Result<(), FakeError> {
      if self.fail_finish {
        return Err(FakeError::Finish);
      }
      let mut runs = self.runs.lock().unwrap();
      if let Some(run) = runs.iter_mut().find(|(id, _)| *id == run_id) {
        run.1 = Some(outcome.clone());
      }
      Ok(())
    }
  }

  impl SnapshotSource for Fake {
    type Error = FakeError;

    async fn load_snapshot(
      &self,
      _: &EntitySchema,
    ) -> Result<BTreeMap<String, SourceRecord>, FakeError> {
      Ok(self.snapshot.clone())
    }
  }

  impl HistoryStore for Fake {
    type Error = FakeError;

    async fn load_current(
      &self,
      _: &EntitySchema,
    ) -> Result<BTreeMap<String, VersionedRecord>, FakeError> {
      Ok(
        self
          .history
          .lock()
          .unwrap()
          .iter()
          .filter(|v| v.is_current)
          .map(|v| (v.key.clone(), v.clone()))
          .collect(),
      )
    }

    async fn apply(
      &self,
      _: &EntitySchema,
      plan: &ReconcilePlan,
      _: &LockToken,
    ) -> Result<ApplyCounts, FakeError> {
      if self.fail_apply {
        return Err(FakeError::Apply);
      }
      let mut history = self.history.lock().unwrap();
      let mut counts = ApplyCounts::default();
      for op in &plan.operations {
        match op {
          Operation::Close { key } => {
            for v in history.iter_mut().filter(|v| v.is_current && &v.key == key) {
              v.is_current = false;
              v.valid_to = plan.as_of;
              counts.closed += 1;
            }
          }
          Operation::Insert { key, attributes, is_deleted } => {
            let version_id = history.len() as i64 + 1;
            history.push(VersionedRecord {
              version_id,
              key: key.clone(),
              attributes: attributes.clone(),
              valid_from: plan.as_of,
              valid_to: open_end(),
              is_current: true,
              is_deleted: *is_deleted,
              record_hash: fingerprint(attributes, *is_deleted),
              batch_id: plan.batch_id,
            });
            counts.inserted += 1;
          }
        }
      }
      Ok(counts)
    }

    async fn acquire_lock(
      &self,
      entity: &str,
      as_of: NaiveDate,
      ttl: Duration,
    ) -> Result<LockToken, FakeError> {
      let mut locked = self.locked.lock().unwrap();
      if *locked {
        return Err(FakeError::Core(Error::LockHeld {
          entity:     entity.to_owned(),
          holder:     "other".into(),
          expires_at: "later".into(),
        }));
      }
      *locked = true;
      Ok(LockToken {
        entity: entity.to_owned(),
        as_of,
        holder_id: Uuid::new_v4(),
        expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap(),
      })
    }

    async fn release_lock(&self, _: &LockToken) -> Result<(), FakeError> {
      *self.locked.lock().unwrap() = false;
      Ok(())
    }

    async fn history(
      &self,
      _: &EntitySchema,
      key: &str,
    ) -> Result<Vec<VersionedRecord>, FakeError> {
      Ok(
        self
          .history
          .lock()
          .unwrap()
          .iter()
          .filter(|v| v.key == key)
          .cloned()
          .collect(),
      )
    }

    async fn versions_as_of(
      &self,
      _: &EntitySchema,
      date: NaiveDate,
      include_deleted: bool,
    ) -> Result<Vec<VersionedRecord>, FakeError> {
      Ok(
        self
          .history
          .lock()
          .unwrap()
          .iter()
          .filter(|v| v.is_visible_at(date) && (include_deleted || !v.is_deleted))
          .cloned()
          .collect(),
      )
    }
  }

  fn snapshot(rows: &[(&str, &str, &str, &str)]) -> BTreeMap<String, SourceRecord> {
    rows
      .iter()
      .map(|(k, nni, nom, prenom)| {
        ((*k).to_owned(), SourceRecord {
          key:        (*k).to_owned(),
          attributes: vec![
            AttrValue::from(*nni),
            AttrValue::from(*nom),
            AttrValue::from(*prenom),
          ],
        })
      })
      .collect()
  }

  fn as_of() -> NaiveDate { "2024-08-25".parse().unwrap() }

  #[tokio::test]
  async fn missing_batch_is_a_precondition_failure() {
    let fake = Fake::default();
    let err = reconcile_entity(&fake, &EntitySchema::employee(), &RunRequest::new(as_of()))
      .await
      .unwrap_err();
    let FakeError::Core(core) = err else { panic!("expected a core error") };
    assert_eq!(core.category(), ErrorCategory::Precondition);
    assert!(fake.runs.lock().unwrap().is_empty());
    assert!(!*fake.locked.lock().unwrap());
  }

  #[tokio::test]
  async fn successful_run_is_logged_and_unlocks() {
    let fake = Fake {
      batch: Some(BatchId(3)),
      snapshot: snapshot(&[("S1", "1", "Dupont", "Jean"), ("S2", "2", "Martin", "Lea")]),
      ..Fake::default()
    };
    let report = reconcile_entity(&fake, &EntitySchema::employee(), &RunRequest::new(as_of()))
      .await
      .unwrap();

    assert_eq!(report.counts, ApplyCounts { inserted: 2, closed: 0 });
    assert_eq!(report.batch_id, BatchId(3));
    assert_eq!(report.history_table, "gold_salarie_histo");
    assert!(!*fake.locked.lock().unwrap());

    let runs = fake.runs.lock().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].0, report.run_id.unwrap());
    assert_eq!(
      runs[0].1,
      Some(RunOutcome::Succeeded { counts: report.counts })
    );
  }

  #[tokio::test]
  async fn failed_apply_is_logged_and_unlocks() {
    let fake = Fake {
      batch: Some(BatchId(3)),
      snapshot: snapshot(&[("S1", "1", "Dupont", "Jean")]),
      fail_apply: true,
      ..Fake::default()
    };
    let err = reconcile_entity(&fake, &EntitySchema::employee(), &RunRequest::new(as_of()))
      .await
      .unwrap_err();
    assert!(matches!(err, FakeError::Apply));
    assert!(!*fake.locked.lock().unwrap());

    let runs = fake.runs.lock().unwrap();
    assert_eq!(
      runs[0].1,
      Some(RunOutcome::Failed { message: "injected apply failure".into() })
    );
  }

  #[tokio::test]
  async fn run_log_failure_after_commit_still_reports_success() {
    let fake = Fake {
      batch: Some(BatchId(3)),
      snapshot: snapshot(&[("S1", "1", "Dupont", "Jean")]),
      fail_finish: true,
      ..Fake::default()
    };
    let report = reconcile_entity(&fake, &EntitySchema::employee(), &RunRequest::new(as_of()))
      .await
      .unwrap();

    assert_eq!(report.counts, ApplyCounts { inserted: 1, closed: 0 });
    assert_eq!(fake.history.lock().unwrap().len(), 1);
    assert!(!*fake.locked.lock().unwrap());
  }

  #[tokio::test]
  async fn held_lock_stops_the_run_before_logging() {
    let fake = Fake {
      batch: Some(BatchId(3)),
      locked: Mutex::new(true),
      ..Fake::default()
    };
    let err = reconcile_entity(&fake, &EntitySchema::employee(), &RunRequest::new(as_of()))
      .await
      .unwrap_err();
    assert!(matches!(err, FakeError::Core(Error::LockHeld { .. })));
    assert!(fake.runs.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn dry_run_reports_without_writing() {
    let fake = Fake {
      batch: Some(BatchId(3)),
      snapshot: snapshot(&[("S1", "1", "Dupont", "Jean")]),
      ..Fake::default()
    };
    let request = RunRequest { dry_run: true, ..RunRequest::new(as_of()) };
    let report = reconcile_entity(&fake, &EntitySchema::employee(), &request)
      .await
      .unwrap();

    assert!(report.dry_run);
    assert_eq!(report.summary.new, 1);
    assert_eq!(report.counts, ApplyCounts::default());
    assert!(report.run_id.is_none());
    assert!(fake.history.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn second_run_with_same_snapshot_is_a_no_op() {
    let fake = Fake {
      batch: Some(BatchId(3)),
      snapshot: snapshot(&[("S1", "1", "Dupont", "Jean")]),
      ..Fake::default()
    };
    let schema = EntitySchema::employee();
    let request = RunRequest::new(as_of());
    reconcile_entity(&fake, &schema, &request).await.unwrap();
    let second = reconcile_entity(&fake, &schema, &request).await.unwrap();

    assert_eq!(second.counts, ApplyCounts::default());
    assert_eq!(second.summary.unchanged, 1);
  }
}
