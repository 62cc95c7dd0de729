//! `gold`: reconcile Silver snapshots into SCD2 Gold history.
//!
//! # Usage
//!
//! ```
//! gold apply salarie --as-of 2024-09-02
//! gold history salarie E1
//! gold as-of paiement --date 2024-09-01 --include-deleted
//! gold --config /etc/gold.toml entities
//! ```

use std::{io::Write as _, path::PathBuf};

use anyhow::Context as _;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use gold_cli::Settings;
use gold_core::{
  pipeline::{RunRequest, reconcile_entity},
  store::HistoryStore,
};
use gold_store_sqlite::SqliteStore;
use serde::Serialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gold", version, about = "SCD2 reconciliation of Silver snapshots")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "gold.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Reconcile one entity's history against its snapshot.
  Apply {
    entity:        String,
    /// Business date of the snapshot (YYYY-MM-DD).
    #[arg(long)]
    as_of:         NaiveDate,
    /// Batch Registry dataset, if it differs from the entity's.
    #[arg(long)]
    batch_dataset: Option<String>,
    /// Compute the plan and print it without writing.
    #[arg(long)]
    dry_run:       bool,
  },
  /// Print every version of one key as JSON lines.
  History { entity: String, key: String },
  /// Print the version of every key visible on a date as JSON lines.
  AsOf {
    entity:          String,
    #[arg(long)]
    date:            NaiveDate,
    #[arg(long)]
    include_deleted: bool,
  },
  /// List the entities that can be reconciled.
  Entities,
  /// Print the reconciliation run log of an entity as JSON lines.
  Runs { entity: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let settings = Settings::load(&cli.config)
    .with_context(|| format!("failed to read config {}", cli.config.display()))?;
  let catalog = settings.catalog().context("invalid entity configuration")?;

  if let Command::Entities = cli.command {
    for schema in catalog.iter() {
      println!("{}", serde_json::to_string(schema)?);
    }
    return Ok(());
  }

  let store_path = settings.store_path();
  let store = SqliteStore::open_with(&store_path, settings.store_options())
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;

  match cli.command {
    Command::Apply {
      entity,
      as_of,
      batch_dataset,
      dry_run,
    } => {
      let schema = catalog.get(&entity)?;
      let request = RunRequest {
        as_of,
        batch_dataset,
        lock_ttl: settings.lock_ttl(),
        dry_run,
      };
      let report = reconcile_entity(&store, schema, &request)
        .await
        .with_context(|| format!("reconciliation of {entity} as of {as_of} failed"))?;
      if report.dry_run {
        println!("{}", serde_json::to_string_pretty(&report)?);
      } else {
        println!(
          "OK {} applied for as_of={} (batch_id={}) inserted={} closed={}",
          report.history_table,
          report.as_of,
          report.batch_id,
          report.counts.inserted,
          report.counts.closed,
        );
      }
    }
    Command::History { entity, key } => {
      let schema = catalog.get(&entity)?;
      let versions = store
        .history(schema, &key)
        .await
        .with_context(|| format!("failed to read history of {entity}/{key}"))?;
      print_lines(&versions)?;
    }
    Command::AsOf {
      entity,
      date,
      include_deleted,
    } => {
      let schema = catalog.get(&entity)?;
      let versions = store
        .versions_as_of(schema, date, include_deleted)
        .await
        .with_context(|| format!("failed to read {entity} as of {date}"))?;
      print_lines(&versions)?;
    }
    Command::Runs { entity } => {
      let log = store
        .run_log(&entity)
        .await
        .with_context(|| format!("failed to read run log of {entity}"))?;
      let mut out = std::io::stdout().lock();
      for entry in log {
        let line = serde_json::json!({
          "run_id": entry.run_id,
          "entity": entry.entity,
          "as_of": entry.as_of,
          "batch_id": entry.batch_id,
          "outcome": entry.outcome,
          "started_at": entry.started_at,
          "finished_at": entry.finished_at,
        });
        writeln!(out, "{line}")?;
      }
    }
    Command::Entities => {}
  }

  Ok(())
}

/// One JSON document per line on stdout.
fn print_lines<T: Serialize>(items: &[T]) -> anyhow::Result<()> {
  let mut out = std::io::stdout().lock();
  for item in items {
    serde_json::to_writer(&mut out, item)?;
    writeln!(out)?;
  }
  Ok(())
}
