//! Configuration and entity catalog for the `gold` binary.
//!
//! Settings are layered: an optional TOML file, then `GOLD_*` environment
//! variables. Entities declared under `[entities.<name>]` are added to the
//! built-in employee, advance-request and payment schemas, replacing a
//! built-in of the same name.

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
  time::Duration,
};

use gold_core::schema::{EntitySchema, SchemaDef};
use gold_store_sqlite::StoreOptions;
use serde::Deserialize;

// ─── Settings ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
  #[serde(default = "default_store_path")]
  pub store_path:      PathBuf,
  #[serde(default = "default_busy_timeout_ms")]
  pub busy_timeout_ms: u64,
  #[serde(default = "default_lock_ttl_secs")]
  pub lock_ttl_secs:   u64,
  #[serde(default)]
  pub entities:        BTreeMap<String, SchemaDef>,
}

fn default_store_path() -> PathBuf { PathBuf::from("gold.db") }

fn default_busy_timeout_ms() -> u64 { 5000 }

fn default_lock_ttl_secs() -> u64 { 900 }

impl Settings {
  /// Read `path` (if it exists) and overlay `GOLD_*` environment variables.
  pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
    config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(config::Environment::with_prefix("GOLD"))
      .build()?
      .try_deserialize()
  }

  /// The store location with a leading `~` expanded.
  pub fn store_path(&self) -> PathBuf { expand_tilde(&self.store_path) }

  pub fn store_options(&self) -> StoreOptions {
    StoreOptions {
      busy_timeout: Duration::from_millis(self.busy_timeout_ms),
    }
  }

  pub fn lock_ttl(&self) -> Duration { Duration::from_secs(self.lock_ttl_secs) }

  /// Validate configured entities and merge them over the built-ins.
  pub fn catalog(&self) -> gold_core::Result<Catalog> {
    let mut schemas: BTreeMap<String, EntitySchema> = EntitySchema::builtins()
      .into_iter()
      .map(|s| (s.name().to_owned(), s))
      .collect();
    for (name, def) in &self.entities {
      let schema = EntitySchema::new(name.clone(), def.clone())?;
      schemas.insert(name.clone(), schema);
    }
    Ok(Catalog { schemas })
  }
}

// ─── Catalog ─────────────────────────────────────────────────────────────────

/// Every entity the binary can reconcile, by name.
#[derive(Debug, Clone)]
pub struct Catalog {
  schemas: BTreeMap<String, EntitySchema>,
}

impl Catalog {
  pub fn get(&self, name: &str) -> gold_core::Result<&EntitySchema> {
    self
      .schemas
      .get(name)
      .ok_or_else(|| gold_core::Error::UnknownEntity(name.to_owned()))
  }

  pub fn iter(&self) -> impl Iterator<Item = &EntitySchema> { self.schemas.values() }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

#[cfg(test)]
mod tests {
  use std::io::Write as _;

  use gold_core::ErrorCategory;

  use super::*;

  fn settings_from(toml: &str) -> Settings {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(toml.as_bytes()).unwrap();
    Settings::load(file.path()).unwrap()
  }

  #[test]
  fn missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::load(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(settings.busy_timeout_ms, 5000);
    assert_eq!(settings.lock_ttl(), Duration::from_secs(900));
    assert!(settings.entities.is_empty());

    let catalog = settings.catalog().unwrap();
    let names: Vec<&str> = catalog.iter().map(EntitySchema::name).collect();
    assert_eq!(names, ["demande_avance", "paiement", "salarie"]);
  }

  #[test]
  fn configured_entities_extend_the_builtins() {
    let settings = settings_from(
      r#"
store_path      = "/tmp/gold-test.db"
busy_timeout_ms = 250

[entities.demande_avance_seule]
dataset       = "demande_avance"
source        = "silver_demande_avance"
history_table = "gold_demande_avance_seule_histo"
key           = "ref_demande_avance"
fields        = ["ref_salarie", "montant_demande"]
"#,
    );
    assert_eq!(settings.store_path(), PathBuf::from("/tmp/gold-test.db"));
    assert_eq!(
      settings.store_options().busy_timeout,
      Duration::from_millis(250)
    );

    let catalog = settings.catalog().unwrap();
    let schema = catalog.get("demande_avance_seule").unwrap();
    assert_eq!(schema.dataset(), "demande_avance");
    assert_eq!(schema.fields(), ["ref_salarie", "montant_demande"]);
    assert!(catalog.get("salarie").is_ok());
  }

  #[test]
  fn configured_entity_replaces_builtin_of_same_name() {
    let settings = settings_from(
      r#"
[entities.salarie]
source        = "staging_salarie"
history_table = "gold_salarie_histo"
key           = "ref_salarie"
fields        = ["nom"]
"#,
    );
    let catalog = settings.catalog().unwrap();
    let schema = catalog.get("salarie").unwrap();
    assert_eq!(schema.source(), "staging_salarie");
    assert_eq!(schema.dataset(), "salarie");
    assert_eq!(schema.fields(), ["nom"]);
  }

  #[test]
  fn invalid_configured_entity_is_a_schema_error() {
    let settings = settings_from(
      r#"
[entities.broken]
source        = "silver_broken"
history_table = "gold_broken_histo"
key           = "id"
fields        = ["id", "name"]
"#,
    );
    let err = settings.catalog().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Schema);
  }

  #[test]
  fn unknown_entity_is_reported() {
    let catalog = Settings::load(Path::new("/nonexistent/gold.toml"))
      .unwrap()
      .catalog()
      .unwrap();
    assert!(matches!(
      catalog.get("contrat"),
      Err(gold_core::Error::UnknownEntity(name)) if name == "contrat"
    ));
  }

  #[test]
  fn tilde_is_expanded_from_home() {
    let Ok(home) = std::env::var("HOME") else { return };
    assert_eq!(
      expand_tilde(Path::new("~/gold.db")),
      PathBuf::from(home).join("gold.db")
    );
    assert_eq!(expand_tilde(Path::new("/abs/gold.db")), PathBuf::from("/abs/gold.db"));
  }
}
