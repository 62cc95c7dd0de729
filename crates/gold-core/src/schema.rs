//! Entity schemas: the declarative description of a reconcilable entity.
//!
//! A schema names the natural key, the ordered business fields that take part
//! in hashing and storage, the snapshot relation to read and the history table
//! to write. It is validated once at construction and never mutated.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Columns every history table carries besides the key and business fields.
pub const RESERVED_COLUMNS: &[&str] = &[
  "version_id",
  "valid_from",
  "valid_to",
  "is_current",
  "is_deleted",
  "record_hash",
  "batch_id",
];

/// The raw, unvalidated shape of a schema, as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDef {
  /// Batch Registry dataset; defaults to the entity name.
  #[serde(default)]
  pub dataset:       Option<String>,
  pub source:        String,
  pub history_table: String,
  pub key:           String,
  pub fields:        Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitySchema {
  name:          String,
  dataset:       String,
  source:        String,
  history_table: String,
  key:           String,
  fields:        Vec<String>,
}

impl EntitySchema {
  /// Validate `def` and build a schema named `name`.
  pub fn new(name: impl Into<String>, def: SchemaDef) -> Result<Self> {
    let name = name.into();
    let dataset = def.dataset.unwrap_or_else(|| name.clone());

    for ident in [&name, &def.source, &def.history_table, &def.key]
      .into_iter()
      .chain(def.fields.iter())
    {
      validate_identifier(ident)?;
    }

    let invalid = |reason: String| Error::InvalidSchema {
      entity: name.clone(),
      reason,
    };

    if def.fields.is_empty() {
      return Err(invalid("no business fields".into()));
    }
    // SQLite column names are case-insensitive.
    if def.fields.iter().any(|f| f.eq_ignore_ascii_case(&def.key)) {
      return Err(invalid(format!("key {} is also listed as a field", def.key)));
    }
    for (i, field) in def.fields.iter().enumerate() {
      if def.fields[..i].iter().any(|f| f.eq_ignore_ascii_case(field)) {
        return Err(invalid(format!("duplicate field {field}")));
      }
    }
    if let Some(col) = std::iter::once(&def.key)
      .chain(def.fields.iter())
      .find(|c| RESERVED_COLUMNS.contains(&c.to_ascii_lowercase().as_str()))
    {
      return Err(invalid(format!("{col} is a reserved history column")));
    }

    Ok(Self {
      name,
      dataset,
      source: def.source,
      history_table: def.history_table,
      key: def.key,
      fields: def.fields,
    })
  }

  pub fn name(&self) -> &str { &self.name }

  pub fn dataset(&self) -> &str { &self.dataset }

  pub fn source(&self) -> &str { &self.source }

  pub fn history_table(&self) -> &str { &self.history_table }

  pub fn key(&self) -> &str { &self.key }

  pub fn fields(&self) -> &[String] { &self.fields }

  // ── Built-in entities ─────────────────────────────────────────────────

  /// Employees (`salarie`).
  pub fn employee() -> Self {
    builtin("salarie", "silver_salarie", "gold_salarie_histo", "ref_salarie", &[
      "nni", "nom", "prenom",
    ])
  }

  /// Advance-payment requests enriched with their matching payment. The
  /// source relation performs the request/payment join.
  pub fn advance_request() -> Self {
    builtin(
      "demande_avance",
      "silver_demande_avance_paiement",
      "gold_demande_avance_histo",
      "ref_demande_avance",
      &[
        "ref_salarie",
        "montant_demande",
        "montant_paye",
        "date_paiement",
        "ref_paiement",
      ],
    )
  }

  /// Payments (`paiement`).
  pub fn payment() -> Self {
    builtin(
      "paiement",
      "silver_paiement",
      "gold_paiement_histo",
      "ref_paiement",
      &[
        "ref_salarie",
        "montant_paye",
        "rib_salarie",
        "date_paiement",
        "ref_demande_avance",
      ],
    )
  }

  pub fn builtins() -> Vec<Self> {
    vec![Self::employee(), Self::advance_request(), Self::payment()]
  }
}

fn builtin(
  name: &str,
  source: &str,
  history_table: &str,
  key: &str,
  fields: &[&str],
) -> EntitySchema {
  // Built-ins are valid by construction; bypass the validating path.
  EntitySchema {
    name:          name.to_owned(),
    dataset:       name.to_owned(),
    source:        source.to_owned(),
    history_table: history_table.to_owned(),
    key:           key.to_owned(),
    fields:        fields.iter().map(|f| (*f).to_owned()).collect(),
  }
}

/// Identifiers are interpolated into SQL, so only `[A-Za-z_][A-Za-z0-9_]*` is
/// accepted.
pub fn validate_identifier(ident: &str) -> Result<()> {
  let mut chars = ident.chars();
  let valid = match chars.next() {
    Some(c) if c.is_ascii_alphabetic() || c == '_' => {
      chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }
    _ => false,
  };
  if valid {
    Ok(())
  } else {
    Err(Error::InvalidIdentifier(ident.to_owned()))
  }
}
