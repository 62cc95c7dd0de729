//! Attribute values and provenance ids.
//!
//! Business attributes are dynamically typed: the same engine historizes
//! employees, advance requests and payments, whose columns differ. Values
//! mirror the storage classes a relational snapshot can yield.

use std::fmt;

use serde::{Deserialize, Serialize};

// ─── AttrValue ───────────────────────────────────────────────────────────────

/// One nullable business attribute. Calendar dates travel as ISO-8601
/// [`AttrValue::Text`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
  Null,
  Integer(i64),
  Real(f64),
  Text(String),
  Blob(Vec<u8>),
}

impl AttrValue {
  pub fn is_null(&self) -> bool { matches!(self, Self::Null) }

  /// The canonical string form fed to the fingerprint.
  ///
  /// `Null` renders as the empty string, so a null and an empty text value
  /// produce the same canonical form.
  pub fn canonical(&self) -> String {
    match self {
      Self::Null => String::new(),
      Self::Integer(i) => i.to_string(),
      // Debug gives the shortest round-trip form and keeps a trailing `.0`
      // on integral values.
      Self::Real(r) => format!("{r:?}"),
      Self::Text(s) => s.clone(),
      Self::Blob(b) => hex::encode(b),
    }
  }
}

impl From<&str> for AttrValue {
  fn from(s: &str) -> Self { Self::Text(s.to_owned()) }
}

impl From<String> for AttrValue {
  fn from(s: String) -> Self { Self::Text(s) }
}

impl From<i64> for AttrValue {
  fn from(i: i64) -> Self { Self::Integer(i) }
}

impl From<f64> for AttrValue {
  fn from(r: f64) -> Self { Self::Real(r) }
}

impl<T: Into<AttrValue>> From<Option<T>> for AttrValue {
  fn from(v: Option<T>) -> Self { v.map_or(Self::Null, Into::into) }
}

// ─── BatchId ─────────────────────────────────────────────────────────────────

/// Identifier of the ingestion batch that produced a version.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BatchId(pub i64);

impl fmt::Display for BatchId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}
