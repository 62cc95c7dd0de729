//! Record fingerprints used for change detection.
//!
//! A fingerprint is a SHA-256 digest over the canonical forms of a version's
//! business attributes followed by its deletion flag. It is stored as
//! `record_hash` on every version and compared against the fingerprint of the
//! incoming snapshot row.

use sha2::{Digest, Sha256};

use crate::value::AttrValue;

/// Placed between canonical values; not expected in business data.
const SEPARATOR: &[u8] = b"\x1f";

/// Compute the fingerprint of `attributes` plus `is_deleted`.
///
/// Deterministic for identical input. `Null` and an empty string share the
/// canonical form `""`, so two attribute lists that differ only in that
/// respect produce the same fingerprint and the change goes undetected.
/// Existing history depends on this rule, so it is kept as is.
pub fn fingerprint(attributes: &[AttrValue], is_deleted: bool) -> String {
  let mut hasher = Sha256::new();
  for value in attributes {
    hasher.update(value.canonical().as_bytes());
    hasher.update(SEPARATOR);
  }
  let flag: &[u8] = if is_deleted { b"true" } else { b"false" };
  hasher.update(flag);
  hex::encode(hasher.finalize())
}
