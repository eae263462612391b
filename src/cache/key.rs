//! Cache keys and invalidation tags.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::fmt;

/// Canonical serialization of query arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Fingerprint {
  /// The query takes no arguments
  NoArgs,
  /// Canonical JSON of the arguments
  Args(String),
}

impl Fingerprint {
  /// Fingerprint a JSON argument value.
  ///
  /// Object members with `null` values are dropped and keys are emitted in
  /// sorted order, so `{"b":1,"a":null}` and `{"b":1}` share a key.
  pub fn of(args: &Value) -> Self {
    match canonicalize(args) {
      None => Fingerprint::NoArgs,
      Some(v) => Fingerprint::Args(v.to_string()),
    }
  }

  fn as_str(&self) -> &str {
    match self {
      Fingerprint::NoArgs => "undefined",
      Fingerprint::Args(s) => s,
    }
  }
}

fn canonicalize(value: &Value) -> Option<Value> {
  match value {
    Value::Null => None,
    // serde_json's Map is ordered by key, so rebuilding it sorts members
    Value::Object(map) => Some(Value::Object(
      map
        .iter()
        .filter_map(|(k, v)| canonicalize(v).map(|v| (k.clone(), v)))
        .collect(),
    )),
    Value::Array(items) => Some(Value::Array(
      items
        .iter()
        .map(|v| canonicalize(v).unwrap_or(Value::Null))
        .collect(),
    )),
    other => Some(other.clone()),
  }
}

/// Identity of one cached query result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
  pub operation: String,
  pub fingerprint: Fingerprint,
}

impl CacheKey {
  pub fn new(operation: impl Into<String>, args: &Value) -> Self {
    Self {
      operation: operation.into(),
      fingerprint: Fingerprint::of(args),
    }
  }

  /// Stable, fixed-length key used for local persistence.
  ///
  /// Results fetched for different callers never share a key.
  pub fn storage_key(&self, owner: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.operation.as_bytes());
    hasher.update(b":");
    hasher.update(self.fingerprint.as_str().as_bytes());
    if let Some(user_id) = owner {
      hasher.update(b"@");
      hasher.update(user_id.as_bytes());
    }
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}({})", self.operation, self.fingerprint.as_str())
  }
}

/// Invalidation label shared by queries that provide it and mutations that
/// invalidate it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(Cow<'static, str>);

impl Tag {
  pub const fn from_static(name: &'static str) -> Self {
    Tag(Cow::Borrowed(name))
  }

  pub fn new(name: impl Into<String>) -> Self {
    Tag(Cow::Owned(name.into()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Tag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}
