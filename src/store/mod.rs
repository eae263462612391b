//! The remote system of record, seen from the cache.
//!
//! The cache never talks to a backend directly; resolvers go through the
//! [`RemoteStore`] trait. Two implementations ship with the crate: a SQLite
//! store used by the command line tool and an in-memory store.

mod filter;
mod memory;
mod sqlite;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::StoreError;

pub use filter::{Filter, Order, Select};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// A row as returned by the store: a JSON object.
pub type Row = Map<String, Value>;

/// The authenticated caller, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
  pub user_id: String,
}

impl Identity {
  pub fn new(user_id: impl Into<String>) -> Self {
    Self {
      user_id: user_id.into(),
    }
  }
}

/// Table-like backend reached through asynchronous calls.
///
/// All calls may fail with a structured [`StoreError`]; timeouts are the
/// implementation's concern and surface as ordinary errors.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Rows of `collection` matching `select`, ordered and ranged.
  async fn query(&self, collection: &str, select: &Select) -> Result<Vec<Row>, StoreError>;

  /// Number of rows of `collection` matching every filter.
  async fn count(&self, collection: &str, filters: &[Filter]) -> Result<usize, StoreError>;

  /// Insert a row and return it as stored (with generated columns).
  async fn insert(&self, collection: &str, row: Row) -> Result<Row, StoreError>;

  /// Merge `patch` into the single row matching `matching` and return it.
  async fn update(&self, collection: &str, matching: &[Filter], patch: Row)
    -> Result<Row, StoreError>;

  /// Delete every row matching `matching`.
  async fn delete(&self, collection: &str, matching: &[Filter]) -> Result<(), StoreError>;

  /// The current caller, or `None` when signed out.
  async fn current_identity(&self) -> Option<Identity>;
}

/// Unique column sets enforced by the bundled stores.
pub(crate) fn unique_columns(collection: &str) -> &'static [&'static [&'static str]] {
  match collection {
    "quotes" => &[&["text"]],
    "favorites" => &[&["user_id", "quote_id"]],
    "collection_quotes" => &[&["collection_id", "quote_id"]],
    "user_profiles" | "user_settings" => &[&["user_id"]],
    _ => &[],
  }
}

/// Collections known to the bundled stores.
pub(crate) const COLLECTIONS: &[&str] = &[
  "quotes",
  "favorites",
  "collections",
  "collection_quotes",
  "user_profiles",
  "user_settings",
];

/// Fill `id` and `created_at` when the caller left them out.
pub(crate) fn with_generated_columns(collection: &str, mut row: Row) -> Row {
  // Profile and settings rows are keyed by user_id.
  let keyed_by_user = matches!(collection, "user_profiles" | "user_settings");
  if !keyed_by_user && !row.contains_key("id") {
    row.insert(
      "id".to_string(),
      Value::String(uuid::Uuid::new_v4().to_string()),
    );
  }
  let timestamp_column = match collection {
    "user_profiles" => Some("updated_at"),
    "user_settings" | "collection_quotes" => None,
    _ => Some("created_at"),
  };
  if let Some(column) = timestamp_column {
    if !row.contains_key(column) {
      row.insert(
        column.to_string(),
        Value::String(chrono::Utc::now().to_rfc3339()),
      );
    }
  }
  row
}

/// Check `row` against the unique constraints of `collection`.
pub(crate) fn check_unique<'a>(
  collection: &str,
  row: &Row,
  existing: impl Iterator<Item = &'a Row> + Clone,
) -> Result<(), StoreError> {
  for columns in unique_columns(collection) {
    let clash = existing.clone().any(|other| {
      columns
        .iter()
        .all(|c| row.get(*c).is_some() && row.get(*c) == other.get(*c))
    });
    if clash {
      return Err(StoreError::conflict(format!(
        "duplicate key value violates unique constraint \"{}_{}_key\"",
        collection,
        columns.join("_")
      )));
    }
  }
  Ok(())
}

pub(crate) fn ensure_collection(collection: &str) -> Result<(), StoreError> {
  if COLLECTIONS.contains(&collection) {
    Ok(())
  } else {
    Err(StoreError::invalid(format!(
      "relation \"{}\" does not exist",
      collection
    )))
  }
}
