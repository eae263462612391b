//! SQLite-backed remote store used by the command line tool.
//!
//! Rows are stored as serialized JSON, one table for every collection.
//! Filtering happens after decoding; collections here are small.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::StoreError;

use super::{
  check_unique, ensure_collection, with_generated_columns, Filter, Identity, RemoteStore, Row,
  Select,
};

/// Schema for the row table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS store_rows (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    data BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_store_rows_collection ON store_rows(collection);
"#;

pub struct SqliteStore {
  conn: Mutex<Connection>,
  identity: Option<Identity>,
}

impl SqliteStore {
  /// Open or create the store at `path`.
  pub fn open(path: &Path, identity: Option<Identity>) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create data directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    Self::with_connection(conn, identity)
  }

  /// Store that lives only as long as the process.
  pub fn open_in_memory(identity: Option<Identity>) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::with_connection(conn, identity)
  }

  fn with_connection(conn: Connection, identity: Option<Identity>) -> Result<Self> {
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
      identity,
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::unavailable(format!("Lock poisoned: {}", e)))
  }
}

/// Load every row of a collection with its row id, in insertion order.
fn load_rows(conn: &Connection, collection: &str) -> Result<Vec<(i64, Row)>, StoreError> {
  let mut stmt =
    conn.prepare("SELECT row_id, data FROM store_rows WHERE collection = ? ORDER BY row_id")?;

  let raw: Vec<(i64, Vec<u8>)> = stmt
    .query_map(params![collection], |row| Ok((row.get(0)?, row.get(1)?)))?
    .collect::<Result<_, _>>()?;

  raw
    .into_iter()
    .map(|(id, data)| {
      serde_json::from_slice::<Row>(&data)
        .map(|row| (id, row))
        .map_err(|e| StoreError::unavailable(format!("Corrupt row {}: {}", id, e)))
    })
    .collect()
}

fn encode(row: &Row) -> Result<Vec<u8>, StoreError> {
  serde_json::to_vec(row).map_err(|e| StoreError::invalid(format!("Failed to encode row: {}", e)))
}

#[async_trait]
impl RemoteStore for SqliteStore {
  async fn query(&self, collection: &str, select: &Select) -> Result<Vec<Row>, StoreError> {
    ensure_collection(collection)?;
    let conn = self.conn()?;
    let rows = load_rows(&conn, collection)?;
    Ok(select.apply(rows.iter().map(|(_, r)| r)))
  }

  async fn count(&self, collection: &str, filters: &[Filter]) -> Result<usize, StoreError> {
    ensure_collection(collection)?;
    let conn = self.conn()?;
    let rows = load_rows(&conn, collection)?;
    Ok(
      rows
        .iter()
        .filter(|(_, r)| filters.iter().all(|f| f.matches(r)))
        .count(),
    )
  }

  async fn insert(&self, collection: &str, row: Row) -> Result<Row, StoreError> {
    ensure_collection(collection)?;
    let row = with_generated_columns(collection, row);
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;

    let existing = load_rows(&tx, collection)?;
    check_unique(collection, &row, existing.iter().map(|(_, r)| r))?;

    tx.execute(
      "INSERT INTO store_rows (collection, data) VALUES (?, ?)",
      params![collection, encode(&row)?],
    )?;
    tx.commit()?;

    Ok(row)
  }

  async fn update(
    &self,
    collection: &str,
    matching: &[Filter],
    patch: Row,
  ) -> Result<Row, StoreError> {
    ensure_collection(collection)?;
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;

    let existing = load_rows(&tx, collection)?;
    let (row_id, current) = existing
      .iter()
      .find(|(_, r)| matching.iter().all(|f| f.matches(r)))
      .ok_or_else(|| {
        StoreError::invalid("JSON object requested, multiple (or no) rows returned")
      })?;

    let mut updated = current.clone();
    updated.extend(patch);
    check_unique(
      collection,
      &updated,
      existing
        .iter()
        .filter(|(id, _)| id != row_id)
        .map(|(_, r)| r),
    )?;

    tx.execute(
      "UPDATE store_rows SET data = ? WHERE row_id = ?",
      params![encode(&updated)?, row_id],
    )?;
    tx.commit()?;

    Ok(updated)
  }

  async fn delete(&self, collection: &str, matching: &[Filter]) -> Result<(), StoreError> {
    ensure_collection(collection)?;
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;

    let doomed: Vec<i64> = load_rows(&tx, collection)?
      .into_iter()
      .filter(|(_, r)| matching.iter().all(|f| f.matches(r)))
      .map(|(id, _)| id)
      .collect();

    for row_id in doomed {
      tx.execute("DELETE FROM store_rows WHERE row_id = ?", params![row_id])?;
    }
    tx.commit()?;

    Ok(())
  }

  async fn current_identity(&self) -> Option<Identity> {
    self.identity.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().unwrap()
  }

  #[tokio::test]
  async fn test_round_trip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quotes.db");

    {
      let store = SqliteStore::open(&path, None).unwrap();
      store
        .insert(
          "quotes",
          row(json!({"text": "Know thyself", "author": "Socrates", "category": "Wisdom"})),
        )
        .await
        .unwrap();
    }

    let store = SqliteStore::open(&path, None).unwrap();
    let rows = store.query("quotes", &Select::new()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["author"], "Socrates");
  }

  #[tokio::test]
  async fn test_delete_matching_rows() {
    let store = SqliteStore::open_in_memory(None).unwrap();
    for quote_id in ["q1", "q2"] {
      store
        .insert("collection_quotes", row(json!({"collection_id": "c1", "quote_id": quote_id})))
        .await
        .unwrap();
    }

    store
      .delete(
        "collection_quotes",
        &[Filter::eq("collection_id", "c1"), Filter::eq("quote_id", "q1")],
      )
      .await
      .unwrap();

    let left = store.query("collection_quotes", &Select::new()).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0]["quote_id"], "q2");
  }

  #[tokio::test]
  async fn test_duplicate_favorite_conflicts() {
    let store = SqliteStore::open_in_memory(Some(Identity::new("u1"))).unwrap();
    let fav = row(json!({"user_id": "u1", "quote_id": "q1"}));
    store.insert("favorites", fav.clone()).await.unwrap();
    let err = store.insert("favorites", fav).await.unwrap_err();
    assert!(err.message.contains("duplicate key"));
  }
}
