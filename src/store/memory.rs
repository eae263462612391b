//! In-process store with the same semantics as the SQLite store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::StoreError;

use super::{
  check_unique, ensure_collection, with_generated_columns, Filter, Identity, RemoteStore, Row,
  Select,
};

#[derive(Default)]
pub struct MemoryStore {
  tables: Mutex<HashMap<String, Vec<Row>>>,
  identity: Mutex<Option<Identity>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_identity(self, identity: Identity) -> Self {
    self.sign_in(identity);
    self
  }

  pub fn sign_in(&self, identity: Identity) {
    if let Ok(mut current) = self.identity.lock() {
      *current = Some(identity);
    }
  }

  pub fn sign_out(&self) {
    if let Ok(mut current) = self.identity.lock() {
      *current = None;
    }
  }

  fn tables(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<Row>>>, StoreError> {
    self
      .tables
      .lock()
      .map_err(|e| StoreError::unavailable(format!("lock poisoned: {}", e)))
  }
}

#[async_trait]
impl RemoteStore for MemoryStore {
  async fn query(&self, collection: &str, select: &Select) -> Result<Vec<Row>, StoreError> {
    ensure_collection(collection)?;
    let tables = self.tables()?;
    Ok(match tables.get(collection) {
      Some(rows) => select.apply(rows.iter()),
      None => Vec::new(),
    })
  }

  async fn count(&self, collection: &str, filters: &[Filter]) -> Result<usize, StoreError> {
    ensure_collection(collection)?;
    let tables = self.tables()?;
    Ok(
      tables
        .get(collection)
        .map(|rows| {
          rows
            .iter()
            .filter(|r| filters.iter().all(|f| f.matches(r)))
            .count()
        })
        .unwrap_or(0),
    )
  }

  async fn insert(&self, collection: &str, row: Row) -> Result<Row, StoreError> {
    ensure_collection(collection)?;
    let row = with_generated_columns(collection, row);
    let mut tables = self.tables()?;
    let rows = tables.entry(collection.to_string()).or_default();
    check_unique(collection, &row, rows.iter())?;
    rows.push(row.clone());
    Ok(row)
  }

  async fn update(
    &self,
    collection: &str,
    matching: &[Filter],
    patch: Row,
  ) -> Result<Row, StoreError> {
    ensure_collection(collection)?;
    let mut tables = self.tables()?;
    let rows = tables.entry(collection.to_string()).or_default();

    let index = rows
      .iter()
      .position(|r| matching.iter().all(|f| f.matches(r)))
      .ok_or_else(|| {
        StoreError::invalid("JSON object requested, multiple (or no) rows returned")
      })?;

    let mut updated = rows[index].clone();
    updated.extend(patch);
    check_unique(
      collection,
      &updated,
      rows
        .iter()
        .enumerate()
        .filter(move |(i, _)| *i != index)
        .map(|(_, r)| r),
    )?;
    rows[index] = updated.clone();
    Ok(updated)
  }

  async fn delete(&self, collection: &str, matching: &[Filter]) -> Result<(), StoreError> {
    ensure_collection(collection)?;
    let mut tables = self.tables()?;
    if let Some(rows) = tables.get_mut(collection) {
      rows.retain(|r| !matching.iter().all(|f| f.matches(r)));
    }
    Ok(())
  }

  async fn current_identity(&self) -> Option<Identity> {
    self.identity.lock().ok().and_then(|i| i.clone())
  }
}
