//! Local blob persistence for query results.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Opaque key-value blob store.
pub trait BlobStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

  fn put(&self, key: &str, value: &[u8]) -> Result<()>;

  fn remove(&self, key: &str) -> Result<()>;
}

/// A persisted query result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEntry {
  pub operation: String,
  /// Caller the result was fetched for
  #[serde(default)]
  pub user_id: Option<String>,
  pub data: Value,
  pub fetched_at: DateTime<Utc>,
}

/// Storage implementation that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopBlobStore;

impl BlobStore for NoopBlobStore {
  fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
    Ok(None) // Always miss
  }

  fn put(&self, _key: &str, _value: &[u8]) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _key: &str) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based blob store.
pub struct SqliteBlobStore {
  conn: Mutex<Connection>,
}

/// Schema for the blob table.
const BLOB_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS blob_cache (
    blob_key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SqliteBlobStore {
  /// Open or create a blob store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(BLOB_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("quotesync").join("cache.db"))
  }
}

impl BlobStore for SqliteBlobStore {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT data FROM blob_cache WHERE blob_key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read blob {}: {}", key, e))
  }

  fn put(&self, key: &str, value: &[u8]) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO blob_cache (blob_key, data, stored_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to store blob {}: {}", key, e))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM blob_cache WHERE blob_key = ?", params![key])
      .map_err(|e| eyre!("Failed to remove blob {}: {}", key, e))?;

    Ok(())
  }
}
