//! Live handles on cached queries.
//!
//! A `QueryHandle` is what a screen holds while it shows a query. It reads
//! the entry's latest snapshot, can be polled from an event loop tick or
//! awaited, and releases its subscription when dropped.
//!
//! # Example
//!
//! ```ignore
//! let mut quotes = cache.use_query("getQuotes", &QuotesArgs::default())?;
//!
//! // In event loop tick
//! if quotes.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match quotes.status() {
//!     QueryStatus::Loading if quotes.data().is_none() => render_spinner(),
//!     QueryStatus::Error => render_error(quotes.error()),
//!     _ => render_quotes(quotes.data_as::<Vec<Quote>>()?),
//! }
//! ```

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::CacheError;

use super::entry::{QuerySnapshot, QueryStatus};
use super::key::CacheKey;
use super::layer::CacheLayer;
use super::registry::reserialize;

/// A subscription to one cache entry.
pub struct QueryHandle {
  cache: CacheLayer,
  key: CacheKey,
  rx: watch::Receiver<QuerySnapshot>,
}

impl QueryHandle {
  pub(crate) fn new(cache: CacheLayer, key: CacheKey, rx: watch::Receiver<QuerySnapshot>) -> Self {
    Self { cache, key, rx }
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// The entry's latest state.
  pub fn snapshot(&self) -> QuerySnapshot {
    self.rx.borrow().clone()
  }

  pub fn status(&self) -> QueryStatus {
    self.rx.borrow().status
  }

  /// Visible data, including any optimistic patches.
  pub fn data(&self) -> Option<Value> {
    self.rx.borrow().data.clone()
  }

  /// Visible data decoded as `T`.
  pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, CacheError> {
    self
      .data()
      .map(|data| reserialize(&self.key.operation, data))
      .transpose()
  }

  pub fn error(&self) -> Option<CacheError> {
    self.rx.borrow().error.clone()
  }

  pub fn is_loading(&self) -> bool {
    self.status() == QueryStatus::Loading
  }

  pub fn is_success(&self) -> bool {
    self.status() == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status() == QueryStatus::Error
  }

  /// Check for updates since the last poll.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick
  /// handler.
  pub fn poll(&mut self) -> bool {
    match self.rx.has_changed() {
      Ok(true) => {
        self.rx.borrow_and_update();
        true
      }
      _ => false,
    }
  }

  /// Wait for the next state change. Returns `None` once the entry is gone.
  pub async fn changed(&mut self) -> Option<QuerySnapshot> {
    self.rx.changed().await.ok()?;
    Some(self.rx.borrow_and_update().clone())
  }

  /// Wait until the entry is no longer loading.
  pub async fn settled(&mut self) -> QuerySnapshot {
    loop {
      let snapshot = self.rx.borrow_and_update().clone();
      if !snapshot.is_loading() {
        return snapshot;
      }
      if self.rx.changed().await.is_err() {
        return self.rx.borrow().clone();
      }
    }
  }

  /// Refetch from the remote store, or join the fetch already in flight.
  pub async fn refetch(&self) -> Result<Value, CacheError> {
    self.cache.refetch_key(&self.key)?.await
  }
}

impl Drop for QueryHandle {
  fn drop(&mut self) {
    self.cache.release(&self.key);
  }
}

impl std::fmt::Debug for QueryHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryHandle")
      .field("key", &self.key)
      .field("status", &self.status())
      .finish_non_exhaustive()
  }
}
