//! Cache entries and the snapshots subscribers observe.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::CacheError;

use super::patch::{replay, PatchLayer, QueryPatch};
use super::registry::Resolver;

/// Lifecycle status of a cached query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// No entry exists for the key
  Uninitialized,
  /// A fetch is in flight; `data` may still hold the previous result
  Loading,
  Success,
  Error,
}

impl QueryStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      QueryStatus::Uninitialized => "uninitialized",
      QueryStatus::Loading => "loading",
      QueryStatus::Success => "success",
      QueryStatus::Error => "error",
    }
  }
}

/// What a subscriber sees of an entry at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
  pub status: QueryStatus,
  pub data: Option<Value>,
  /// Present only in `Error` status
  pub error: Option<CacheError>,
  pub last_fetched_at: Option<DateTime<Utc>>,
}

impl QuerySnapshot {
  pub fn uninitialized() -> Self {
    Self {
      status: QueryStatus::Uninitialized,
      data: None,
      error: None,
      last_fetched_at: None,
    }
  }

  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }
}

pub(crate) type FetchFuture = Shared<BoxFuture<'static, Result<Value, CacheError>>>;

pub(crate) struct InFlight {
  pub future: FetchFuture,
}

pub(crate) struct CacheEntry {
  /// Distinguishes this incarnation from entries later created for the
  /// same key after an eviction.
  pub generation: u64,
  pub args: Value,
  pub resolver: Resolver,
  pub status: QueryStatus,
  /// Visible data: the last fetched value with optimistic layers applied
  pub data: Option<Value>,
  pub error: Option<CacheError>,
  pub last_fetched_at: Option<DateTime<Utc>>,
  pub subscriber_count: usize,
  /// Invalidated while unobserved; refetch on next subscription
  pub stale: bool,
  /// Invalidated while a fetch was in flight; refetch when it lands
  pub refetch_pending: bool,
  pub in_flight: Option<InFlight>,
  /// Bumped on every subscribe/unsubscribe so outdated eviction timers no-op
  pub eviction_token: u64,
  pub layers: Vec<PatchLayer>,
  tx: watch::Sender<QuerySnapshot>,
}

impl CacheEntry {
  pub fn new(generation: u64, args: Value, resolver: Resolver) -> Self {
    let (tx, _rx) = watch::channel(QuerySnapshot::uninitialized());
    Self {
      generation,
      args,
      resolver,
      status: QueryStatus::Uninitialized,
      data: None,
      error: None,
      last_fetched_at: None,
      subscriber_count: 0,
      stale: false,
      refetch_pending: false,
      in_flight: None,
      eviction_token: 0,
      layers: Vec::new(),
      tx,
    }
  }

  /// Seed the entry with previously persisted data.
  pub fn hydrate(&mut self, data: Value, fetched_at: DateTime<Utc>) {
    self.data = Some(data);
    self.last_fetched_at = Some(fetched_at);
  }

  pub fn snapshot(&self) -> QuerySnapshot {
    QuerySnapshot {
      status: self.status,
      data: self.data.clone(),
      error: self.error.clone(),
      last_fetched_at: self.last_fetched_at,
    }
  }

  pub fn watch(&self) -> watch::Receiver<QuerySnapshot> {
    self.tx.subscribe()
  }

  /// Publish the current state to every handle.
  pub fn notify(&self) {
    self.tx.send_replace(self.snapshot());
  }

  /// Whether a new subscriber should trigger a background refetch.
  pub fn needs_refetch(&self, stale_time: Duration) -> bool {
    if self.in_flight.is_some() {
      return false;
    }
    match self.status {
      QueryStatus::Uninitialized | QueryStatus::Error => true,
      QueryStatus::Loading => false,
      QueryStatus::Success => {
        self.stale
          || self.last_fetched_at.map_or(true, |at| {
            chrono::Duration::from_std(stale_time).map_or(false, |ttl| Utc::now() - at > ttl)
          })
      }
    }
  }

  pub fn begin_loading(&mut self, future: FetchFuture) {
    self.status = QueryStatus::Loading;
    self.error = None;
    self.stale = false;
    self.refetch_pending = false;
    self.in_flight = Some(InFlight { future });
  }

  /// Install freshly fetched data.
  ///
  /// Layers committed before the fetch started are already reflected by
  /// the server and are dropped; every other layer is replayed on top.
  pub fn apply_fetched(&mut self, fetched: Value, started_at: u64) {
    self
      .layers
      .retain(|l| l.committed_at.map_or(true, |at| at >= started_at));
    self.data = Some(replay(fetched, &mut self.layers));
    self.status = QueryStatus::Success;
    self.error = None;
    self.last_fetched_at = Some(Utc::now());
  }

  pub fn apply_error(&mut self, error: CacheError) {
    self.status = QueryStatus::Error;
    self.error = Some(error);
  }

  /// Apply a patch as a new top layer. Entries without data are left alone.
  pub fn push_layer(&mut self, id: u64, patch: QueryPatch) -> bool {
    let Some(data) = self.data.as_mut() else {
      return false;
    };
    let before = data.clone();
    patch.apply(data);
    self.layers.push(PatchLayer {
      id,
      before,
      patch,
      committed_at: None,
    });
    true
  }

  pub fn commit_layer(&mut self, id: u64, at: u64) -> bool {
    match self.layers.iter_mut().find(|l| l.id == id) {
      Some(layer) => {
        layer.committed_at = Some(at);
        true
      }
      None => false,
    }
  }

  /// Remove one layer, restoring the value it was applied to and replaying
  /// any layers that were applied after it.
  pub fn rollback_layer(&mut self, id: u64) -> bool {
    let Some(index) = self.layers.iter().position(|l| l.id == id) else {
      return false;
    };
    let removed = self.layers.remove(index);
    self.data = Some(replay(removed.before, &mut self.layers[index..]));
    true
  }
}
