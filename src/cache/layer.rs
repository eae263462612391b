//! Cache layer that orchestrates query caching, invalidation and fetching.

use chrono::Utc;
use futures::future::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::event::{CacheEvent, EventStream};
use crate::store::{Identity, RemoteStore};

use super::entry::{CacheEntry, FetchFuture, QuerySnapshot};
use super::key::{CacheKey, Tag};
use super::query::QueryHandle;
use super::registry::{to_args, OperationRegistry};
use super::storage::{BlobStore, NoopBlobStore, PersistedEntry};
use super::tags::TagIndex;

/// Tuning knobs for a cache layer.
#[derive(Debug, Clone)]
pub struct CacheOptions {
  /// How long fetched data counts as fresh for new subscribers
  pub stale_time: Duration,
  /// How long an entry without subscribers is kept before eviction
  pub eviction_grace: Duration,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      stale_time: Duration::from_secs(60),
      eviction_grace: Duration::from_secs(60),
    }
  }
}

pub(crate) struct CacheState {
  pub entries: HashMap<CacheKey, CacheEntry>,
  pub tags: TagIndex,
  /// Logical clock; also the source of generation, layer and mutation ids
  clock: u64,
  torn_down: bool,
}

impl CacheState {
  pub fn tick(&mut self) -> u64 {
    self.clock += 1;
    self.clock
  }
}

pub(crate) struct Inner {
  state: Mutex<CacheState>,
  pub registry: OperationRegistry,
  pub store: Arc<dyn RemoteStore>,
  blobs: Arc<dyn BlobStore>,
  /// Caller whose persisted results may hydrate new entries
  owner: Option<String>,
  options: CacheOptions,
  events: broadcast::Sender<CacheEvent>,
}

/// The process-wide query cache and mutation dispatcher.
///
/// Construct one at startup and hand clones to every consumer; clones share
/// the same state. Operations that start fetches must run inside a Tokio
/// runtime.
#[derive(Clone)]
pub struct CacheLayer {
  pub(crate) inner: Arc<Inner>,
}

/// Builder for [`CacheLayer`].
pub struct CacheLayerBuilder {
  registry: OperationRegistry,
  store: Arc<dyn RemoteStore>,
  blobs: Arc<dyn BlobStore>,
  owner: Option<String>,
  options: CacheOptions,
}

impl CacheLayerBuilder {
  pub fn options(mut self, options: CacheOptions) -> Self {
    self.options = options;
    self
  }

  pub fn stale_time(mut self, stale_time: Duration) -> Self {
    self.options.stale_time = stale_time;
    self
  }

  pub fn eviction_grace(mut self, grace: Duration) -> Self {
    self.options.eviction_grace = grace;
    self
  }

  /// Persist successful results and hydrate new entries from `blobs`.
  pub fn blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
    self.blobs = blobs;
    self
  }

  /// The signed-in caller. Only results persisted for this caller hydrate
  /// new entries; without one, only anonymous results do.
  pub fn identity(mut self, identity: Option<Identity>) -> Self {
    self.owner = identity.map(|i| i.user_id);
    self
  }

  pub fn build(self) -> CacheLayer {
    let (events, _) = broadcast::channel(256);
    CacheLayer {
      inner: Arc::new(Inner {
        state: Mutex::new(CacheState {
          entries: HashMap::new(),
          tags: TagIndex::new(),
          clock: 0,
          torn_down: false,
        }),
        registry: self.registry,
        store: self.store,
        blobs: self.blobs,
        owner: self.owner,
        options: self.options,
        events,
      }),
    }
  }
}

impl CacheLayer {
  pub fn builder(registry: OperationRegistry, store: Arc<dyn RemoteStore>) -> CacheLayerBuilder {
    CacheLayerBuilder {
      registry,
      store,
      blobs: Arc::new(NoopBlobStore),
      owner: None,
      options: CacheOptions::default(),
    }
  }

  /// Create a cache layer with default options and no persistence.
  pub fn new(registry: OperationRegistry, store: Arc<dyn RemoteStore>) -> Self {
    Self::builder(registry, store).build()
  }

  pub(crate) fn lock(&self) -> MutexGuard<'_, CacheState> {
    // Cache turns never panic while holding the lock, so poisoning carries
    // no information here.
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  pub(crate) fn emit(&self, event: CacheEvent) {
    // No receivers is fine
    let _ = self.inner.events.send(event);
  }

  /// Subscribe to the cache event stream.
  pub fn events(&self) -> EventStream {
    EventStream::new(self.inner.events.subscribe())
  }

  pub fn registry(&self) -> &OperationRegistry {
    &self.inner.registry
  }

  /// Register interest in `operation(args)` and return a live handle.
  ///
  /// Cached data is available on the handle immediately. A fetch starts in
  /// the background when the entry is new or stale; if one is already in
  /// flight the handle simply shares its result.
  pub fn subscribe<A: Serialize + ?Sized>(
    &self,
    operation: &str,
    args: &A,
  ) -> Result<QueryHandle, CacheError> {
    let def = self.inner.registry.query(operation)?;
    let args = to_args(operation, args)?;
    let key = CacheKey::new(operation, &args);

    // Blob reads stay outside the state lock.
    let known = self.lock().entries.contains_key(&key);
    let persisted = if known { None } else { self.load_persisted(&key) };

    let mut guard = self.lock();
    if guard.torn_down {
      return Err(CacheError::TornDown);
    }
    let now = guard.tick();
    let state = &mut *guard;

    let entry = match state.entries.entry(key.clone()) {
      Entry::Occupied(occupied) => occupied.into_mut(),
      Entry::Vacant(vacant) => {
        let mut entry = CacheEntry::new(now, args, def.resolver.clone());
        if let Some(persisted) = persisted {
          debug!(%key, "hydrated entry from local storage");
          entry.hydrate(persisted.data, persisted.fetched_at);
        }
        state.tags.register(&key, &def.provides);
        debug!(%key, "created cache entry");
        vacant.insert(entry)
      }
    };

    entry.subscriber_count += 1;
    entry.eviction_token += 1;
    let rx = entry.watch();

    let fetch = if entry.needs_refetch(self.inner.options.stale_time) {
      Some(self.begin_fetch(&key, entry, now))
    } else {
      None
    };
    drop(guard);

    if let Some(fetch) = fetch {
      drive(fetch);
    }

    Ok(QueryHandle::new(self.clone(), key, rx))
  }

  /// Alias of [`subscribe`](Self::subscribe) for UI code.
  pub fn use_query<A: Serialize + ?Sized>(
    &self,
    operation: &str,
    args: &A,
  ) -> Result<QueryHandle, CacheError> {
    self.subscribe(operation, args)
  }

  /// Drop a subscription. Equivalent to dropping the handle.
  pub fn unsubscribe(&self, handle: QueryHandle) {
    drop(handle);
  }

  /// Fetch `operation(args)` from the remote store, joining an in-flight
  /// fetch for the same key if there is one.
  pub async fn fetch<A: Serialize + ?Sized>(
    &self,
    operation: &str,
    args: &A,
  ) -> Result<Value, CacheError> {
    let handle = self.subscribe(operation, args)?;
    handle.refetch().await
  }

  /// Current state of `operation(args)` without subscribing.
  pub fn query_data<A: Serialize + ?Sized>(
    &self,
    operation: &str,
    args: &A,
  ) -> Result<QuerySnapshot, CacheError> {
    let key = CacheKey::new(operation, &to_args(operation, args)?);
    let state = self.lock();
    Ok(
      state
        .entries
        .get(&key)
        .map(CacheEntry::snapshot)
        .unwrap_or_else(QuerySnapshot::uninitialized),
    )
  }

  /// Number of live entries.
  pub fn entry_count(&self) -> usize {
    self.lock().entries.len()
  }

  /// Mark every entry registered under any of `tags` as stale.
  ///
  /// Observed entries refetch right away, or as soon as their current fetch
  /// lands; unobserved ones refetch on their next subscription.
  pub fn invalidate_tags(&self, tags: &[Tag]) {
    let mut guard = self.lock();
    let now = guard.tick();
    let state = &mut *guard;

    let mut keys: Vec<CacheKey> = state.tags.keys_for_tags(tags).into_iter().collect();
    keys.sort();

    let mut fetches = Vec::new();
    for key in &keys {
      let Some(entry) = state.entries.get_mut(key) else {
        continue;
      };
      if entry.in_flight.is_some() {
        entry.refetch_pending = true;
      } else if entry.subscriber_count > 0 {
        fetches.push(self.begin_fetch(key, entry, now));
      } else {
        entry.stale = true;
      }
    }

    info!(
      tags = ?tags.iter().map(Tag::as_str).collect::<Vec<_>>(),
      entries = keys.len(),
      "invalidated tags"
    );
    self.emit(CacheEvent::TagsInvalidated {
      tags: tags.to_vec(),
      keys,
    });
    drop(guard);

    for fetch in fetches {
      drive(fetch);
    }
  }

  /// Drop every entry and refuse further subscriptions.
  pub fn teardown(&self) {
    let mut state = self.lock();
    state.torn_down = true;
    state.tags.clear();
    let evicted: Vec<CacheKey> = state.entries.drain().map(|(key, _)| key).collect();
    for key in evicted {
      self.emit(CacheEvent::EntryEvicted { key });
    }
    info!("cache torn down");
  }

  pub(crate) fn is_torn_down(&self) -> bool {
    self.lock().torn_down
  }

  /// Start a fetch for `entry` and mark it loading. The caller spawns the
  /// returned future once the state lock is released.
  fn begin_fetch(&self, key: &CacheKey, entry: &mut CacheEntry, started_at: u64) -> FetchFuture {
    let weak = Arc::downgrade(&self.inner);
    let resolver = entry.resolver.clone();
    let store = Arc::clone(&self.inner.store);
    let args = entry.args.clone();
    let generation = entry.generation;
    let fetch_key = key.clone();

    let future = async move {
      let owner = store.current_identity().await.map(|i| i.user_id);
      let result = AssertUnwindSafe(async move { resolver(store, args).await })
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(CacheError::Aborted("query resolver panicked".to_string())));
      if let Some(inner) = weak.upgrade() {
        let layer = CacheLayer { inner };
        if let Ok(data) = &result {
          if layer.is_current(&fetch_key, generation) {
            layer.persist(&fetch_key, owner, data);
          }
        }
        layer.finish_fetch(&fetch_key, generation, started_at, &result);
      }
      result
    }
    .boxed()
    .shared();

    debug!(%key, "fetch started");
    entry.begin_loading(future.clone());
    entry.notify();
    self.emit(CacheEvent::EntryUpdated {
      key: key.clone(),
      status: entry.status,
    });
    future
  }

  /// Apply a fetch outcome, unless the entry it was started for is gone.
  fn finish_fetch(
    &self,
    key: &CacheKey,
    generation: u64,
    started_at: u64,
    result: &Result<Value, CacheError>,
  ) {
    let mut guard = self.lock();
    let now = guard.tick();

    let Some(entry) = guard
      .entries
      .get_mut(key)
      .filter(|e| e.generation == generation)
    else {
      debug!(%key, "discarding fetch result for evicted entry");
      return;
    };

    entry.in_flight = None;
    match result {
      Ok(data) => {
        entry.apply_fetched(data.clone(), started_at);
        debug!(%key, "fetch succeeded");
      }
      Err(e) => {
        warn!(%key, error = %e, "fetch failed");
        entry.apply_error(e.clone());
      }
    }
    entry.notify();
    self.emit(CacheEvent::EntryUpdated {
      key: key.clone(),
      status: entry.status,
    });

    if !entry.refetch_pending {
      return;
    }
    if entry.subscriber_count == 0 {
      entry.refetch_pending = false;
      entry.stale = true;
      return;
    }
    let fetch = self.begin_fetch(key, entry, now);
    drop(guard);
    drive(fetch);
  }

  fn is_current(&self, key: &CacheKey, generation: u64) -> bool {
    self
      .lock()
      .entries
      .get(key)
      .is_some_and(|e| e.generation == generation)
  }

  /// Refetch the entry behind a live handle.
  pub(crate) fn refetch_key(&self, key: &CacheKey) -> Result<FetchFuture, CacheError> {
    let mut guard = self.lock();
    if guard.torn_down {
      return Err(CacheError::TornDown);
    }
    let now = guard.tick();
    let entry = guard.entries.get_mut(key).ok_or(CacheError::TornDown)?;

    if let Some(in_flight) = &entry.in_flight {
      return Ok(in_flight.future.clone());
    }

    let fetch = self.begin_fetch(key, entry, now);
    drop(guard);
    drive(fetch.clone());
    Ok(fetch)
  }

  /// Drop one subscription and schedule eviction when none are left.
  pub(crate) fn release(&self, key: &CacheKey) {
    let mut guard = self.lock();
    let Some(entry) = guard.entries.get_mut(key) else {
      return;
    };

    entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
    if entry.subscriber_count > 0 {
      return;
    }
    entry.eviction_token += 1;
    let (generation, token) = (entry.generation, entry.eviction_token);

    let grace = self.inner.options.eviction_grace;
    if grace.is_zero() {
      self.evict(&mut guard, key);
      return;
    }

    match tokio::runtime::Handle::try_current() {
      Ok(runtime) => {
        let weak = Arc::downgrade(&self.inner);
        let key = key.clone();
        runtime.spawn(async move {
          tokio::time::sleep(grace).await;
          if let Some(inner) = weak.upgrade() {
            CacheLayer { inner }.evict_if_idle(&key, generation, token);
          }
        });
      }
      Err(_) => self.evict(&mut guard, key),
    }
  }

  fn evict_if_idle(&self, key: &CacheKey, generation: u64, token: u64) {
    let mut guard = self.lock();
    let idle = guard.entries.get(key).is_some_and(|e| {
      e.generation == generation && e.eviction_token == token && e.subscriber_count == 0
    });
    if idle {
      self.evict(&mut guard, key);
    }
  }

  fn evict(&self, state: &mut CacheState, key: &CacheKey) {
    if state.entries.remove(key).is_some() {
      state.tags.unregister(key);
      debug!(%key, "evicted cache entry");
      self.emit(CacheEvent::EntryEvicted { key: key.clone() });
    }
  }

  fn load_persisted(&self, key: &CacheKey) -> Option<PersistedEntry> {
    let owner = self.inner.owner.as_deref();
    let bytes = match self.inner.blobs.get(&key.storage_key(owner)) {
      Ok(bytes) => bytes?,
      Err(e) => {
        warn!(%key, "failed to read persisted entry: {}", e);
        return None;
      }
    };
    match serde_json::from_slice::<PersistedEntry>(&bytes) {
      Ok(persisted)
        if persisted.operation == key.operation && persisted.user_id.as_deref() == owner =>
      {
        Some(persisted)
      }
      Ok(_) => None,
      Err(e) => {
        warn!(%key, "ignoring corrupt persisted entry: {}", e);
        None
      }
    }
  }

  fn persist(&self, key: &CacheKey, owner: Option<String>, data: &Value) {
    let storage_key = key.storage_key(owner.as_deref());
    let persisted = PersistedEntry {
      operation: key.operation.clone(),
      user_id: owner,
      data: data.clone(),
      fetched_at: Utc::now(),
    };
    let result = serde_json::to_vec(&persisted)
      .map_err(|e| color_eyre::eyre::eyre!("Failed to encode entry: {}", e))
      .and_then(|bytes| self.inner.blobs.put(&storage_key, &bytes));
    if let Err(e) = result {
      warn!(%key, "failed to persist entry: {}", e);
    }
  }
}

/// Run a fetch to completion on its own task.
fn drive(fetch: FetchFuture) {
  tokio::spawn(async move {
    let _ = fetch.await;
  });
}
