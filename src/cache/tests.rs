use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use super::*;
use crate::error::CacheError;
use crate::event::CacheEvent;
use crate::store::{Identity, MemoryStore, RemoteStore};

const ITEMS: Tag = Tag::from_static("Items");
const OTHER: Tag = Tag::from_static("Other");

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ListArgs {
  prefix: Option<String>,
}

impl ListArgs {
  fn prefix(p: &str) -> Self {
    Self {
      prefix: Some(p.to_string()),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AddItem {
  name: String,
}

fn add(name: &str) -> AddItem {
  AddItem {
    name: name.to_string(),
  }
}

/// Scripted backend: a list of names behind gates the test opens.
struct Backend {
  items: Mutex<Vec<String>>,
  fetches: AtomicUsize,
  other_fetches: AtomicUsize,
  fetch_gate: Semaphore,
  write_gate: Semaphore,
}

impl Backend {
  fn open(items: &[&str]) -> Arc<Self> {
    Self::with_permits(items, Semaphore::MAX_PERMITS)
  }

  fn gated(items: &[&str]) -> Arc<Self> {
    Self::with_permits(items, 0)
  }

  fn with_permits(items: &[&str], permits: usize) -> Arc<Self> {
    Arc::new(Self {
      items: Mutex::new(items.iter().map(|s| s.to_string()).collect()),
      fetches: AtomicUsize::new(0),
      other_fetches: AtomicUsize::new(0),
      fetch_gate: Semaphore::new(permits),
      write_gate: Semaphore::new(permits),
    })
  }

  fn fetches(&self) -> usize {
    self.fetches.load(Ordering::SeqCst)
  }

  fn items(&self) -> Vec<String> {
    self.items.lock().unwrap().clone()
  }
}

async fn pass(gate: &Semaphore) {
  gate.acquire().await.unwrap().forget();
}

fn registry(backend: &Arc<Backend>) -> OperationRegistry {
  let list = Arc::clone(backend);
  let other = Arc::clone(backend);
  let write = Arc::clone(backend);

  OperationRegistry::builder()
    .query("list", &[ITEMS], move |_store, args: ListArgs| {
      let backend = Arc::clone(&list);
      async move {
        backend.fetches.fetch_add(1, Ordering::SeqCst);
        pass(&backend.fetch_gate).await;
        let prefix = args.prefix.unwrap_or_default();
        Ok(
          backend
            .items()
            .into_iter()
            .filter(|i| i.starts_with(&prefix))
            .collect::<Vec<_>>(),
        )
      }
    })
    .query("other", &[OTHER], move |_store, _args: ()| {
      let backend = Arc::clone(&other);
      async move { Ok(backend.other_fetches.fetch_add(1, Ordering::SeqCst) + 1) }
    })
    .query("broken", &[ITEMS], |_store, _args: ()| async move {
      Err::<Value, _>(CacheError::not_found("thing"))
    })
    .query("nth", &[], |_store, index: usize| async move {
      let empty: Vec<u32> = Vec::new();
      Ok::<_, CacheError>(empty[index])
    })
    .optimistic_mutation(
      "add",
      &[ITEMS],
      move |_store, args: AddItem| {
        let backend = Arc::clone(&write);
        async move {
          pass(&backend.write_gate).await;
          if args.name.starts_with("bad") {
            return Err(CacheError::RemoteFailure {
              message: "write rejected".to_string(),
              conflict: false,
            });
          }
          backend.items.lock().unwrap().push(args.name.clone());
          Ok(args.name)
        }
      },
      |args: &AddItem| {
        let name = args.name.clone();
        vec![QueryPatch::typed::<Vec<String>, _>(
          "list",
          &json!(ListArgs::default()),
          move |items| items.push(name.clone()),
        )]
      },
    )
    .build()
}

fn cache_for(backend: &Arc<Backend>) -> CacheLayer {
  let store: Arc<dyn RemoteStore> = Arc::new(MemoryStore::new());
  CacheLayer::new(registry(backend), store)
}

fn strings(handle: &QueryHandle) -> Vec<String> {
  handle.data_as::<Vec<String>>().unwrap().unwrap_or_default()
}

async fn settle_tasks() {
  for _ in 0..20 {
    tokio::task::yield_now().await;
  }
}

#[tokio::test]
async fn test_concurrent_subscribers_share_one_fetch() {
  let backend = Backend::gated(&["a", "b"]);
  let cache = cache_for(&backend);

  let mut first = cache.subscribe("list", &ListArgs::default()).unwrap();
  let mut second = cache.subscribe("list", &ListArgs::default()).unwrap();
  assert_eq!(cache.entry_count(), 1);
  assert!(first.is_loading());

  backend.fetch_gate.add_permits(1);
  let a = first.settled().await;
  let b = second.settled().await;

  assert_eq!(backend.fetches(), 1);
  assert_eq!(a.data, Some(json!(["a", "b"])));
  assert_eq!(a, b);
}

#[tokio::test]
async fn test_fetch_joins_in_flight_request() {
  let backend = Backend::gated(&["a"]);
  let cache = cache_for(&backend);

  let handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  let joined = tokio::spawn({
    let cache = cache.clone();
    async move { cache.fetch("list", &ListArgs::default()).await }
  });
  settle_tasks().await;

  backend.fetch_gate.add_permits(1);
  assert_eq!(joined.await.unwrap().unwrap(), json!(["a"]));
  assert_eq!(backend.fetches(), 1);
  drop(handle);
}

#[tokio::test]
async fn test_stale_entry_serves_data_while_refetching() {
  let backend = Backend::gated(&["a"]);
  let cache = cache_for(&backend);

  let mut handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  backend.fetch_gate.add_permits(1);
  handle.settled().await;

  backend.items.lock().unwrap().push("b".to_string());
  cache.invalidate_tags(&[ITEMS]);

  let snapshot = handle.snapshot();
  assert_eq!(snapshot.status, QueryStatus::Loading);
  assert_eq!(snapshot.data, Some(json!(["a"])));

  backend.fetch_gate.add_permits(1);
  let snapshot = handle.settled().await;
  assert_eq!(snapshot.status, QueryStatus::Success);
  assert_eq!(snapshot.data, Some(json!(["a", "b"])));
}

#[tokio::test]
async fn test_invalidating_unobserved_entry_defers_refetch() {
  let backend = Backend::open(&["a"]);
  let cache = CacheLayer::builder(registry(&backend), Arc::new(MemoryStore::new()))
    .eviction_grace(Duration::from_secs(600))
    .build();

  let mut handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  handle.settled().await;
  drop(handle);

  cache.invalidate_tags(&[ITEMS]);
  settle_tasks().await;
  assert_eq!(backend.fetches(), 1);

  let mut handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  assert!(handle.is_loading());
  assert_eq!(handle.data(), Some(json!(["a"])));
  handle.settled().await;
  assert_eq!(backend.fetches(), 2);
}

#[tokio::test]
async fn test_fresh_entry_is_not_refetched() {
  let backend = Backend::open(&["a"]);
  let cache = cache_for(&backend);

  let mut handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  handle.settled().await;

  let again = cache.subscribe("list", &ListArgs::default()).unwrap();
  assert!(again.is_success());
  settle_tasks().await;
  assert_eq!(backend.fetches(), 1);
}

#[tokio::test]
async fn test_invalidation_during_fetch_refetches_after_it_lands() {
  let backend = Backend::gated(&["a"]);
  let cache = cache_for(&backend);

  let mut handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  cache.invalidate_tags(&[ITEMS]);

  backend.fetch_gate.add_permits(1);
  settle_tasks().await;
  assert_eq!(backend.fetches(), 2);
  assert!(handle.is_loading());

  backend.fetch_gate.add_permits(1);
  assert!(handle.settled().await.is_success());
}

#[tokio::test]
async fn test_failed_fetch_reports_error_and_recovers_on_subscribe() {
  let backend = Backend::open(&[]);
  let cache = cache_for(&backend);

  let mut handle = cache.subscribe("broken", &()).unwrap();
  let snapshot = handle.settled().await;
  assert!(snapshot.is_error());
  assert_eq!(snapshot.error, Some(CacheError::not_found("thing")));
  assert_eq!(snapshot.data, None);

  // A new subscriber retries an entry in error.
  let second = cache.subscribe("broken", &()).unwrap();
  assert!(second.is_loading());
}

#[tokio::test]
async fn test_panicking_resolver_settles_as_error() {
  let backend = Backend::open(&[]);
  let cache = cache_for(&backend);

  let mut handle = cache.subscribe("nth", &7usize).unwrap();
  let snapshot = handle.settled().await;
  assert!(matches!(snapshot.error, Some(CacheError::Aborted(_))));

  // Nothing is left in flight, so a refetch runs again and settles.
  assert!(matches!(handle.refetch().await, Err(CacheError::Aborted(_))));
  assert!(handle.is_error());
}

#[tokio::test]
async fn test_poll_reports_changes_once() {
  let backend = Backend::gated(&["a"]);
  let cache = cache_for(&backend);

  let mut handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  assert!(handle.poll());
  assert!(!handle.poll());

  backend.fetch_gate.add_permits(1);
  settle_tasks().await;
  assert!(handle.poll());
  assert!(handle.is_success());
  assert!(!handle.poll());
}

#[tokio::test]
async fn test_failed_mutation_rolls_back_optimistic_patch() {
  let backend = Backend::open(&["a"]);
  let cache = cache_for(&backend);

  let mut handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  handle.settled().await;

  let pending = cache.mutate("add", &add("bad"));
  assert_eq!(strings(&handle), vec!["a", "bad"]);
  assert_eq!(pending.patched_keys().len(), 1);
  assert_eq!(pending.status(), MutationStatus::Pending);

  let err = pending.await.unwrap_err();
  assert_eq!(err.to_string(), "write rejected");
  assert_eq!(strings(&handle), vec!["a"]);
  // No invalidation on failure
  settle_tasks().await;
  assert_eq!(backend.fetches(), 1);
}

#[tokio::test]
async fn test_successful_mutation_invalidates_tags() {
  let backend = Backend::open(&["a"]);
  let cache = cache_for(&backend);

  let mut handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  handle.settled().await;

  let out = cache.mutate("add", &add("b")).await.unwrap();
  assert_eq!(out, json!("b"));

  let snapshot = handle.settled().await;
  assert_eq!(snapshot.data, Some(json!(["a", "b"])));
  assert_eq!(backend.fetches(), 2);
}

#[tokio::test]
async fn test_invalidation_only_touches_tagged_entries() {
  let backend = Backend::open(&["a"]);
  let cache = cache_for(&backend);

  let mut list = cache.subscribe("list", &ListArgs::default()).unwrap();
  let mut other = cache.subscribe("other", &()).unwrap();
  list.settled().await;
  other.settled().await;

  cache.mutate("add", &add("b")).await.unwrap();
  list.settled().await;
  settle_tasks().await;

  assert_eq!(backend.fetches(), 2);
  assert_eq!(backend.other_fetches.load(Ordering::SeqCst), 1);
  assert_eq!(other.data(), Some(json!(1)));
}

#[tokio::test]
async fn test_every_key_under_a_tag_is_refetched() {
  let backend = Backend::open(&["apple", "banana"]);
  let cache = cache_for(&backend);

  let mut all = cache.subscribe("list", &ListArgs::default()).unwrap();
  let mut a_only = cache.subscribe("list", &ListArgs::prefix("a")).unwrap();
  all.settled().await;
  a_only.settled().await;
  assert_eq!(cache.entry_count(), 2);

  cache.mutate("add", &add("avocado")).await.unwrap();

  assert_eq!(all.settled().await.data, Some(json!(["apple", "banana", "avocado"])));
  assert_eq!(a_only.settled().await.data, Some(json!(["apple", "avocado"])));
  assert_eq!(backend.fetches(), 4);
}

#[tokio::test]
async fn test_rollback_keeps_patches_of_other_mutations() {
  let backend = Backend::open(&["a"]);
  let cache = cache_for(&backend);
  let mut handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  handle.settled().await;

  // Hold writes back so both patches are in place before either settles.
  backend.write_gate.forget_permits(Semaphore::MAX_PERMITS);
  let failing = cache.mutate("add", &add("bad-x"));
  let succeeding = cache.mutate("add", &add("y"));
  assert_eq!(strings(&handle), vec!["a", "bad-x", "y"]);

  backend.write_gate.add_permits(1);
  assert!(failing.await.is_err());
  assert_eq!(strings(&handle), vec!["a", "y"]);

  backend.write_gate.add_permits(1);
  succeeding.await.unwrap();
  assert_eq!(handle.settled().await.data, Some(json!(["a", "y"])));
}

#[tokio::test]
async fn test_mutation_without_cached_target_skips_patch() {
  let backend = Backend::open(&[]);
  let cache = cache_for(&backend);

  let pending = cache.mutate("add", &add("x"));
  assert!(pending.patched_keys().is_empty());
  pending.await.unwrap();
  assert_eq!(backend.items(), vec!["x"]);
}

#[tokio::test]
async fn test_mutate_with_overrides_registered_patch() {
  let backend = Backend::open(&["a"]);
  let cache = cache_for(&backend);
  let mut handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  handle.settled().await;

  backend.write_gate.forget_permits(Semaphore::MAX_PERMITS);
  let pending = cache.mutate_with("add", &add("bad"), |_| {
    vec![QueryPatch::typed::<Vec<String>, _>(
      "list",
      &json!(ListArgs::default()),
      |items| items.clear(),
    )]
  });
  assert!(strings(&handle).is_empty());

  backend.write_gate.add_permits(1);
  assert!(pending.await.is_err());
  assert_eq!(strings(&handle), vec!["a"]);
}

#[tokio::test]
async fn test_mutation_dispatch_errors() {
  let backend = Backend::open(&[]);
  let cache = cache_for(&backend);

  let err = cache.mutate("nope", &()).await.unwrap_err();
  assert_eq!(err, CacheError::UnknownOperation("nope".to_string()));

  let pending = cache.mutate("list", &ListArgs::default());
  assert_eq!(pending.status(), MutationStatus::Failed);
  assert!(matches!(pending.await, Err(CacheError::WrongKind { .. })));

  assert!(matches!(
    cache.subscribe("add", &add("x")),
    Err(CacheError::WrongKind { .. })
  ));
}

#[tokio::test]
async fn test_use_mutation_trigger() {
  let backend = Backend::open(&[]);
  let cache = cache_for(&backend);

  let add_item = cache.use_mutation("add");
  assert_eq!(add_item.operation(), "add");
  add_item.trigger(&add("one")).await.unwrap();
  add_item.trigger(&add("two")).await.unwrap();
  assert_eq!(backend.items(), vec!["one", "two"]);
}

#[tokio::test]
async fn test_dropped_mutation_still_completes() {
  let backend = Backend::open(&[]);
  let cache = cache_for(&backend);

  drop(cache.mutate("add", &add("x")));
  settle_tasks().await;
  assert_eq!(backend.items(), vec!["x"]);
}

#[tokio::test]
async fn test_evicted_entry_ignores_late_fetch_result() {
  let backend = Backend::gated(&["a"]);
  let cache = CacheLayer::builder(registry(&backend), Arc::new(MemoryStore::new()))
    .eviction_grace(Duration::ZERO)
    .build();

  let handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  settle_tasks().await;
  drop(handle);
  assert_eq!(cache.entry_count(), 0);

  let mut handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  settle_tasks().await;
  assert_eq!(backend.fetches(), 2);

  // The first permit goes to the fetch of the evicted entry.
  backend.fetch_gate.add_permits(1);
  settle_tasks().await;
  assert!(handle.is_loading());

  backend.fetch_gate.add_permits(1);
  assert!(handle.settled().await.is_success());
}

#[tokio::test]
async fn test_rollback_after_eviction_is_skipped() {
  let backend = Backend::open(&["a"]);
  let cache = CacheLayer::builder(registry(&backend), Arc::new(MemoryStore::new()))
    .eviction_grace(Duration::ZERO)
    .build();

  let mut handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  handle.settled().await;

  backend.write_gate.forget_permits(Semaphore::MAX_PERMITS);
  let pending = cache.mutate("add", &add("bad"));
  drop(handle);
  assert_eq!(cache.entry_count(), 0);

  backend.write_gate.add_permits(1);
  assert!(pending.await.is_err());
  assert_eq!(cache.entry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unobserved_entry_evicted_after_grace() {
  let backend = Backend::open(&["a"]);
  let cache = CacheLayer::builder(registry(&backend), Arc::new(MemoryStore::new()))
    .eviction_grace(Duration::from_secs(30))
    .build();

  let mut handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  handle.settled().await;
  drop(handle);

  tokio::time::sleep(Duration::from_secs(10)).await;
  // Resubscribing inside the grace period keeps the entry
  let mut handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  handle.settled().await;
  tokio::time::sleep(Duration::from_secs(60)).await;
  assert_eq!(cache.entry_count(), 1);

  drop(handle);
  tokio::time::sleep(Duration::from_secs(31)).await;
  assert_eq!(cache.entry_count(), 0);
  let snapshot = cache.query_data("list", &ListArgs::default()).unwrap();
  assert_eq!(snapshot.status, QueryStatus::Uninitialized);
}

#[tokio::test]
async fn test_patch_query_data_undo_and_commit() {
  let backend = Backend::open(&["a"]);
  let cache = cache_for(&backend);
  let mut handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  handle.settled().await;

  let patch = || {
    vec![QueryPatch::new("list", &json!({}), |v| {
      if let Some(items) = v.as_array_mut() {
        items.push(json!("local"));
      }
    })]
  };

  let set = cache.patch_query_data(patch());
  assert_eq!(strings(&handle), vec!["a", "local"]);
  set.undo();
  assert_eq!(strings(&handle), vec!["a"]);

  cache.patch_query_data(patch()).commit();
  assert_eq!(strings(&handle), vec!["a", "local"]);
}

#[tokio::test]
async fn test_events_describe_cache_activity() {
  let backend = Backend::open(&["a"]);
  let cache = cache_for(&backend);
  let mut events = cache.events();

  let mut handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  handle.settled().await;
  cache.mutate("add", &add("b")).await.unwrap();
  handle.settled().await;

  let events = events.drain();
  let key = handle.key().clone();
  assert_eq!(
    events[0],
    CacheEvent::EntryUpdated {
      key: key.clone(),
      status: QueryStatus::Loading
    }
  );
  assert!(events.contains(&CacheEvent::TagsInvalidated {
    tags: vec![ITEMS],
    keys: vec![key],
  }));
  assert!(events
    .iter()
    .any(|e| matches!(e, CacheEvent::MutationSettled { succeeded: true, .. })));
}

#[tokio::test]
async fn test_teardown_rejects_new_work() {
  let backend = Backend::open(&["a"]);
  let cache = cache_for(&backend);
  let mut handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  handle.settled().await;

  cache.teardown();
  assert_eq!(cache.entry_count(), 0);
  assert!(handle.changed().await.is_none());
  assert!(matches!(handle.refetch().await, Err(CacheError::TornDown)));
  assert!(matches!(
    cache.subscribe("list", &ListArgs::default()),
    Err(CacheError::TornDown)
  ));
  assert!(matches!(
    cache.mutate("add", &add("x")).await,
    Err(CacheError::TornDown)
  ));
}

#[tokio::test]
async fn test_new_entries_hydrate_from_blob_store() {
  let blobs: Arc<dyn BlobStore> = Arc::new(SqliteBlobStore::open_in_memory().unwrap());

  let backend = Backend::open(&["a"]);
  let cache = CacheLayer::builder(registry(&backend), Arc::new(MemoryStore::new()))
    .blob_store(Arc::clone(&blobs))
    .build();
  let mut handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  handle.settled().await;

  // A fresh cache (next process start) sees the persisted result at once.
  let backend = Backend::gated(&["a", "b"]);
  let cache = CacheLayer::builder(registry(&backend), Arc::new(MemoryStore::new()))
    .blob_store(blobs)
    .build();
  let mut handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  assert!(handle.is_loading());
  assert_eq!(strings(&handle), vec!["a"]);

  backend.fetch_gate.add_permits(1);
  assert_eq!(handle.settled().await.data, Some(json!(["a", "b"])));
}

#[tokio::test]
async fn test_persisted_results_only_hydrate_for_their_owner() {
  let blobs: Arc<dyn BlobStore> = Arc::new(SqliteBlobStore::open_in_memory().unwrap());
  let alice = Identity::new("alice");

  let backend = Backend::open(&["mine"]);
  let store = Arc::new(MemoryStore::new().with_identity(alice.clone()));
  let cache = CacheLayer::builder(registry(&backend), store)
    .blob_store(Arc::clone(&blobs))
    .identity(Some(alice.clone()))
    .build();
  let mut handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  handle.settled().await;
  drop(handle);

  // Signed out: nothing saved for alice shows up.
  let backend = Backend::gated(&[]);
  let cache = CacheLayer::builder(registry(&backend), Arc::new(MemoryStore::new()))
    .blob_store(Arc::clone(&blobs))
    .build();
  let handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  assert!(handle.is_loading());
  assert_eq!(handle.data(), None);

  // Another user sees nothing either.
  let bob = Identity::new("bob");
  let cache = CacheLayer::builder(
    registry(&backend),
    Arc::new(MemoryStore::new().with_identity(bob.clone())),
  )
  .blob_store(Arc::clone(&blobs))
  .identity(Some(bob))
  .build();
  let handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  assert_eq!(handle.data(), None);

  // Alice gets her own result back.
  let cache = CacheLayer::builder(
    registry(&backend),
    Arc::new(MemoryStore::new().with_identity(alice.clone())),
  )
  .blob_store(blobs)
  .identity(Some(alice))
  .build();
  let handle = cache.subscribe("list", &ListArgs::default()).unwrap();
  assert_eq!(handle.data(), Some(json!(["mine"])));
}
