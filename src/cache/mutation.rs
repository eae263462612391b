//! Mutation dispatch with optimistic patches.
//!
//! A mutation applies its patches to cached queries synchronously, before
//! the remote write starts, and then runs the write on its own task. The
//! write is never cancelled: dropping a [`PendingMutation`] only stops the
//! caller from observing it. On success the patches are committed and the
//! mutation's tags are invalidated; on failure exactly the patches it
//! applied are undone.

use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::event::CacheEvent;

use super::key::CacheKey;
use super::layer::CacheLayer;
use super::patch::QueryPatch;
use super::registry::{to_args, MutationDef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
  Pending,
  Succeeded,
  Failed,
}

struct AppliedPatch {
  key: CacheKey,
  generation: u64,
  layer: u64,
}

/// Patches applied to the cache that still await a verdict.
///
/// Call [`commit`](Self::commit) once the write they anticipate has
/// succeeded or [`undo`](Self::undo) if it failed. Dropping the set
/// commits it.
#[must_use = "dropping a PatchSet commits its patches"]
pub struct PatchSet {
  cache: CacheLayer,
  applied: Vec<AppliedPatch>,
  settled: bool,
}

impl PatchSet {
  /// Keys of the entries that were actually patched.
  pub fn keys(&self) -> Vec<CacheKey> {
    let mut keys: Vec<CacheKey> = self.applied.iter().map(|a| a.key.clone()).collect();
    keys.dedup();
    keys
  }

  pub fn is_empty(&self) -> bool {
    self.applied.is_empty()
  }

  /// Keep the patches. They stay on top of refetched data until a fetch
  /// that started after this call lands.
  pub fn commit(mut self) {
    self.settled = true;
    self.cache.commit_patches(&self.applied);
  }

  /// Remove exactly these patches, keeping any applied by others.
  pub fn undo(mut self) {
    self.settled = true;
    self.cache.undo_patches(&self.applied);
  }
}

impl Drop for PatchSet {
  fn drop(&mut self) {
    if !self.settled {
      self.cache.commit_patches(&self.applied);
    }
  }
}

impl std::fmt::Debug for PatchSet {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PatchSet")
      .field("keys", &self.keys())
      .finish_non_exhaustive()
  }
}

enum Outcome {
  /// Failed before any task was spawned
  Rejected(Option<CacheError>),
  Running(JoinHandle<Result<Value, CacheError>>),
}

/// A dispatched mutation.
///
/// Await it for the remote result. The mutation runs to completion whether
/// or not it is awaited.
pub struct PendingMutation {
  id: u64,
  operation: String,
  args: Value,
  patched: Vec<CacheKey>,
  status: watch::Receiver<MutationStatus>,
  outcome: Outcome,
}

impl PendingMutation {
  fn rejected(operation: &str, error: CacheError) -> Self {
    warn!(operation, error = %error, "mutation rejected");
    let (_, status) = watch::channel(MutationStatus::Failed);
    Self {
      id: 0,
      operation: operation.to_string(),
      args: Value::Null,
      patched: Vec::new(),
      status,
      outcome: Outcome::Rejected(Some(error)),
    }
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn operation(&self) -> &str {
    &self.operation
  }

  pub fn args(&self) -> &Value {
    &self.args
  }

  /// Entries that received an optimistic patch.
  pub fn patched_keys(&self) -> &[CacheKey] {
    &self.patched
  }

  pub fn status(&self) -> MutationStatus {
    *self.status.borrow()
  }

  pub fn is_pending(&self) -> bool {
    self.status() == MutationStatus::Pending
  }
}

impl Future for PendingMutation {
  type Output = Result<Value, CacheError>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = self.get_mut();
    match &mut this.outcome {
      Outcome::Rejected(error) => Poll::Ready(Err(
        error
          .take()
          .unwrap_or_else(|| CacheError::Aborted("mutation polled after completion".to_string())),
      )),
      Outcome::Running(task) => Pin::new(task)
        .poll(cx)
        .map(|joined| joined.unwrap_or_else(|e| Err(CacheError::Aborted(e.to_string())))),
    }
  }
}

impl std::fmt::Debug for PendingMutation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PendingMutation")
      .field("id", &self.id)
      .field("operation", &self.operation)
      .field("status", &self.status())
      .finish_non_exhaustive()
  }
}

/// A mutation bound to its operation name, for UI code.
#[derive(Clone)]
pub struct MutationTrigger {
  cache: CacheLayer,
  operation: String,
}

impl MutationTrigger {
  pub fn operation(&self) -> &str {
    &self.operation
  }

  pub fn trigger<A: Serialize + ?Sized>(&self, args: &A) -> PendingMutation {
    self.cache.mutate(&self.operation, args)
  }
}

impl CacheLayer {
  /// Dispatch `operation(args)` with its registered optimistic patch.
  ///
  /// Patches are visible to subscribers when this returns. Must be called
  /// inside a Tokio runtime.
  pub fn mutate<A: Serialize + ?Sized>(&self, operation: &str, args: &A) -> PendingMutation {
    self.dispatch(operation, args, |def, args| {
      def
        .optimistic
        .as_ref()
        .map(|patch| patch(args))
        .unwrap_or_default()
    })
  }

  /// Dispatch `operation(args)` with a call-site optimistic patch in place
  /// of the registered one.
  pub fn mutate_with<A, P>(&self, operation: &str, args: &A, optimistic: P) -> PendingMutation
  where
    A: Serialize + ?Sized,
    P: FnOnce(&Value) -> Vec<QueryPatch>,
  {
    self.dispatch(operation, args, |_, args| optimistic(args))
  }

  pub fn use_mutation(&self, operation: &str) -> MutationTrigger {
    MutationTrigger {
      cache: self.clone(),
      operation: operation.to_string(),
    }
  }

  fn dispatch<A, P>(&self, operation: &str, args: &A, patches: P) -> PendingMutation
  where
    A: Serialize + ?Sized,
    P: FnOnce(&MutationDef, &Value) -> Vec<QueryPatch>,
  {
    let def = match self.inner.registry.mutation(operation) {
      Ok(def) => def,
      Err(e) => return PendingMutation::rejected(operation, e),
    };
    let args = match to_args(operation, args) {
      Ok(args) => args,
      Err(e) => return PendingMutation::rejected(operation, e),
    };
    if self.is_torn_down() {
      return PendingMutation::rejected(operation, CacheError::TornDown);
    }

    let id = self.lock().tick();
    let patch_set = self.patch_query_data(patches(def, &args));
    let patched = patch_set.keys();
    debug!(operation, id, patched = patched.len(), "mutation dispatched");

    let (status_tx, status) = watch::channel(MutationStatus::Pending);
    let resolver = def.resolver.clone();
    let invalidates = def.invalidates.clone();
    let store = Arc::clone(&self.inner.store);
    let cache = self.clone();
    let name = def.name;
    let task_args = args.clone();

    let task = tokio::spawn(async move {
      let result = resolver(store, task_args).await;
      let succeeded = result.is_ok();
      match &result {
        Ok(_) => {
          patch_set.commit();
          cache.invalidate_tags(&invalidates);
          info!(operation = name, id, "mutation succeeded");
        }
        Err(e) => {
          warn!(operation = name, id, error = %e, "mutation failed, rolling back");
          patch_set.undo();
        }
      }
      status_tx.send_replace(if succeeded {
        MutationStatus::Succeeded
      } else {
        MutationStatus::Failed
      });
      cache.emit(CacheEvent::MutationSettled {
        id,
        operation: name.to_string(),
        succeeded,
      });
      result
    });

    PendingMutation {
      id,
      operation: operation.to_string(),
      args,
      patched,
      status,
      outcome: Outcome::Running(task),
    }
  }

  /// Apply `patches` to the cached entries they target, all at once.
  ///
  /// Patches aimed at entries that are missing or hold no data are skipped.
  pub fn patch_query_data(&self, patches: Vec<QueryPatch>) -> PatchSet {
    let mut state = self.lock();
    let mut applied = Vec::new();

    for patch in patches {
      let layer = state.tick();
      let key = patch.key.clone();
      let Some(entry) = state.entries.get_mut(&key) else {
        debug!(%key, "no cached entry to patch");
        continue;
      };
      if entry.push_layer(layer, patch) {
        applied.push(AppliedPatch {
          key,
          generation: entry.generation,
          layer,
        });
      } else {
        debug!(%key, "no cached data to patch");
      }
    }

    // Publish only after every patch is in place
    let mut keys: Vec<&CacheKey> = applied.iter().map(|a| &a.key).collect();
    keys.sort();
    keys.dedup();
    for key in keys {
      if let Some(entry) = state.entries.get(key) {
        entry.notify();
        self.emit(CacheEvent::EntryUpdated {
          key: key.clone(),
          status: entry.status,
        });
      }
    }
    drop(state);

    PatchSet {
      cache: self.clone(),
      applied,
      settled: false,
    }
  }

  fn commit_patches(&self, applied: &[AppliedPatch]) {
    if applied.is_empty() {
      return;
    }
    let mut state = self.lock();
    let now = state.tick();
    for patch in applied {
      if let Some(entry) = state
        .entries
        .get_mut(&patch.key)
        .filter(|e| e.generation == patch.generation)
      {
        entry.commit_layer(patch.layer, now);
      }
    }
  }

  fn undo_patches(&self, applied: &[AppliedPatch]) {
    let mut state = self.lock();
    let mut touched: Vec<CacheKey> = Vec::new();

    for patch in applied.iter().rev() {
      let rolled_back = state
        .entries
        .get_mut(&patch.key)
        .filter(|e| e.generation == patch.generation)
        .is_some_and(|entry| entry.rollback_layer(patch.layer));
      if rolled_back {
        touched.push(patch.key.clone());
      } else {
        warn!(key = %patch.key, "patched entry no longer cached, skipping rollback");
      }
    }

    touched.sort();
    touched.dedup();
    for key in touched {
      if let Some(entry) = state.entries.get(&key) {
        entry.notify();
        self.emit(CacheEvent::EntryUpdated {
          key,
          status: entry.status,
        });
      }
    }
  }
}
