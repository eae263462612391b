//! Optimistic patches.
//!
//! A patch is a recipe applied to one entry's data. Each applied patch is
//! kept as a layer on the entry together with the value it was applied to,
//! so it can be undone on its own even when later patches sit on top.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use super::key::CacheKey;

/// In-place edit of an entry's data.
pub type Recipe = Arc<dyn Fn(&mut Value) + Send + Sync>;

/// A patch aimed at one cached query.
#[derive(Clone)]
pub struct QueryPatch {
  pub key: CacheKey,
  pub(crate) recipe: Recipe,
}

impl QueryPatch {
  /// Patch the raw JSON data of `operation(args)`.
  pub fn new<F>(operation: &str, args: &Value, recipe: F) -> Self
  where
    F: Fn(&mut Value) + Send + Sync + 'static,
  {
    Self {
      key: CacheKey::new(operation, args),
      recipe: Arc::new(recipe),
    }
  }

  /// Patch the data of `operation(args)` through its typed form.
  ///
  /// If the cached value does not decode as `T` the patch leaves it alone.
  pub fn typed<T, F>(operation: &str, args: &Value, recipe: F) -> Self
  where
    T: Serialize + DeserializeOwned,
    F: Fn(&mut T) + Send + Sync + 'static,
  {
    let target = operation.to_string();
    Self::new(operation, args, move |value| {
      let mut draft: T = match serde_json::from_value(value.clone()) {
        Ok(draft) => draft,
        Err(e) => {
          warn!(operation = %target, "skipping optimistic patch: {}", e);
          return;
        }
      };
      recipe(&mut draft);
      match serde_json::to_value(draft) {
        Ok(patched) => *value = patched,
        Err(e) => warn!(operation = %target, "skipping optimistic patch: {}", e),
      }
    })
  }

  pub(crate) fn apply(&self, value: &mut Value) {
    (self.recipe)(value)
  }
}

impl fmt::Debug for QueryPatch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryPatch")
      .field("key", &self.key)
      .finish_non_exhaustive()
  }
}

/// One applied patch on one entry.
pub(crate) struct PatchLayer {
  pub id: u64,
  /// Entry data immediately before this layer was applied
  pub before: Value,
  pub patch: QueryPatch,
  /// Logical time at which the owning mutation succeeded
  pub committed_at: Option<u64>,
}

/// Re-apply `layers` in order on top of `base`, refreshing each layer's
/// snapshot, and return the resulting visible value.
pub(crate) fn replay(base: Value, layers: &mut [PatchLayer]) -> Value {
  let mut value = base;
  for layer in layers.iter_mut() {
    layer.before = value.clone();
    layer.patch.apply(&mut value);
  }
  value
}
