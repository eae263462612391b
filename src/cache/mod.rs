//! Client-side query cache.
//!
//! This module provides the data-sync layer between screens and the remote
//! store:
//! - Caches query results per operation and canonicalized arguments
//! - Deduplicates concurrent fetches of the same key
//! - Serves cached data while refetching stale entries in the background
//! - Invalidates entries by tag after successful mutations
//! - Applies optimistic patches and rolls back exactly those on failure
//! - Optionally persists results to a local blob store for offline startup

mod entry;
mod key;
mod layer;
mod mutation;
mod patch;
mod query;
mod registry;
mod storage;
mod tags;

#[cfg(test)]
mod tests;

pub use entry::{QuerySnapshot, QueryStatus};
pub use key::{CacheKey, Fingerprint, Tag};
pub use layer::{CacheLayer, CacheLayerBuilder, CacheOptions};
pub use mutation::{MutationStatus, MutationTrigger, PatchSet, PendingMutation};
pub use patch::QueryPatch;
pub use query::QueryHandle;
pub use registry::{
  reserialize, FetchResult, MutationDef, Operation, OperationRegistry, QueryDef, RegistryBuilder,
  Resolver,
};
pub use storage::{BlobStore, NoopBlobStore, PersistedEntry, SqliteBlobStore};
pub use tags::TagIndex;
