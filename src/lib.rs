//! Client-side data sync for a quotes app.
//!
//! [`cache::CacheLayer`] keeps query results keyed by operation and
//! arguments, refetches them when mutations invalidate their tags, and
//! applies optimistic patches that are rolled back when a write fails.
//! [`quotes`] declares the app's operations against a [`store::RemoteStore`].

pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod quotes;
pub mod store;

pub use cache::{CacheLayer, QueryHandle, QueryStatus, Tag};
pub use error::{CacheError, StoreError};
