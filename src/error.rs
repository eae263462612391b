//! Error types surfaced by the cache and by remote store implementations.

use thiserror::Error;

/// Failure reported by a [`RemoteStore`](crate::store::RemoteStore) call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct StoreError {
  pub kind: StoreErrorKind,
  pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
  /// Unique constraint or similar write conflict
  Conflict,
  /// Backend could not be reached or failed internally
  Unavailable,
  /// Request was malformed (unknown collection, bad row shape)
  Invalid,
}

impl StoreError {
  pub fn conflict(message: impl Into<String>) -> Self {
    Self {
      kind: StoreErrorKind::Conflict,
      message: message.into(),
    }
  }

  pub fn unavailable(message: impl Into<String>) -> Self {
    Self {
      kind: StoreErrorKind::Unavailable,
      message: message.into(),
    }
  }

  pub fn invalid(message: impl Into<String>) -> Self {
    Self {
      kind: StoreErrorKind::Invalid,
      message: message.into(),
    }
  }
}

impl From<rusqlite::Error> for StoreError {
  fn from(e: rusqlite::Error) -> Self {
    StoreError::unavailable(format!("sqlite: {}", e))
  }
}

/// Errors produced by cache operations.
///
/// Cloneable so a single fetch outcome can be shared by every caller that
/// joined the same in-flight request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
  #[error("Not authenticated")]
  NotAuthenticated,

  /// The remote call failed; `message` is the store's own message.
  #[error("{message}")]
  RemoteFailure { message: String, conflict: bool },

  #[error("{what} not found")]
  NotFound { what: String },

  #[error("unknown operation `{0}`")]
  UnknownOperation(String),

  #[error("operation `{name}` is not a {expected}")]
  WrongKind {
    name: String,
    expected: &'static str,
  },

  #[error("invalid arguments for `{operation}`: {message}")]
  InvalidArgs { operation: String, message: String },

  #[error("failed to decode data for `{operation}`: {message}")]
  Decode { operation: String, message: String },

  #[error("cache has been torn down")]
  TornDown,

  #[error("task aborted: {0}")]
  Aborted(String),
}

impl CacheError {
  pub fn not_found(what: impl Into<String>) -> Self {
    CacheError::NotFound { what: what.into() }
  }

  /// Whether the failure came from a write conflict in the remote store.
  pub fn is_conflict(&self) -> bool {
    matches!(self, CacheError::RemoteFailure { conflict: true, .. })
  }

  /// Short machine-friendly label, used in logs and events.
  pub fn kind(&self) -> &'static str {
    match self {
      CacheError::NotAuthenticated => "not_authenticated",
      CacheError::RemoteFailure { .. } => "remote_failure",
      CacheError::NotFound { .. } => "not_found",
      CacheError::UnknownOperation(_) => "unknown_operation",
      CacheError::WrongKind { .. } => "wrong_kind",
      CacheError::InvalidArgs { .. } => "invalid_args",
      CacheError::Decode { .. } => "decode",
      CacheError::TornDown => "torn_down",
      CacheError::Aborted(_) => "aborted",
    }
  }
}

impl From<StoreError> for CacheError {
  fn from(e: StoreError) -> Self {
    CacheError::RemoteFailure {
      conflict: e.kind == StoreErrorKind::Conflict,
      message: e.message,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_store_conflict_maps_to_remote_failure() {
    let err: CacheError = StoreError::conflict("duplicate key value").into();
    assert!(err.is_conflict());
    assert_eq!(err.to_string(), "duplicate key value");
  }

  #[test]
  fn test_unavailable_is_not_conflict() {
    let err: CacheError = StoreError::unavailable("timeout").into();
    assert!(!err.is_conflict());
    assert_eq!(err.kind(), "remote_failure");
  }
}
