use tokio::sync::broadcast;
use tracing::debug;

use crate::cache::{CacheKey, QueryStatus, Tag};

/// Cache events
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
  /// An entry's visible state changed
  EntryUpdated { key: CacheKey, status: QueryStatus },
  /// An entry was dropped from the cache
  EntryEvicted { key: CacheKey },
  /// Tags were invalidated, affecting `keys`
  TagsInvalidated { tags: Vec<Tag>, keys: Vec<CacheKey> },
  /// A mutation reached its terminal state
  MutationSettled {
    id: u64,
    operation: String,
    succeeded: bool,
  },
}

/// Receiving end of the cache event stream
pub struct EventStream {
  rx: broadcast::Receiver<CacheEvent>,
}

impl EventStream {
  pub(crate) fn new(rx: broadcast::Receiver<CacheEvent>) -> Self {
    Self { rx }
  }

  /// Receive the next event, or `None` once the cache is gone.
  ///
  /// A receiver that falls behind skips the events it missed.
  pub async fn next(&mut self) -> Option<CacheEvent> {
    loop {
      match self.rx.recv().await {
        Ok(event) => return Some(event),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          debug!(skipped, "event stream lagged");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }

  /// Receive an event that is already queued, without waiting.
  pub fn try_next(&mut self) -> Option<CacheEvent> {
    loop {
      match self.rx.try_recv() {
        Ok(event) => return Some(event),
        Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
        Err(_) => return None,
      }
    }
  }

  /// Drain every queued event.
  pub fn drain(&mut self) -> Vec<CacheEvent> {
    std::iter::from_fn(|| self.try_next()).collect()
  }
}
