//! Bidirectional tag index.
//!
//! Tracks which cache keys depend on which tags so invalidation can find
//! every affected entry, and so eviction can drop a key from every tag it
//! was registered under.

use std::collections::{HashMap, HashSet};

use super::key::{CacheKey, Tag};

#[derive(Debug, Default)]
pub struct TagIndex {
  /// Maps tags to all cache keys that depend on them
  tag_to_keys: HashMap<Tag, HashSet<CacheKey>>,
  /// Maps cache keys to the tags they were registered with
  key_to_tags: HashMap<CacheKey, HashSet<Tag>>,
}

impl TagIndex {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a cache key under each of `tags`.
  ///
  /// Keys registered with no tags are not tracked at all.
  pub fn register(&mut self, key: &CacheKey, tags: &[Tag]) {
    if tags.is_empty() {
      return;
    }
    for tag in tags {
      self
        .tag_to_keys
        .entry(tag.clone())
        .or_default()
        .insert(key.clone());
    }
    self
      .key_to_tags
      .entry(key.clone())
      .or_default()
      .extend(tags.iter().cloned());
  }

  /// Remove a key from every tag set it belongs to.
  pub fn unregister(&mut self, key: &CacheKey) {
    if let Some(tags) = self.key_to_tags.remove(key) {
      for tag in tags {
        if let Some(keys) = self.tag_to_keys.get_mut(&tag) {
          keys.remove(key);
          if keys.is_empty() {
            self.tag_to_keys.remove(&tag);
          }
        }
      }
    }
  }

  /// Union of the keys registered under any of `tags`.
  pub fn keys_for_tags<'a>(&self, tags: impl IntoIterator<Item = &'a Tag>) -> HashSet<CacheKey> {
    tags
      .into_iter()
      .filter_map(|tag| self.tag_to_keys.get(tag))
      .flatten()
      .cloned()
      .collect()
  }

  pub fn tags_for_key(&self, key: &CacheKey) -> HashSet<Tag> {
    self.key_to_tags.get(key).cloned().unwrap_or_default()
  }

  pub fn clear(&mut self) {
    self.tag_to_keys.clear();
    self.key_to_tags.clear();
  }

  pub fn key_count(&self) -> usize {
    self.key_to_tags.len()
  }

  pub fn tag_count(&self) -> usize {
    self.tag_to_keys.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::{json, Value};

  const FAVORITES: Tag = Tag::from_static("Favorites");
  const COLLECTIONS: Tag = Tag::from_static("Collections");
  const QUOTES: Tag = Tag::from_static("Quotes");

  #[test]
  fn test_register_and_lookup() {
    let mut index = TagIndex::new();
    let key = CacheKey::new("getFavorites", &Value::Null);

    index.register(&key, &[FAVORITES]);

    assert!(index.keys_for_tags([&FAVORITES]).contains(&key));
    assert!(index.tags_for_key(&key).contains(&FAVORITES));
    assert!(index.keys_for_tags([&COLLECTIONS]).is_empty());
  }

  #[test]
  fn test_one_tag_many_keys() {
    let mut index = TagIndex::new();
    let love = CacheKey::new("getQuotes", &json!({"category": "Love"}));
    let wisdom = CacheKey::new("getQuotes", &json!({"category": "Wisdom"}));

    index.register(&love, &[QUOTES]);
    index.register(&wisdom, &[QUOTES]);

    let keys = index.keys_for_tags([&QUOTES]);
    assert_eq!(keys.len(), 2);
  }

  #[test]
  fn test_union_across_tags() {
    let mut index = TagIndex::new();
    let favorites = CacheKey::new("getFavorites", &Value::Null);
    let collections = CacheKey::new("getCollections", &Value::Null);
    index.register(&favorites, &[FAVORITES]);
    index.register(&collections, &[COLLECTIONS]);

    let keys = index.keys_for_tags([&FAVORITES, &COLLECTIONS]);
    assert_eq!(keys.len(), 2);
  }

  #[test]
  fn test_unregister_cleans_up_mappings() {
    let mut index = TagIndex::new();
    let key = CacheKey::new("getCollectionQuotes", &json!({"collection_id": "c1"}));
    index.register(&key, &[COLLECTIONS, QUOTES]);
    assert_eq!(index.key_count(), 1);
    assert_eq!(index.tag_count(), 2);

    index.unregister(&key);
    assert_eq!(index.key_count(), 0);
    assert_eq!(index.tag_count(), 0);
  }

  #[test]
  fn test_untagged_keys_are_not_tracked() {
    let mut index = TagIndex::new();
    let key = CacheKey::new("getQuoteOfTheDay", &Value::Null);
    index.register(&key, &[]);
    assert_eq!(index.key_count(), 0);
  }
}
