//! The quotes app's data layer: row types, the operation registry and the
//! sample data seeder.

mod api;
mod seed;
mod types;

pub use api::*;
pub use seed::{assign_category, ensure_user, seed_quotes, SAMPLE_QUOTES};
pub use types::*;

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheLayer, QueryStatus};
  use crate::error::CacheError;
  use crate::event::CacheEvent;
  use crate::store::{Identity, MemoryStore, RemoteStore, Row};
  use serde_json::json;
  use std::sync::Arc;

  async fn setup() -> (CacheLayer, Arc<MemoryStore>) {
    let user = Identity::new("u1");
    let store = Arc::new(MemoryStore::new().with_identity(user.clone()));
    seed_quotes(store.as_ref()).await.unwrap();
    ensure_user(store.as_ref(), &user).await.unwrap();
    let cache = CacheLayer::new(registry(), store.clone());
    (cache, store)
  }

  async fn some_quote(cache: &CacheLayer) -> Quote {
    let mut handle = cache.subscribe(GET_QUOTES, &QuotesArgs::default()).unwrap();
    handle.settled().await;
    let quotes: Vec<Quote> = handle.data_as().unwrap().unwrap();
    quotes[0].clone()
  }

  fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().unwrap()
  }

  #[test]
  fn test_registry_declares_every_operation() {
    assert_eq!(registry().names().len(), 16);
    assert_eq!(quote_of_the_day_index(365, 24), 5);
  }

  #[tokio::test]
  async fn test_duplicate_favorite_rolls_back_temp_entry() {
    let (cache, store) = setup().await;
    let quote = some_quote(&cache).await;

    let mut favorites = cache.subscribe(GET_FAVORITES, &()).unwrap();
    favorites.settled().await;
    assert_eq!(favorites.data(), Some(json!([])));

    // Another device favorited the quote; this cache has not seen it yet.
    store
      .insert("favorites", row(json!({"user_id": "u1", "quote_id": quote.id})))
      .await
      .unwrap();

    let pending = cache.mutate(ADD_FAVORITE, &AddFavoriteArgs { quote: quote.clone() });
    let visible: Vec<Favorite> = favorites.data_as().unwrap().unwrap();
    assert_eq!(visible.len(), 1);
    assert!(visible[0].id.starts_with("temp-"));
    assert_eq!(visible[0].quote.as_ref(), Some(&quote));

    let err = pending.await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(favorites.data(), Some(json!([])));
  }

  #[tokio::test]
  async fn test_add_and_remove_favorite() {
    let (cache, _store) = setup().await;
    let quote = some_quote(&cache).await;
    let mut favorites = cache.subscribe(GET_FAVORITES, &()).unwrap();
    favorites.settled().await;

    let added = cache
      .mutate(ADD_FAVORITE, &AddFavoriteArgs { quote: quote.clone() })
      .await
      .unwrap();
    assert_eq!(added["quote"]["id"], json!(quote.id));

    let settled: Vec<Favorite> = {
      favorites.settled().await;
      favorites.data_as().unwrap().unwrap()
    };
    assert_eq!(settled.len(), 1);
    assert!(!settled[0].id.starts_with("temp-"));
    assert_eq!(settled[0].quote.as_ref(), Some(&quote));

    let pending = cache.mutate(
      REMOVE_FAVORITE,
      &RemoveFavoriteArgs {
        quote_id: quote.id.clone(),
      },
    );
    assert_eq!(favorites.data(), Some(json!([])));
    pending.await.unwrap();
    favorites.settled().await;
    assert_eq!(favorites.data(), Some(json!([])));
  }

  #[tokio::test]
  async fn test_offset_past_the_end_settles_empty() {
    let (cache, _store) = setup().await;
    let args = QuotesArgs {
      category: None,
      limit: 50,
      offset: usize::MAX,
    };
    let mut handle = cache.subscribe(GET_QUOTES, &args).unwrap();
    let snapshot = handle.settled().await;
    assert!(snapshot.is_success());
    assert_eq!(snapshot.data, Some(json!([])));
  }

  #[tokio::test]
  async fn test_category_arguments_make_distinct_entries() {
    let (cache, _store) = setup().await;

    let mut love = cache
      .subscribe(GET_QUOTES, &QuotesArgs::category("Love"))
      .unwrap();
    let mut wisdom = cache
      .subscribe(GET_QUOTES, &QuotesArgs::category("Wisdom"))
      .unwrap();
    assert_ne!(love.key(), wisdom.key());

    love.settled().await;
    wisdom.settled().await;
    let love: Vec<Quote> = love.data_as().unwrap().unwrap();
    let wisdom: Vec<Quote> = wisdom.data_as().unwrap().unwrap();
    assert!(!love.is_empty() && love.iter().all(|q| q.category == "Love"));
    assert!(!wisdom.is_empty() && wisdom.iter().all(|q| q.category == "Wisdom"));
  }

  #[tokio::test]
  async fn test_create_collection_refetches_active_list() {
    let (cache, _store) = setup().await;
    let mut collections = cache.subscribe(GET_COLLECTIONS, &()).unwrap();
    collections.settled().await;
    let key = collections.key().clone();

    let mut events = cache.events();
    cache
      .mutate(
        CREATE_COLLECTION,
        &CreateCollectionArgs {
          name: "Stoics".to_string(),
        },
      )
      .await
      .unwrap();
    let snapshot = collections.settled().await;

    let statuses: Vec<QueryStatus> = events
      .drain()
      .into_iter()
      .filter_map(|e| match e {
        CacheEvent::EntryUpdated { key: k, status } if k == key => Some(status),
        _ => None,
      })
      .collect();
    assert_eq!(statuses, vec![QueryStatus::Loading, QueryStatus::Success]);

    let list: Vec<Collection> = serde_json::from_value(snapshot.data.unwrap()).unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].name, "Stoics");
    assert_eq!(list[0].user_id, "u1");
  }

  #[tokio::test]
  async fn test_collection_quotes_patch_and_embed() {
    let (cache, _store) = setup().await;
    let quote = some_quote(&cache).await;
    let created = cache
      .mutate(
        CREATE_COLLECTION,
        &CreateCollectionArgs {
          name: "Mornings".to_string(),
        },
      )
      .await
      .unwrap();
    let collection_id = created["id"].as_str().unwrap().to_string();

    let args = CollectionQuotesArgs {
      collection_id: collection_id.clone(),
    };
    let mut entries = cache.subscribe(GET_COLLECTION_QUOTES, &args).unwrap();
    entries.settled().await;

    let pending = cache.mutate(
      ADD_QUOTE_TO_COLLECTION,
      &AddToCollectionArgs {
        collection_id: collection_id.clone(),
        quote: quote.clone(),
      },
    );
    let optimistic: Vec<CollectionQuote> = entries.data_as().unwrap().unwrap();
    assert!(optimistic[0].id.starts_with("temp-"));
    pending.await.unwrap();

    entries.settled().await;
    let stored: Vec<CollectionQuote> = entries.data_as().unwrap().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].quote.as_ref(), Some(&quote));

    cache
      .mutate(DELETE_COLLECTION, &DeleteCollectionArgs { id: collection_id })
      .await
      .unwrap();
    assert_eq!(entries.settled().await.data, Some(json!([])));
  }

  #[tokio::test]
  async fn test_settings_update_is_partial() {
    let (cache, _store) = setup().await;
    let mut settings = cache.subscribe(GET_USER_SETTINGS, &()).unwrap();
    settings.settled().await;

    cache
      .mutate(
        UPDATE_USER_SETTINGS,
        &SettingsUpdate {
          theme: Some(Theme::Dark),
          ..SettingsUpdate::default()
        },
      )
      .await
      .unwrap();
    settings.settled().await;

    let current: UserSettings = settings.data_as().unwrap().unwrap();
    assert_eq!(current.theme, Theme::Dark);
    assert_eq!(current.accent_color, "green");
  }

  #[tokio::test]
  async fn test_profile_update_sets_name() {
    let (cache, _store) = setup().await;
    let updated = cache
      .mutate(
        UPDATE_USER_PROFILE,
        &ProfileUpdate {
          name: Some("Ada".to_string()),
          ..ProfileUpdate::default()
        },
      )
      .await
      .unwrap();
    assert_eq!(updated["name"], json!("Ada"));

    let mut profile = cache.subscribe(GET_USER_PROFILE, &()).unwrap();
    let profile: UserProfile = {
      profile.settled().await;
      profile.data_as().unwrap().unwrap()
    };
    assert_eq!(profile.name.as_deref(), Some("Ada"));
  }

  #[tokio::test]
  async fn test_signed_out_reads_fail() {
    let store = Arc::new(MemoryStore::new());
    let cache = CacheLayer::new(registry(), store);

    let mut favorites = cache.subscribe(GET_FAVORITES, &()).unwrap();
    let snapshot = favorites.settled().await;
    assert_eq!(snapshot.error, Some(CacheError::NotAuthenticated));

    let mut profile = cache.subscribe(GET_USER_PROFILE, &()).unwrap();
    assert_eq!(
      profile.settled().await.error,
      Some(CacheError::NotAuthenticated)
    );
  }

  #[tokio::test]
  async fn test_quote_of_the_day() {
    let store: Arc<dyn RemoteStore> = Arc::new(MemoryStore::new());
    let cache = CacheLayer::new(registry(), Arc::clone(&store));
    let err = cache.fetch(GET_QUOTE_OF_THE_DAY, &()).await.unwrap_err();
    assert_eq!(err, CacheError::not_found("quote"));

    seed_quotes(store.as_ref()).await.unwrap();
    let quote: Quote =
      serde_json::from_value(cache.fetch(GET_QUOTE_OF_THE_DAY, &()).await.unwrap()).unwrap();
    assert!(SAMPLE_QUOTES.iter().any(|(text, _)| *text == quote.text));
  }

  #[tokio::test]
  async fn test_search_matches_text_or_author() {
    let (cache, _store) = setup().await;
    let found: Vec<Quote> = serde_json::from_value(
      cache
        .fetch(
          SEARCH_QUOTES,
          &SearchArgs {
            query: "BUDDHA".to_string(),
          },
        )
        .await
        .unwrap(),
    )
    .unwrap();
    assert_eq!(found.len(), 2);
    assert!(found.iter().all(|q| q.author == "Buddha"));
  }
}
