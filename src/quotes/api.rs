//! Query and mutation definitions for the quotes app.

use chrono::{Datelike, Local, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::cache::{reserialize, OperationRegistry, QueryPatch, Tag};
use crate::error::CacheError;
use crate::store::{Filter, Identity, RemoteStore, Row, Select};

use super::types::*;

pub const QUOTES: Tag = Tag::from_static("Quotes");
pub const FAVORITES: Tag = Tag::from_static("Favorites");
pub const COLLECTIONS: Tag = Tag::from_static("Collections");
pub const USER_PROFILE: Tag = Tag::from_static("UserProfile");
pub const USER_SETTINGS: Tag = Tag::from_static("UserSettings");

pub const GET_QUOTES: &str = "getQuotes";
pub const SEARCH_QUOTES: &str = "searchQuotes";
pub const GET_QUOTE_OF_THE_DAY: &str = "getQuoteOfTheDay";
pub const GET_FAVORITES: &str = "getFavorites";
pub const ADD_FAVORITE: &str = "addFavorite";
pub const REMOVE_FAVORITE: &str = "removeFavorite";
pub const GET_COLLECTIONS: &str = "getCollections";
pub const CREATE_COLLECTION: &str = "createCollection";
pub const DELETE_COLLECTION: &str = "deleteCollection";
pub const GET_COLLECTION_QUOTES: &str = "getCollectionQuotes";
pub const ADD_QUOTE_TO_COLLECTION: &str = "addQuoteToCollection";
pub const REMOVE_QUOTE_FROM_COLLECTION: &str = "removeQuoteFromCollection";
pub const GET_USER_PROFILE: &str = "getUserProfile";
pub const UPDATE_USER_PROFILE: &str = "updateUserProfile";
pub const GET_USER_SETTINGS: &str = "getUserSettings";
pub const UPDATE_USER_SETTINGS: &str = "updateUserSettings";

/// Placeholder owner of optimistic rows until the server answers.
const PENDING_USER: &str = "me";

/// Build the registry of every quotes app operation.
pub fn registry() -> OperationRegistry {
  OperationRegistry::builder()
    .query(GET_QUOTES, &[QUOTES], get_quotes)
    .query(SEARCH_QUOTES, &[QUOTES], search_quotes)
    .query(GET_QUOTE_OF_THE_DAY, &[QUOTES], get_quote_of_the_day)
    .query(GET_FAVORITES, &[FAVORITES], get_favorites)
    .optimistic_mutation(
      ADD_FAVORITE,
      &[FAVORITES],
      add_favorite,
      |args: &AddFavoriteArgs| vec![prepend_favorite(&args.quote)],
    )
    .optimistic_mutation(
      REMOVE_FAVORITE,
      &[FAVORITES],
      remove_favorite,
      |args: &RemoveFavoriteArgs| vec![drop_favorite(&args.quote_id)],
    )
    .query(GET_COLLECTIONS, &[COLLECTIONS], get_collections)
    .mutation(CREATE_COLLECTION, &[COLLECTIONS], create_collection)
    .mutation(DELETE_COLLECTION, &[COLLECTIONS], delete_collection)
    .query(GET_COLLECTION_QUOTES, &[COLLECTIONS], get_collection_quotes)
    .optimistic_mutation(
      ADD_QUOTE_TO_COLLECTION,
      &[COLLECTIONS],
      add_quote_to_collection,
      |args: &AddToCollectionArgs| {
        vec![prepend_collection_quote(&args.collection_id, &args.quote)]
      },
    )
    .optimistic_mutation(
      REMOVE_QUOTE_FROM_COLLECTION,
      &[COLLECTIONS],
      remove_quote_from_collection,
      |args: &RemoveFromCollectionArgs| {
        vec![drop_collection_quote(&args.collection_id, &args.quote_id)]
      },
    )
    .query(GET_USER_PROFILE, &[USER_PROFILE], get_user_profile)
    .mutation(UPDATE_USER_PROFILE, &[USER_PROFILE], update_user_profile)
    .query(GET_USER_SETTINGS, &[USER_SETTINGS], get_user_settings)
    .mutation(UPDATE_USER_SETTINGS, &[USER_SETTINGS], update_user_settings)
    .build()
}

// Optimistic patches

fn prepend_favorite(quote: &Quote) -> QueryPatch {
  let quote = quote.clone();
  QueryPatch::typed::<Vec<Favorite>, _>(GET_FAVORITES, &Value::Null, move |favorites| {
    if favorites.iter().any(|f| f.quote_id == quote.id) {
      return;
    }
    favorites.insert(
      0,
      Favorite {
        id: temp_id(),
        user_id: PENDING_USER.to_string(),
        quote_id: quote.id.clone(),
        created_at: Utc::now(),
        quote: Some(quote.clone()),
      },
    );
  })
}

fn drop_favorite(quote_id: &str) -> QueryPatch {
  let quote_id = quote_id.to_string();
  QueryPatch::typed::<Vec<Favorite>, _>(GET_FAVORITES, &Value::Null, move |favorites| {
    if let Some(index) = favorites.iter().position(|f| f.quote_id == quote_id) {
      favorites.remove(index);
    }
  })
}

fn collection_key(collection_id: &str) -> Value {
  json!({ "collection_id": collection_id })
}

fn prepend_collection_quote(collection_id: &str, quote: &Quote) -> QueryPatch {
  let quote = quote.clone();
  let collection = collection_id.to_string();
  QueryPatch::typed::<Vec<CollectionQuote>, _>(
    GET_COLLECTION_QUOTES,
    &collection_key(collection_id),
    move |entries| {
      if entries.iter().any(|e| e.quote_id == quote.id) {
        return;
      }
      entries.insert(
        0,
        CollectionQuote {
          id: temp_id(),
          collection_id: collection.clone(),
          quote_id: quote.id.clone(),
          quote: Some(quote.clone()),
        },
      );
    },
  )
}

fn drop_collection_quote(collection_id: &str, quote_id: &str) -> QueryPatch {
  let quote_id = quote_id.to_string();
  QueryPatch::typed::<Vec<CollectionQuote>, _>(
    GET_COLLECTION_QUOTES,
    &collection_key(collection_id),
    move |entries| {
      if let Some(index) = entries.iter().position(|e| e.quote_id == quote_id) {
        entries.remove(index);
      }
    },
  )
}

fn temp_id() -> String {
  format!("temp-{}", Uuid::new_v4())
}

// Helpers

async fn identity(store: &dyn RemoteStore) -> Result<Identity, CacheError> {
  store
    .current_identity()
    .await
    .ok_or(CacheError::NotAuthenticated)
}

fn decode<T: DeserializeOwned>(operation: &str, rows: Vec<Row>) -> Result<Vec<T>, CacheError> {
  rows
    .into_iter()
    .map(|row| reserialize(operation, Value::Object(row)))
    .collect()
}

fn decode_row<T: DeserializeOwned>(operation: &str, row: Row) -> Result<T, CacheError> {
  reserialize(operation, Value::Object(row))
}

/// Exactly one row, or `NotFound` when there is none.
fn single<T: DeserializeOwned>(
  operation: &str,
  what: &str,
  rows: Vec<Row>,
) -> Result<T, CacheError> {
  let mut rows = rows.into_iter();
  match (rows.next(), rows.next()) {
    (Some(row), None) => decode_row(operation, row),
    (None, _) => Err(CacheError::not_found(what)),
    (Some(_), Some(_)) => Err(CacheError::RemoteFailure {
      message: "JSON object requested, multiple (or no) rows returned".to_string(),
      conflict: false,
    }),
  }
}

fn to_row<T: Serialize>(operation: &str, value: &T) -> Result<Row, CacheError> {
  match serde_json::to_value(value) {
    Ok(Value::Object(row)) => Ok(row),
    Ok(other) => Err(CacheError::InvalidArgs {
      operation: operation.to_string(),
      message: format!("expected an object, got {}", other),
    }),
    Err(e) => Err(CacheError::InvalidArgs {
      operation: operation.to_string(),
      message: e.to_string(),
    }),
  }
}

/// Attach the referenced quote to each row as `quote`.
async fn embed_quotes(store: &dyn RemoteStore, mut rows: Vec<Row>) -> Result<Vec<Row>, CacheError> {
  let ids: Vec<Value> = rows
    .iter()
    .filter_map(|r| r.get("quote_id").cloned())
    .collect();
  if ids.is_empty() {
    return Ok(rows);
  }

  let quotes: HashMap<String, Row> = store
    .query("quotes", &Select::new().filter(Filter::is_in("id", ids)))
    .await?
    .into_iter()
    .filter_map(|q| {
      let id = q.get("id")?.as_str()?.to_string();
      Some((id, q))
    })
    .collect();

  for row in &mut rows {
    let quote = row
      .get("quote_id")
      .and_then(Value::as_str)
      .and_then(|id| quotes.get(id))
      .map(|q| Value::Object(q.clone()))
      .unwrap_or(Value::Null);
    row.insert("quote".to_string(), quote);
  }
  Ok(rows)
}

fn with_quote(mut row: Row, quote: &Quote) -> Row {
  if let Ok(value) = serde_json::to_value(quote) {
    row.insert("quote".to_string(), value);
  }
  row
}

/// Index of the quote shown on `day_of_year` among `count` quotes.
pub fn quote_of_the_day_index(day_of_year: u32, count: usize) -> usize {
  day_of_year as usize % count
}

// Quotes

async fn get_quotes(
  store: Arc<dyn RemoteStore>,
  args: QuotesArgs,
) -> Result<Vec<Quote>, CacheError> {
  let mut select = Select::new().order_by("created_at", false);
  if args.limit > 0 {
    select = select.range(args.offset, args.offset.saturating_add(args.limit - 1));
  } else {
    select = select.limit(0);
  }
  if let Some(category) = args.category.filter(|c| !c.is_empty()) {
    select = select.filter(Filter::eq("category", category));
  }
  decode(GET_QUOTES, store.query("quotes", &select).await?)
}

async fn search_quotes(
  store: Arc<dyn RemoteStore>,
  args: SearchArgs,
) -> Result<Vec<Quote>, CacheError> {
  let pattern = format!("%{}%", args.query);
  let select = Select::new()
    .filter(Filter::Or(vec![
      Filter::ilike("text", pattern.clone()),
      Filter::ilike("author", pattern),
    ]))
    .limit(50);
  decode(SEARCH_QUOTES, store.query("quotes", &select).await?)
}

async fn get_quote_of_the_day(store: Arc<dyn RemoteStore>, _args: ()) -> Result<Quote, CacheError> {
  let count = store.count("quotes", &[]).await?;
  if count == 0 {
    return Err(CacheError::not_found("quote"));
  }
  let index = quote_of_the_day_index(Local::now().ordinal(), count);
  debug!(index, count, "picked quote of the day");

  let select = Select::new().order_by("created_at", true).range(index, index);
  single(GET_QUOTE_OF_THE_DAY, "quote", store.query("quotes", &select).await?)
}

// Favorites

async fn get_favorites(
  store: Arc<dyn RemoteStore>,
  _args: (),
) -> Result<Vec<Favorite>, CacheError> {
  let user = identity(store.as_ref()).await?;
  let select = Select::new()
    .filter(Filter::eq("user_id", user.user_id))
    .order_by("created_at", false);
  let rows = store.query("favorites", &select).await?;
  decode(GET_FAVORITES, embed_quotes(store.as_ref(), rows).await?)
}

async fn add_favorite(
  store: Arc<dyn RemoteStore>,
  args: AddFavoriteArgs,
) -> Result<Favorite, CacheError> {
  let user = identity(store.as_ref()).await?;
  let row = to_row(
    ADD_FAVORITE,
    &json!({ "user_id": user.user_id, "quote_id": args.quote.id }),
  )?;
  let inserted = store.insert("favorites", row).await?;
  decode_row(ADD_FAVORITE, with_quote(inserted, &args.quote))
}

async fn remove_favorite(
  store: Arc<dyn RemoteStore>,
  args: RemoveFavoriteArgs,
) -> Result<(), CacheError> {
  let user = identity(store.as_ref()).await?;
  store
    .delete(
      "favorites",
      &[
        Filter::eq("user_id", user.user_id),
        Filter::eq("quote_id", args.quote_id),
      ],
    )
    .await?;
  Ok(())
}

// Collections

async fn get_collections(
  store: Arc<dyn RemoteStore>,
  _args: (),
) -> Result<Vec<Collection>, CacheError> {
  let user = identity(store.as_ref()).await?;
  let select = Select::new()
    .filter(Filter::eq("user_id", user.user_id))
    .order_by("created_at", false);
  decode(GET_COLLECTIONS, store.query("collections", &select).await?)
}

async fn create_collection(
  store: Arc<dyn RemoteStore>,
  args: CreateCollectionArgs,
) -> Result<Collection, CacheError> {
  let user = identity(store.as_ref()).await?;
  let row = to_row(
    CREATE_COLLECTION,
    &json!({ "user_id": user.user_id, "name": args.name }),
  )?;
  decode_row(CREATE_COLLECTION, store.insert("collections", row).await?)
}

async fn delete_collection(
  store: Arc<dyn RemoteStore>,
  args: DeleteCollectionArgs,
) -> Result<(), CacheError> {
  let user = identity(store.as_ref()).await?;
  store
    .delete(
      "collections",
      &[
        Filter::eq("id", args.id.clone()),
        Filter::eq("user_id", user.user_id),
      ],
    )
    .await?;
  store
    .delete("collection_quotes", &[Filter::eq("collection_id", args.id)])
    .await?;
  Ok(())
}

async fn get_collection_quotes(
  store: Arc<dyn RemoteStore>,
  args: CollectionQuotesArgs,
) -> Result<Vec<CollectionQuote>, CacheError> {
  let select = Select::new().filter(Filter::eq("collection_id", args.collection_id));
  let rows = store.query("collection_quotes", &select).await?;
  decode(GET_COLLECTION_QUOTES, embed_quotes(store.as_ref(), rows).await?)
}

async fn add_quote_to_collection(
  store: Arc<dyn RemoteStore>,
  args: AddToCollectionArgs,
) -> Result<CollectionQuote, CacheError> {
  let row = to_row(
    ADD_QUOTE_TO_COLLECTION,
    &json!({ "collection_id": args.collection_id, "quote_id": args.quote.id }),
  )?;
  let inserted = store.insert("collection_quotes", row).await?;
  decode_row(ADD_QUOTE_TO_COLLECTION, with_quote(inserted, &args.quote))
}

async fn remove_quote_from_collection(
  store: Arc<dyn RemoteStore>,
  args: RemoveFromCollectionArgs,
) -> Result<(), CacheError> {
  store
    .delete(
      "collection_quotes",
      &[
        Filter::eq("collection_id", args.collection_id),
        Filter::eq("quote_id", args.quote_id),
      ],
    )
    .await?;
  Ok(())
}

// Profile and settings

async fn get_user_profile(
  store: Arc<dyn RemoteStore>,
  _args: (),
) -> Result<UserProfile, CacheError> {
  let user = identity(store.as_ref()).await?;
  let select = Select::new().filter(Filter::eq("user_id", user.user_id));
  single(
    GET_USER_PROFILE,
    "user profile",
    store.query("user_profiles", &select).await?,
  )
}

async fn update_user_profile(
  store: Arc<dyn RemoteStore>,
  update: ProfileUpdate,
) -> Result<UserProfile, CacheError> {
  let user = identity(store.as_ref()).await?;
  let mut patch = to_row(UPDATE_USER_PROFILE, &update)?;
  patch.insert("updated_at".to_string(), json!(Utc::now()));
  let updated = store
    .update("user_profiles", &[Filter::eq("user_id", user.user_id)], patch)
    .await?;
  decode_row(UPDATE_USER_PROFILE, updated)
}

async fn get_user_settings(
  store: Arc<dyn RemoteStore>,
  _args: (),
) -> Result<UserSettings, CacheError> {
  let user = identity(store.as_ref()).await?;
  let select = Select::new().filter(Filter::eq("user_id", user.user_id));
  single(
    GET_USER_SETTINGS,
    "user settings",
    store.query("user_settings", &select).await?,
  )
}

async fn update_user_settings(
  store: Arc<dyn RemoteStore>,
  update: SettingsUpdate,
) -> Result<UserSettings, CacheError> {
  let user = identity(store.as_ref()).await?;
  let patch = to_row(UPDATE_USER_SETTINGS, &update)?;
  let updated = store
    .update("user_settings", &[Filter::eq("user_id", user.user_id)], patch)
    .await?;
  decode_row(UPDATE_USER_SETTINGS, updated)
}
