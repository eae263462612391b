use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use quotesync::cache::{BlobStore, CacheLayer, NoopBlobStore, SqliteBlobStore};
use quotesync::config::Config;
use quotesync::quotes::{self, *};
use quotesync::store::{Filter, Identity, RemoteStore, Select, SqliteStore};
use quotesync::CacheError;

#[derive(Parser, Debug)]
#[command(name = "quotesync")]
#[command(about = "Browse and curate quotes through a local sync cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/quotesync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Act as this user (overrides config and QUOTESYNC_USER_ID)
  #[arg(short, long)]
  user: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List quotes, newest first
  Quotes {
    #[arg(short, long)]
    category: Option<String>,
    #[arg(short, long, default_value_t = 50)]
    limit: usize,
    #[arg(short, long, default_value_t = 0)]
    offset: usize,
  },
  /// Search quote text and authors
  Search { query: String },
  /// Show the quote of the day
  Today,
  /// List or edit favorites
  Favorites {
    #[command(subcommand)]
    action: Option<FavoriteAction>,
  },
  /// List or edit collections
  Collections {
    #[command(subcommand)]
    action: Option<CollectionAction>,
  },
  /// Show or edit the profile
  Profile {
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    avatar_url: Option<String>,
  },
  /// Show or edit settings
  Settings {
    #[arg(long)]
    dark: Option<bool>,
    #[arg(long)]
    accent: Option<String>,
    #[arg(long)]
    font_size: Option<f64>,
    #[arg(long)]
    notifications: Option<bool>,
    #[arg(long)]
    notification_time: Option<String>,
  },
  /// Insert the sample quotes and create the user's rows
  Seed,
}

#[derive(Subcommand, Debug)]
enum FavoriteAction {
  Add { quote_id: String },
  Remove { quote_id: String },
}

#[derive(Subcommand, Debug)]
enum CollectionAction {
  Create { name: String },
  Delete { id: String },
  Show { id: String },
  Add { id: String, quote_id: String },
  Remove { id: String, quote_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = quotesync::logging::init(&config.log)?;

  let identity = args.user.map(Identity::new).or_else(|| config.identity());

  let db_path = config.database_path()?;
  let store: Arc<dyn RemoteStore> = Arc::new(SqliteStore::open(&db_path, identity.clone())?);
  info!(path = %db_path.display(), "opened store");

  let blobs: Arc<dyn BlobStore> = if config.cache.persist {
    Arc::new(SqliteBlobStore::open(&SqliteBlobStore::default_path()?)?)
  } else {
    Arc::new(NoopBlobStore)
  };

  let cache = CacheLayer::builder(quotes::registry(), Arc::clone(&store))
    .options(config.cache.options())
    .blob_store(blobs)
    .identity(identity.clone())
    .build();

  let result = run(&cache, store.as_ref(), identity, args.command).await;
  cache.teardown();
  result
}

async fn run(
  cache: &CacheLayer,
  store: &dyn RemoteStore,
  identity: Option<Identity>,
  command: Command,
) -> Result<()> {
  match command {
    Command::Quotes {
      category,
      limit,
      offset,
    } => {
      let args = QuotesArgs {
        category,
        limit,
        offset,
      };
      let quotes: Vec<Quote> = load(cache, GET_QUOTES, &args).await?;
      print_quotes(&quotes);
    }
    Command::Search { query } => {
      let quotes: Vec<Quote> = load(cache, SEARCH_QUOTES, &SearchArgs { query }).await?;
      print_quotes(&quotes);
    }
    Command::Today => {
      let quote: Quote = load(cache, GET_QUOTE_OF_THE_DAY, &()).await?;
      print_quotes(std::slice::from_ref(&quote));
    }
    Command::Favorites { action } => {
      match action {
        Some(FavoriteAction::Add { quote_id }) => {
          let quote = find_quote(store, &quote_id).await?;
          cache.mutate(ADD_FAVORITE, &AddFavoriteArgs { quote }).await?;
        }
        Some(FavoriteAction::Remove { quote_id }) => {
          cache
            .mutate(REMOVE_FAVORITE, &RemoveFavoriteArgs { quote_id })
            .await?;
        }
        None => {}
      }
      let favorites: Vec<Favorite> = load(cache, GET_FAVORITES, &()).await?;
      let quotes: Vec<Quote> = favorites.into_iter().filter_map(|f| f.quote).collect();
      print_quotes(&quotes);
    }
    Command::Collections { action } => match action {
      None => print_collections(&load::<_, Vec<Collection>>(cache, GET_COLLECTIONS, &()).await?),
      Some(CollectionAction::Create { name }) => {
        cache
          .mutate(CREATE_COLLECTION, &CreateCollectionArgs { name })
          .await?;
        print_collections(&load::<_, Vec<Collection>>(cache, GET_COLLECTIONS, &()).await?);
      }
      Some(CollectionAction::Delete { id }) => {
        cache
          .mutate(DELETE_COLLECTION, &DeleteCollectionArgs { id })
          .await?;
        print_collections(&load::<_, Vec<Collection>>(cache, GET_COLLECTIONS, &()).await?);
      }
      Some(CollectionAction::Show { id }) => {
        show_collection(cache, id).await?;
      }
      Some(CollectionAction::Add { id, quote_id }) => {
        let quote = find_quote(store, &quote_id).await?;
        let args = AddToCollectionArgs {
          collection_id: id.clone(),
          quote,
        };
        cache.mutate(ADD_QUOTE_TO_COLLECTION, &args).await?;
        show_collection(cache, id).await?;
      }
      Some(CollectionAction::Remove { id, quote_id }) => {
        let args = RemoveFromCollectionArgs {
          collection_id: id.clone(),
          quote_id,
        };
        cache.mutate(REMOVE_QUOTE_FROM_COLLECTION, &args).await?;
        show_collection(cache, id).await?;
      }
    },
    Command::Profile { name, avatar_url } => {
      let update = ProfileUpdate { name, avatar_url };
      let profile: UserProfile = if update == ProfileUpdate::default() {
        load(cache, GET_USER_PROFILE, &()).await?
      } else {
        let value = cache.mutate(UPDATE_USER_PROFILE, &update).await?;
        quotesync::cache::reserialize(UPDATE_USER_PROFILE, value)?
      };
      println!("user:    {}", profile.user_id);
      println!("name:    {}", profile.name.as_deref().unwrap_or("-"));
      println!("avatar:  {}", profile.avatar_url.as_deref().unwrap_or("-"));
      println!("updated: {}", profile.updated_at.format("%Y-%m-%d %H:%M"));
    }
    Command::Settings {
      dark,
      accent,
      font_size,
      notifications,
      notification_time,
    } => {
      let update = SettingsUpdate {
        theme: dark.map(|d| if d { Theme::Dark } else { Theme::Light }),
        accent_color: accent,
        font_size,
        notifications_enabled: notifications,
        notification_time,
      };
      let settings: UserSettings = if update == SettingsUpdate::default() {
        load(cache, GET_USER_SETTINGS, &()).await?
      } else {
        let value = cache.mutate(UPDATE_USER_SETTINGS, &update).await?;
        quotesync::cache::reserialize(UPDATE_USER_SETTINGS, value)?
      };
      println!("{}", serde_yaml::to_string(&settings)?);
    }
    Command::Seed => {
      let inserted = seed_quotes(store).await?;
      println!("Inserted {} quotes", inserted);
      match identity {
        Some(user) => ensure_user(store, &user).await?,
        None => warn!("no user configured; skipping profile and settings"),
      }
    }
  }
  Ok(())
}

/// Settle a query and decode its data.
///
/// Falls back to persisted data when the store cannot be reached, but never
/// when the caller is no longer signed in.
async fn load<A, T>(cache: &CacheLayer, operation: &str, args: &A) -> Result<T>
where
  A: Serialize + ?Sized,
  T: DeserializeOwned,
{
  let mut handle = cache.subscribe(operation, args)?;
  let snapshot = handle.settled().await;

  if let Some(error) = snapshot.error {
    if error == CacheError::NotAuthenticated {
      return Err(eyre!("{} failed: {}. Sign in again with --user", operation, error));
    }
    if snapshot.data.is_none() {
      return Err(eyre!("{} failed: {}", operation, error));
    }
    warn!(operation, "showing cached data: {}", error);
  }
  let data = snapshot
    .data
    .ok_or_else(|| eyre!("{} returned no data", operation))?;
  Ok(quotesync::cache::reserialize(operation, data)?)
}

async fn find_quote(store: &dyn RemoteStore, id: &str) -> Result<Quote> {
  let rows = store
    .query("quotes", &Select::new().filter(Filter::eq("id", id)))
    .await?;
  let row = rows
    .into_iter()
    .next()
    .ok_or_else(|| eyre!("No quote with id {}", id))?;
  Ok(quotesync::cache::reserialize("quotes", serde_json::Value::Object(row))?)
}

async fn show_collection(cache: &CacheLayer, collection_id: String) -> Result<()> {
  let entries: Vec<CollectionQuote> =
    load(cache, GET_COLLECTION_QUOTES, &CollectionQuotesArgs { collection_id }).await?;
  let quotes: Vec<Quote> = entries.into_iter().filter_map(|e| e.quote).collect();
  print_quotes(&quotes);
  Ok(())
}

fn print_quotes(quotes: &[Quote]) {
  if quotes.is_empty() {
    println!("No quotes");
    return;
  }
  for quote in quotes {
    println!("{}  \"{}\" - {} [{}]", quote.id, quote.text, quote.author, quote.category);
  }
}

fn print_collections(collections: &[Collection]) {
  if collections.is_empty() {
    println!("No collections");
    return;
  }
  for collection in collections {
    println!(
      "{}  {} (created {})",
      collection.id,
      collection.name,
      collection.created_at.format("%Y-%m-%d")
    );
  }
}
