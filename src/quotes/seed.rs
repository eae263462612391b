//! Sample data for a fresh store.

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::{Filter, Identity, RemoteStore, Row, Select};

use super::types::{Category, UserSettings};

/// Pick a category from keywords in the quote text.
pub fn assign_category(text: &str) -> Category {
  const RULES: &[(&[&str], Category)] = &[
    (&["love", "heart", "soul", "passion"], Category::Love),
    (&["success", "goal", "dream", "work", "fail"], Category::Success),
    (&["wise", "wisdom", "truth", "knowledge", "mind"], Category::Wisdom),
    (&["laugh", "humor", "funny", "smile", "joke"], Category::Humor),
    (&["life", "time", "live", "world", "peace"], Category::Life),
  ];

  let text = text.to_lowercase();
  RULES
    .iter()
    .find(|(words, _)| words.iter().any(|w| text.contains(w)))
    .map(|(_, category)| *category)
    .unwrap_or(Category::Motivation)
}

/// (text, author)
pub const SAMPLE_QUOTES: &[(&str, &str)] = &[
  ("The only way to do great work is to love what you do.", "Steve Jobs"),
  ("Where there is love there is life.", "Mahatma Gandhi"),
  ("Keep your face always toward the sunshine, and shadows will fall behind you.", "Walt Whitman"),
  ("Success is not final, failure is not fatal: it is the courage to continue that counts.", "Winston Churchill"),
  ("A goal without a plan is just a wish.", "Antoine de Saint-Exupery"),
  ("All our dreams can come true, if we have the courage to pursue them.", "Walt Disney"),
  ("The only true wisdom is in knowing you know nothing.", "Socrates"),
  ("Knowing yourself is the beginning of all wisdom.", "Aristotle"),
  ("The mind is everything. What you think you become.", "Buddha"),
  ("A day without laughter is a day wasted.", "Charlie Chaplin"),
  ("Against the assault of laughter nothing can stand.", "Mark Twain"),
  ("Peace begins with a smile.", "Mother Teresa"),
  ("In the end, it's not the years in your life that count. It's the life in your years.", "Abraham Lincoln"),
  ("Life is what happens when you're busy making other plans.", "John Lennon"),
  ("Be the change that you wish to see in the world.", "Mahatma Gandhi"),
  ("It does not matter how slowly you go as long as you do not stop.", "Confucius"),
  ("Believe you can and you're halfway there.", "Theodore Roosevelt"),
  ("Act as if what you do makes a difference. It does.", "William James"),
  ("What lies behind us and what lies before us are tiny matters compared to what lies within us.", "Ralph Waldo Emerson"),
  ("The best way out is always through.", "Robert Frost"),
  ("Put your heart, mind, and soul into even your smallest acts.", "Swami Sivananda"),
  ("Turn your wounds into wisdom.", "Oprah Winfrey"),
  ("Do not dwell in the past, do not dream of the future, concentrate the mind on the present moment.", "Buddha"),
  ("With the new day comes new strength and new thoughts.", "Eleanor Roosevelt"),
];

/// Insert the sample quotes, skipping any whose text is already stored.
///
/// Returns the number of quotes inserted.
pub async fn seed_quotes(store: &dyn RemoteStore) -> Result<usize, StoreError> {
  let mut inserted = 0;
  for (text, author) in SAMPLE_QUOTES {
    let existing = store
      .count("quotes", &[Filter::eq("text", *text)])
      .await?;
    if existing > 0 {
      debug!(text, "quote already present");
      continue;
    }

    store
      .insert("quotes", quote_row(text, author))
      .await?;
    inserted += 1;
  }

  info!(inserted, total = SAMPLE_QUOTES.len(), "seeded quotes");
  Ok(inserted)
}

fn quote_row(text: &str, author: &str) -> Row {
  let mut row = Row::new();
  row.insert("text".to_string(), json!(text));
  row.insert("author".to_string(), json!(author));
  row.insert("category".to_string(), json!(assign_category(text).as_str()));
  row.insert("created_at".to_string(), json!(Utc::now()));
  row
}

/// Create the profile and settings rows of `user` when missing.
pub async fn ensure_user(store: &dyn RemoteStore, user: &Identity) -> Result<(), StoreError> {
  let mine = Select::new().filter(Filter::eq("user_id", user.user_id.clone()));

  if store.query("user_profiles", &mine).await?.is_empty() {
    let mut row = Row::new();
    row.insert("user_id".to_string(), json!(user.user_id));
    row.insert("name".to_string(), json!(null));
    row.insert("avatar_url".to_string(), json!(null));
    store.insert("user_profiles", row).await?;
    info!(user = %user.user_id, "created user profile");
  }

  if store.query("user_settings", &mine).await?.is_empty() {
    let settings = UserSettings::defaults_for(&user.user_id);
    let row = match serde_json::to_value(settings) {
      Ok(serde_json::Value::Object(row)) => row,
      _ => return Err(StoreError::invalid("settings did not encode as an object")),
    };
    store.insert("user_settings", row).await?;
    info!(user = %user.user_id, "created user settings");
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryStore;

  #[test]
  fn test_assign_category_by_keyword() {
    assert_eq!(assign_category("All you need is LOVE"), Category::Love);
    assert_eq!(assign_category("Chase the dream"), Category::Success);
    assert_eq!(assign_category("Seek the truth"), Category::Wisdom);
    assert_eq!(assign_category("Tell me a joke"), Category::Humor);
    assert_eq!(assign_category("Make peace"), Category::Life);
    assert_eq!(assign_category("Keep going"), Category::Motivation);
    // Earlier rules win
    assert_eq!(assign_category("Love your work"), Category::Love);
  }

  #[tokio::test]
  async fn test_seeding_twice_skips_existing() {
    let store = MemoryStore::new();
    let first = seed_quotes(&store).await.unwrap();
    assert_eq!(first, SAMPLE_QUOTES.len());

    let second = seed_quotes(&store).await.unwrap();
    assert_eq!(second, 0);
    assert_eq!(store.count("quotes", &[]).await.unwrap(), SAMPLE_QUOTES.len());
  }

  #[tokio::test]
  async fn test_ensure_user_is_idempotent() {
    let store = MemoryStore::new();
    let user = Identity::new("u1");
    ensure_user(&store, &user).await.unwrap();
    ensure_user(&store, &user).await.unwrap();

    assert_eq!(store.count("user_profiles", &[]).await.unwrap(), 1);
    assert_eq!(store.count("user_settings", &[]).await.unwrap(), 1);
  }
}
