//! Rows and operation arguments of the quotes app.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
  pub id: String,
  pub text: String,
  pub author: String,
  pub category: String,
  pub created_at: DateTime<Utc>,
}

/// Quote categories the seeder assigns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
  Motivation,
  Love,
  Success,
  Wisdom,
  Humor,
  Life,
}

impl Category {
  pub const ALL: [Category; 6] = [
    Category::Motivation,
    Category::Love,
    Category::Success,
    Category::Wisdom,
    Category::Humor,
    Category::Life,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Category::Motivation => "Motivation",
      Category::Love => "Love",
      Category::Success => "Success",
      Category::Wisdom => "Wisdom",
      Category::Humor => "Humor",
      Category::Life => "Life",
    }
  }
}

impl fmt::Display for Category {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Favorite {
  pub id: String,
  pub user_id: String,
  pub quote_id: String,
  pub created_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub quote: Option<Quote>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
  pub id: String,
  pub user_id: String,
  pub name: String,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionQuote {
  pub id: String,
  pub collection_id: String,
  pub quote_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub quote: Option<Quote>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
  pub user_id: String,
  pub name: Option<String>,
  pub avatar_url: Option<String>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
  #[default]
  Light,
  Dark,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
  pub user_id: String,
  pub theme: Theme,
  pub accent_color: String,
  pub font_size: f64,
  pub notifications_enabled: bool,
  pub notification_time: Option<String>,
}

impl UserSettings {
  /// Settings a new account starts with.
  pub fn defaults_for(user_id: &str) -> Self {
    Self {
      user_id: user_id.to_string(),
      theme: Theme::Light,
      accent_color: "green".to_string(),
      font_size: 1.0,
      notifications_enabled: true,
      notification_time: Some("08:30 AM".to_string()),
    }
  }
}

/// Partial profile update; absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdate {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub avatar_url: Option<String>,
}

/// Partial settings update; absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsUpdate {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub theme: Option<Theme>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub accent_color: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub font_size: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub notifications_enabled: Option<bool>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub notification_time: Option<String>,
}

// Operation arguments

fn default_limit() -> usize {
  50
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotesArgs {
  #[serde(default)]
  pub category: Option<String>,
  #[serde(default = "default_limit")]
  pub limit: usize,
  #[serde(default)]
  pub offset: usize,
}

impl Default for QuotesArgs {
  fn default() -> Self {
    Self {
      category: None,
      limit: default_limit(),
      offset: 0,
    }
  }
}

impl QuotesArgs {
  pub fn category(category: impl Into<String>) -> Self {
    Self {
      category: Some(category.into()),
      ..Self::default()
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchArgs {
  pub query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddFavoriteArgs {
  pub quote: Quote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveFavoriteArgs {
  pub quote_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateCollectionArgs {
  pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteCollectionArgs {
  pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionQuotesArgs {
  pub collection_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddToCollectionArgs {
  pub collection_id: String,
  pub quote: Quote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveFromCollectionArgs {
  pub collection_id: String,
  pub quote_id: String,
}
