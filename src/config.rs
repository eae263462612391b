use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheOptions;
use crate::store::Identity;

/// Environment variable that supplies the signed-in user.
pub const USER_ID_ENV: &str = "QUOTESYNC_USER_ID";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  /// Path of the store database (defaults to the data directory)
  pub database: Option<PathBuf>,
  /// Signed-in user; overridden by QUOTESYNC_USER_ID
  pub user_id: Option<String>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_stale_time")]
  pub stale_time_secs: u64,
  /// Seconds an unobserved entry survives; 0 evicts immediately
  #[serde(default = "default_eviction_grace")]
  pub eviction_grace_secs: u64,
  /// Persist query results for offline startup
  #[serde(default = "default_persist")]
  pub persist: bool,
}

fn default_stale_time() -> u64 {
  60
}

fn default_eviction_grace() -> u64 {
  60
}

fn default_persist() -> bool {
  true
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: default_stale_time(),
      eviction_grace_secs: default_eviction_grace(),
      persist: default_persist(),
    }
  }
}

impl CacheConfig {
  pub fn options(&self) -> CacheOptions {
    CacheOptions {
      stale_time: Duration::from_secs(self.stale_time_secs),
      eviction_grace: Duration::from_secs(self.eviction_grace_secs),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Default filter directive; RUST_LOG takes precedence
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Also write logs to this file
  pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
  "warn".to_string()
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./quotesync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/quotesync/config.yaml
  ///
  /// Without a file every setting takes its default.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("quotesync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("quotesync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file is a valid, all-default config
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// The signed-in user, from QUOTESYNC_USER_ID or the config file.
  pub fn identity(&self) -> Option<Identity> {
    std::env::var(USER_ID_ENV)
      .ok()
      .filter(|id| !id.is_empty())
      .or_else(|| self.user_id.clone())
      .map(Identity::new)
  }

  /// Where the store database lives.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("quotesync").join("quotes.db"))
  }
}
