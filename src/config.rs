use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::{CacheConfig, ClientSettings};
use crate::retry::RetryPolicy;

/// Environment variable that overrides `api.base_url`.
pub const API_URL_ENV: &str = "PRESSROOM_API_URL";

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  #[serde(default)]
  pub base_url: String,
  /// Per-request timeout in milliseconds
  #[serde(default = "default_request_timeout_ms")]
  pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
  DEFAULT_REQUEST_TIMEOUT_MS
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// SQLite file for credentials (defaults to the user data directory)
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./pressroom.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/pressroom/config.yaml
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::from_env_only().ok_or_else(|| {
        eyre!(
          "No configuration file found. Create one at ~/.config/pressroom/config.yaml \
           or set {}.",
          API_URL_ENV
        )
      })?,
    };

    config.with_env_overrides().validated()
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("pressroom.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("pressroom").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  /// A config made of defaults, usable when only the env var is set.
  fn from_env_only() -> Option<Self> {
    std::env::var(API_URL_ENV).ok().map(|url| Self {
      api: ApiConfig {
        base_url: url,
        request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
      },
      cache: CacheConfig::default(),
      storage: StorageConfig::default(),
    })
  }

  fn with_env_overrides(mut self) -> Self {
    if let Ok(url) = std::env::var(API_URL_ENV) {
      if !url.trim().is_empty() {
        self.api.base_url = url;
      }
    }
    self
  }

  pub fn validated(self) -> Result<Self> {
    if self.api.base_url.trim().is_empty() {
      return Err(eyre!("api.base_url must not be empty"));
    }
    if self.api.request_timeout_ms == 0 {
      return Err(eyre!("api.request_timeout_ms must be greater than zero"));
    }
    Ok(self)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.api.request_timeout_ms)
  }

  /// Defaults every resource client starts from.
  pub fn client_settings(&self) -> ClientSettings {
    ClientSettings {
      timeout: Some(self.request_timeout()),
      retry: RetryPolicy::default(),
    }
  }
}
