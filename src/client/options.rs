//! Client-wide settings and per-call request options.

use serde::Deserialize;
use std::time::Duration;

use crate::cache::{DEFAULT_MAX_SIZE, DEFAULT_TTL};
use crate::cancel::CancellationToken;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_ttl", rename = "ttl_ms", with = "millis")]
  pub ttl: Duration,
  #[serde(default = "default_max_size")]
  pub max_size: usize,
  #[serde(default = "default_enabled")]
  pub enabled: bool,
}

fn default_ttl() -> Duration {
  DEFAULT_TTL
}

fn default_max_size() -> usize {
  DEFAULT_MAX_SIZE
}

fn default_enabled() -> bool {
  true
}

mod millis {
  use serde::{Deserialize, Deserializer};
  use std::time::Duration;

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl: DEFAULT_TTL,
      max_size: DEFAULT_MAX_SIZE,
      enabled: true,
    }
  }
}

impl CacheConfig {
  pub fn disabled() -> Self {
    Self {
      enabled: false,
      ..Self::default()
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn with_max_size(mut self, max_size: usize) -> Self {
    self.max_size = max_size;
    self
  }
}

/// Defaults applied to every call of a client unless a call overrides them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientSettings {
  pub timeout: Option<Duration>,
  pub retry: RetryPolicy,
}

/// Per-call configuration. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
  pub cache_enabled: Option<bool>,
  pub cache_ttl: Option<Duration>,
  /// Neither read nor write the cache
  pub skip_cache: bool,
  /// Bypass the cache read but store the fresh result
  pub force_fresh: bool,
  pub timeout: Option<Duration>,
  pub max_retries: Option<u32>,
  pub retry_base_delay: Option<Duration>,
  pub cancellation: Option<CancellationToken>,
}

impl RequestOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn skip_cache(mut self) -> Self {
    self.skip_cache = true;
    self
  }

  pub fn force_fresh(mut self) -> Self {
    self.force_fresh = true;
    self
  }

  pub fn cache_enabled(mut self, enabled: bool) -> Self {
    self.cache_enabled = Some(enabled);
    self
  }

  pub fn cache_ttl(mut self, ttl: Duration) -> Self {
    self.cache_ttl = Some(ttl);
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn max_retries(mut self, retries: u32) -> Self {
    self.max_retries = Some(retries);
    self
  }

  pub fn retry_base_delay(mut self, delay: Duration) -> Self {
    self.retry_base_delay = Some(delay);
    self
  }

  pub fn cancellation(mut self, token: CancellationToken) -> Self {
    self.cancellation = Some(token);
    self
  }
}

/// Options after layering call > client settings > defaults.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedOptions {
  pub read_cache: bool,
  pub write_cache: bool,
  pub cache_ttl: Duration,
  pub timeout: Option<Duration>,
  pub retry: RetryPolicy,
  pub cancellation: Option<CancellationToken>,
}

impl ResolvedOptions {
  pub fn resolve(options: RequestOptions, cache: &CacheConfig, settings: &ClientSettings) -> Self {
    let enabled = options.cache_enabled.unwrap_or(cache.enabled);
    let usable = enabled && !options.skip_cache;
    Self {
      read_cache: usable && !options.force_fresh,
      write_cache: usable,
      cache_ttl: options.cache_ttl.unwrap_or(cache.ttl),
      timeout: options.timeout.or(settings.timeout),
      retry: RetryPolicy::new(
        options.max_retries.unwrap_or(settings.retry.max_retries),
        options.retry_base_delay.unwrap_or(settings.retry.base_delay),
      ),
      cancellation: options.cancellation,
    }
  }
}
