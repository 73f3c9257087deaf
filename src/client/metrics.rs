//! Per-client request metrics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Mutable counters owned by a single client.
#[derive(Debug, Clone)]
pub struct Metrics {
  request_count: u64,
  error_count: u64,
  cache_lookups: u64,
  cache_hits: u64,
  average_response_time_ms: f64,
  last_reset: DateTime<Utc>,
}

/// Read-only view handed to callers and the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
  /// Network attempts, retries included
  pub request_count: u64,
  /// Failed attempts / attempts
  pub error_rate: f64,
  pub average_response_time_ms: f64,
  /// Cache hits / cache lookups
  pub cache_hit_rate: f64,
  pub last_reset: DateTime<Utc>,
}

impl Metrics {
  pub fn new() -> Self {
    Self {
      request_count: 0,
      error_count: 0,
      cache_lookups: 0,
      cache_hits: 0,
      average_response_time_ms: 0.0,
      last_reset: Utc::now(),
    }
  }

  pub fn record_cache_lookup(&mut self, hit: bool) {
    self.cache_lookups += 1;
    if hit {
      self.cache_hits += 1;
    }
  }

  /// Record a finished attempt. The average is a rolling mean over attempts.
  pub fn record_attempt(&mut self, elapsed: Duration, failed: bool) {
    self.request_count += 1;
    if failed {
      self.error_count += 1;
    }
    let n = self.request_count as f64;
    let sample = elapsed.as_secs_f64() * 1000.0;
    self.average_response_time_ms += (sample - self.average_response_time_ms) / n;
  }

  pub fn reset(&mut self) {
    *self = Self::new();
  }

  pub fn snapshot(&self) -> MetricsSnapshot {
    MetricsSnapshot {
      request_count: self.request_count,
      error_rate: ratio(self.error_count, self.request_count),
      average_response_time_ms: self.average_response_time_ms,
      cache_hit_rate: ratio(self.cache_hits, self.cache_lookups),
      last_reset: self.last_reset,
    }
  }
}

impl Default for Metrics {
  fn default() -> Self {
    Self::new()
  }
}

fn ratio(part: u64, whole: u64) -> f64 {
  if whole == 0 {
    0.0
  } else {
    part as f64 / whole as f64
  }
}
