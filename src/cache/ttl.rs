//! Bounded key/value store with per-entry expiry.
//!
//! Expiry is lazy: nothing runs in the background, entries are checked on access.
//! Capacity is enforced by purging expired entries only. When every entry is
//! still valid a `set` goes through anyway and the store grows past `max_size`.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// Default lifetime of a cached value.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
/// Default soft capacity.
pub const DEFAULT_MAX_SIZE: usize = 1000;

/// A stored value with its expiry. `expires_at = stored_at + ttl`.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
  pub value: V,
  pub stored_at: Instant,
  pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
  fn new(value: V, ttl: Duration) -> Self {
    let stored_at = Instant::now();
    Self {
      value,
      stored_at,
      expires_at: stored_at + ttl,
    }
  }

  pub fn is_valid_at(&self, now: Instant) -> bool {
    now <= self.expires_at
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
  pub size: usize,
  pub max_size: usize,
}

#[derive(Debug)]
pub struct TtlCache<K, V> {
  entries: HashMap<K, CacheEntry<V>>,
  max_size: usize,
  default_ttl: Duration,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
  pub fn new(max_size: usize, default_ttl: Duration) -> Self {
    Self {
      entries: HashMap::new(),
      max_size,
      default_ttl,
    }
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  /// Return the value if present and not expired. Expired entries are evicted.
  pub fn get<Q>(&mut self, key: &Q) -> Option<V>
  where
    K: Borrow<Q>,
    Q: Hash + Eq + ?Sized,
  {
    let now = Instant::now();
    match self.entries.get(key) {
      Some(entry) if entry.is_valid_at(now) => Some(entry.value.clone()),
      Some(_) => {
        self.entries.remove(key);
        None
      }
      None => None,
    }
  }

  /// Like [`get`](Self::get) but also returns when the value was stored.
  pub fn get_entry<Q>(&mut self, key: &Q) -> Option<CacheEntry<V>>
  where
    K: Borrow<Q>,
    Q: Hash + Eq + ?Sized,
  {
    let now = Instant::now();
    match self.entries.get(key) {
      Some(entry) if entry.is_valid_at(now) => Some(entry.clone()),
      Some(_) => {
        self.entries.remove(key);
        None
      }
      None => None,
    }
  }

  /// Store a value. `ttl = None` uses the cache default.
  pub fn set(&mut self, key: K, value: V, ttl: Option<Duration>) {
    if self.entries.len() >= self.max_size && !self.entries.contains_key(&key) {
      self.purge_expired();
    }
    let ttl = ttl.unwrap_or(self.default_ttl);
    self.entries.insert(key, CacheEntry::new(value, ttl));
  }

  pub fn delete<Q>(&mut self, key: &Q) -> bool
  where
    K: Borrow<Q>,
    Q: Hash + Eq + ?Sized,
  {
    self.entries.remove(key).is_some()
  }

  pub fn clear(&mut self) {
    self.entries.clear();
  }

  /// Remove every expired entry, returning how many were dropped.
  pub fn purge_expired(&mut self) -> usize {
    let now = Instant::now();
    let before = self.entries.len();
    self.entries.retain(|_, entry| entry.is_valid_at(now));
    before - self.entries.len()
  }

  pub fn stats(&self) -> CacheStats {
    CacheStats {
      size: self.entries.len(),
      max_size: self.max_size,
    }
  }
}

impl<V: Clone> TtlCache<String, V> {
  /// Drop every key in a namespace (keys starting with `prefix`).
  pub fn invalidate_prefix(&mut self, prefix: &str) -> usize {
    let before = self.entries.len();
    self.entries.retain(|key, _| !key.starts_with(prefix));
    before - self.entries.len()
  }
}

impl<K: Eq + Hash, V: Clone> Default for TtlCache<K, V> {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_SIZE, DEFAULT_TTL)
  }
}
