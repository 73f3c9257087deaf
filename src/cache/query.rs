//! Hierarchical query cache used by CRUD resources.
//!
//! Entries are keyed by `(root_key, operation, params)`. Invalidation marks
//! entries stale instead of dropping them; a stale entry reads as a miss and
//! is replaced by the next successful fetch.

use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::ttl::DEFAULT_TTL;

/// Cache key for a single query.
///
/// Two keys are equal iff root, operation and normalized params are equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueryKey {
  root: String,
  operation: String,
  params: String,
}

impl QueryKey {
  pub fn new(root: impl Into<String>, operation: impl Into<String>, params: &impl Serialize) -> Self {
    let params = serde_json::to_value(params)
      .map(normalize_params)
      .unwrap_or(Value::Null);
    Self {
      root: root.into(),
      operation: operation.into(),
      params: canonical(&params),
    }
  }

  pub fn root(&self) -> &str {
    &self.root
  }

  pub fn operation(&self) -> &str {
    &self.operation
  }

  /// Canonical JSON of the normalized params.
  pub fn params(&self) -> &str {
    &self.params
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}:{}", self.root, self.operation, self.params)
  }
}

/// Drop null and empty-string members so `{a: 1, b: null}` and `{a: 1}` share a key.
pub fn normalize_params(value: Value) -> Value {
  match value {
    Value::Object(map) => Value::Object(
      map
        .into_iter()
        .filter(|(_, v)| !v.is_null() && v.as_str() != Some(""))
        .map(|(k, v)| (k, normalize_params(v)))
        .collect(),
    ),
    Value::Array(items) => Value::Array(items.into_iter().map(normalize_params).collect()),
    other => other,
  }
}

/// Serialize with sorted object keys.
pub fn canonical(value: &Value) -> String {
  // serde_json's default map is ordered, so plain serialization is stable
  value.to_string()
}

struct QueryEntry {
  value: Arc<dyn Any + Send + Sync>,
  updated_at: Instant,
  stale: bool,
}

pub struct QueryCache {
  entries: HashMap<QueryKey, QueryEntry>,
  stale_time: Duration,
  generations: HashMap<String, u64>,
  cleared: u64,
}

impl QueryCache {
  pub fn new(stale_time: Duration) -> Self {
    Self {
      entries: HashMap::new(),
      stale_time,
      generations: HashMap::new(),
      cleared: 0,
    }
  }

  /// Changes whenever anything under `root` is invalidated or removed.
  pub fn generation(&self, root: &str) -> u64 {
    self.cleared + self.generations.get(root).copied().unwrap_or(0)
  }

  fn bump(&mut self, root: &str) {
    *self.generations.entry(root.to_string()).or_default() += 1;
  }

  fn is_fresh(&self, entry: &QueryEntry) -> bool {
    !entry.stale && entry.updated_at.elapsed() <= self.stale_time
  }

  /// Fresh value for `key`, if any.
  pub fn get<T: Clone + 'static>(&self, key: &QueryKey) -> Option<T> {
    self
      .entries
      .get(key)
      .filter(|entry| self.is_fresh(entry))
      .and_then(|entry| entry.value.downcast_ref::<T>().cloned())
  }

  /// Value for `key` regardless of staleness.
  pub fn peek<T: Clone + 'static>(&self, key: &QueryKey) -> Option<T> {
    self
      .entries
      .get(key)
      .and_then(|entry| entry.value.downcast_ref::<T>().cloned())
  }

  /// Store `value` only if the root has not moved past `generation`.
  pub fn set_if_current<T: Send + Sync + 'static>(
    &mut self,
    key: QueryKey,
    value: T,
    generation: u64,
  ) -> bool {
    if self.generation(&key.root) != generation {
      return false;
    }
    self.set(key, value);
    true
  }

  pub fn set<T: Send + Sync + 'static>(&mut self, key: QueryKey, value: T) {
    self.entries.insert(
      key,
      QueryEntry {
        value: Arc::new(value),
        updated_at: Instant::now(),
        stale: false,
      },
    );
  }

  pub fn is_stale(&self, key: &QueryKey) -> Option<bool> {
    self.entries.get(key).map(|entry| !self.is_fresh(entry))
  }

  /// Mark every entry under `root` stale. Returns how many were marked.
  pub fn invalidate(&mut self, root: &str) -> usize {
    self.bump(root);
    self.invalidate_where(|key| key.root == root)
  }

  pub fn invalidate_operation(&mut self, root: &str, operation: &str) -> usize {
    self.bump(root);
    self.invalidate_where(|key| key.root == root && key.operation == operation)
  }

  fn invalidate_where(&mut self, matches: impl Fn(&QueryKey) -> bool) -> usize {
    let mut marked = 0;
    for (key, entry) in self.entries.iter_mut() {
      if matches(key) {
        entry.stale = true;
        marked += 1;
      }
    }
    marked
  }

  pub fn remove(&mut self, key: &QueryKey) -> bool {
    self.bump(&key.root);
    self.entries.remove(key).is_some()
  }

  pub fn clear(&mut self) {
    self.cleared += 1;
    self.entries.clear();
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

impl Default for QueryCache {
  fn default() -> Self {
    Self::new(DEFAULT_TTL)
  }
}

/// Cloneable handle to a shared [`QueryCache`].
#[derive(Clone, Default)]
pub struct QueryClient {
  inner: Arc<Mutex<QueryCache>>,
}

impl QueryClient {
  pub fn new(stale_time: Duration) -> Self {
    Self {
      inner: Arc::new(Mutex::new(QueryCache::new(stale_time))),
    }
  }

  /// Lock the cache. A poisoned lock still holds consistent cache data.
  pub fn lock(&self) -> MutexGuard<'_, QueryCache> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn get<T: Clone + 'static>(&self, key: &QueryKey) -> Option<T> {
    self.lock().get(key)
  }

  pub fn seed<T: Send + Sync + 'static>(&self, key: QueryKey, value: T) {
    self.lock().set(key, value);
  }

  pub fn generation(&self, root: &str) -> u64 {
    self.lock().generation(root)
  }

  /// Seed unless `key`'s root was invalidated since `generation` was read.
  pub fn seed_if_current<T: Send + Sync + 'static>(
    &self,
    key: QueryKey,
    value: T,
    generation: u64,
  ) -> bool {
    self.lock().set_if_current(key, value, generation)
  }

  pub fn invalidate(&self, root: &str) -> usize {
    self.lock().invalidate(root)
  }

  pub fn remove(&self, key: &QueryKey) -> bool {
    self.lock().remove(key)
  }

  pub fn clear(&self) {
    self.lock().clear();
  }
}

impl fmt::Debug for QueryClient {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryClient")
      .field("entries", &self.lock().len())
      .finish_non_exhaustive()
  }
}
