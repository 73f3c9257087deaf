//! Async query abstraction for data fetching with caching support.
//!
//! A `Query<T>` wraps a fetcher closure and exposes `{data, loading, error,
//! last_fetched_at}` plus the actions `refetch`, `reset`, `set_data` and
//! `set_error`. Results travel back over a channel tagged with the id of the
//! cancellation token that issued them; only the token that is still active
//! may commit, so the last issued fetch always wins.
//!
//! # Example
//!
//! ```ignore
//! let orders = dashboard.orders.clone();
//! let mut query = Query::new(
//!   move |token| {
//!     let orders = orders.clone();
//!     async move {
//!       let options = RequestOptions::new().cancellation(token);
//!       orders.find_many(&json!({"status": "open"}), options).await.map(|e| e.data)
//!     }
//!   },
//!   FetchOptions::default().cache_key("orders:open"),
//! );
//!
//! // Serve from cache or start fetching
//! query.read();
//!
//! // In event loop tick
//! if query.poll() {
//!   // State changed, trigger re-render
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::debug;

use crate::cache::{TtlCache, DEFAULT_MAX_SIZE, DEFAULT_TTL};
use crate::cancel::CancellationToken;
use crate::error::ServiceError;
use crate::retry::{retry, RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_RETRIES};

/// TTL cache that several queries can share.
pub type SharedCache<T> = Arc<Mutex<TtlCache<String, T>>>;

pub fn shared_cache<T: Clone>() -> SharedCache<T> {
  Arc::new(Mutex::new(TtlCache::new(DEFAULT_MAX_SIZE, DEFAULT_TTL)))
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, ServiceError>> + Send>>;

type FetcherFn<T> = Arc<dyn Fn(CancellationToken) -> BoxFuture<T> + Send + Sync>;

type Tagged<T> = (u64, Result<T, ServiceError>);

enum Settled<T> {
  Delivered(Option<Tagged<T>>),
  Finished(Result<(), JoinError>),
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
  /// No key means no caching
  pub cache_key: Option<String>,
  /// How long a cached value is usable at all
  pub cache_ttl: Duration,
  /// How long a value counts as fresh before a read refetches in the background
  pub stale_time: Duration,
  pub retry_count: u32,
  pub retry_delay: Duration,
  pub enabled: bool,
}

impl Default for FetchOptions {
  fn default() -> Self {
    Self {
      cache_key: None,
      cache_ttl: DEFAULT_TTL,
      stale_time: Duration::from_secs(1),
      retry_count: DEFAULT_MAX_RETRIES,
      retry_delay: DEFAULT_BASE_DELAY,
      enabled: true,
    }
  }
}

impl FetchOptions {
  pub fn cache_key(mut self, key: impl Into<String>) -> Self {
    self.cache_key = Some(key.into());
    self
  }

  pub fn cache_ttl(mut self, ttl: Duration) -> Self {
    self.cache_ttl = ttl;
    self
  }

  pub fn stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn retry(mut self, count: u32, delay: Duration) -> Self {
    self.retry_count = count;
    self.retry_delay = delay;
    self
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy::new(self.retry_count, self.retry_delay)
  }
}

/// Observable state of a query.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
  pub data: Option<T>,
  pub loading: bool,
  pub error: Option<ServiceError>,
  pub last_fetched_at: Option<Instant>,
}

impl<T> Default for QueryState<T> {
  fn default() -> Self {
    Self {
      data: None,
      loading: false,
      error: None,
      last_fetched_at: None,
    }
  }
}

pub struct Query<T> {
  state: QueryState<T>,
  fetcher: FetcherFn<T>,
  options: FetchOptions,
  cache: SharedCache<T>,
  active: Option<CancellationToken>,
  task: Option<JoinHandle<()>>,
  sender: mpsc::UnboundedSender<Tagged<T>>,
  receiver: mpsc::UnboundedReceiver<Tagged<T>>,
}

impl<T: Clone + Send + Sync + 'static> Query<T> {
  /// The fetcher is called once per attempt with the token of the fetch it belongs to.
  pub fn new<F, Fut>(fetcher: F, options: FetchOptions) -> Self
  where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ServiceError>> + Send + 'static,
  {
    let (sender, receiver) = mpsc::unbounded_channel();
    Self {
      state: QueryState::default(),
      fetcher: Arc::new(move |token| Box::pin(fetcher(token))),
      options,
      cache: shared_cache(),
      active: None,
      task: None,
      sender,
      receiver,
    }
  }

  /// Use a cache shared with other queries.
  pub fn with_cache(mut self, cache: SharedCache<T>) -> Self {
    self.cache = cache;
    self
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data.as_ref()
  }

  pub fn is_loading(&self) -> bool {
    self.state.loading
  }

  pub fn error(&self) -> Option<&ServiceError> {
    self.state.error.as_ref()
  }

  pub fn options(&self) -> &FetchOptions {
    &self.options
  }

  /// True when there is no data or it is older than `stale_time`.
  pub fn is_stale(&self) -> bool {
    match self.state.last_fetched_at {
      Some(at) => at.elapsed() > self.options.stale_time,
      None => true,
    }
  }

  /// Copy a usable cached value into the state. Returns whether one was found.
  fn load_cached(&mut self) -> bool {
    let key = match &self.options.cache_key {
      Some(key) => key,
      None => return false,
    };
    let entry = self
      .cache
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get_entry(key);
    match entry {
      Some(entry) => {
        debug!(key, "Serving query from cache");
        self.state.data = Some(entry.value);
        self.state.error = None;
        self.state.last_fetched_at = Some(entry.stored_at);
        true
      }
      None => false,
    }
  }

  /// Stale-while-revalidate read.
  ///
  /// Serves a usable cached value immediately and starts a background fetch
  /// when the value is stale or absent. A fetch already in flight is left to finish.
  pub fn read(&mut self) -> &QueryState<T> {
    if !self.options.enabled {
      return &self.state;
    }
    let cached = self.load_cached();
    if self.active.is_none() && (!cached || self.is_stale()) {
      self.start_fetch();
    }
    &self.state
  }

  /// Fetch again. Without `force` a usable cached value is taken instead.
  pub fn refetch(&mut self, force: bool) {
    if !self.options.enabled {
      return;
    }
    if !force && self.load_cached() {
      self.state.loading = false;
      return;
    }
    self.start_fetch();
  }

  /// Cancel anything in flight and forget all state.
  pub fn reset(&mut self) {
    self.cancel_active();
    self.state = QueryState::default();
  }

  pub fn set_data(&mut self, data: T) {
    self.cancel_active();
    self.store(&data);
    self.state = QueryState {
      data: Some(data),
      loading: false,
      error: None,
      last_fetched_at: Some(Instant::now()),
    };
  }

  pub fn set_error(&mut self, error: ServiceError) {
    self.cancel_active();
    self.state.loading = false;
    self.state.error = Some(error);
  }

  /// Poll for results from a pending fetch.
  ///
  /// Returns `true` if the state changed. Results from superseded fetches are dropped.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;
    while let Ok((id, result)) = self.receiver.try_recv() {
      changed |= self.commit(id, result);
    }
    changed
  }

  /// Wait until the active fetch commits. Returns immediately when nothing is in flight.
  ///
  /// A fetch task that dies without reporting back is committed as an error.
  pub async fn settle(&mut self) -> &QueryState<T> {
    while self.active.is_some() {
      let Some(task) = self.task.as_mut() else {
        break;
      };
      let settled = tokio::select! {
        biased;
        delivered = self.receiver.recv() => Settled::Delivered(delivered),
        finished = task => Settled::Finished(finished),
      };
      match settled {
        Settled::Delivered(Some((id, result))) => {
          self.commit(id, result);
        }
        Settled::Delivered(None) => break,
        Settled::Finished(finished) => {
          self.task = None;
          self.poll();
          if let Some(id) = self.active.as_ref().map(CancellationToken::id) {
            let reason = match finished {
              Err(err) if err.is_panic() => "Fetch task panicked",
              _ => "Fetch task ended without a result",
            };
            self.commit(id, Err(ServiceError::new(reason)));
          }
        }
      }
    }
    &self.state
  }

  fn commit(&mut self, id: u64, result: Result<T, ServiceError>) -> bool {
    let is_active = self.active.as_ref().is_some_and(|token| token.id() == id);
    if !is_active {
      debug!(id, "Dropping result of superseded fetch");
      return false;
    }
    self.active = None;
    self.state.loading = false;

    match result {
      Ok(data) => {
        self.store(&data);
        self.state.data = Some(data);
        self.state.error = None;
        self.state.last_fetched_at = Some(Instant::now());
      }
      Err(err) => {
        self.state.error = Some(err);
      }
    }
    true
  }

  fn store(&self, data: &T) {
    if let Some(key) = &self.options.cache_key {
      self
        .cache
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .set(key.clone(), data.clone(), Some(self.options.cache_ttl));
    }
  }

  fn cancel_active(&mut self) {
    self.task = None;
    if let Some(token) = self.active.take() {
      token.cancel();
    }
  }

  fn start_fetch(&mut self) {
    self.cancel_active();
    let token = CancellationToken::new();
    self.active = Some(token.clone());
    self.state.loading = true;

    let id = token.id();
    let policy = self.options.retry_policy();
    let fetcher = self.fetcher.clone();
    let sender = self.sender.clone();
    self.task = Some(tokio::spawn(async move {
      let result = retry(policy, Some(&token), |_| fetcher(token.clone())).await;
      // The query may be gone already
      let _ = sender.send((id, result));
    }));
  }
}

impl<T> Drop for Query<T> {
  fn drop(&mut self) {
    if let Some(token) = self.active.take() {
      token.cancel();
    }
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("state", &self.state)
      .field("options", &self.options)
      .field("active", &self.active)
      .finish_non_exhaustive()
  }
}
