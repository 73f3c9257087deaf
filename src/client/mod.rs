//! Generic per-entity resource client.
//!
//! A `ResourceClient<E, C, U>` owns a [`TtlCache`] and [`Metrics`] and talks to a
//! REST collection through the shared [`TransportAdapter`]:
//!
//! | Operation    | Method | Path       |
//! |--------------|--------|------------|
//! | find_many    | GET    | `/R`       |
//! | find_by_id   | GET    | `/R/{id}`  |
//! | create       | POST   | `/R`       |
//! | update       | PUT    | `/R/{id}`  |
//! | delete       | DELETE | `/R/{id}`  |
//! | bulk_create  | POST   | `/R/bulk`  |
//! | bulk_update  | PUT    | `/R/bulk`  |
//! | bulk_delete  | DELETE | `/R/bulk`  |
//!
//! Reads are cached under `R:findMany:<params>` and `R:findById:<id>`. Every
//! mutation drops the whole `R:` namespace before it is dispatched and again
//! once it completes. A read that overlapped a mutation is returned but not cached.

mod metrics;
mod options;

pub use metrics::{Metrics, MetricsSnapshot};
pub use options::{CacheConfig, ClientSettings, RequestOptions};

use options::ResolvedOptions;

use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cache::{canonical, normalize_params, CacheStats, Identifiable, TtlCache};
use crate::envelope::{Envelope, PageMeta};
use crate::error::ServiceError;
use crate::retry::{retry, with_timeout, RetryPolicy};
use crate::transport::{ApiRequest, Method, RawResponse, TransportAdapter, UploadForm};

/// How the flat item list is found in a list response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ItemsExtractor {
  /// `data` is already the array
  #[default]
  Identity,
  /// `data` is an object holding the array under this field
  Field(String),
}

impl ItemsExtractor {
  /// Pull the item array out of `envelope.data`, lifting sibling pagination
  /// fields into `meta` when the server did not send any.
  pub fn extract(&self, envelope: Envelope<Value>) -> Result<Envelope<Value>, ServiceError> {
    if envelope.data.is_array() {
      return Ok(envelope);
    }

    let field = match self {
      ItemsExtractor::Identity => {
        return Err(ServiceError::decode("Expected a list in response data"));
      }
      ItemsExtractor::Field(field) => field,
    };

    let mut envelope = envelope;
    let body = match envelope.data.as_object_mut() {
      Some(body) => body,
      None => return Err(ServiceError::decode("Expected an object in response data")),
    };
    let items = match body.remove(field) {
      Some(items @ Value::Array(_)) => items,
      _ => {
        return Err(ServiceError::decode(format!(
          "Expected a list under '{}' in response data",
          field
        )));
      }
    };
    let lifted = PageMeta::from_siblings(body);
    let meta = envelope.meta.take().or(lifted);

    let mut out = envelope.map(|_| items);
    out.meta = meta;
    Ok(out)
  }
}

/// Static description of one REST collection.
#[derive(Debug, Clone)]
pub struct ResourceConfig {
  /// Resource name, also the cache-key prefix
  pub name: String,
  /// Collection path, `/name` unless overridden
  pub path: String,
  pub cache: CacheConfig,
  pub items: ItemsExtractor,
}

impl ResourceConfig {
  pub fn new(name: impl Into<String>) -> Self {
    let name = name.into();
    Self {
      path: format!("/{}", name),
      name,
      cache: CacheConfig::default(),
      items: ItemsExtractor::default(),
    }
  }

  pub fn with_path(mut self, path: impl Into<String>) -> Self {
    let path = path.into();
    self.path = if path.starts_with('/') {
      path
    } else {
      format!("/{}", path)
    };
    self
  }

  pub fn with_cache(mut self, cache: CacheConfig) -> Self {
    self.cache = cache;
    self
  }

  pub fn with_items(mut self, items: ItemsExtractor) -> Self {
    self.items = items;
    self
  }
}

/// One entry of a bulk update.
#[derive(Debug, Clone, Serialize)]
pub struct BulkUpdate<I, U> {
  pub id: I,
  pub data: U,
}

/// Result of a binary download.
#[derive(Debug, Clone, PartialEq)]
pub struct Download {
  pub file_name: Option<String>,
  pub content_type: Option<String>,
  pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
enum Cached<E> {
  Many(Envelope<Vec<E>>),
  One(Envelope<E>),
}

pub struct ResourceClient<E, C = E, U = C> {
  config: ResourceConfig,
  adapter: TransportAdapter,
  settings: ClientSettings,
  cache: Mutex<TtlCache<String, Cached<E>>>,
  /// Bumped on every invalidation; reads only cache results from the epoch they started in
  epoch: AtomicU64,
  metrics: Mutex<Metrics>,
  _payloads: PhantomData<fn(C, U)>,
}

impl<E, C, U> ResourceClient<E, C, U>
where
  E: Identifiable,
  C: Serialize + Send + Sync,
  U: Serialize + Send + Sync,
{
  pub fn new(config: ResourceConfig, adapter: TransportAdapter) -> Self {
    let cache = TtlCache::new(config.cache.max_size, config.cache.ttl);
    Self {
      config,
      adapter,
      settings: ClientSettings::default(),
      cache: Mutex::new(cache),
      epoch: AtomicU64::new(0),
      metrics: Mutex::new(Metrics::new()),
      _payloads: PhantomData,
    }
  }

  pub fn with_settings(mut self, settings: ClientSettings) -> Self {
    self.settings = settings;
    self
  }

  pub fn name(&self) -> &str {
    &self.config.name
  }

  pub fn config(&self) -> &ResourceConfig {
    &self.config
  }

  fn cache(&self) -> MutexGuard<'_, TtlCache<String, Cached<E>>> {
    self.cache.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn metrics_mut(&self) -> MutexGuard<'_, Metrics> {
    self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn namespace(&self) -> String {
    format!("{}:", self.config.name)
  }

  fn find_many_key(&self, params: &Value) -> String {
    format!("{}:findMany:{}", self.config.name, canonical(params))
  }

  fn find_by_id_key(&self, id: &E::Id) -> String {
    format!("{}:findById:{}", self.config.name, id)
  }

  fn item_path(&self, id: &E::Id) -> String {
    format!("{}/{}", self.config.path, id)
  }

  fn sub_path(&self, sub_path: Option<&str>) -> String {
    match sub_path.map(|s| s.trim_matches('/')).filter(|s| !s.is_empty()) {
      Some(sub) => format!("{}/{}", self.config.path, sub),
      None => self.config.path.clone(),
    }
  }

  fn resolve(&self, options: RequestOptions) -> ResolvedOptions {
    ResolvedOptions::resolve(options, &self.config.cache, &self.settings)
  }

  fn read_cached(&self, key: &str) -> Option<Cached<E>> {
    let hit = self.cache().get(key);
    self.metrics_mut().record_cache_lookup(hit.is_some());
    debug!(resource = %self.config.name, key, hit = hit.is_some(), "Cache lookup");
    hit
  }

  fn invalidate_namespace(&self) {
    let mut cache = self.cache();
    self.epoch.fetch_add(1, Ordering::SeqCst);
    let dropped = cache.invalidate_prefix(&self.namespace());
    debug!(resource = %self.config.name, dropped, "Invalidated cache namespace");
  }

  fn current_epoch(&self) -> u64 {
    self.epoch.load(Ordering::SeqCst)
  }

  /// Cache a read unless the namespace was invalidated while it was in flight.
  fn store_read(&self, key: String, value: Cached<E>, ttl: Duration, started_in: u64) {
    let mut cache = self.cache();
    if self.current_epoch() == started_in {
      cache.set(key, value, Some(ttl));
    } else {
      debug!(resource = %self.config.name, key, "Read overlapped a mutation, not caching");
    }
  }

  /// Retry-wrapped, timed dispatch of one request through `dispatch`.
  async fn send<T, F, Fut>(
    &self,
    request: ApiRequest,
    options: &ResolvedOptions,
    dispatch: F,
  ) -> Result<T, ServiceError>
  where
    F: Fn(ApiRequest) -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
  {
    let result = retry(options.retry, options.cancellation.as_ref(), |_| {
      let attempt = dispatch(request.clone().timeout(options.timeout));
      async move {
        let started = Instant::now();
        let result = with_timeout(options.timeout, attempt).await;
        self
          .metrics_mut()
          .record_attempt(started.elapsed(), result.is_err());
        result
      }
    })
    .await;

    self.committable(result, options)
  }

  async fn execute(
    &self,
    request: ApiRequest,
    options: &ResolvedOptions,
  ) -> Result<Envelope<Value>, ServiceError> {
    self
      .send(request, options, |request| self.adapter.dispatch(request))
      .await
  }

  /// Dispatch a mutation with the namespace dropped on both sides of the call.
  async fn mutate(
    &self,
    request: ApiRequest,
    options: &ResolvedOptions,
  ) -> Result<Envelope<Value>, ServiceError> {
    self.invalidate_namespace();
    let result = self.execute(request, options).await;
    self.invalidate_namespace();
    result
  }

  /// Drop results that arrive after the caller cancelled.
  fn committable<T>(
    &self,
    result: Result<T, ServiceError>,
    options: &ResolvedOptions,
  ) -> Result<T, ServiceError> {
    match &options.cancellation {
      Some(token) if token.is_cancelled() => Err(ServiceError::cancelled()),
      _ => result,
    }
  }

  pub async fn find_many<P>(
    &self,
    params: &P,
    options: RequestOptions,
  ) -> Result<Envelope<Vec<E>>, ServiceError>
  where
    P: Serialize + ?Sized,
  {
    let options = self.resolve(options);
    let params = serde_json::to_value(params)
      .map(normalize_params)
      .map_err(|e| ServiceError::decode(format!("Failed to serialize params: {}", e)))?;
    let key = self.find_many_key(&params);

    if options.read_cache {
      if let Some(Cached::Many(envelope)) = self.read_cached(&key) {
        return Ok(envelope);
      }
    }

    let started_in = self.current_epoch();
    let request = ApiRequest::get(self.config.path.clone()).query(&params);
    let envelope = self.execute(request, &options).await?;
    let envelope: Envelope<Vec<E>> = self.config.items.extract(envelope)?.decode()?;

    if options.write_cache {
      self.store_read(key, Cached::Many(envelope.clone()), options.cache_ttl, started_in);
    }
    Ok(envelope)
  }

  pub async fn find_by_id(
    &self,
    id: &E::Id,
    options: RequestOptions,
  ) -> Result<Envelope<E>, ServiceError> {
    let options = self.resolve(options);
    let key = self.find_by_id_key(id);

    if options.read_cache {
      if let Some(Cached::One(envelope)) = self.read_cached(&key) {
        return Ok(envelope);
      }
    }

    let started_in = self.current_epoch();
    let request = ApiRequest::get(self.item_path(id));
    let envelope: Envelope<E> = self.execute(request, &options).await?.decode()?;

    if options.write_cache {
      self.store_read(key, Cached::One(envelope.clone()), options.cache_ttl, started_in);
    }
    Ok(envelope)
  }

  /// Never served from cache. Seeding the new entity is left to the caller.
  pub async fn create(&self, data: &C, options: RequestOptions) -> Result<Envelope<E>, ServiceError> {
    let options = self.resolve(options);
    let request = ApiRequest::new(Method::Post, self.config.path.clone()).json(to_json(data)?);
    let envelope = self.mutate(request, &options).await?.decode()?;
    info!(resource = %self.config.name, "Created entity");
    Ok(envelope)
  }

  pub async fn update(
    &self,
    id: &E::Id,
    data: &U,
    options: RequestOptions,
  ) -> Result<Envelope<E>, ServiceError> {
    let options = self.resolve(options);
    self.cache().delete(&self.find_by_id_key(id));

    let request = ApiRequest::new(Method::Put, self.item_path(id)).json(to_json(data)?);
    let envelope = self.mutate(request, &options).await?.decode()?;
    info!(resource = %self.config.name, %id, "Updated entity");
    Ok(envelope)
  }

  pub async fn delete(&self, id: &E::Id, options: RequestOptions) -> Result<Envelope<()>, ServiceError> {
    let options = self.resolve(options);
    self.cache().delete(&self.find_by_id_key(id));

    let request = ApiRequest::new(Method::Delete, self.item_path(id));
    let envelope = self.mutate(request, &options).await?;
    info!(resource = %self.config.name, %id, "Deleted entity");
    Ok(envelope.map(|_| ()))
  }

  pub async fn bulk_create(
    &self,
    items: &[C],
    options: RequestOptions,
  ) -> Result<Envelope<Vec<E>>, ServiceError> {
    let options = self.resolve(options);
    let request = ApiRequest::new(Method::Post, self.bulk_path()).json(to_json(items)?);
    let envelope = self.mutate(request, &options).await?;
    let envelope = self.config.items.extract(envelope)?.decode()?;
    info!(resource = %self.config.name, count = items.len(), "Bulk created entities");
    Ok(envelope)
  }

  pub async fn bulk_update(
    &self,
    items: &[BulkUpdate<E::Id, U>],
    options: RequestOptions,
  ) -> Result<Envelope<Vec<E>>, ServiceError> {
    let options = self.resolve(options);
    let request = ApiRequest::new(Method::Put, self.bulk_path()).json(to_json(items)?);
    let envelope = self.mutate(request, &options).await?;
    let envelope = self.config.items.extract(envelope)?.decode()?;
    info!(resource = %self.config.name, count = items.len(), "Bulk updated entities");
    Ok(envelope)
  }

  pub async fn bulk_delete(
    &self,
    ids: &[E::Id],
    options: RequestOptions,
  ) -> Result<Envelope<()>, ServiceError> {
    let options = self.resolve(options);
    let request =
      ApiRequest::new(Method::Delete, self.bulk_path()).json(json!({ "ids": to_json(ids)? }));
    let envelope = self.mutate(request, &options).await?;
    info!(resource = %self.config.name, count = ids.len(), "Bulk deleted entities");
    Ok(envelope.map(|_| ()))
  }

  fn bulk_path(&self) -> String {
    format!("{}/bulk", self.config.path)
  }

  /// Multipart upload under the collection path. Invalidates the namespace.
  pub async fn upload(
    &self,
    form: UploadForm,
    sub_path: Option<&str>,
    options: RequestOptions,
  ) -> Result<Envelope<Value>, ServiceError> {
    let options = self.resolve(options);
    let request = ApiRequest::new(Method::Post, self.sub_path(sub_path)).multipart(form);
    self.mutate(request, &options).await
  }

  /// Raw download under the collection path. Not cached.
  pub async fn download(
    &self,
    sub_path: Option<&str>,
    file_name: Option<&str>,
    options: RequestOptions,
  ) -> Result<Download, ServiceError> {
    let options = self.resolve(options);
    let request = ApiRequest::get(self.sub_path(sub_path));

    let response = self
      .send(request, &options, |request| self.adapter.dispatch_raw(request))
      .await?;

    Ok(Download {
      file_name: file_name
        .map(String::from)
        .or_else(|| attachment_name(&response)),
      content_type: response.header("content-type").map(String::from),
      bytes: response.body,
    })
  }

  /// Lightweight reachability probe: one uncached, unretried list request.
  pub async fn health_check(&self) -> Result<(), ServiceError> {
    let options = self.resolve(
      RequestOptions::new()
        .skip_cache()
        .max_retries(0)
        .timeout(Duration::from_secs(5)),
    );
    let request = ApiRequest::get(self.config.path.clone()).param("limit", 1);
    self.execute(request, &options).await.map(|_| ())
  }

  pub fn clear_cache(&self) {
    let mut cache = self.cache();
    self.epoch.fetch_add(1, Ordering::SeqCst);
    cache.clear();
  }

  pub fn cache_stats(&self) -> CacheStats {
    self.cache().stats()
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.metrics_mut().snapshot()
  }

  pub fn reset_metrics(&self) {
    self.metrics_mut().reset();
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    self.settings.retry
  }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<Value, ServiceError> {
  serde_json::to_value(value)
    .map_err(|e| ServiceError::decode(format!("Failed to serialize request body: {}", e)))
}

/// File name from `Content-Disposition: attachment; filename="x.pdf"`.
fn attachment_name(response: &RawResponse) -> Option<String> {
  let disposition = response.header("content-disposition")?;
  disposition
    .split(';')
    .map(str::trim)
    .find_map(|part| part.strip_prefix("filename="))
    .map(|name| name.trim_matches('"').to_string())
    .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cancel::CancellationToken;
  use crate::store::CredentialStore;
  use crate::testing::{ok, status, ScriptedTransport};
  use serde::Deserialize;
  use std::sync::Arc;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Job {
    id: u64,
    name: String,
  }

  impl Identifiable for Job {
    type Id = u64;

    fn id(&self) -> u64 {
      self.id
    }
  }

  #[derive(Debug, Clone, Serialize)]
  struct NewJob {
    name: String,
  }

  type JobClient = ResourceClient<Job, NewJob, NewJob>;

  fn client(wire: &Arc<ScriptedTransport>, cache: CacheConfig) -> JobClient {
    let adapter = TransportAdapter::new(wire.clone(), CredentialStore::in_memory());
    ResourceClient::new(ResourceConfig::new("jobs").with_cache(cache), adapter).with_settings(
      ClientSettings {
        timeout: None,
        retry: RetryPolicy::new(3, Duration::from_millis(100)),
      },
    )
  }

  fn no_params() -> Value {
    json!({})
  }

  #[tokio::test(start_paused = true)]
  async fn test_ttl_scenario_hit_then_refetch() {
    let wire = ScriptedTransport::new();
    wire.reply(Method::Get, "/jobs/1", ok(json!({"id": 1, "name": "A"})));
    let jobs = client(&wire, CacheConfig::default().with_ttl(Duration::from_millis(5000)));

    let first = jobs.find_by_id(&1, RequestOptions::new()).await.unwrap();
    assert_eq!(first.data, Job { id: 1, name: "A".to_string() });

    tokio::time::advance(Duration::from_millis(3000)).await;
    let second = jobs.find_by_id(&1, RequestOptions::new()).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(wire.calls(), 1);

    tokio::time::advance(Duration::from_millis(3000)).await;
    jobs.find_by_id(&1, RequestOptions::new()).await.unwrap();
    assert_eq!(wire.calls(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_find_many_caches_per_params() {
    let wire = ScriptedTransport::new();
    wire.reply(Method::Get, "/jobs", ok(json!([{"id": 1, "name": "A"}])));
    let jobs = client(&wire, CacheConfig::default());

    jobs.find_many(&json!({"page": 1}), RequestOptions::new()).await.unwrap();
    jobs.find_many(&json!({"page": 1, "q": ""}), RequestOptions::new()).await.unwrap();
    assert_eq!(wire.calls(), 1, "normalized params share one entry");

    jobs.find_many(&json!({"page": 2}), RequestOptions::new()).await.unwrap();
    assert_eq!(wire.calls(), 2);
    assert_eq!(wire.last_request().unwrap().query_pairs(), vec![("page".to_string(), "2".to_string())]);

    let metrics = jobs.metrics();
    assert_eq!(metrics.request_count, 2);
    assert!((metrics.cache_hit_rate - 1.0 / 3.0).abs() < 1e-9);
  }

  #[tokio::test(start_paused = true)]
  async fn test_skip_cache_and_force_fresh() {
    let wire = ScriptedTransport::new();
    wire.reply(Method::Get, "/jobs/1", ok(json!({"id": 1, "name": "A"})));
    let jobs = client(&wire, CacheConfig::default());

    jobs.find_by_id(&1, RequestOptions::new().skip_cache()).await.unwrap();
    assert_eq!(jobs.cache_stats().size, 0);

    jobs.find_by_id(&1, RequestOptions::new().force_fresh()).await.unwrap();
    jobs.find_by_id(&1, RequestOptions::new().force_fresh()).await.unwrap();
    assert_eq!(wire.calls(), 3);
    assert_eq!(jobs.cache_stats().size, 1);

    jobs.find_by_id(&1, RequestOptions::new()).await.unwrap();
    assert_eq!(wire.calls(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_disabled_cache_always_hits_network() {
    let wire = ScriptedTransport::new();
    wire.reply(Method::Get, "/jobs", ok(json!([])));
    let jobs = client(&wire, CacheConfig::disabled());

    jobs.find_many(&no_params(), RequestOptions::new()).await.unwrap();
    jobs.find_many(&no_params(), RequestOptions::new()).await.unwrap();
    assert_eq!(wire.calls(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_create_invalidates_namespace_and_is_never_cached() {
    let wire = ScriptedTransport::new();
    wire.reply(Method::Get, "/jobs", ok(json!([])));
    wire.reply(Method::Post, "/jobs", ok(json!({"id": 9, "name": "New"})));
    let jobs = client(&wire, CacheConfig::default());

    jobs.find_many(&no_params(), RequestOptions::new()).await.unwrap();
    assert_eq!(jobs.cache_stats().size, 1);

    let created = jobs
      .create(&NewJob { name: "New".to_string() }, RequestOptions::new())
      .await
      .unwrap();
    assert_eq!(created.data.id, 9);
    assert_eq!(jobs.cache_stats().size, 0);
    assert_eq!(wire.last_request().unwrap().body, crate::transport::RequestBody::Json(json!({"name": "New"})));

    jobs.find_many(&no_params(), RequestOptions::new()).await.unwrap();
    assert_eq!(wire.calls_to(Method::Get, "/jobs"), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_update_drops_detail_entry() {
    let wire = ScriptedTransport::new();
    wire.reply(Method::Get, "/jobs/42", ok(json!({"id": 42, "name": "A"})));
    wire.reply(Method::Put, "/jobs/42", ok(json!({"id": 42, "name": "B"})));
    let jobs = client(&wire, CacheConfig::default());

    jobs.find_by_id(&42, RequestOptions::new()).await.unwrap();
    let updated = jobs
      .update(&42, &NewJob { name: "B".to_string() }, RequestOptions::new())
      .await
      .unwrap();
    assert_eq!(updated.data.name, "B");
    assert_eq!(jobs.cache_stats().size, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_delete_and_bulk_paths() {
    let wire = ScriptedTransport::new();
    wire.reply(Method::Delete, "/jobs/3", ok(Value::Null));
    wire.reply(Method::Post, "/jobs/bulk", ok(json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}])));
    wire.reply(Method::Put, "/jobs/bulk", ok(json!([{"id": 1, "name": "c"}])));
    wire.reply(Method::Delete, "/jobs/bulk", ok(Value::Null));
    let jobs = client(&wire, CacheConfig::default());

    jobs.delete(&3, RequestOptions::new()).await.unwrap();

    let created = jobs
      .bulk_create(
        &[NewJob { name: "a".to_string() }, NewJob { name: "b".to_string() }],
        RequestOptions::new(),
      )
      .await
      .unwrap();
    assert_eq!(created.data.len(), 2);

    let updated = jobs
      .bulk_update(
        &[BulkUpdate { id: 1, data: NewJob { name: "c".to_string() } }],
        RequestOptions::new(),
      )
      .await
      .unwrap();
    assert_eq!(updated.data[0].name, "c");
    assert_eq!(
      wire.last_request().unwrap().body,
      crate::transport::RequestBody::Json(json!([{"id": 1, "data": {"name": "c"}}]))
    );

    jobs.bulk_delete(&[1, 2], RequestOptions::new()).await.unwrap();
    assert_eq!(
      wire.last_request().unwrap().body,
      crate::transport::RequestBody::Json(json!({"ids": [1, 2]}))
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_server_errors_are_retried_with_budget() {
    let wire = ScriptedTransport::new();
    wire.reply(Method::Get, "/jobs/1", status(503));
    let jobs = client(&wire, CacheConfig::default());

    let err = jobs.find_by_id(&1, RequestOptions::new()).await.unwrap_err();
    assert_eq!(err.status, Some(503));
    assert_eq!(wire.calls(), 4);
    assert_eq!(jobs.metrics().error_rate, 1.0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_not_found_is_surfaced_after_one_attempt() {
    let wire = ScriptedTransport::new();
    wire.reply(Method::Get, "/jobs/1", status(404));
    let jobs = client(&wire, CacheConfig::default());

    let err = jobs.find_by_id(&1, RequestOptions::new()).await.unwrap_err();
    assert_eq!(err.status, Some(404));
    assert_eq!(wire.calls(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_failure_then_success_is_cached() {
    let wire = ScriptedTransport::new();
    wire.fail(
      Method::Get,
      "/jobs/1",
      crate::transport::TransportFailure::Network("reset".to_string()),
    );
    wire.reply(Method::Get, "/jobs/1", ok(json!({"id": 1, "name": "A"})));
    let jobs = client(&wire, CacheConfig::default());

    let envelope = jobs.find_by_id(&1, RequestOptions::new()).await.unwrap();
    assert_eq!(envelope.data.name, "A");
    assert_eq!(wire.calls(), 2);
    assert_eq!(jobs.cache_stats().size, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_counts_as_retryable_failure() {
    let wire = ScriptedTransport::new();
    wire.reply_after(
      Method::Get,
      "/jobs/1",
      Duration::from_secs(10),
      ok(json!({"id": 1, "name": "slow"})),
    );
    let jobs = client(&wire, CacheConfig::default());

    let err = jobs
      .find_by_id(
        &1,
        RequestOptions::new().timeout(Duration::from_millis(50)).max_retries(1),
      )
      .await
      .unwrap_err();
    assert!(err.has_code(crate::error::codes::TIMEOUT));
    assert_eq!(wire.calls(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancelled_call_does_not_commit_to_cache() {
    let wire = ScriptedTransport::new();
    wire.reply_after(
      Method::Get,
      "/jobs/1",
      Duration::from_millis(100),
      ok(json!({"id": 1, "name": "A"})),
    );
    let jobs = client(&wire, CacheConfig::default());
    let token = CancellationToken::new();

    let canceller = {
      let token = token.clone();
      tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
      })
    };
    let err = jobs
      .find_by_id(&1, RequestOptions::new().cancellation(token))
      .await
      .unwrap_err();
    canceller.await.unwrap();

    assert!(err.is_cancelled());
    assert_eq!(jobs.cache_stats().size, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_paginated_list_with_items_field() {
    let wire = ScriptedTransport::new();
    wire.reply(
      Method::Get,
      "/jobs",
      ok(json!({"items": [{"id": 1, "name": "A"}], "total": 40, "page": 1, "limit": 1, "hasMore": true})),
    );
    let adapter = TransportAdapter::new(wire.clone(), CredentialStore::in_memory());
    let jobs: JobClient = ResourceClient::new(
      ResourceConfig::new("jobs").with_items(ItemsExtractor::Field("items".to_string())),
      adapter,
    );

    let envelope = jobs.find_many(&no_params(), RequestOptions::new()).await.unwrap();
    assert_eq!(envelope.data.len(), 1);
    let meta = envelope.meta.unwrap();
    assert_eq!(meta.total, Some(40));
    assert_eq!(meta.has_more, Some(true));
  }

  #[tokio::test(start_paused = true)]
  async fn test_identity_extractor_rejects_object_data() {
    let wire = ScriptedTransport::new();
    wire.reply(Method::Get, "/jobs", ok(json!({"items": []})));
    let jobs = client(&wire, CacheConfig::default());

    let err = jobs.find_many(&no_params(), RequestOptions::new()).await.unwrap_err();
    assert!(err.has_code(crate::error::codes::DECODE_ERROR));
  }

  #[tokio::test(start_paused = true)]
  async fn test_upload_and_download() {
    let wire = ScriptedTransport::new();
    wire.reply(Method::Post, "/jobs/import", ok(json!({"imported": 3})));
    let mut csv = RawResponse::new(200, "id,name\n1,A\n");
    csv
      .headers
      .insert("Content-Disposition".to_string(), "attachment; filename=\"jobs.csv\"".to_string());
    csv.headers.insert("Content-Type".to_string(), "text/csv".to_string());
    wire.reply(Method::Get, "/jobs/export", csv);
    let jobs = client(&wire, CacheConfig::default());

    let form = UploadForm::new().file("file", "jobs.csv", Some("text/csv"), b"id\n".to_vec());
    let uploaded = jobs
      .upload(form, Some("/import"), RequestOptions::new())
      .await
      .unwrap();
    assert_eq!(uploaded.data, json!({"imported": 3}));
    let sent = wire.last_request().unwrap();
    assert_eq!(
      sent.headers.get("Content-Type").map(String::as_str),
      Some("multipart/form-data")
    );

    let download = jobs
      .download(Some("export"), None, RequestOptions::new())
      .await
      .unwrap();
    assert_eq!(download.file_name.as_deref(), Some("jobs.csv"));
    assert_eq!(download.content_type.as_deref(), Some("text/csv"));
    assert_eq!(download.bytes, b"id,name\n1,A\n".to_vec());
  }

  #[tokio::test(start_paused = true)]
  async fn test_health_check_sends_limit_and_no_retry() {
    let wire = ScriptedTransport::new();
    wire.reply(Method::Get, "/jobs", status(500));
    let jobs = client(&wire, CacheConfig::default());

    assert!(jobs.health_check().await.is_err());
    assert_eq!(wire.calls(), 1);
    assert_eq!(
      wire.last_request().unwrap().query_pairs(),
      vec![("limit".to_string(), "1".to_string())]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_reads_both_fetch_without_dedup() {
    let wire = ScriptedTransport::new();
    wire.reply_after(
      Method::Get,
      "/jobs/42",
      Duration::from_millis(20),
      ok(json!({"id": 42, "name": "A"})),
    );
    let jobs = client(&wire, CacheConfig::default());

    let (a, b) = tokio::join!(
      jobs.find_by_id(&42, RequestOptions::new()),
      jobs.find_by_id(&42, RequestOptions::new())
    );
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(wire.calls(), 2);
    assert_eq!(jobs.cache_stats().size, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_read_overlapping_a_create_is_not_cached() {
    let wire = ScriptedTransport::new();
    wire.reply_after(
      Method::Get,
      "/jobs",
      Duration::from_millis(100),
      ok(json!([{"id": 1, "name": "proof"}])),
    );
    wire.reply(
      Method::Get,
      "/jobs",
      ok(json!([{"id": 1, "name": "proof"}, {"id": 2, "name": "plate"}])),
    );
    wire.reply(Method::Post, "/jobs", ok(json!({"id": 2, "name": "plate"})));
    let jobs = client(&wire, CacheConfig::default());

    let create = async {
      tokio::time::sleep(Duration::from_millis(10)).await;
      jobs
        .create(&NewJob { name: "plate".to_string() }, RequestOptions::new())
        .await
    };
    let params = no_params();
    let (listed, created) = tokio::join!(jobs.find_many(&params, RequestOptions::new()), create);
    assert_eq!(listed.unwrap().data.len(), 1);
    assert_eq!(created.unwrap().data.id, 2);
    assert_eq!(jobs.cache_stats().size, 0);

    let listed = jobs.find_many(&no_params(), RequestOptions::new()).await.unwrap();
    assert_eq!(listed.data.len(), 2);
    assert_eq!(wire.calls_to(Method::Get, "/jobs"), 2);
  }
}
