//! CRUD resource built on a [`ResourceClient`] and a shared [`QueryClient`].
//!
//! Reads go through the query cache under `(root_key, "list", params)` and
//! `(root_key, "detail", id)`. Successful mutations mark the whole root stale,
//! then seed or drop the detail entry they touched, so the next read observes
//! the mutation either from the seeded entry or through a refetch.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::cache::{Identifiable, QueryClient, QueryKey};
use crate::client::{Download, RequestOptions, ResourceClient};
use crate::envelope::Envelope;
use crate::error::{ServiceError, ValidationError};
use crate::notify::{Notification, Notifier, TracingNotifier};
use crate::transport::UploadForm;
use serde_json::Value;

const LIST: &str = "list";
const DETAIL: &str = "detail";

/// Checks a payload before it is sent.
pub trait Validator<T>: Send + Sync {
  fn validate(&self, value: &T) -> Result<(), ValidationError>;
}

impl<T, F> Validator<T> for F
where
  F: Fn(&T) -> Result<(), ValidationError> + Send + Sync,
{
  fn validate(&self, value: &T) -> Result<(), ValidationError> {
    self(value)
  }
}

pub type IdExtractor<E> = Arc<dyn Fn(&E) -> <E as Identifiable>::Id + Send + Sync>;

/// Cache miss: options for the fetch and the root generation it started in.
struct Refetch {
  options: RequestOptions,
  generation: u64,
}

/// Success messages handed to the notifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrudMessages {
  pub created: String,
  pub updated: String,
  pub deleted: String,
  pub uploaded: String,
  pub downloaded: String,
}

impl CrudMessages {
  pub fn for_entity(entity: &str) -> Self {
    Self {
      created: format!("{} created successfully", entity),
      updated: format!("{} updated successfully", entity),
      deleted: format!("{} deleted successfully", entity),
      uploaded: "File uploaded successfully".to_string(),
      downloaded: "File downloaded successfully".to_string(),
    }
  }
}

impl Default for CrudMessages {
  fn default() -> Self {
    Self::for_entity("Item")
  }
}

pub struct CrudResource<E: Identifiable, C = E, U = C> {
  root_key: String,
  client: Arc<ResourceClient<E, C, U>>,
  queries: QueryClient,
  notifier: Arc<dyn Notifier>,
  messages: CrudMessages,
  id_extractor: Option<IdExtractor<E>>,
  create_validator: Option<Arc<dyn Validator<C>>>,
  update_validator: Option<Arc<dyn Validator<U>>>,
}

impl<E, C, U> CrudResource<E, C, U>
where
  E: Identifiable,
  C: Serialize + Send + Sync,
  U: Serialize + Send + Sync,
{
  /// Root key defaults to the client's resource name.
  pub fn new(client: Arc<ResourceClient<E, C, U>>, queries: QueryClient) -> Self {
    Self {
      root_key: client.name().to_string(),
      client,
      queries,
      notifier: Arc::new(TracingNotifier),
      messages: CrudMessages::default(),
      id_extractor: None,
      create_validator: None,
      update_validator: None,
    }
  }

  /// Resource with a private query cache whose entries stay fresh for the client's cache ttl.
  pub fn standalone(client: Arc<ResourceClient<E, C, U>>) -> Self {
    let queries = QueryClient::new(client.config().cache.ttl);
    Self::new(client, queries)
  }

  pub fn with_root_key(mut self, root_key: impl Into<String>) -> Self {
    self.root_key = root_key.into();
    self
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn with_messages(mut self, messages: CrudMessages) -> Self {
    self.messages = messages;
    self
  }

  pub fn with_id_extractor(
    mut self,
    extractor: impl Fn(&E) -> E::Id + Send + Sync + 'static,
  ) -> Self {
    self.id_extractor = Some(Arc::new(extractor));
    self
  }

  pub fn with_create_validator(mut self, validator: impl Validator<C> + 'static) -> Self {
    self.create_validator = Some(Arc::new(validator));
    self
  }

  pub fn with_update_validator(mut self, validator: impl Validator<U> + 'static) -> Self {
    self.update_validator = Some(Arc::new(validator));
    self
  }

  pub fn root_key(&self) -> &str {
    &self.root_key
  }

  pub fn client(&self) -> &Arc<ResourceClient<E, C, U>> {
    &self.client
  }

  pub fn queries(&self) -> &QueryClient {
    &self.queries
  }

  pub fn list_key<P: Serialize + ?Sized>(&self, params: &P) -> QueryKey {
    QueryKey::new(self.root_key.clone(), LIST, &params)
  }

  pub fn detail_key(&self, id: &E::Id) -> QueryKey {
    QueryKey::new(self.root_key.clone(), DETAIL, id)
  }

  fn extract_id(&self, entity: &E) -> E::Id {
    match &self.id_extractor {
      Some(extract) => extract(entity),
      None => entity.id(),
    }
  }

  /// Fresh cached value, or how to refetch it.
  ///
  /// An entry that exists but is stale must bypass the client's own cache too.
  fn lookup<T: Clone + 'static>(&self, key: &QueryKey) -> Result<T, Refetch> {
    let cache = self.queries.lock();
    if let Some(value) = cache.get::<T>(key) {
      debug!(%key, "Query cache hit");
      return Ok(value);
    }
    let options = match cache.is_stale(key) {
      Some(true) => RequestOptions::new().force_fresh(),
      _ => RequestOptions::new(),
    };
    Err(Refetch {
      options,
      generation: cache.generation(&self.root_key),
    })
  }

  fn seed_read<T: Send + Sync + 'static>(&self, key: QueryKey, value: T, generation: u64) {
    if !self.queries.seed_if_current(key, value, generation) {
      debug!(root = %self.root_key, "Read overlapped a mutation, not seeding");
    }
  }

  pub async fn list<P>(&self, params: &P) -> Result<Envelope<Vec<E>>, ServiceError>
  where
    P: Serialize + ?Sized,
  {
    let key = self.list_key(params);
    let refetch = match self.lookup::<Envelope<Vec<E>>>(&key) {
      Ok(hit) => return Ok(hit),
      Err(refetch) => refetch,
    };

    let envelope = self.client.find_many(params, refetch.options).await?;
    self.seed_read(key, envelope.clone(), refetch.generation);
    Ok(envelope)
  }

  /// Flat item array, pagination metadata dropped.
  pub async fn list_items<P>(&self, params: &P) -> Result<Vec<E>, ServiceError>
  where
    P: Serialize + ?Sized,
  {
    self.list(params).await.map(|envelope| envelope.data)
  }

  /// `Ok(None)` without any fetch when `enabled` is false.
  pub async fn detail(
    &self,
    id: &E::Id,
    enabled: bool,
  ) -> Result<Option<Envelope<E>>, ServiceError> {
    if !enabled {
      return Ok(None);
    }

    let key = self.detail_key(id);
    let refetch = match self.lookup::<Envelope<E>>(&key) {
      Ok(hit) => return Ok(Some(hit)),
      Err(refetch) => refetch,
    };

    let envelope = self.client.find_by_id(id, refetch.options).await?;
    self.seed_read(key, envelope.clone(), refetch.generation);
    Ok(Some(envelope))
  }

  pub async fn create(&self, data: &C) -> Result<Envelope<E>, ServiceError> {
    if let Some(validator) = &self.create_validator {
      self.reported(validator.validate(data).map_err(ServiceError::from))?;
    }

    let envelope = self.reported(self.client.create(data, RequestOptions::new()).await)?;
    let id = self.extract_id(&envelope.data);
    self.queries.invalidate(&self.root_key);
    self.queries.seed(self.detail_key(&id), envelope.clone());
    self.notifier.notify(Notification::success(&self.messages.created));
    Ok(envelope)
  }

  pub async fn update(&self, id: &E::Id, data: &U) -> Result<Envelope<E>, ServiceError> {
    if let Some(validator) = &self.update_validator {
      self.reported(validator.validate(data).map_err(ServiceError::from))?;
    }

    let envelope = self.reported(self.client.update(id, data, RequestOptions::new()).await)?;
    self.queries.invalidate(&self.root_key);
    self.queries.seed(self.detail_key(id), envelope.clone());
    self.notifier.notify(Notification::success(&self.messages.updated));
    Ok(envelope)
  }

  pub async fn delete(&self, id: &E::Id) -> Result<Envelope<()>, ServiceError> {
    let envelope = self.reported(self.client.delete(id, RequestOptions::new()).await)?;
    self.queries.invalidate(&self.root_key);
    self.queries.remove(&self.detail_key(id));
    self.notifier.notify(Notification::success(&self.messages.deleted));
    Ok(envelope)
  }

  pub async fn upload(
    &self,
    form: UploadForm,
    sub_path: Option<&str>,
  ) -> Result<Envelope<Value>, ServiceError> {
    let envelope = self.reported(
      self
        .client
        .upload(form, sub_path, RequestOptions::new())
        .await,
    )?;
    self.queries.invalidate(&self.root_key);
    self.notifier.notify(Notification::success(&self.messages.uploaded));
    Ok(envelope)
  }

  pub async fn download(
    &self,
    sub_path: Option<&str>,
    file_name: Option<&str>,
  ) -> Result<Download, ServiceError> {
    let download = self.reported(
      self
        .client
        .download(sub_path, file_name, RequestOptions::new())
        .await,
    )?;
    self.notifier.notify(Notification::success(&self.messages.downloaded));
    Ok(download)
  }

  /// Mark everything under the root key stale.
  pub fn invalidate(&self) -> usize {
    self.queries.invalidate(&self.root_key)
  }

  /// Emit an error notification for a failed mutation and pass the result on.
  fn reported<T>(&self, result: Result<T, ServiceError>) -> Result<T, ServiceError> {
    if let Err(err) = &result {
      self.notifier.notify(Notification::error(&err.message));
    }
    result
  }
}

impl<E: Identifiable, C, U> fmt::Debug for CrudResource<E, C, U> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CrudResource")
      .field("root_key", &self.root_key)
      .field("queries", &self.queries)
      .finish_non_exhaustive()
  }
}
