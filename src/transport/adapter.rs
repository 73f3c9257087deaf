//! Credential injection, 401 handling and error normalization around a [`Transport`].

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{ApiRequest, RawResponse, Transport, TransportFailure};
use crate::envelope::Envelope;
use crate::error::{codes, FieldErrors, ServiceError};
use crate::store::CredentialStore;

/// Reacts to the credential being rejected.
///
/// In the dashboard this navigates to the login surface; the core only signals.
pub trait AuthHandler: Send + Sync {
  fn on_unauthenticated(&self);
}

/// Handler that only records the event in the log.
pub struct LogAuthHandler;

impl AuthHandler for LogAuthHandler {
  fn on_unauthenticated(&self) {
    warn!("Credential rejected; re-authentication required");
  }
}

#[derive(Clone)]
pub struct TransportAdapter {
  transport: Arc<dyn Transport>,
  credentials: CredentialStore,
  auth: Arc<dyn AuthHandler>,
}

impl TransportAdapter {
  pub fn new(transport: Arc<dyn Transport>, credentials: CredentialStore) -> Self {
    Self {
      transport,
      credentials,
      auth: Arc::new(LogAuthHandler),
    }
  }

  pub fn with_auth_handler(mut self, auth: Arc<dyn AuthHandler>) -> Self {
    self.auth = auth;
    self
  }

  pub fn credentials(&self) -> &CredentialStore {
    &self.credentials
  }

  /// Send and decode the body as an [`Envelope`].
  pub async fn dispatch(&self, request: ApiRequest) -> Result<Envelope<Value>, ServiceError> {
    let response = self.send(request).await?;
    Envelope::from_body(&response.body)?.into_result()
  }

  /// Send and hand back the raw body, for binary downloads.
  pub async fn dispatch_raw(&self, request: ApiRequest) -> Result<RawResponse, ServiceError> {
    self.send(request).await
  }

  async fn send(&self, mut request: ApiRequest) -> Result<RawResponse, ServiceError> {
    request
      .headers
      .entry("Content-Type".to_string())
      .or_insert_with(|| request.body.content_type().to_string());
    if let Some(token) = self.credentials.token() {
      request
        .headers
        .insert("Authorization".to_string(), format!("Bearer {}", token));
    }

    let method = request.method;
    let path = request.path.clone();
    debug!(%method, %path, "Dispatching request");

    let response = self
      .transport
      .send(request)
      .await
      .map_err(normalize_failure)?;

    if response.status == 401 {
      self.handle_unauthorized();
      let mut err = ServiceError::unauthenticated();
      if let Some(message) = body_message(&response.body) {
        err.message = message;
      }
      return Err(err);
    }

    if !response.is_success() {
      let err = error_from_response(&response);
      debug!(%method, %path, status = response.status, error = %err, "Request failed");
      return Err(err);
    }

    Ok(response)
  }

  fn handle_unauthorized(&self) {
    if let Err(e) = self.credentials.clear() {
      warn!(error = %e, "Failed to clear stored credentials after 401");
    }
    self.auth.on_unauthenticated();
  }
}

fn normalize_failure(failure: TransportFailure) -> ServiceError {
  match failure {
    TransportFailure::Network(message) => ServiceError::network(message),
    TransportFailure::Timeout(after) => ServiceError::timeout(after),
    TransportFailure::InvalidRequest(message) => {
      ServiceError::new(message).with_code(codes::HTTP_ERROR)
    }
  }
}

fn body_message(body: &[u8]) -> Option<String> {
  let value: Value = serde_json::from_slice(body).ok()?;
  value
    .get("message")
    .or_else(|| value.get("error"))
    .and_then(Value::as_str)
    .map(String::from)
}

/// Server message if present, otherwise a generic one; status always set.
fn error_from_response(response: &RawResponse) -> ServiceError {
  let parsed: Option<Value> = serde_json::from_slice(&response.body).ok();
  let mut err = ServiceError::from_status(response.status, body_message(&response.body));

  if let Some(body) = parsed {
    if let Some(code) = body.get("code").and_then(Value::as_str) {
      err.code = Some(code.to_string());
    }
    if let Some(errors) = body
      .get("errors")
      .cloned()
      .and_then(|e| serde_json::from_value::<FieldErrors>(e).ok())
    {
      err = err.with_errors(errors);
    }
  }
  err
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use serde_json::json;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Mutex;

  /// Replays one response and records the request it saw.
  struct OneShot {
    response: Result<RawResponse, TransportFailure>,
    seen: Mutex<Option<ApiRequest>>,
  }

  impl OneShot {
    fn new(response: Result<RawResponse, TransportFailure>) -> Arc<Self> {
      Arc::new(Self {
        response,
        seen: Mutex::new(None),
      })
    }

    fn seen(&self) -> ApiRequest {
      self.seen.lock().unwrap().clone().expect("no request sent")
    }
  }

  #[async_trait]
  impl Transport for OneShot {
    async fn send(&self, request: ApiRequest) -> Result<RawResponse, TransportFailure> {
      *self.seen.lock().unwrap() = Some(request);
      self.response.clone()
    }
  }

  #[derive(Default)]
  struct Flag(AtomicBool);

  impl AuthHandler for Flag {
    fn on_unauthenticated(&self) {
      self.0.store(true, Ordering::SeqCst);
    }
  }

  #[tokio::test]
  async fn test_attaches_bearer_token_when_present() {
    let wire = OneShot::new(Ok(RawResponse::json(200, &json!([]))));
    let creds = CredentialStore::in_memory();
    creds.set_token("t0k").unwrap();
    let adapter = TransportAdapter::new(wire.clone(), creds);

    adapter.dispatch(ApiRequest::get("/orders")).await.unwrap();

    let seen = wire.seen();
    assert_eq!(seen.headers.get("Authorization").map(String::as_str), Some("Bearer t0k"));
    assert_eq!(
      seen.headers.get("Content-Type").map(String::as_str),
      Some("application/json")
    );
  }

  #[tokio::test]
  async fn test_missing_token_is_not_an_error() {
    let wire = OneShot::new(Ok(RawResponse::json(200, &json!({"id": 1}))));
    let adapter = TransportAdapter::new(wire.clone(), CredentialStore::in_memory());

    let envelope = adapter.dispatch(ApiRequest::get("/orders/1")).await.unwrap();
    assert_eq!(envelope.data, json!({"id": 1}));
    assert!(!wire.seen().headers.contains_key("Authorization"));
  }

  #[tokio::test]
  async fn test_401_clears_credentials_and_signals() {
    let wire = OneShot::new(Ok(RawResponse::json(401, &json!({"message": "Token expired"}))));
    let creds = CredentialStore::in_memory();
    creds.login("stale", Some(&json!({"name": "op"}))).unwrap();
    let flag = Arc::new(Flag::default());
    let adapter = TransportAdapter::new(wire, creds.clone()).with_auth_handler(flag.clone());

    let err = adapter.dispatch(ApiRequest::get("/orders")).await.unwrap_err();

    assert!(err.is_unauthorized());
    assert_eq!(err.message, "Token expired");
    assert!(flag.0.load(Ordering::SeqCst));
    assert_eq!(creds.token(), None);
    assert_eq!(creds.user::<Value>().unwrap(), None);
  }

  #[tokio::test]
  async fn test_server_error_uses_server_message() {
    let wire = OneShot::new(Ok(RawResponse::json(503, &json!({"message": "Press queue offline"}))));
    let adapter = TransportAdapter::new(wire, CredentialStore::in_memory());

    let err = adapter.dispatch(ApiRequest::get("/orders")).await.unwrap_err();
    assert_eq!(err.status, Some(503));
    assert_eq!(err.message, "Press queue offline");
    assert!(err.is_retryable());
  }

  #[tokio::test]
  async fn test_forbidden_without_body_gets_generic_message() {
    let wire = OneShot::new(Ok(RawResponse::new(403, "")));
    let adapter = TransportAdapter::new(wire, CredentialStore::in_memory());

    let err = adapter.dispatch(ApiRequest::get("/users")).await.unwrap_err();
    assert_eq!(err.status, Some(403));
    assert_eq!(err.message, "Request failed with status 403");
    assert!(err.has_code(codes::FORBIDDEN));
  }

  #[tokio::test]
  async fn test_validation_failure_carries_field_errors() {
    let wire = OneShot::new(Ok(RawResponse::json(
      400,
      &json!({"message": "Invalid", "errors": {"quantity": ["must be positive"]}}),
    )));
    let adapter = TransportAdapter::new(wire, CredentialStore::in_memory());

    let err = adapter.dispatch(ApiRequest::get("/orders")).await.unwrap_err();
    assert_eq!(err.field_errors("quantity"), ["must be positive".to_string()]);
    assert!(!err.is_retryable());
  }

  #[tokio::test]
  async fn test_network_failure_has_no_status() {
    let wire = OneShot::new(Err(TransportFailure::Network("dns failure".to_string())));
    let adapter = TransportAdapter::new(wire, CredentialStore::in_memory());

    let err = adapter.dispatch(ApiRequest::get("/orders")).await.unwrap_err();
    assert_eq!(err.status, None);
    assert!(err.has_code(codes::NETWORK_ERROR));
  }
}
