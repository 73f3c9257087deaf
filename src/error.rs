//! Normalized error types surfaced by the resource-access core.
//!
//! Everything that leaves a `ResourceClient`, `CrudResource` or `Query` is a
//! [`ServiceError`]. Raw transport failures never escape.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Field name -> list of messages, as returned by 400-class validation failures.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

pub mod codes {
  pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
  pub const TIMEOUT: &str = "TIMEOUT";
  pub const CANCELLED: &str = "CANCELLED";
  pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";
  pub const FORBIDDEN: &str = "FORBIDDEN";
  pub const NOT_FOUND: &str = "NOT_FOUND";
  pub const SERVER_ERROR: &str = "SERVER_ERROR";
  pub const HTTP_ERROR: &str = "HTTP_ERROR";
  pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
  pub const DECODE_ERROR: &str = "DECODE_ERROR";
  pub const SERVICE_NOT_FOUND: &str = "SERVICE_NOT_FOUND";
}

/// The only error type propagated out of the resource client.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ServiceError {
  pub message: String,
  pub code: Option<String>,
  /// HTTP status, absent when no response was received
  pub status: Option<u16>,
  pub errors: Option<FieldErrors>,
  pub occurred_at: DateTime<Utc>,
}

impl ServiceError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      code: None,
      status: None,
      errors: None,
      occurred_at: Utc::now(),
    }
  }

  pub fn with_code(mut self, code: impl Into<String>) -> Self {
    self.code = Some(code.into());
    self
  }

  pub fn with_status(mut self, status: u16) -> Self {
    self.status = Some(status);
    self
  }

  pub fn with_errors(mut self, errors: FieldErrors) -> Self {
    self.errors = Some(errors);
    self
  }

  /// No response was received (DNS, connection reset, ...).
  pub fn network(message: impl Into<String>) -> Self {
    Self::new(message).with_code(codes::NETWORK_ERROR)
  }

  pub fn timeout(after: std::time::Duration) -> Self {
    Self::new(format!("Request timed out after {}ms", after.as_millis())).with_code(codes::TIMEOUT)
  }

  pub fn cancelled() -> Self {
    Self::new("Request was cancelled").with_code(codes::CANCELLED)
  }

  pub fn unauthenticated() -> Self {
    Self::new("Authentication required")
      .with_code(codes::UNAUTHENTICATED)
      .with_status(401)
  }

  pub fn decode(message: impl Into<String>) -> Self {
    Self::new(message).with_code(codes::DECODE_ERROR)
  }

  /// Build an error from an HTTP status and the server-supplied message, if any.
  pub fn from_status(status: u16, message: Option<String>) -> Self {
    let code = match status {
      403 => codes::FORBIDDEN,
      404 => codes::NOT_FOUND,
      400 | 422 => codes::VALIDATION_ERROR,
      500..=599 => codes::SERVER_ERROR,
      _ => codes::HTTP_ERROR,
    };
    let message = message
      .filter(|m| !m.trim().is_empty())
      .unwrap_or_else(|| format!("Request failed with status {}", status));
    Self::new(message).with_code(code).with_status(status)
  }

  pub fn service_not_found(name: &str) -> Self {
    Self::new(format!("Service '{}' not found", name)).with_code(codes::SERVICE_NOT_FOUND)
  }

  pub fn has_code(&self, code: &str) -> bool {
    self.code.as_deref() == Some(code)
  }

  /// 4xx responses, including 401.
  pub fn is_client_error(&self) -> bool {
    matches!(self.status, Some(400..=499))
  }

  pub fn is_unauthorized(&self) -> bool {
    self.status == Some(401)
  }

  pub fn is_cancelled(&self) -> bool {
    self.has_code(codes::CANCELLED)
  }

  /// Network failures, timeouts and 5xx are retryable. Client errors,
  /// cancellations and local validation failures are not.
  pub fn is_retryable(&self) -> bool {
    if self.is_cancelled() || self.has_code(codes::VALIDATION_ERROR) || self.has_code(codes::DECODE_ERROR) {
      return false;
    }
    !self.is_client_error()
  }

  /// Messages for a single field, if the server returned any.
  pub fn field_errors(&self, field: &str) -> &[String] {
    self
      .errors
      .as_ref()
      .and_then(|e| e.get(field))
      .map(Vec::as_slice)
      .unwrap_or(&[])
  }
}

/// Returned by the opaque schema-validation capability.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
  pub message: String,
  pub errors: FieldErrors,
}

impl ValidationError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      errors: FieldErrors::new(),
    }
  }

  pub fn field(mut self, field: impl Into<String>, message: impl Into<String>) -> Self {
    self.errors.entry(field.into()).or_default().push(message.into());
    self
  }
}

impl From<ValidationError> for ServiceError {
  fn from(err: ValidationError) -> Self {
    let base = ServiceError::new(err.message).with_code(codes::VALIDATION_ERROR);
    if err.errors.is_empty() {
      base
    } else {
      base.with_errors(err.errors)
    }
  }
}
