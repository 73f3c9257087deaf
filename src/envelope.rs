//! Response wrapper shared by every resource endpoint.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FieldErrors, ServiceError};

/// Pagination metadata attached to list responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
  #[serde(default)]
  pub total: Option<u64>,
  #[serde(default)]
  pub page: Option<u64>,
  #[serde(default)]
  pub limit: Option<u64>,
  #[serde(default)]
  pub has_more: Option<bool>,
}

impl PageMeta {
  /// Lift pagination fields that sit next to the items of a paginated body.
  pub fn from_siblings(body: &serde_json::Map<String, Value>) -> Option<Self> {
    let meta = Self {
      total: body.get("total").and_then(Value::as_u64),
      page: body.get("page").and_then(Value::as_u64),
      limit: body.get("limit").and_then(Value::as_u64),
      has_more: body
        .get("hasMore")
        .or_else(|| body.get("has_more"))
        .and_then(Value::as_bool),
    };
    if meta == Self::default() {
      None
    } else {
      Some(meta)
    }
  }
}

/// Normalized success wrapper. Never mutated after the transport adapter builds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
  pub success: bool,
  pub data: T,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub errors: Option<FieldErrors>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub meta: Option<PageMeta>,
}

impl<T> Envelope<T> {
  pub fn ok(data: T) -> Self {
    Self {
      success: true,
      data,
      message: None,
      errors: None,
      meta: None,
    }
  }

  pub fn with_meta(mut self, meta: PageMeta) -> Self {
    self.meta = Some(meta);
    self
  }

  /// Swap the payload while keeping message and metadata.
  pub fn map<R>(self, f: impl FnOnce(T) -> R) -> Envelope<R> {
    Envelope {
      success: self.success,
      data: f(self.data),
      message: self.message,
      errors: self.errors,
      meta: self.meta,
    }
  }

  pub fn try_map<R, E>(self, f: impl FnOnce(T) -> Result<R, E>) -> Result<Envelope<R>, E> {
    Ok(Envelope {
      success: self.success,
      data: f(self.data)?,
      message: self.message,
      errors: self.errors,
      meta: self.meta,
    })
  }
}

impl Envelope<Value> {
  /// Interpret a raw response body.
  ///
  /// Bodies shaped like an envelope (`success` + `data`) are taken as-is, any other
  /// JSON is wrapped as a successful payload and an empty body becomes `null`.
  pub fn from_body(body: &[u8]) -> Result<Self, ServiceError> {
    if body.iter().all(u8::is_ascii_whitespace) {
      return Ok(Self::ok(Value::Null));
    }

    let value: Value = serde_json::from_slice(body)
      .map_err(|e| ServiceError::decode(format!("Failed to parse response body: {}", e)))?;

    let is_envelope = value
      .as_object()
      .map(|o| o.get("success").is_some_and(Value::is_boolean) && o.contains_key("data"))
      .unwrap_or(false);

    if is_envelope {
      serde_json::from_value(value)
        .map_err(|e| ServiceError::decode(format!("Malformed response envelope: {}", e)))
    } else {
      Ok(Self::ok(value))
    }
  }

  /// Fail when the server reported `success: false` inside a 2xx response.
  pub fn into_result(self) -> Result<Self, ServiceError> {
    if self.success {
      return Ok(self);
    }
    let mut err = ServiceError::new(
      self
        .message
        .clone()
        .unwrap_or_else(|| "Request was not successful".to_string()),
    );
    if let Some(errors) = self.errors {
      err = err.with_errors(errors);
    }
    Err(err)
  }

  pub fn decode<T: DeserializeOwned>(self) -> Result<Envelope<T>, ServiceError> {
    self.try_map(|data| {
      serde_json::from_value(data)
        .map_err(|e| ServiceError::decode(format!("Failed to decode response data: {}", e)))
    })
  }
}
