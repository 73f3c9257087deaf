//! Outbound request plumbing.
//!
//! [`Transport`] is the raw wire (reqwest in production, scripted fakes in tests).
//! [`TransportAdapter`] wraps it with credential injection, 401 handling and
//! error normalization.

mod adapter;
mod http;

pub use adapter::{AuthHandler, LogAuthHandler, TransportAdapter};
pub use http::HttpTransport;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One file in a multipart upload.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePart {
  pub field: String,
  pub file_name: String,
  pub content_type: Option<String>,
  pub bytes: Vec<u8>,
}

/// Binary form body sent as `multipart/form-data`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadForm {
  pub fields: Vec<(String, String)>,
  pub files: Vec<FilePart>,
}

impl UploadForm {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.fields.push((name.into(), value.into()));
    self
  }

  pub fn file(
    mut self,
    field: impl Into<String>,
    file_name: impl Into<String>,
    content_type: Option<&str>,
    bytes: Vec<u8>,
  ) -> Self {
    self.files.push(FilePart {
      field: field.into(),
      file_name: file_name.into(),
      content_type: content_type.map(String::from),
      bytes,
    });
    self
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
  Empty,
  Json(Value),
  Multipart(UploadForm),
}

impl RequestBody {
  /// Content type implied by the body. Multipart boundaries are added by the wire.
  pub fn content_type(&self) -> &'static str {
    match self {
      RequestBody::Multipart(_) => "multipart/form-data",
      _ => "application/json",
    }
  }
}

/// Request descriptor handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
  pub method: Method,
  /// Path relative to the configured base URL, starting with `/`
  pub path: String,
  pub params: BTreeMap<String, Value>,
  pub body: RequestBody,
  pub headers: BTreeMap<String, String>,
  pub timeout: Option<Duration>,
}

impl ApiRequest {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      params: BTreeMap::new(),
      body: RequestBody::Empty,
      headers: BTreeMap::new(),
      timeout: None,
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::Get, path)
  }

  /// Merge the members of a serializable object into the query string.
  /// Null and empty-string members are skipped.
  pub fn query(mut self, params: &impl Serialize) -> Self {
    if let Ok(Value::Object(map)) = serde_json::to_value(params) {
      for (key, value) in map {
        if value.is_null() || value.as_str() == Some("") {
          continue;
        }
        self.params.insert(key, value);
      }
    }
    self
  }

  pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.params.insert(key.into(), value.into());
    self
  }

  pub fn json(mut self, body: Value) -> Self {
    self.body = RequestBody::Json(body);
    self
  }

  pub fn multipart(mut self, form: UploadForm) -> Self {
    self.body = RequestBody::Multipart(form);
    self
  }

  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  /// Query parameters flattened to string pairs. Arrays repeat their key.
  pub fn query_pairs(&self) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (key, value) in &self.params {
      match value {
        Value::Array(items) => {
          for item in items {
            pairs.push((key.clone(), scalar_to_string(item)));
          }
        }
        other => pairs.push((key.clone(), scalar_to_string(other))),
      }
    }
    pairs
  }
}

fn scalar_to_string(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

/// Raw response as received from the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl RawResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn json(status: u16, body: &Value) -> Self {
    Self::new(status, body.to_string())
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Failure with no response at all.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportFailure {
  #[error("Network error: {0}")]
  Network(String),
  #[error("Request timed out after {0:?}")]
  Timeout(Duration),
  #[error("Invalid request: {0}")]
  InvalidRequest(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: ApiRequest) -> Result<RawResponse, TransportFailure>;
}
