//! reqwest-backed wire.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::multipart::{Form, Part};
use std::time::Duration;
use url::Url;

use super::{ApiRequest, Method, RawResponse, RequestBody, Transport, TransportFailure, UploadForm};

/// HTTP transport rooted at a base URL.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: String,
  timeout: Duration,
}

impl HttpTransport {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
    let parsed =
      Url::parse(base_url).map_err(|e| eyre!("Invalid API base URL '{}': {}", base_url, e))?;
    if !matches!(parsed.scheme(), "http" | "https") {
      return Err(eyre!("API base URL must be http(s): {}", base_url));
    }

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url: parsed.as_str().trim_end_matches('/').to_string(),
      timeout,
    })
  }

  pub fn base_url(&self) -> &str {
    &self.base_url
  }

  fn url_for(&self, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
      path.to_string()
    } else if path.starts_with('/') {
      format!("{}{}", self.base_url, path)
    } else {
      format!("{}/{}", self.base_url, path)
    }
  }
}

fn build_form(form: UploadForm) -> std::result::Result<Form, TransportFailure> {
  let mut multipart = Form::new();
  for (name, value) in form.fields {
    multipart = multipart.text(name, value);
  }
  for file in form.files {
    let mut part = Part::bytes(file.bytes).file_name(file.file_name);
    if let Some(content_type) = file.content_type {
      part = part
        .mime_str(&content_type)
        .map_err(|e| TransportFailure::InvalidRequest(e.to_string()))?;
    }
    multipart = multipart.part(file.field, part);
  }
  Ok(multipart)
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: ApiRequest) -> Result<RawResponse, TransportFailure> {
    let url = self.url_for(&request.path);
    let method = match request.method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    };
    let timeout = request.timeout.unwrap_or(self.timeout);

    let mut builder = self
      .client
      .request(method, &url)
      .timeout(timeout)
      .query(&request.query_pairs());

    let is_multipart = matches!(request.body, RequestBody::Multipart(_));
    for (name, value) in &request.headers {
      // reqwest sets the multipart content type together with its boundary
      if is_multipart && name.eq_ignore_ascii_case("content-type") {
        continue;
      }
      builder = builder.header(name.as_str(), value.as_str());
    }

    builder = match request.body {
      RequestBody::Empty => builder,
      RequestBody::Json(body) => builder.json(&body),
      RequestBody::Multipart(form) => builder.multipart(build_form(form)?),
    };

    let response = builder.send().await.map_err(|e| {
      if e.is_timeout() {
        TransportFailure::Timeout(timeout)
      } else {
        TransportFailure::Network(e.to_string())
      }
    })?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
      .collect();
    let body = response.bytes().await.map_err(|e| {
      if e.is_timeout() {
        TransportFailure::Timeout(timeout)
      } else {
        TransportFailure::Network(format!("Failed to read response body: {}", e))
      }
    })?;

    Ok(RawResponse {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}
