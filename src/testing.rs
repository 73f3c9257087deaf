//! Scripted transport for unit tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::transport::{ApiRequest, Method, RawResponse, Transport, TransportFailure};

#[derive(Clone)]
struct Scripted {
  delay: Duration,
  outcome: Result<RawResponse, TransportFailure>,
}

/// Replays queued outcomes per `(method, path)`. The last queued outcome repeats.
#[derive(Default)]
pub struct ScriptedTransport {
  routes: Mutex<HashMap<(Method, String), VecDeque<Scripted>>>,
  calls: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  fn push(&self, method: Method, path: &str, scripted: Scripted) {
    self
      .routes
      .lock()
      .unwrap()
      .entry((method, path.to_string()))
      .or_default()
      .push_back(scripted);
  }

  pub fn reply(&self, method: Method, path: &str, response: RawResponse) {
    self.reply_after(method, path, Duration::ZERO, response);
  }

  pub fn reply_after(&self, method: Method, path: &str, delay: Duration, response: RawResponse) {
    self.push(
      method,
      path,
      Scripted {
        delay,
        outcome: Ok(response),
      },
    );
  }

  pub fn fail(&self, method: Method, path: &str, failure: TransportFailure) {
    self.push(
      method,
      path,
      Scripted {
        delay: Duration::ZERO,
        outcome: Err(failure),
      },
    );
  }

  pub fn calls(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn calls_to(&self, method: Method, path: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.method == method && r.path == path)
      .count()
  }

  pub fn last_request(&self) -> Option<ApiRequest> {
    self.calls.lock().unwrap().last().cloned()
  }
}

#[async_trait]
impl Transport for ScriptedTransport {
  async fn send(&self, request: ApiRequest) -> Result<RawResponse, TransportFailure> {
    let key = (request.method, request.path.clone());
    self.calls.lock().unwrap().push(request);

    let scripted = {
      let mut routes = self.routes.lock().unwrap();
      match routes.get_mut(&key) {
        Some(queue) if queue.len() > 1 => queue.pop_front(),
        Some(queue) => queue.front().cloned(),
        None => None,
      }
    };

    match scripted {
      Some(scripted) => {
        if !scripted.delay.is_zero() {
          tokio::time::sleep(scripted.delay).await;
        }
        scripted.outcome
      }
      None => Ok(RawResponse::json(404, &json!({"message": "no route"}))),
    }
  }
}

/// 200 response wrapping `data` in a success envelope.
pub fn ok(data: Value) -> RawResponse {
  RawResponse::json(200, &json!({"success": true, "data": data}))
}

pub fn status(code: u16) -> RawResponse {
  RawResponse::json(code, &json!({"message": format!("status {}", code)}))
}
