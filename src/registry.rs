//! Process-wide directory of resource clients.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cache::Identifiable;
use crate::client::{MetricsSnapshot, ResourceClient};
use crate::error::{codes, ServiceError};

/// Upper bound for a single health probe.
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// What the registry needs from a registered client.
#[async_trait]
pub trait ManagedService: Send + Sync + 'static {
  fn name(&self) -> &str;
  fn clear_cache(&self);
  fn metrics(&self) -> MetricsSnapshot;
  async fn health_check(&self) -> Result<(), ServiceError>;
}

#[async_trait]
impl<E, C, U> ManagedService for ResourceClient<E, C, U>
where
  E: Identifiable,
  C: Serialize + Send + Sync + 'static,
  U: Serialize + Send + Sync + 'static,
{
  fn name(&self) -> &str {
    ResourceClient::name(self)
  }

  fn clear_cache(&self) {
    ResourceClient::clear_cache(self)
  }

  fn metrics(&self) -> MetricsSnapshot {
    ResourceClient::metrics(self)
  }

  async fn health_check(&self) -> Result<(), ServiceError> {
    ResourceClient::health_check(self).await
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
  Healthy,
  Degraded,
  Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
  pub name: String,
  pub healthy: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
  pub status: HealthStatus,
  pub services: Vec<ServiceHealth>,
  pub checked_at: DateTime<Utc>,
}

impl HealthReport {
  fn from_checks(services: Vec<ServiceHealth>) -> Self {
    let healthy = services.iter().filter(|s| s.healthy).count();
    let status = if healthy == services.len() {
      HealthStatus::Healthy
    } else if healthy == 0 {
      HealthStatus::Unhealthy
    } else {
      HealthStatus::Degraded
    };
    Self {
      status,
      services,
      checked_at: Utc::now(),
    }
  }
}

struct Registered {
  service: Arc<dyn ManagedService>,
  typed: Arc<dyn Any + Send + Sync>,
}

static GLOBAL: Lazy<ServiceRegistry> = Lazy::new(ServiceRegistry::new);

#[derive(Default)]
pub struct ServiceRegistry {
  services: RwLock<BTreeMap<String, Registered>>,
}

impl ServiceRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// The single registry of the process.
  pub fn global() -> &'static ServiceRegistry {
    &GLOBAL
  }

  /// Register `service` under `name`, replacing any previous registration.
  pub fn register<S: ManagedService>(&self, name: impl Into<String>, service: Arc<S>) {
    let name = name.into();
    let entry = Registered {
      service: service.clone(),
      typed: service,
    };
    let replaced = self
      .services
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(name.clone(), entry)
      .is_some();
    info!(service = %name, replaced, "Registered service");
  }

  /// Typed lookup.
  pub fn get<S: ManagedService>(&self, name: &str) -> Result<Arc<S>, ServiceError> {
    let typed = self
      .services
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(name)
      .map(|entry| entry.typed.clone())
      .ok_or_else(|| ServiceError::service_not_found(name))?;
    typed.downcast::<S>().map_err(|_| {
      ServiceError::new(format!("Service '{}' is registered with a different type", name))
        .with_code(codes::SERVICE_NOT_FOUND)
    })
  }

  pub fn service(&self, name: &str) -> Result<Arc<dyn ManagedService>, ServiceError> {
    self
      .services
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(name)
      .map(|entry| entry.service.clone())
      .ok_or_else(|| ServiceError::service_not_found(name))
  }

  pub fn names(&self) -> Vec<String> {
    self
      .services
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .keys()
      .cloned()
      .collect()
  }

  fn snapshot(&self) -> Vec<(String, Arc<dyn ManagedService>)> {
    self
      .services
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
      .map(|(name, entry)| (name.clone(), entry.service.clone()))
      .collect()
  }

  pub fn clear_all_caches(&self) {
    for (_, service) in self.snapshot() {
      service.clear_cache();
    }
  }

  pub fn all_metrics(&self) -> BTreeMap<String, MetricsSnapshot> {
    self
      .snapshot()
      .into_iter()
      .map(|(name, service)| (name, service.metrics()))
      .collect()
  }

  /// Probe every service concurrently, each bounded by [`HEALTH_PROBE_TIMEOUT`].
  pub async fn health_status(&self) -> HealthReport {
    let probes = self.snapshot().into_iter().map(|(name, service)| async move {
      let started = Instant::now();
      let outcome = tokio::time::timeout(HEALTH_PROBE_TIMEOUT, service.health_check()).await;
      let error = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err.message),
        Err(_) => Some(format!(
          "Health check timed out after {}s",
          HEALTH_PROBE_TIMEOUT.as_secs()
        )),
      };
      if let Some(error) = &error {
        warn!(service = %name, %error, "Health check failed");
      }
      ServiceHealth {
        name,
        healthy: error.is_none(),
        error,
        latency_ms: started.elapsed().as_millis() as u64,
      }
    });

    HealthReport::from_checks(join_all(probes).await)
  }
}

impl std::fmt::Debug for ServiceRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ServiceRegistry")
      .field("services", &self.names())
      .finish()
  }
}
