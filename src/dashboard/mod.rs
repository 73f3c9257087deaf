//! The print-production resources and their wiring.

mod types;

pub use types::{
  Design, DesignInput, DesignStatus, Material, MaterialInput, NewOrder, Order, OrderStatus,
  OrderUpdate, Role, User, UserInput,
};

use color_eyre::Result;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::cache::QueryClient;
use crate::client::{
  CacheConfig, ClientSettings, ItemsExtractor, RequestOptions, ResourceClient, ResourceConfig,
};
use crate::config::Config;
use crate::crud::{CrudMessages, CrudResource};
use crate::error::ServiceError;
use crate::registry::ServiceRegistry;
use crate::store::{CredentialStore, SqliteStore};
use crate::transport::{HttpTransport, TransportAdapter};

pub const ORDERS: &str = "orders";
pub const DESIGNS: &str = "designs";
pub const MATERIALS: &str = "materials";
pub const USERS: &str = "users";

pub type OrderClient = ResourceClient<Order, NewOrder, OrderUpdate>;
pub type DesignClient = ResourceClient<Design, DesignInput>;
pub type MaterialClient = ResourceClient<Material, MaterialInput>;
pub type UserClient = ResourceClient<User, UserInput>;

/// One client per resource, sharing a single transport adapter.
pub struct Dashboard {
  pub orders: Arc<OrderClient>,
  pub designs: Arc<DesignClient>,
  pub materials: Arc<MaterialClient>,
  pub users: Arc<UserClient>,
  adapter: TransportAdapter,
}

impl Dashboard {
  /// Build the HTTP stack from `config` and register the clients globally.
  pub fn connect(config: &Config) -> Result<Self> {
    let transport = Arc::new(HttpTransport::new(
      &config.api.base_url,
      config.request_timeout(),
    )?);
    let store_path = match &config.storage.path {
      Some(path) => path.clone(),
      None => SqliteStore::default_path()?,
    };
    let credentials = CredentialStore::new(Arc::new(SqliteStore::open(&store_path)?));
    let adapter = TransportAdapter::new(transport, credentials);

    info!(base_url = %config.api.base_url, "Connecting dashboard");
    Ok(Self::assemble(
      adapter,
      config.cache,
      config.client_settings(),
      ServiceRegistry::global(),
    ))
  }

  /// Wire the four clients over `adapter` and register them in `registry`.
  pub fn assemble(
    adapter: TransportAdapter,
    cache: CacheConfig,
    settings: ClientSettings,
    registry: &ServiceRegistry,
  ) -> Self {
    fn client<E, C, U>(
      config: ResourceConfig,
      adapter: &TransportAdapter,
      settings: ClientSettings,
    ) -> Arc<ResourceClient<E, C, U>>
    where
      E: crate::cache::Identifiable,
      C: serde::Serialize + Send + Sync,
      U: serde::Serialize + Send + Sync,
    {
      Arc::new(ResourceClient::new(config, adapter.clone()).with_settings(settings))
    }

    let orders: Arc<OrderClient> = client(
      ResourceConfig::new(ORDERS)
        .with_cache(cache)
        .with_items(ItemsExtractor::Field("items".to_string())),
      &adapter,
      settings,
    );
    let designs: Arc<DesignClient> =
      client(ResourceConfig::new(DESIGNS).with_cache(cache), &adapter, settings);
    let materials: Arc<MaterialClient> =
      client(ResourceConfig::new(MATERIALS).with_cache(cache), &adapter, settings);
    let users: Arc<UserClient> =
      client(ResourceConfig::new(USERS).with_cache(cache), &adapter, settings);

    registry.register(ORDERS, orders.clone());
    registry.register(DESIGNS, designs.clone());
    registry.register(MATERIALS, materials.clone());
    registry.register(USERS, users.clone());

    Self {
      orders,
      designs,
      materials,
      users,
      adapter,
    }
  }

  pub fn credentials(&self) -> &CredentialStore {
    self.adapter.credentials()
  }

  /// Order resource with payload validation and order-specific messages.
  pub fn order_resource(&self, queries: &QueryClient) -> CrudResource<Order, NewOrder, OrderUpdate> {
    CrudResource::new(self.orders.clone(), queries.clone())
      .with_messages(CrudMessages::for_entity("Order"))
      .with_create_validator(|order: &NewOrder| order.validate())
  }

  pub fn design_resource(&self, queries: &QueryClient) -> CrudResource<Design, DesignInput> {
    CrudResource::new(self.designs.clone(), queries.clone())
      .with_messages(CrudMessages::for_entity("Design"))
  }

  pub fn material_resource(&self, queries: &QueryClient) -> CrudResource<Material, MaterialInput> {
    CrudResource::new(self.materials.clone(), queries.clone())
      .with_messages(CrudMessages::for_entity("Material"))
  }

  pub fn user_resource(&self, queries: &QueryClient) -> CrudResource<User, UserInput> {
    CrudResource::new(self.users.clone(), queries.clone())
      .with_messages(CrudMessages::for_entity("User"))
  }

  /// List any resource by name, as JSON.
  pub async fn list_json(&self, resource: &str, params: &Value) -> Result<Value, ServiceError> {
    match resource {
      ORDERS => to_value(self.orders.find_many(params, RequestOptions::new()).await?),
      DESIGNS => to_value(self.designs.find_many(params, RequestOptions::new()).await?),
      MATERIALS => to_value(self.materials.find_many(params, RequestOptions::new()).await?),
      USERS => to_value(self.users.find_many(params, RequestOptions::new()).await?),
      other => Err(ServiceError::service_not_found(other)),
    }
  }

  /// Fetch one entity of any resource by name and numeric id, as JSON.
  pub async fn get_json(&self, resource: &str, id: u64) -> Result<Value, ServiceError> {
    match resource {
      ORDERS => to_value(self.orders.find_by_id(&id, RequestOptions::new()).await?),
      DESIGNS => to_value(self.designs.find_by_id(&id, RequestOptions::new()).await?),
      MATERIALS => to_value(self.materials.find_by_id(&id, RequestOptions::new()).await?),
      USERS => to_value(self.users.find_by_id(&id, RequestOptions::new()).await?),
      other => Err(ServiceError::service_not_found(other)),
    }
  }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, ServiceError> {
  serde_json::to_value(value)
    .map_err(|e| ServiceError::decode(format!("Failed to encode response: {}", e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{ok, ScriptedTransport};
  use crate::transport::Method;
  use serde_json::json;

  fn dashboard(wire: &Arc<ScriptedTransport>, registry: &ServiceRegistry) -> Dashboard {
    let adapter = TransportAdapter::new(wire.clone(), CredentialStore::in_memory());
    Dashboard::assemble(
      adapter,
      CacheConfig::default(),
      ClientSettings::default(),
      registry,
    )
  }

  #[tokio::test]
  async fn test_assemble_registers_every_resource() {
    let wire = ScriptedTransport::new();
    let registry = ServiceRegistry::new();
    let board = dashboard(&wire, &registry);

    assert_eq!(registry.names(), vec!["designs", "materials", "orders", "users"]);
    let orders: Arc<OrderClient> = registry.get(ORDERS).unwrap();
    assert!(Arc::ptr_eq(&orders, &board.orders));
  }

  #[tokio::test]
  async fn test_orders_list_is_paginated() {
    let wire = ScriptedTransport::new();
    wire.reply(
      Method::Get,
      "/orders",
      ok(json!({
        "items": [{"id": 1, "orderNumber": "PO-1", "customer": "Acme", "status": "pending", "quantity": 10}],
        "total": 1,
        "page": 1,
        "limit": 20,
        "hasMore": false
      })),
    );
    let registry = ServiceRegistry::new();
    let board = dashboard(&wire, &registry);

    let page = board.orders.find_many(&json!({"status": "pending"}), RequestOptions::new()).await.unwrap();
    assert_eq!(page.data.len(), 1);
    assert_eq!(page.meta.and_then(|m| m.total), Some(1));

    let listed = board.list_json(ORDERS, &json!({"status": "pending"})).await.unwrap();
    assert_eq!(listed["data"][0]["orderNumber"], "PO-1");
    assert_eq!(wire.calls(), 1);
  }

  #[tokio::test]
  async fn test_order_resource_validates_before_sending() {
    let wire = ScriptedTransport::new();
    let registry = ServiceRegistry::new();
    let board = dashboard(&wire, &registry);
    let orders = board.order_resource(&QueryClient::default());

    let err = orders
      .create(&NewOrder {
        customer: "Acme".to_string(),
        quantity: 0,
        design_id: None,
        material_id: None,
        due_date: None,
      })
      .await
      .unwrap_err();
    assert_eq!(err.field_errors("quantity"), ["must be at least 1".to_string()]);
    assert_eq!(wire.calls(), 0);
  }

  #[tokio::test]
  async fn test_unknown_resource_name() {
    let wire = ScriptedTransport::new();
    let registry = ServiceRegistry::new();
    let board = dashboard(&wire, &registry);

    let err = board.get_json("inks", 1).await.unwrap_err();
    assert!(err.has_code(crate::error::codes::SERVICE_NOT_FOUND));
  }
}
