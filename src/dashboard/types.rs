use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::Identifiable;
use crate::error::ValidationError;

/// Production stage of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
  Pending,
  InProduction,
  Printing,
  Finishing,
  Shipped,
  Completed,
  Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
  pub id: u64,
  pub order_number: String,
  pub customer: String,
  pub status: OrderStatus,
  pub quantity: u32,
  #[serde(default)]
  pub design_id: Option<u64>,
  #[serde(default)]
  pub material_id: Option<u64>,
  #[serde(default)]
  pub due_date: Option<DateTime<Utc>>,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
  pub customer: String,
  pub quantity: u32,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub design_id: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub material_id: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub due_date: Option<DateTime<Utc>>,
}

impl NewOrder {
  pub fn validate(&self) -> Result<(), ValidationError> {
    let mut err = ValidationError::new("Order is invalid");
    let mut failed = false;
    if self.customer.trim().is_empty() {
      err = err.field("customer", "is required");
      failed = true;
    }
    if self.quantity == 0 {
      err = err.field("quantity", "must be at least 1");
      failed = true;
    }
    if failed {
      Err(err)
    } else {
      Ok(())
    }
  }
}

/// Partial order update; unset fields are left alone by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdate {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<OrderStatus>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub quantity: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub due_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesignStatus {
  Draft,
  PendingApproval,
  Approved,
  Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Design {
  pub id: u64,
  pub name: String,
  pub status: DesignStatus,
  #[serde(default)]
  pub file_url: Option<String>,
  #[serde(default)]
  pub width_mm: Option<f64>,
  #[serde(default)]
  pub height_mm: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DesignInput {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<DesignStatus>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub width_mm: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub height_mm: Option<f64>,
}

/// Stock item: substrates, inks, laminates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Material {
  pub id: u64,
  pub sku: String,
  pub name: String,
  pub unit: String,
  pub stock: f64,
  #[serde(default)]
  pub reorder_level: Option<f64>,
}

impl Material {
  pub fn needs_reorder(&self) -> bool {
    self.reorder_level.is_some_and(|level| self.stock <= level)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialInput {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub sku: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub unit: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub stock: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reorder_level: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Admin,
  Operator,
  Viewer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
  pub id: u64,
  pub email: String,
  pub name: String,
  pub role: Role,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInput {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub role: Option<Role>,
}

macro_rules! identified_by_id {
  ($($entity:ty),*) => {
    $(
      impl Identifiable for $entity {
        type Id = u64;

        fn id(&self) -> u64 {
          self.id
        }
      }
    )*
  };
}

identified_by_id!(Order, Design, Material, User);
