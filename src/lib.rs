//! Resource-access core for a print-production operations dashboard.
//!
//! A [`client::ResourceClient`] per REST collection, a [`crud::CrudResource`]
//! layer with a shared query cache, the [`query::Query`] fetch primitive and a
//! process-wide [`registry::ServiceRegistry`].

pub mod cache;
pub mod cancel;
pub mod client;
pub mod config;
pub mod crud;
pub mod dashboard;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod notify;
pub mod query;
pub mod registry;
pub mod retry;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testing;

pub use cancel::CancellationToken;
pub use envelope::{Envelope, PageMeta};
pub use error::{ServiceError, ValidationError};
