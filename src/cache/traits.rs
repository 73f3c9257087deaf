//! Core traits for cached entities.

use serde::{de::DeserializeOwned, Serialize};
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// Entity with a stable identifier.
///
/// The id is used for the `/{resource}/{id}` path segment and for the
/// detail entries of both cache tiers.
pub trait Identifiable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  type Id: Clone + Debug + Display + Eq + Hash + Serialize + Send + Sync + 'static;

  fn id(&self) -> Self::Id;
}
