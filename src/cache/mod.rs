//! In-memory cache tiers.
//!
//! - [`TtlCache`]: bounded per-entry-expiry store owned by each resource client
//! - [`QueryCache`]: hierarchical `(root, operation, params)` cache shared by CRUD resources,
//!   invalidated by staleness marking

mod query;
mod traits;
mod ttl;

pub use query::{canonical, normalize_params, QueryCache, QueryClient, QueryKey};
pub use traits::Identifiable;
pub use ttl::{CacheEntry, CacheStats, TtlCache, DEFAULT_MAX_SIZE, DEFAULT_TTL};
