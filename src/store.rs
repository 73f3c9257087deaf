//! Persistent key-value store and the credential record kept in it.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Key under which the bearer token is persisted.
pub const ACCESS_TOKEN_KEY: &str = "access_token";
/// Key under which the serialized user record is persisted.
pub const USER_INFO_KEY: &str = "user_info";

/// Trait for persistent key-value backends.
pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>>;

  fn set(&self, key: &str, value: &str) -> Result<()>;

  fn remove(&self, key: &str) -> Result<()>;
}

/// In-process store. Contents are lost on exit.
#[derive(Default)]
pub struct MemoryStore {
  values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let values = self.values.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(values.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let mut values = self.values.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    values.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let mut values = self.values.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    values.remove(key);
    Ok(())
  }
}

/// SQLite-backed store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

/// Schema for the key-value table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SqliteStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default store path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("pressroom").join("store.db"))
  }
}

impl KeyValueStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read '{}': {}", key, e))
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write '{}': {}", key, e))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to remove '{}': {}", key, e))?;

    Ok(())
  }
}

/// Access token and user record, always cleared together.
#[derive(Clone)]
pub struct CredentialStore {
  store: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
  pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
    Self { store }
  }

  pub fn in_memory() -> Self {
    Self::new(Arc::new(MemoryStore::new()))
  }

  /// The stored bearer token. Read failures are treated as "no token".
  pub fn token(&self) -> Option<String> {
    match self.store.get(ACCESS_TOKEN_KEY) {
      Ok(token) => token.filter(|t| !t.is_empty()),
      Err(e) => {
        warn!(error = %e, "Failed to read access token");
        None
      }
    }
  }

  pub fn user<T: DeserializeOwned>(&self) -> Result<Option<T>> {
    match self.store.get(USER_INFO_KEY)? {
      Some(raw) => serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| eyre!("Failed to parse stored user record: {}", e)),
      None => Ok(None),
    }
  }

  pub fn set_token(&self, token: &str) -> Result<()> {
    self.store.set(ACCESS_TOKEN_KEY, token)
  }

  pub fn login<T: Serialize>(&self, token: &str, user: Option<&T>) -> Result<()> {
    self.set_token(token)?;
    match user {
      Some(user) => {
        let raw = serde_json::to_string(user)
          .map_err(|e| eyre!("Failed to serialize user record: {}", e))?;
        self.store.set(USER_INFO_KEY, &raw)
      }
      None => self.store.remove(USER_INFO_KEY),
    }
  }

  pub fn clear(&self) -> Result<()> {
    self.store.remove(ACCESS_TOKEN_KEY)?;
    self.store.remove(USER_INFO_KEY)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;

  #[derive(Debug, Serialize, Deserialize, PartialEq)]
  struct Operator {
    id: u64,
    name: String,
  }

  #[test]
  fn test_sqlite_store_roundtrip_and_remove() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert_eq!(store.get("k").unwrap(), None);
    store.set("k", "one").unwrap();
    store.set("k", "two").unwrap();
    assert_eq!(store.get("k").unwrap().as_deref(), Some("two"));
    store.remove("k").unwrap();
    assert_eq!(store.get("k").unwrap(), None);
  }

  #[test]
  fn test_sqlite_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");
    SqliteStore::open(&path).unwrap().set(ACCESS_TOKEN_KEY, "tok").unwrap();

    let reopened = SqliteStore::open(&path).unwrap();
    assert_eq!(reopened.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("tok"));
  }

  #[test]
  fn test_credentials_cleared_together() {
    let creds = CredentialStore::in_memory();
    let user = Operator {
      id: 3,
      name: "press-op".to_string(),
    };
    creds.login("abc", Some(&user)).unwrap();
    assert_eq!(creds.token().as_deref(), Some("abc"));
    assert_eq!(creds.user::<Operator>().unwrap(), Some(user));

    creds.clear().unwrap();
    assert_eq!(creds.token(), None);
    assert_eq!(creds.user::<Operator>().unwrap(), None);
  }

  #[test]
  fn test_empty_token_is_absent() {
    let creds = CredentialStore::in_memory();
    creds.set_token("").unwrap();
    assert_eq!(creds.token(), None);
  }
}
