//! Cache storage trait and its SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{entry_hash, CachedResponse};
use crate::http::{Headers, Response};

/// Trait for cache storage backends.
///
/// Storage holds any number of named stores, each mapping a request key to a
/// captured response, plus the registration record naming the version that
/// controls clients. Individual calls are atomic; nothing locks across calls.
pub trait CacheStorage: Send + Sync {
  /// Names of every existing store.
  fn store_names(&self) -> Result<Vec<String>>;

  fn has_store(&self, name: &str) -> Result<bool>;

  /// Create the store if absent. Returns true if it was created.
  fn open_store(&self, name: &str) -> Result<bool>;

  /// Delete a store and all its entries. Returns true if it existed.
  fn delete_store(&self, name: &str) -> Result<bool>;

  fn get_entry(&self, store: &str, key: &str) -> Result<Option<CachedResponse>>;

  /// Store a single entry, creating the store if needed.
  #[allow(dead_code)]
  fn put_entry(&self, store: &str, key: &str, response: &Response) -> Result<()> {
    self.put_entries(store, &[(key.to_string(), response.clone())])
  }

  /// Store a batch of entries; either all are written or none.
  fn put_entries(&self, store: &str, entries: &[(String, Response)]) -> Result<()>;

  /// Store a single entry only if the store exists.
  /// Returns false, writing nothing, when it does not.
  fn put_existing(&self, store: &str, key: &str, response: &Response) -> Result<bool>;

  /// Keys of every entry in a store.
  fn entry_keys(&self, store: &str) -> Result<Vec<String>>;

  /// The version currently controlling clients, if any.
  fn get_registration(&self) -> Result<Option<String>>;

  fn set_registration(&self, version: &str) -> Result<()>;
}

type MemoryStore = BTreeMap<String, CachedResponse>;

#[derive(Default)]
struct MemoryState {
  stores: BTreeMap<String, MemoryStore>,
  registration: Option<String>,
}

/// Storage that lives only as long as the process.
/// Used when persistence is disabled.
#[derive(Default)]
pub struct MemoryStorage {
  state: Mutex<MemoryState>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
    self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn store_names(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.stores.keys().cloned().collect())
  }

  fn has_store(&self, name: &str) -> Result<bool> {
    Ok(self.lock()?.stores.contains_key(name))
  }

  fn open_store(&self, name: &str) -> Result<bool> {
    let mut state = self.lock()?;
    if state.stores.contains_key(name) {
      return Ok(false);
    }
    state.stores.insert(name.to_string(), MemoryStore::new());
    Ok(true)
  }

  fn delete_store(&self, name: &str) -> Result<bool> {
    Ok(self.lock()?.stores.remove(name).is_some())
  }

  fn get_entry(&self, store: &str, key: &str) -> Result<Option<CachedResponse>> {
    let state = self.lock()?;
    Ok(
      state
        .stores
        .get(store)
        .and_then(|entries| entries.get(key))
        .cloned(),
    )
  }

  fn put_entries(&self, store: &str, entries: &[(String, Response)]) -> Result<()> {
    let mut state = self.lock()?;
    let target = state.stores.entry(store.to_string()).or_default();
    let cached_at = Utc::now();
    for (key, response) in entries {
      target.insert(
        key.clone(),
        CachedResponse {
          url: key.clone(),
          response: response.clone(),
          cached_at,
        },
      );
    }
    Ok(())
  }

  fn put_existing(&self, store: &str, key: &str, response: &Response) -> Result<bool> {
    let mut state = self.lock()?;
    let Some(target) = state.stores.get_mut(store) else {
      return Ok(false);
    };

    target.insert(
      key.to_string(),
      CachedResponse {
        url: key.to_string(),
        response: response.clone(),
        cached_at: Utc::now(),
      },
    );
    Ok(true)
  }

  fn entry_keys(&self, store: &str) -> Result<Vec<String>> {
    let state = self.lock()?;
    Ok(
      state
        .stores
        .get(store)
        .map(|entries| entries.keys().cloned().collect())
        .unwrap_or_default(),
    )
  }

  fn get_registration(&self) -> Result<Option<String>> {
    Ok(self.lock()?.registration.clone())
  }

  fn set_registration(&self, version: &str) -> Result<()> {
    self.lock()?.registration = Some(version.to_string());
    Ok(())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at the given path, or the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Storage backed by a private in-memory database.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("moldgate").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Named cache stores, one per gateway version
CREATE TABLE IF NOT EXISTS cache_stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Captured responses, keyed by the hash of the request URL
CREATE TABLE IF NOT EXISTS cache_entries (
    store_name TEXT NOT NULL,
    url_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    response_type TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store_name, url_hash),
    FOREIGN KEY (store_name) REFERENCES cache_stores(name) ON DELETE CASCADE
);

-- Version controlling clients (single row)
CREATE TABLE IF NOT EXISTS registration (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    active_version TEXT NOT NULL,
    activated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl CacheStorage for SqliteStorage {
  fn store_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache store name: {}", e))?;

    Ok(names)
  }

  fn has_store(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM cache_stores WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache store {}: {}", name, e))?;

    Ok(found.is_some())
  }

  fn open_store(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;

    let inserted = conn
      .execute(
        "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open cache store {}: {}", name, e))?;

    Ok(inserted > 0)
  }

  fn delete_store(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE store_name = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let deleted = tx
      .execute("DELETE FROM cache_stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache store {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(deleted > 0)
  }

  fn get_entry(&self, store: &str, key: &str) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<(String, u16, String, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT url, status, response_type, headers, body, cached_at FROM cache_entries
         WHERE store_name = ? AND url_hash = ?",
        params![store, entry_hash(key)],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry {}: {}", key, e))?;

    let Some((url, status, response_type, headers, body, cached_at)) = row else {
      return Ok(None);
    };

    let headers: Headers = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;
    let response_type = response_type
      .parse()
      .map_err(|e| eyre!("Corrupt cache entry {}: {}", url, e))?;

    Ok(Some(CachedResponse {
      url,
      response: Response {
        status,
        headers,
        body,
        response_type,
      },
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn put_entries(&self, store: &str, entries: &[(String, Response)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
      params![store],
    )
    .map_err(|e| eyre!("Failed to open cache store {}: {}", store, e))?;

    for (key, response) in entries {
      insert_entry(&tx, store, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn put_existing(&self, store: &str, key: &str, response: &Response) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let exists: Option<i64> = tx
      .query_row(
        "SELECT 1 FROM cache_stores WHERE name = ?",
        params![store],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache store {}: {}", store, e))?;

    if exists.is_none() {
      return Ok(false);
    }

    insert_entry(&tx, store, key, response)?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(true)
  }

  fn entry_keys(&self, store: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT url FROM cache_entries WHERE store_name = ? ORDER BY url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![store], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list entries of {}: {}", store, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read entry key: {}", e))?;

    Ok(keys)
  }

  fn get_registration(&self) -> Result<Option<String>> {
    let conn = self.lock()?;

    conn
      .query_row(
        "SELECT active_version FROM registration WHERE id = 1",
        [],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read registration: {}", e))
  }

  fn set_registration(&self, version: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO registration (id, active_version, activated_at)
         VALUES (1, ?, datetime('now'))",
        params![version],
      )
      .map_err(|e| eyre!("Failed to write registration: {}", e))?;

    Ok(())
  }
}

fn insert_entry(conn: &Connection, store: &str, key: &str, response: &Response) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (store_name, url_hash, url, status, response_type, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        store,
        entry_hash(key),
        key,
        response.status,
        response.response_type.as_str(),
        headers,
        response.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry {}: {}", key, e))?;

  Ok(())
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::ResponseType;

  fn exercise_stores(storage: &dyn CacheStorage) {
    assert!(storage.open_store("moldpark-cache-v1").unwrap());
    assert!(!storage.open_store("moldpark-cache-v1").unwrap());
    assert!(storage.open_store("moldpark-cache-v2").unwrap());
    assert_eq!(
      storage.store_names().unwrap(),
      vec!["moldpark-cache-v1", "moldpark-cache-v2"]
    );

    assert!(storage.delete_store("moldpark-cache-v1").unwrap());
    assert!(!storage.delete_store("moldpark-cache-v1").unwrap());
    assert!(!storage.has_store("moldpark-cache-v1").unwrap());
    assert!(storage.has_store("moldpark-cache-v2").unwrap());
  }

  fn exercise_entries(storage: &dyn CacheStorage) {
    let key = "https://moldpark.test/static/js/custom.js";
    let response = Response::new(200, "console.log('hi')")
      .with_header("content-type", "application/javascript");

    assert!(storage.get_entry("v2", key).unwrap().is_none());
    storage.put_entry("v2", key, &response).unwrap();

    let cached = storage.get_entry("v2", key).unwrap().unwrap();
    assert_eq!(cached.url, key);
    assert_eq!(cached.response, response);
    assert!(storage.has_store("v2").unwrap());
    assert_eq!(storage.entry_keys("v2").unwrap(), vec![key]);

    // Entries are scoped to their store
    assert!(storage.get_entry("v1", key).unwrap().is_none());

    storage.delete_store("v2").unwrap();
    assert!(storage.get_entry("v2", key).unwrap().is_none());
    assert!(storage.entry_keys("v2").unwrap().is_empty());
  }

  fn exercise_put_existing(storage: &dyn CacheStorage) {
    let key = "https://moldpark.test/static/late.js";
    let response = Response::new(200, "late");

    assert!(!storage.put_existing("moldpark-cache-v0", key, &response).unwrap());
    assert!(!storage.has_store("moldpark-cache-v0").unwrap());

    storage.open_store("moldpark-cache-v3").unwrap();
    assert!(storage.put_existing("moldpark-cache-v3", key, &response).unwrap());
    let cached = storage.get_entry("moldpark-cache-v3", key).unwrap().unwrap();
    assert_eq!(cached.response.body, b"late");
  }

  fn exercise_registration(storage: &dyn CacheStorage) {
    assert_eq!(storage.get_registration().unwrap(), None);
    storage.set_registration("moldpark-cache-v1").unwrap();
    storage.set_registration("moldpark-cache-v2").unwrap();
    assert_eq!(
      storage.get_registration().unwrap().as_deref(),
      Some("moldpark-cache-v2")
    );
  }

  #[test]
  fn test_memory_storage() {
    let storage = MemoryStorage::new();
    exercise_stores(&storage);
    exercise_entries(&storage);
    exercise_put_existing(&storage);
    exercise_registration(&storage);
  }

  #[test]
  fn test_sqlite_storage() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    exercise_stores(&storage);
    exercise_entries(&storage);
    exercise_put_existing(&storage);
    exercise_registration(&storage);
  }

  #[test]
  fn test_sqlite_persists_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    let key = "https://moldpark.test/static/favicon.ico";

    {
      let storage = SqliteStorage::open(Some(&path)).unwrap();
      let response = Response::new(200, vec![0u8, 1, 2]).with_type(ResponseType::Basic);
      storage.put_entry("moldpark-cache-v2", key, &response).unwrap();
      storage.set_registration("moldpark-cache-v2").unwrap();
    }

    let storage = SqliteStorage::open(Some(&path)).unwrap();
    let cached = storage
      .get_entry("moldpark-cache-v2", key)
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.body, vec![0u8, 1, 2]);
    assert_eq!(
      storage.get_registration().unwrap().as_deref(),
      Some("moldpark-cache-v2")
    );
  }
}
