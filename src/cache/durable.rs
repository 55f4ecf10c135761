//! Durable tier: trait, SQLite implementation and the entry codec.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::entry::CacheEntry;

/// Key-value backing store for the durable tier.
///
/// The cache treats it as best-effort: errors are logged by the caller and
/// never reach cache users.
#[async_trait]
pub trait DurableStore: Send + Sync {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

  async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

  async fn delete(&self, key: &str) -> Result<()>;

  async fn keys(&self) -> Result<Vec<String>>;
}

/// Storage implementation that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopStore;

#[async_trait]
impl DurableStore for NoopStore {
  async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
    Ok(None) // Always miss
  }

  async fn set(&self, _key: &str, _value: Vec<u8>) -> Result<()> {
    Ok(()) // Discard
  }

  async fn delete(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  async fn keys(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }
}

/// In-process durable tier, mainly for tests.
#[derive(Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.entries.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.lock().is_empty()
  }

  pub fn contains(&self, key: &str) -> bool {
    self.entries.lock().contains_key(key)
  }

  pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
    self.entries.lock().get(key).cloned()
  }
}

#[async_trait]
impl DurableStore for MemoryStore {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    Ok(self.entries.lock().get(key).cloned())
  }

  async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
    self.entries.lock().insert(key.to_string(), value);
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<()> {
    self.entries.lock().remove(key);
    Ok(())
  }

  async fn keys(&self) -> Result<Vec<String>> {
    Ok(self.entries.lock().keys().cloned().collect())
  }
}

/// SQLite-backed durable tier.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

/// Schema for the durable tier.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("prsync").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .conn
      .lock()
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  /// Number of rows and total stored bytes.
  pub fn usage(&self) -> Result<(u64, u64)> {
    let conn = self.conn.lock();

    conn
      .query_row(
        "SELECT COUNT(*), COALESCE(SUM(LENGTH(value)), 0) FROM cache_entries",
        [],
        |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
      )
      .map_err(|e| eyre!("Failed to read cache usage: {}", e))
  }
}

#[async_trait]
impl DurableStore for SqliteStore {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let conn = self.conn.lock();

    conn
      .query_row(
        "SELECT value FROM cache_entries WHERE cache_key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))
  }

  async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
    let conn = self.conn.lock();

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (cache_key, value, written_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", key, e))?;

    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<()> {
    let conn = self.conn.lock();

    conn
      .execute("DELETE FROM cache_entries WHERE cache_key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete cache entry {}: {}", key, e))?;

    Ok(())
  }

  async fn keys(&self) -> Result<Vec<String>> {
    let conn = self.conn.lock();

    let mut stmt = conn
      .prepare("SELECT cache_key FROM cache_entries")
      .map_err(|e| eyre!("Failed to prepare key query: {}", e))?;

    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache key: {}", e))?;

    Ok(keys)
  }
}

// ============================================================================
// Entry codec
// ============================================================================

const FORMAT_JSON: u8 = b'J';
const FORMAT_ZSTD: u8 = b'Z';

/// zstd level 3 = fast with good compression
const ZSTD_LEVEL: i32 = 3;

/// Serialize an entry for the durable tier, compressing it when the JSON
/// form is larger than `threshold` bytes.
pub fn encode_entry<T: Serialize>(entry: &CacheEntry<T>, threshold: usize) -> Result<Vec<u8>> {
  let json = serde_json::to_vec(entry).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;

  let mut out;
  if json.len() > threshold {
    let compressed =
      zstd::encode_all(&json[..], ZSTD_LEVEL).map_err(|e| eyre!("Failed to compress entry: {}", e))?;
    out = Vec::with_capacity(compressed.len() + 1);
    out.push(FORMAT_ZSTD);
    out.extend_from_slice(&compressed);
  } else {
    out = Vec::with_capacity(json.len() + 1);
    out.push(FORMAT_JSON);
    out.extend_from_slice(&json);
  }

  Ok(out)
}

pub fn decode_entry<T: DeserializeOwned>(bytes: &[u8]) -> Result<CacheEntry<T>> {
  let (format, body) = bytes
    .split_first()
    .ok_or_else(|| eyre!("Empty cache entry"))?;

  let entry = match *format {
    FORMAT_JSON => serde_json::from_slice(body),
    FORMAT_ZSTD => {
      let json = zstd::decode_all(body).map_err(|e| eyre!("Failed to decompress entry: {}", e))?;
      serde_json::from_slice(&json)
    }
    other => return Err(eyre!("Unknown cache entry format {:#04x}", other)),
  };

  entry.map_err(|e| eyre!("Failed to deserialize entry: {}", e))
}

/// Whether the stored bytes are zstd-compressed.
pub fn is_compressed(bytes: &[u8]) -> bool {
  bytes.first() == Some(&FORMAT_ZSTD)
}
