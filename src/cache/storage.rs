//! Cache storage trait and SQLite implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::state::{parse_timestamp, timestamp};
use crate::db::Database;
use crate::net::Response;

use super::key::CacheKey;
use super::manager::CacheHandle;

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  /// Canonical URL the entry was stored under
  pub url: String,
  /// The captured response
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Every method is individually atomic: a write is either fully visible or
/// not visible at all.
pub trait CacheStorage: Send + Sync {
  /// Record a generation; no-op if it exists.
  fn create_generation(&self, handle: &CacheHandle) -> Result<()>;

  /// Physical names of every generation, sorted.
  fn list_generations(&self) -> Result<Vec<String>>;

  /// Delete a generation and all of its entries.
  fn delete_generation(&self, name: &str) -> Result<bool>;

  /// Look up an entry by key.
  fn get_entry(&self, handle: &CacheHandle, key: &CacheKey) -> Result<Option<CachedEntry>>;

  /// Insert or replace an entry, recreating the generation if needed.
  fn put_entry(&self, handle: &CacheHandle, key: &CacheKey, response: &Response) -> Result<()>;

  /// Insert or replace many entries in one transaction.
  fn put_entries(&self, handle: &CacheHandle, entries: &[(CacheKey, Response)]) -> Result<()>;

  /// Number of entries in a generation.
  #[cfg(test)]
  fn entry_count(&self, name: &str) -> Result<usize>;

  /// Delete the oldest entries beyond `max_entries`. Returns how many were removed.
  fn trim_generation(&self, name: &str, max_entries: usize) -> Result<usize>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

fn insert_generation(conn: &Connection, handle: &CacheHandle) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_generations (name, logical_name, version, created_at)
       VALUES (?, ?, ?, ?)",
      params![
        handle.name(),
        handle.logical().as_str(),
        handle.version(),
        timestamp(Utc::now())
      ],
    )
    .map_err(|e| eyre!("Failed to create generation {}: {}", handle.name(), e))?;
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  generation: &str,
  key: &CacheKey,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (generation, entry_key, method, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        generation,
        key.digest(),
        key.method(),
        key.url(),
        response.status,
        headers,
        response.body,
        timestamp(Utc::now())
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", key.url(), e))?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn create_generation(&self, handle: &CacheHandle) -> Result<()> {
    let conn = self.db.conn()?;
    insert_generation(&conn, handle)
  }

  fn list_generations(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_generations ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names: Vec<String> = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  fn delete_generation(&self, name: &str) -> Result<bool> {
    let mut conn = self.db.conn()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE generation = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM cache_generations WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete generation {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get_entry(&self, handle: &CacheHandle, key: &CacheKey) -> Result<Option<CachedEntry>> {
    let conn = self.db.conn()?;

    let row: Option<(String, u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT url, status, headers, body, cached_at FROM cache_entries
         WHERE generation = ? AND entry_key = ?",
        params![handle.name(), key.digest()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query entry {}: {}", key.url(), e))?;

    match row {
      Some((url, status, headers, body, cached_at)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(CachedEntry {
          url,
          response: Response {
            status,
            headers,
            body,
          },
          cached_at: parse_timestamp(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put_entry(&self, handle: &CacheHandle, key: &CacheKey, response: &Response) -> Result<()> {
    self.put_entries(handle, &[(key.clone(), response.clone())])
  }

  fn put_entries(&self, handle: &CacheHandle, entries: &[(CacheKey, Response)]) -> Result<()> {
    let mut conn = self.db.conn()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    insert_generation(&tx, handle)?;
    for (key, response) in entries {
      insert_entry(&tx, handle.name(), key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  #[cfg(test)]
  fn entry_count(&self, name: &str) -> Result<usize> {
    let conn = self.db.conn()?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE generation = ?",
        params![name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", name, e))?;

    Ok(count as usize)
  }

  fn trim_generation(&self, name: &str, max_entries: usize) -> Result<usize> {
    let conn = self.db.conn()?;

    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE generation = ?1 AND entry_key IN (
           SELECT entry_key FROM cache_entries WHERE generation = ?1
           ORDER BY cached_at DESC, rowid DESC LIMIT -1 OFFSET ?2
         )",
        params![name, max_entries as i64],
      )
      .map_err(|e| eyre!("Failed to trim generation {}: {}", name, e))?;

    Ok(removed)
  }
}
