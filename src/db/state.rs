//! Lifecycle record and sync tag persistence.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::Database;

/// Persisted lifecycle versions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleRecord {
  /// Version whose generations currently serve requests
  pub active_version: Option<String>,
  /// Version installed and waiting for activation
  pub waiting_version: Option<String>,
}

/// A sync tag waiting for a successful replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingTag {
  pub tag: String,
  pub registered_at: DateTime<Utc>,
  pub attempts: u32,
  pub last_error: Option<String>,
}

impl Database {
  pub fn load_lifecycle(&self) -> Result<LifecycleRecord> {
    let conn = self.conn()?;

    let record = conn
      .query_row(
        "SELECT active_version, waiting_version FROM lifecycle WHERE id = 1",
        [],
        |row| {
          Ok(LifecycleRecord {
            active_version: row.get(0)?,
            waiting_version: row.get(1)?,
          })
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to load lifecycle record: {}", e))?;

    Ok(record.unwrap_or_default())
  }

  pub fn save_lifecycle(&self, record: &LifecycleRecord) -> Result<()> {
    let conn = self.conn()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO lifecycle (id, active_version, waiting_version, updated_at)
         VALUES (1, ?, ?, ?)",
        params![record.active_version, record.waiting_version, timestamp(Utc::now())],
      )
      .map_err(|e| eyre!("Failed to save lifecycle record: {}", e))?;

    Ok(())
  }

  /// Mark a tag pending. Registering an already pending tag keeps its history.
  pub fn register_sync_tag(&self, tag: &str) -> Result<()> {
    let conn = self.conn()?;

    conn
      .execute(
        "INSERT OR IGNORE INTO sync_tags (tag, registered_at) VALUES (?, ?)",
        params![tag, timestamp(Utc::now())],
      )
      .map_err(|e| eyre!("Failed to register sync tag {}: {}", tag, e))?;

    Ok(())
  }

  pub fn pending_sync_tags(&self) -> Result<Vec<PendingTag>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT tag, registered_at, attempts, last_error FROM sync_tags
         ORDER BY registered_at, tag",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String, u32, Option<String>)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
      .map_err(|e| eyre!("Failed to query sync tags: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    rows
      .into_iter()
      .map(|(tag, registered_at, attempts, last_error)| {
        Ok(PendingTag {
          tag,
          registered_at: parse_timestamp(&registered_at)?,
          attempts,
          last_error,
        })
      })
      .collect()
  }

  /// Record a failed replay; the tag stays pending.
  pub fn record_sync_failure(&self, tag: &str, error: &str) -> Result<()> {
    let conn = self.conn()?;

    conn
      .execute(
        "INSERT INTO sync_tags (tag, registered_at, attempts, last_error) VALUES (?1, ?2, 1, ?3)
         ON CONFLICT(tag) DO UPDATE SET attempts = attempts + 1, last_error = ?3",
        params![tag, timestamp(Utc::now()), error],
      )
      .map_err(|e| eyre!("Failed to record sync failure for {}: {}", tag, e))?;

    Ok(())
  }

  pub fn complete_sync_tag(&self, tag: &str) -> Result<bool> {
    let conn = self.conn()?;

    let removed = conn
      .execute("DELETE FROM sync_tags WHERE tag = ?", params![tag])
      .map_err(|e| eyre!("Failed to complete sync tag {}: {}", tag, e))?;

    Ok(removed > 0)
  }
}

/// Format a timestamp in the fixed-width form stored by the gateway.
pub fn timestamp(at: DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp written by [`timestamp`].
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
