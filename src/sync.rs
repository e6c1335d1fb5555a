//! Background sync: deferred work replayed when connectivity returns.
//!
//! The host registers a tag while offline. When the scheduler signals the tag,
//! its handler replays the deferred work. A failed replay keeps the tag pending
//! for the next signal.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use fs2::FileExt;
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::db::state::PendingTag;
use crate::db::Database;
use crate::event::{HostEvent, HostEvents};
use crate::net::{FetchError, Fetcher, Request};

pub const WORKOUT_SYNC_TAG: &str = "sync-workouts";

#[derive(Error, Debug)]
pub enum SyncError {
  #[error("Sync endpoint {url} unreachable: {source}")]
  Unreachable {
    url: String,
    #[source]
    source: FetchError,
  },

  #[error("Server rejected record {id} with status {status}")]
  Rejected { id: String, status: u16 },
}

/// Outcome of a successful replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Records accepted by the server
  pub sent: usize,
  /// Records the server had already applied
  pub already_applied: usize,
}

/// Work replayed for one sync tag.
pub trait SyncHandler: Send + Sync {
  fn replay(&self) -> BoxFuture<'_, Result<SyncReport>>;
}

pub struct SyncQueue {
  db: Arc<Database>,
  host: HostEvents,
  handlers: HashMap<String, Arc<dyn SyncHandler>>,
}

impl SyncQueue {
  pub fn new(db: Arc<Database>, host: HostEvents) -> Self {
    Self {
      db,
      host,
      handlers: HashMap::new(),
    }
  }

  pub fn with_handler(mut self, tag: impl Into<String>, handler: Arc<dyn SyncHandler>) -> Self {
    self.handlers.insert(tag.into(), handler);
    self
  }

  /// Mark a tag pending until its next successful replay.
  pub fn register(&self, tag: &str) -> Result<()> {
    if !self.handlers.contains_key(tag) {
      return Err(eyre!("No sync handler for tag '{}'", tag));
    }
    self.db.register_sync_tag(tag)?;
    info!("registered sync tag {}", tag);
    Ok(())
  }

  pub fn pending(&self) -> Result<Vec<PendingTag>> {
    self.db.pending_sync_tags()
  }

  /// Replay a tag. Unknown tags are ignored and yield `None`.
  ///
  /// On failure the tag stays pending with its attempt count bumped, and the
  /// error is returned so the scheduler can retry.
  pub async fn on_sync(&self, tag: &str) -> Result<Option<SyncReport>> {
    let Some(handler) = self.handlers.get(tag) else {
      info!("ignoring sync for unknown tag '{}'", tag);
      return Ok(None);
    };

    match handler.replay().await {
      Ok(report) => {
        self.db.complete_sync_tag(tag)?;
        info!(
          "sync {} finished: {} sent, {} already applied",
          tag, report.sent, report.already_applied
        );
        self.host.emit(HostEvent::SyncFinished {
          tag: tag.to_string(),
          ok: true,
          error: None,
        });
        Ok(Some(report))
      }
      Err(e) => {
        warn!("sync {} failed: {}", tag, e);
        self.db.record_sync_failure(tag, &e.to_string())?;
        self.host.emit(HostEvent::SyncFinished {
          tag: tag.to_string(),
          ok: false,
          error: Some(e.to_string()),
        });
        Err(e)
      }
    }
  }

  /// Replay every pending tag. Returns the tags that completed.
  pub async fn replay_pending(&self) -> Result<Vec<String>> {
    let mut completed = Vec::new();
    for pending in self.pending()? {
      match self.on_sync(&pending.tag).await {
        Ok(Some(_)) => completed.push(pending.tag),
        Ok(None) => {}
        Err(e) => debug!("{} stays pending: {}", pending.tag, e),
      }
    }
    Ok(completed)
  }
}

/// A workout logged while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutRecord {
  pub id: String,
  #[serde(flatten)]
  pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Records waiting to reach the server.
pub trait WorkoutOutbox: Send + Sync {
  fn pending(&self) -> Result<Vec<WorkoutRecord>>;
  /// Remove a record the server has accepted
  fn acknowledge(&self, id: &str) -> Result<()>;
}

/// Outbox stored as a JSON array, written by the host application.
///
/// Readers and writers coordinate through an exclusive advisory lock on
/// `<outbox>.lock`. The host must hold the same lock while it appends records.
pub struct FileOutbox {
  path: PathBuf,
}

/// Exclusive hold on an outbox; released on drop.
pub struct OutboxLock {
  file: File,
}

impl Drop for OutboxLock {
  fn drop(&mut self) {
    let _ = FileExt::unlock(&self.file);
  }
}

impl FileOutbox {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  fn lock_path(&self) -> PathBuf {
    let mut name = self.path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
  }

  /// Block until the outbox lock is ours.
  pub fn lock(&self) -> Result<OutboxLock> {
    let lock_path = self.lock_path();
    if let Some(parent) = lock_path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create outbox directory: {}", e))?;
    }

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(|e| eyre!("Failed to open outbox lock {}: {}", lock_path.display(), e))?;
    FileExt::lock_exclusive(&file)
      .map_err(|e| eyre!("Failed to lock outbox {}: {}", self.path.display(), e))?;

    Ok(OutboxLock { file })
  }

  fn read(&self) -> Result<Vec<WorkoutRecord>> {
    if !self.path.exists() {
      return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(&self.path)
      .map_err(|e| eyre!("Failed to read outbox {}: {}", self.path.display(), e))?;
    if contents.trim().is_empty() {
      return Ok(Vec::new());
    }
    serde_json::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse outbox {}: {}", self.path.display(), e))
  }

  fn write(&self, records: &[WorkoutRecord]) -> Result<()> {
    let json = serde_json::to_string_pretty(records)
      .map_err(|e| eyre!("Failed to serialize outbox: {}", e))?;

    // Replace via rename so readers never see a partial file
    let tmp = self.path.with_extension("json.tmp");
    std::fs::write(&tmp, json)
      .map_err(|e| eyre!("Failed to write outbox {}: {}", tmp.display(), e))?;
    std::fs::rename(&tmp, &self.path)
      .map_err(|e| eyre!("Failed to replace outbox {}: {}", self.path.display(), e))
  }
}

impl WorkoutOutbox for FileOutbox {
  fn pending(&self) -> Result<Vec<WorkoutRecord>> {
    let _lock = self.lock()?;
    self.read()
  }

  /// Re-reads the file under the lock and removes only `id`, so records the
  /// host appended since `pending` survive.
  fn acknowledge(&self, id: &str) -> Result<()> {
    let _lock = self.lock()?;
    let mut records = self.read()?;
    let before = records.len();
    records.retain(|r| r.id != id);
    if records.len() != before {
      self.write(&records)?;
    }
    Ok(())
  }
}

/// Replays offline workouts against the sync endpoint.
pub struct WorkoutSync {
  outbox: Arc<dyn WorkoutOutbox>,
  fetcher: Arc<dyn Fetcher>,
  endpoint: Url,
}

impl WorkoutSync {
  pub fn new(outbox: Arc<dyn WorkoutOutbox>, fetcher: Arc<dyn Fetcher>, endpoint: Url) -> Self {
    Self {
      outbox,
      fetcher,
      endpoint,
    }
  }

  async fn send_all(&self) -> Result<SyncReport> {
    let mut report = SyncReport::default();

    for record in self.outbox.pending()? {
      let body = serde_json::to_vec(&record)
        .map_err(|e| eyre!("Failed to serialize workout {}: {}", record.id, e))?;
      let request = Request::new(Method::POST, self.endpoint.clone())
        .with_header("content-type", "application/json")
        .with_header("idempotency-key", &record.id)
        .with_body(body);

      let response = self
        .fetcher
        .fetch(request)
        .await
        .map_err(|source| SyncError::Unreachable {
          url: self.endpoint.to_string(),
          source,
        })?;

      match response.status {
        200..=299 => report.sent += 1,
        409 => report.already_applied += 1,
        status => {
          return Err(
            SyncError::Rejected {
              id: record.id,
              status,
            }
            .into(),
          )
        }
      }

      self.outbox.acknowledge(&record.id)?;
      debug!("workout {} synced (status {})", record.id, response.status);
    }

    Ok(report)
  }
}

impl SyncHandler for WorkoutSync {
  fn replay(&self) -> BoxFuture<'_, Result<SyncReport>> {
    self.send_all().boxed()
  }
}
