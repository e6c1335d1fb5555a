//! Install and activation of cache versions.
//!
//! ```text
//! Idle ──install──▶ Installing ──ok──▶ Waiting ──activate──▶ Activating ──▶ Active
//!                        │
//!                        └──any manifest failure──▶ Redundant (may install again)
//! ```
//!
//! Install and activate are serialized on one async lock. Requests keep being
//! served from the previously active version until activation completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheKey, CacheStoreManager, LogicalCache};
use crate::db::state::LifecycleRecord;
use crate::db::Database;
use crate::event::{HostEvent, HostEvents};
use crate::net::{FetchError, Fetcher, Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
  /// Not installed
  Idle,
  Installing,
  /// Installed, previous version still in control
  Waiting,
  Activating,
  Active,
  /// Install failed
  Redundant,
}

/// Why a manifest could not be seeded. Nothing is committed in either case.
#[derive(Error, Debug)]
pub enum InstallError {
  #[error("Manifest resource {url} unreachable: {source}")]
  Unreachable {
    url: String,
    #[source]
    source: FetchError,
  },

  #[error("Manifest resource {url} returned status {status}")]
  BadStatus { url: String, status: u16 },
}

pub struct LifecycleController {
  version: String,
  manifest: Vec<Url>,
  key_headers: Vec<String>,
  caches: Arc<CacheStoreManager>,
  fetcher: Arc<dyn Fetcher>,
  db: Arc<Database>,
  host: HostEvents,
  state: Mutex<LifecycleState>,
  skip_waiting: AtomicBool,
  transition: tokio::sync::Mutex<()>,
}

impl LifecycleController {
  pub fn new(
    version: impl Into<String>,
    manifest: Vec<Url>,
    key_headers: Vec<String>,
    caches: Arc<CacheStoreManager>,
    fetcher: Arc<dyn Fetcher>,
    db: Arc<Database>,
    host: HostEvents,
  ) -> Self {
    Self {
      version: version.into(),
      manifest,
      key_headers,
      caches,
      fetcher,
      db,
      host,
      state: Mutex::new(LifecycleState::Idle),
      skip_waiting: AtomicBool::new(false),
      transition: tokio::sync::Mutex::new(()),
    }
  }

  /// Load the persisted record and make its active version current.
  pub fn restore(&self) -> Result<()> {
    let record = self.db.load_lifecycle()?;
    self.caches.set_current_version(record.active_version.clone())?;

    let state = if record.active_version.as_deref() == Some(self.version.as_str()) {
      LifecycleState::Active
    } else if record.waiting_version.as_deref() == Some(self.version.as_str()) {
      LifecycleState::Waiting
    } else {
      LifecycleState::Idle
    };

    debug!(
      "restored lifecycle: active {:?}, version {} is {:?}",
      record.active_version, self.version, state
    );
    *self.state.lock().map_err(|e| eyre!("Lock poisoned: {}", e))? = state;
    Ok(())
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn state(&self) -> LifecycleState {
    self
      .state
      .lock()
      .map(|s| *s)
      .unwrap_or_else(|e| *e.into_inner())
  }

  fn set_state(&self, state: LifecycleState) {
    match self.state.lock() {
      Ok(mut current) => *current = state,
      Err(e) => *e.into_inner() = state,
    }
    info!("version {} is now {:?}", self.version, state);
    self.host.emit(HostEvent::StateChanged {
      version: self.version.clone(),
      state,
    });
  }

  /// Install this version: seed the shell cache from the manifest.
  ///
  /// Any unreachable resource fails the whole install and commits nothing.
  /// A successful install activates right away when no version is active or
  /// skip-waiting was requested.
  pub async fn install(&self) -> Result<()> {
    let guard = self.transition.lock().await;
    match self.state() {
      LifecycleState::Active => {
        info!("version {} is already active", self.version);
        return Ok(());
      }
      LifecycleState::Waiting => debug!("version {} already installed", self.version),
      _ => self.run_install().await?,
    }
    drop(guard);

    if self.should_activate() {
      self.activate().await?;
    }
    Ok(())
  }

  async fn run_install(&self) -> Result<()> {
    self.set_state(LifecycleState::Installing);

    match self.seed_manifest().await {
      Ok(count) => {
        let mut record = self.db.load_lifecycle()?;
        record.waiting_version = Some(self.version.clone());
        self.db.save_lifecycle(&record)?;

        info!("installed version {} with {} shell resources", self.version, count);
        self.set_state(LifecycleState::Waiting);
        Ok(())
      }
      Err(e) => {
        warn!("install of version {} failed: {}", self.version, e);
        self.set_state(LifecycleState::Redundant);
        Err(e)
      }
    }
  }

  async fn seed_manifest(&self) -> Result<usize> {
    let fetches = self.manifest.iter().map(|url| {
      let fetcher = Arc::clone(&self.fetcher);
      let url = url.clone();
      async move {
        let response = fetcher
          .fetch(Request::get(url.clone()))
          .await
          .map_err(|source| InstallError::Unreachable {
            url: url.to_string(),
            source,
          })?;
        if !response.is_success() {
          return Err(InstallError::BadStatus {
            url: url.to_string(),
            status: response.status,
          });
        }
        Ok((url, response))
      }
    });

    let fetched = futures::future::try_join_all(fetches).await?;

    let entries: Vec<(CacheKey, Response)> = fetched
      .into_iter()
      .map(|(url, response)| {
        (
          CacheKey::from_request(&Request::get(url), &self.key_headers),
          response,
        )
      })
      .collect();

    let handle = self.caches.handle_for(LogicalCache::Static, &self.version);
    self.caches.seed(&handle, &entries)?;
    Ok(entries.len())
  }

  fn should_activate(&self) -> bool {
    self.state() == LifecycleState::Waiting
      && (self.skip_waiting.load(Ordering::SeqCst) || self.caches.current_version().is_none())
  }

  /// Activate an installed version: purge superseded generations and take control.
  /// Returns the deleted generation names.
  pub async fn activate(&self) -> Result<Vec<String>> {
    let _guard = self.transition.lock().await;

    match self.state() {
      LifecycleState::Waiting => {}
      LifecycleState::Active => return Ok(Vec::new()),
      other => {
        return Err(eyre!(
          "Cannot activate version {} while {:?}",
          self.version,
          other
        ))
      }
    }

    self.set_state(LifecycleState::Activating);
    match self.take_control() {
      Ok(deleted) => {
        self.set_state(LifecycleState::Active);
        Ok(deleted)
      }
      Err(e) => {
        warn!("activation of version {} failed: {}", self.version, e);
        self.set_state(LifecycleState::Waiting);
        Err(e)
      }
    }
  }

  /// Persist the switch, then serve from this version and purge older generations.
  ///
  /// Nothing changes if the record cannot be saved. A failed purge leaves the
  /// stale generations for the next activation to remove.
  fn take_control(&self) -> Result<Vec<String>> {
    let previous = self.db.load_lifecycle()?;
    self.db.save_lifecycle(&LifecycleRecord {
      active_version: Some(self.version.clone()),
      waiting_version: None,
    })?;

    if let Err(e) = self.caches.set_current_version(Some(self.version.clone())) {
      if let Err(restore) = self.db.save_lifecycle(&previous) {
        warn!("failed to restore lifecycle record: {}", restore);
      }
      return Err(e);
    }
    self.skip_waiting.store(false, Ordering::SeqCst);

    match self.caches.purge_stale(&self.version) {
      Ok(deleted) => Ok(deleted),
      Err(e) => {
        warn!("stale generations kept until the next activation: {}", e);
        Ok(Vec::new())
      }
    }
  }

  /// Activate without waiting for clients of the previous version.
  pub async fn skip_waiting(&self) -> Result<()> {
    self.skip_waiting.store(true, Ordering::SeqCst);

    match self.state() {
      LifecycleState::Waiting => {
        self.activate().await?;
      }
      LifecycleState::Installing => debug!("activation will follow install"),
      other => debug!("skip-waiting has no effect while {:?}", other),
    }
    Ok(())
  }

  /// The previous version has no clients left.
  pub async fn release_clients(&self) -> Result<()> {
    if self.state() == LifecycleState::Waiting {
      self.activate().await?;
    } else {
      debug!("no waiting version to activate");
    }
    Ok(())
  }
}
