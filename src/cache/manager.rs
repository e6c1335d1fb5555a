//! Owner of the cache generations.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, RwLock};

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info, warn};

use crate::net::Response;

use super::key::CacheKey;
use super::storage::{CacheStorage, CachedEntry, SqliteStorage};

/// Logical cache names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalCache {
  /// Shell resources seeded from the manifest at install
  Static,
  /// Runtime responses: pages, scripts, styles, API calls
  Dynamic,
  /// Runtime images
  Images,
}

impl LogicalCache {
  pub const ALL: [LogicalCache; 3] = [Self::Static, Self::Dynamic, Self::Images];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
      Self::Images => "images",
    }
  }
}

impl fmt::Display for LogicalCache {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// An opened physical generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHandle {
  logical: LogicalCache,
  version: String,
  name: String,
}

impl CacheHandle {
  pub fn logical(&self) -> LogicalCache {
    self.logical
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Physical store name
  pub fn name(&self) -> &str {
    &self.name
  }
}

/// Optional entry bounds for the runtime generations.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheLimits {
  pub dynamic_max_entries: Option<usize>,
  pub images_max_entries: Option<usize>,
}

impl CacheLimits {
  fn max_entries(&self, logical: LogicalCache) -> Option<usize> {
    match logical {
      LogicalCache::Static => None,
      LogicalCache::Dynamic => self.dynamic_max_entries,
      LogicalCache::Images => self.images_max_entries,
    }
  }
}

/// Manages named, versioned cache generations on top of a storage backend.
///
/// At most one generation per logical name is current: the one for the
/// current version. Every other generation carrying the prefix is stale.
pub struct CacheStoreManager<S: CacheStorage = SqliteStorage> {
  storage: S,
  prefix: String,
  limits: CacheLimits,
  current_version: RwLock<Option<String>>,
  open_handles: Mutex<HashMap<LogicalCache, CacheHandle>>,
}

impl<S: CacheStorage> CacheStoreManager<S> {
  pub fn new(storage: S, prefix: impl Into<String>, limits: CacheLimits) -> Self {
    Self {
      storage,
      prefix: prefix.into(),
      limits,
      current_version: RwLock::new(None),
      open_handles: Mutex::new(HashMap::new()),
    }
  }

  pub fn physical_name(&self, logical: LogicalCache, version: &str) -> String {
    format!("{}-{}-{}", self.prefix, logical, version)
  }

  /// Physical names a version owns.
  pub fn expected_generations(&self, version: &str) -> Vec<String> {
    LogicalCache::ALL
      .iter()
      .map(|logical| self.physical_name(*logical, version))
      .collect()
  }

  /// Version whose generations serve requests.
  pub fn current_version(&self) -> Option<String> {
    self
      .current_version
      .read()
      .map(|v| v.clone())
      .unwrap_or_else(|e| e.into_inner().clone())
  }

  /// Switch the serving version. Open handles of the previous version are dropped.
  pub fn set_current_version(&self, version: Option<String>) -> Result<()> {
    let mut current = self
      .current_version
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if *current != version {
      debug!("current cache version {:?} -> {:?}", *current, version);
      *current = version;
      self.handles()?.clear();
    }
    Ok(())
  }

  fn handles(&self) -> Result<std::sync::MutexGuard<'_, HashMap<LogicalCache, CacheHandle>>> {
    self
      .open_handles
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Open a logical cache of the current version, creating the generation on first use.
  pub fn open(&self, logical: LogicalCache) -> Result<CacheHandle> {
    if let Some(handle) = self.handles()?.get(&logical) {
      return Ok(handle.clone());
    }

    let version = self
      .current_version()
      .ok_or_else(|| eyre!("No active cache version; cannot open {} cache", logical))?;

    let handle = self.open_version(logical, &version)?;
    self.handles()?.insert(logical, handle.clone());
    Ok(handle)
  }

  /// Open a logical cache of an explicit version, creating the generation.
  pub fn open_version(&self, logical: LogicalCache, version: &str) -> Result<CacheHandle> {
    let handle = self.handle_for(logical, version);
    self.storage.create_generation(&handle)?;
    Ok(handle)
  }

  /// Handle for a generation without creating it; the first write creates it.
  pub fn handle_for(&self, logical: LogicalCache, version: &str) -> CacheHandle {
    CacheHandle {
      logical,
      version: version.to_string(),
      name: self.physical_name(logical, version),
    }
  }

  pub fn match_entry(&self, handle: &CacheHandle, key: &CacheKey) -> Result<Option<CachedEntry>> {
    self.storage.get_entry(handle, key)
  }

  /// Store a response. Writing an existing key replaces the previous entry.
  /// Writes through a handle of a retired version are dropped, so an in-flight
  /// fetch cannot resurrect a purged generation.
  pub fn put(&self, handle: &CacheHandle, key: &CacheKey, response: &Response) -> Result<()> {
    if let Some(current) = self.current_version() {
      if current != handle.version() {
        debug!("dropping write to retired generation {}", handle.name());
        return Ok(());
      }
    }

    self.storage.put_entry(handle, key, response)?;

    if let Some(max) = self.limits.max_entries(handle.logical()) {
      let removed = self.storage.trim_generation(handle.name(), max)?;
      if removed > 0 {
        debug!("evicted {} entries from {}", removed, handle.name());
      }
    }
    Ok(())
  }

  /// Write a set of entries all-or-nothing.
  pub fn seed(&self, handle: &CacheHandle, entries: &[(CacheKey, Response)]) -> Result<()> {
    self.storage.put_entries(handle, entries)
  }

  pub fn delete_generation(&self, name: &str) -> Result<bool> {
    self.handles()?.retain(|_, handle| handle.name() != name);
    self.storage.delete_generation(name)
  }

  pub fn list_generations(&self) -> Result<Vec<String>> {
    self.storage.list_generations()
  }

  #[cfg(test)]
  pub fn entry_count(&self, handle: &CacheHandle) -> Result<usize> {
    self.storage.entry_count(handle.name())
  }

  /// Delete every prefixed generation that does not belong to `version`.
  /// Returns the deleted names.
  pub fn purge_stale(&self, version: &str) -> Result<Vec<String>> {
    let expected = self.expected_generations(version);
    let owned_prefix = format!("{}-", self.prefix);

    let mut deleted = Vec::new();
    for name in self.list_generations()? {
      if !name.starts_with(&owned_prefix) || expected.contains(&name) {
        continue;
      }
      if self.delete_generation(&name)? {
        info!("deleted stale cache generation {}", name);
        deleted.push(name);
      }
    }
    Ok(deleted)
  }

  /// Delete every generation. The gateway is cold until requests repopulate it.
  pub fn clear_all(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.list_generations()? {
      match self.delete_generation(&name) {
        Ok(true) => deleted.push(name),
        Ok(false) => {}
        Err(e) => warn!("failed to delete generation {}: {}", name, e),
      }
    }
    self.handles()?.clear();
    Ok(deleted)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::net::Request;
  use std::sync::Arc;

  fn manager(limits: CacheLimits) -> CacheStoreManager {
    let db = Arc::new(Database::in_memory().unwrap());
    CacheStoreManager::new(SqliteStorage::new(db), "gym", limits)
  }

  fn key(url: &str) -> CacheKey {
    CacheKey::from_request(&Request::parse(url).unwrap(), &[])
  }

  #[test]
  fn test_open_requires_current_version() {
    let caches = manager(CacheLimits::default());
    assert!(caches.open(LogicalCache::Dynamic).is_err());

    caches.set_current_version(Some("v1".to_string())).unwrap();
    let handle = caches.open(LogicalCache::Dynamic).unwrap();
    assert_eq!(handle.name(), "gym-dynamic-v1");
    assert_eq!(caches.list_generations().unwrap(), vec!["gym-dynamic-v1"]);
  }

  #[test]
  fn test_put_replaces_entry() {
    let caches = manager(CacheLimits::default());
    caches.set_current_version(Some("v1".to_string())).unwrap();
    let handle = caches.open(LogicalCache::Dynamic).unwrap();
    let k = key("https://app.example.com/plan");

    caches.put(&handle, &k, &Response::ok("first")).unwrap();
    caches.put(&handle, &k, &Response::ok("second")).unwrap();

    let entry = caches.match_entry(&handle, &k).unwrap().unwrap();
    assert_eq!(entry.response.body, b"second");
    assert_eq!(entry.url, "https://app.example.com/plan");
    assert_eq!(caches.entry_count(&handle).unwrap(), 1);
  }

  #[test]
  fn test_headers_survive_storage() {
    let caches = manager(CacheLimits::default());
    caches.set_current_version(Some("v1".to_string())).unwrap();
    let handle = caches.open(LogicalCache::Static).unwrap();
    let k = key("https://app.example.com/app.css");
    let response = Response::ok("body{}").with_header("Content-Type", "text/css");

    caches.put(&handle, &k, &response).unwrap();
    let entry = caches.match_entry(&handle, &k).unwrap().unwrap();
    assert_eq!(entry.response, response);
  }

  #[test]
  fn test_purge_stale_keeps_current_version() {
    let caches = manager(CacheLimits::default());
    for logical in LogicalCache::ALL {
      caches.open_version(logical, "v1").unwrap();
      caches.open_version(logical, "v2").unwrap();
    }
    caches.open_version(LogicalCache::Static, "v3").unwrap();

    let deleted = caches.purge_stale("v2").unwrap();
    assert_eq!(deleted.len(), 4);

    let remaining = caches.list_generations().unwrap();
    assert_eq!(
      remaining,
      vec!["gym-dynamic-v2", "gym-images-v2", "gym-static-v2"]
    );
  }

  #[test]
  fn test_purge_ignores_foreign_generations() {
    let db = Arc::new(Database::in_memory().unwrap());
    let ours = CacheStoreManager::new(SqliteStorage::new(db.clone()), "gym", CacheLimits::default());
    let theirs = CacheStoreManager::new(SqliteStorage::new(db), "other", CacheLimits::default());
    theirs.open_version(LogicalCache::Static, "v1").unwrap();
    ours.open_version(LogicalCache::Static, "v1").unwrap();

    ours.purge_stale("v2").unwrap();
    assert_eq!(ours.list_generations().unwrap(), vec!["other-static-v1"]);
  }

  #[test]
  fn test_delete_generation_removes_entries() {
    let caches = manager(CacheLimits::default());
    let handle = caches.open_version(LogicalCache::Images, "v1").unwrap();
    let k = key("https://app.example.com/a.png");
    caches.put(&handle, &k, &Response::ok("png")).unwrap();

    assert!(caches.delete_generation(handle.name()).unwrap());
    assert!(!caches.delete_generation(handle.name()).unwrap());
    assert!(caches.match_entry(&handle, &k).unwrap().is_none());
  }

  #[test]
  fn test_clear_all_leaves_cold_state() {
    let caches = manager(CacheLimits::default());
    caches.set_current_version(Some("v1".to_string())).unwrap();
    let handle = caches.open(LogicalCache::Dynamic).unwrap();
    let k = key("https://app.example.com/plan");
    caches.put(&handle, &k, &Response::ok("plan")).unwrap();

    let deleted = caches.clear_all().unwrap();
    assert_eq!(deleted, vec!["gym-dynamic-v1"]);
    assert!(caches.list_generations().unwrap().is_empty());

    // Reopening recreates an empty generation
    let handle = caches.open(LogicalCache::Dynamic).unwrap();
    assert!(caches.match_entry(&handle, &k).unwrap().is_none());
  }

  #[test]
  fn test_entry_bound_evicts_oldest() {
    let caches = manager(CacheLimits {
      dynamic_max_entries: Some(2),
      images_max_entries: None,
    });
    caches.set_current_version(Some("v1".to_string())).unwrap();
    let handle = caches.open(LogicalCache::Dynamic).unwrap();

    for page in ["a", "b", "c"] {
      let k = key(&format!("https://app.example.com/{}", page));
      caches.put(&handle, &k, &Response::ok(page)).unwrap();
    }

    assert_eq!(caches.entry_count(&handle).unwrap(), 2);
    assert!(caches
      .match_entry(&handle, &key("https://app.example.com/a"))
      .unwrap()
      .is_none());
    assert!(caches
      .match_entry(&handle, &key("https://app.example.com/c"))
      .unwrap()
      .is_some());
  }

  #[test]
  fn test_write_to_retired_generation_is_dropped() {
    let caches = manager(CacheLimits::default());
    caches.set_current_version(Some("v1".to_string())).unwrap();
    let old = caches.open(LogicalCache::Dynamic).unwrap();

    caches.set_current_version(Some("v2".to_string())).unwrap();
    caches.purge_stale("v2").unwrap();
    caches
      .put(&old, &key("https://app.example.com/late"), &Response::ok("late"))
      .unwrap();

    assert!(caches.list_generations().unwrap().is_empty());
  }

  #[test]
  fn test_static_generation_is_never_trimmed() {
    let caches = manager(CacheLimits {
      dynamic_max_entries: Some(1),
      images_max_entries: Some(1),
    });
    let handle = caches.open_version(LogicalCache::Static, "v1").unwrap();
    let entries: Vec<(CacheKey, Response)> = ["/", "/offline.html", "/app.js"]
      .iter()
      .map(|p| (key(&format!("https://app.example.com{}", p)), Response::ok(*p)))
      .collect();

    caches.seed(&handle, &entries).unwrap();
    caches
      .put(&handle, &key("https://app.example.com/extra"), &Response::ok("x"))
      .unwrap();
    assert_eq!(caches.entry_count(&handle).unwrap(), 4);
  }
}
