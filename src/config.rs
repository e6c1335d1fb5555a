use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::CacheLimits;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin of the application shell, e.g. https://app.example.com
  pub origin: String,
  /// Version tag embedded in physical cache names
  pub version: String,
  #[serde(default = "default_cache_prefix")]
  pub cache_prefix: String,
  /// External origins whose responses may be cached
  #[serde(default)]
  pub trusted_origins: Vec<String>,
  #[serde(default)]
  pub routing: RoutingConfig,
  #[serde(default)]
  pub shell: ShellConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub notifications: NotificationConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Database location (default: $XDG_DATA_HOME/shellgate/gateway.db)
  pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
  /// Hosts of backend platforms; subdomains match too
  #[serde(default)]
  pub backend_hosts: Vec<String>,
  /// Path prefixes that mark API calls
  #[serde(default = "default_api_prefixes")]
  pub api_path_prefixes: Vec<String>,
}

impl Default for RoutingConfig {
  fn default() -> Self {
    Self {
      backend_hosts: Vec::new(),
      api_path_prefixes: default_api_prefixes(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
  /// Resources seeded into the static cache at install, in order
  #[serde(default = "default_manifest")]
  pub manifest: Vec<String>,
  #[serde(default = "default_offline_document")]
  pub offline_document: String,
  #[serde(default = "default_placeholder_image")]
  pub placeholder_image: String,
}

impl Default for ShellConfig {
  fn default() -> Self {
    Self {
      manifest: default_manifest(),
      offline_document: default_offline_document(),
      placeholder_image: default_placeholder_image(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// Request headers that take part in the cache key (case-insensitive)
  #[serde(default)]
  pub key_headers: Vec<String>,
  pub dynamic_max_entries: Option<usize>,
  pub images_max_entries: Option<usize>,
}

impl CacheConfig {
  pub fn limits(&self) -> CacheLimits {
    CacheLimits {
      dynamic_max_entries: self.dynamic_max_entries,
      images_max_entries: self.images_max_entries,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_timeout_secs(),
    }
  }
}

impl NetworkConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
  #[serde(default = "default_notification_title")]
  pub title: String,
  #[serde(default = "default_notification_body")]
  pub default_body: String,
  #[serde(default = "default_icon")]
  pub icon: String,
  #[serde(default = "default_icon")]
  pub badge: String,
  /// Vibration pattern in milliseconds (on, off, on, ...)
  #[serde(default = "default_vibrate")]
  pub vibrate: Vec<u32>,
  /// View opened by the "view" action
  #[serde(default = "default_view_path")]
  pub view_path: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      title: default_notification_title(),
      default_body: default_notification_body(),
      icon: default_icon(),
      badge: default_icon(),
      vibrate: default_vibrate(),
      view_path: default_view_path(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Endpoint receiving replayed workouts
  #[serde(default = "default_workouts_endpoint")]
  pub workouts_endpoint: String,
  /// Host-written outbox (default: $XDG_DATA_HOME/shellgate/workout-outbox.json)
  pub outbox_path: Option<PathBuf>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      workouts_endpoint: default_workouts_endpoint(),
      outbox_path: None,
    }
  }
}

fn default_cache_prefix() -> String {
  "shellgate".to_string()
}

fn default_api_prefixes() -> Vec<String> {
  vec!["/api/".to_string()]
}

fn default_manifest() -> Vec<String> {
  ["/", "/index.html", "/manifest.json", "/offline.html", "/icons/placeholder.svg"]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_offline_document() -> String {
  "/offline.html".to_string()
}

fn default_placeholder_image() -> String {
  "/icons/placeholder.svg".to_string()
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_notification_title() -> String {
  "Coach".to_string()
}

fn default_notification_body() -> String {
  "You have a new update from your coach".to_string()
}

fn default_icon() -> String {
  "/icons/icon-192.png".to_string()
}

fn default_vibrate() -> Vec<u32> {
  vec![100, 50, 100]
}

fn default_view_path() -> String {
  "/workouts".to_string()
}

fn default_workouts_endpoint() -> String {
  "/api/workouts/sync".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellgate.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellgate/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/shellgate/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shellgate.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellgate").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.origin_url()?;
    Ok(config)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve a path or absolute URL against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid resource path '{}': {}", path, e))
  }

  /// Manifest resources as absolute URLs, in manifest order.
  pub fn manifest_urls(&self) -> Result<Vec<Url>> {
    self.shell.manifest.iter().map(|p| self.resolve(p)).collect()
  }

  pub fn outbox_path(&self) -> Result<PathBuf> {
    match &self.sync.outbox_path {
      Some(p) => Ok(p.clone()),
      None => Ok(crate::db::data_dir()?.join("workout-outbox.json")),
    }
  }
}
