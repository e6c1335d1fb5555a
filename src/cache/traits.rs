//! Result types shared by the strategies and the gateway.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Data served from a cache, optionally while a refresh runs in the background.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, revalidating: bool) -> Self {
    Self {
      data,
      source: if revalidating {
        CacheSource::CacheStale
      } else {
        CacheSource::Cache
      },
      cached_at: Some(cached_at),
    }
  }

  /// Cached data served because the network failed.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// A fixed fallback resource.
  pub fn fallback(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      cached_at: None,
    }
  }
}

/// Indicates where served data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Cache hit, network not consulted
  Cache,
  /// Cache hit served while a background refresh is in flight
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
  /// Offline document or placeholder image
  Fallback,
}
