//! Network strategies: network-first, cache-first, stale-while-revalidate.

use std::sync::{Arc, Mutex};

use color_eyre::Result;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheHandle, CacheKey, CacheResult, CacheStoreManager, LogicalCache};
use crate::net::{Fetcher, Request, Response};
use crate::router::{Fallback, Route};

const OFFLINE_HTML: &str = "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You are offline</h1><p>This page will be available again once you reconnect.</p></body></html>\n";

const PLACEHOLDER_SVG: &str = "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"200\" height=\"200\" \
viewBox=\"0 0 200 200\"><rect width=\"200\" height=\"200\" fill=\"#e5e7eb\"/></svg>\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
  NetworkFirst,
  CacheFirst,
  StaleWhileRevalidate,
}

/// Locations of the fallback resources inside the shell cache.
#[derive(Debug, Clone)]
pub struct FallbackResources {
  pub offline_document: Url,
  pub placeholder_image: Url,
}

/// Strategy layer that runs a route against the caches and the network.
///
/// Response snapshots are owned values: the copy written to a cache and the
/// copy returned to the caller are always distinct.
pub struct StrategyLayer {
  caches: Arc<CacheStoreManager>,
  fetcher: Arc<dyn Fetcher>,
  fallbacks: FallbackResources,
  key_headers: Vec<String>,
  revalidations: Mutex<JoinSet<()>>,
}

impl StrategyLayer {
  pub fn new(
    caches: Arc<CacheStoreManager>,
    fetcher: Arc<dyn Fetcher>,
    fallbacks: FallbackResources,
    key_headers: Vec<String>,
  ) -> Self {
    Self {
      caches,
      fetcher,
      fallbacks,
      key_headers,
      revalidations: Mutex::new(JoinSet::new()),
    }
  }

  pub fn key_for(&self, request: &Request) -> CacheKey {
    CacheKey::from_request(request, &self.key_headers)
  }

  /// Serve a request according to its route.
  pub async fn execute(&self, route: &Route, request: &Request) -> Result<CacheResult<Response>> {
    debug!("{} via {:?} ({})", request, route.strategy, route.cache);
    match route.strategy {
      StrategyKind::NetworkFirst => self.network_first(request, route.cache, route.fallback).await,
      StrategyKind::CacheFirst => self.cache_first(request, route.cache, route.fallback).await,
      StrategyKind::StaleWhileRevalidate => self.stale_while_revalidate(request, route.cache).await,
    }
  }

  /// Fetch a resource with network-first strategy.
  ///
  /// 1. Fetch from network; store a copy and return the live response
  /// 2. On network failure, return the cached entry (target cache, then shell cache)
  /// 3. Without a cached entry, return the route's fallback, or propagate the failure
  pub async fn network_first(
    &self,
    request: &Request,
    cache: LogicalCache,
    fallback: Option<Fallback>,
  ) -> Result<CacheResult<Response>> {
    let handle = self.caches.open(cache)?;
    let key = self.key_for(request);

    match self.fetcher.fetch(request.clone()).await {
      Ok(response) => {
        self.store(&handle, &key, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(error) => {
        warn!("network failed for {}: {}", request, error);

        if let Some(entry) = self.lookup(&handle, &key)? {
          debug!("serving {} from cache while offline", entry.url);
          return Ok(CacheResult::offline(entry.response, entry.cached_at));
        }

        match fallback {
          Some(fallback) => Ok(CacheResult::fallback(self.fallback_response(fallback)?)),
          None => Err(error.into()),
        }
      }
    }
  }

  /// Fetch a resource with cache-first strategy.
  ///
  /// A cached entry is returned without touching the network. A miss is
  /// fetched and stored; a failed fetch returns the route's fallback.
  pub async fn cache_first(
    &self,
    request: &Request,
    cache: LogicalCache,
    fallback: Option<Fallback>,
  ) -> Result<CacheResult<Response>> {
    let handle = self.caches.open(cache)?;
    let key = self.key_for(request);

    if let Some(entry) = self.caches.match_entry(&handle, &key)? {
      return Ok(CacheResult::from_cache(entry.response, entry.cached_at, false));
    }

    match self.fetcher.fetch(request.clone()).await {
      Ok(response) => {
        self.store(&handle, &key, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(error) => {
        warn!("network failed for {}: {}", request, error);
        match fallback {
          Some(fallback) => Ok(CacheResult::fallback(self.fallback_response(fallback)?)),
          None => Err(error.into()),
        }
      }
    }
  }

  /// Fetch a resource with stale-while-revalidate strategy.
  ///
  /// A cached entry is returned at once while a background task refreshes it.
  /// Refresh failures are logged, never surfaced. On a miss the caller waits
  /// for the network.
  pub async fn stale_while_revalidate(
    &self,
    request: &Request,
    cache: LogicalCache,
  ) -> Result<CacheResult<Response>> {
    let handle = self.caches.open(cache)?;
    let key = self.key_for(request);

    if let Some(entry) = self.caches.match_entry(&handle, &key)? {
      self.spawn_revalidation(request.clone(), handle, key);
      return Ok(CacheResult::from_cache(entry.response, entry.cached_at, true));
    }

    let response = self.fetcher.fetch(request.clone()).await?;
    self.store(&handle, &key, &response);
    Ok(CacheResult::from_network(response))
  }

  fn spawn_revalidation(&self, request: Request, handle: CacheHandle, key: CacheKey) {
    let caches = Arc::clone(&self.caches);
    let fetcher = Arc::clone(&self.fetcher);

    let task = async move {
      match fetcher.fetch(request.clone()).await {
        Ok(response) if response.is_cacheable() => {
          if let Err(e) = caches.put(&handle, &key, &response) {
            warn!("failed to store refreshed {}: {}", request, e);
          } else {
            debug!("refreshed {}", request);
          }
        }
        Ok(response) => debug!("not refreshing {}: status {}", request, response.status),
        Err(e) => warn!("background refresh of {} failed: {}", request, e),
      }
    };

    match self.revalidations.lock() {
      Ok(mut tasks) => {
        // Reap finished refreshes so a long-running loop does not accumulate them
        while let Some(finished) = tasks.try_join_next() {
          if let Err(e) = finished {
            warn!("background refresh task failed: {}", e);
          }
        }
        tasks.spawn(task);
      }
      Err(e) => warn!("revalidation queue unavailable: {}", e),
    }
  }

  /// Wait until every background refresh has finished.
  pub async fn settle(&self) {
    loop {
      let mut tasks = match self.revalidations.lock() {
        Ok(mut tasks) => std::mem::replace(&mut *tasks, JoinSet::new()),
        Err(_) => return,
      };
      if tasks.is_empty() {
        return;
      }
      while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
          warn!("background refresh task failed: {}", e);
        }
      }
    }
  }

  #[cfg(test)]
  fn tracked_revalidations(&self) -> usize {
    self.revalidations.lock().map(|t| t.len()).unwrap_or(0)
  }

  /// Write a copy of a live response. Storage errors do not fail the request.
  fn store(&self, handle: &CacheHandle, key: &CacheKey, response: &Response) {
    if !response.is_cacheable() {
      debug!("not caching {} (status {})", key.url(), response.status);
      return;
    }
    if let Err(e) = self.caches.put(handle, key, response) {
      warn!("failed to cache {}: {}", key.url(), e);
    }
  }

  /// Cached entry for the key in the target cache, then in the shell cache.
  fn lookup(&self, handle: &CacheHandle, key: &CacheKey) -> Result<Option<crate::cache::CachedEntry>> {
    if let Some(entry) = self.caches.match_entry(handle, key)? {
      return Ok(Some(entry));
    }
    if handle.logical() == LogicalCache::Static {
      return Ok(None);
    }
    let shell = self.caches.open(LogicalCache::Static)?;
    self.caches.match_entry(&shell, key)
  }

  fn fallback_response(&self, fallback: Fallback) -> Result<Response> {
    let (url, builtin, content_type) = match fallback {
      Fallback::OfflineDocument => (
        &self.fallbacks.offline_document,
        OFFLINE_HTML,
        "text/html; charset=utf-8",
      ),
      Fallback::PlaceholderImage => (
        &self.fallbacks.placeholder_image,
        PLACEHOLDER_SVG,
        "image/svg+xml",
      ),
    };

    let shell = self.caches.open(LogicalCache::Static)?;
    let key = self.key_for(&Request::get(url.clone()));
    if let Some(entry) = self.caches.match_entry(&shell, &key)? {
      return Ok(entry.response);
    }

    debug!("{} not in shell cache, serving built-in {:?}", url, fallback);
    Ok(Response::ok(builtin).with_header("content-type", content_type))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheLimits, CacheSource, SqliteStorage};
  use crate::db::Database;
  use crate::net::testing::MockFetcher;
  use crate::net::FetchError;
  use std::time::{Duration, Instant};

  const PAGE: &str = "https://app.example.com/workouts";
  const IMAGE: &str = "https://app.example.com/img/squat.png";
  const SCRIPT: &str = "https://app.example.com/assets/app.js";
  const API: &str = "https://app.example.com/api/plans";

  struct Fixture {
    caches: Arc<CacheStoreManager>,
    network: Arc<MockFetcher>,
    layer: StrategyLayer,
  }

  fn fixture() -> Fixture {
    let db = Arc::new(Database::in_memory().unwrap());
    let caches = Arc::new(CacheStoreManager::new(
      SqliteStorage::new(db),
      "gym",
      CacheLimits::default(),
    ));
    caches.set_current_version(Some("v1".to_string())).unwrap();
    let network = Arc::new(MockFetcher::new());
    let fetcher: Arc<dyn Fetcher> = network.clone();
    let layer = StrategyLayer::new(
      caches.clone(),
      fetcher,
      FallbackResources {
        offline_document: Url::parse("https://app.example.com/offline.html").unwrap(),
        placeholder_image: Url::parse("https://app.example.com/icons/placeholder.svg").unwrap(),
      },
      Vec::new(),
    );
    Fixture {
      caches,
      network,
      layer,
    }
  }

  impl Fixture {
    fn seed(&self, cache: LogicalCache, url: &str, body: &str) {
      let handle = self.caches.open(cache).unwrap();
      let key = self.layer.key_for(&Request::parse(url).unwrap());
      self.caches.put(&handle, &key, &Response::ok(body)).unwrap();
    }

    fn cached(&self, cache: LogicalCache, url: &str) -> Option<String> {
      let handle = self.caches.open(cache).unwrap();
      let key = self.layer.key_for(&Request::parse(url).unwrap());
      self
        .caches
        .match_entry(&handle, &key)
        .unwrap()
        .map(|e| e.response.text())
    }
  }

  fn nav(url: &str) -> Request {
    Request::navigate(Url::parse(url).unwrap())
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let f = fixture();
    f.seed(LogicalCache::Images, IMAGE, "cached-bytes");
    f.network.respond(IMAGE, 200, "fresh-bytes");

    let result = f
      .layer
      .cache_first(&Request::parse(IMAGE).unwrap(), LogicalCache::Images, Some(Fallback::PlaceholderImage))
      .await
      .unwrap();

    assert_eq!(result.data.body, b"cached-bytes");
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(f.network.total_calls(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_miss_fetches_and_stores() {
    let f = fixture();
    f.network.respond(IMAGE, 200, "png");

    let result = f
      .layer
      .cache_first(&Request::parse(IMAGE).unwrap(), LogicalCache::Images, Some(Fallback::PlaceholderImage))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(f.cached(LogicalCache::Images, IMAGE).as_deref(), Some("png"));
  }

  #[tokio::test]
  async fn test_cache_first_failure_serves_placeholder() {
    let f = fixture();
    f.network.fail(IMAGE);

    let result = f
      .layer
      .cache_first(&Request::parse(IMAGE).unwrap(), LogicalCache::Images, Some(Fallback::PlaceholderImage))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Fallback);
    assert_eq!(result.data.header("content-type"), Some("image/svg+xml"));
  }

  #[tokio::test]
  async fn test_placeholder_prefers_shell_copy() {
    let f = fixture();
    f.seed(
      LogicalCache::Static,
      "https://app.example.com/icons/placeholder.svg",
      "<svg>shell</svg>",
    );
    f.network.fail(IMAGE);

    let result = f
      .layer
      .cache_first(&Request::parse(IMAGE).unwrap(), LogicalCache::Images, Some(Fallback::PlaceholderImage))
      .await
      .unwrap();

    assert_eq!(result.data.text(), "<svg>shell</svg>");
  }

  #[tokio::test]
  async fn test_network_first_stores_success() {
    let f = fixture();
    f.network.respond(API, 200, "[1,2]");

    let result = f
      .layer
      .network_first(&Request::parse(API).unwrap(), LogicalCache::Dynamic, None)
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.text(), "[1,2]");
    assert_eq!(f.cached(LogicalCache::Dynamic, API).as_deref(), Some("[1,2]"));
  }

  #[tokio::test]
  async fn test_network_first_does_not_store_errors() {
    let f = fixture();
    f.network.respond(API, 500, "boom");

    let result = f
      .layer
      .network_first(&Request::parse(API).unwrap(), LogicalCache::Dynamic, None)
      .await
      .unwrap();

    assert_eq!(result.data.status, 500);
    assert_eq!(f.cached(LogicalCache::Dynamic, API), None);
  }

  #[tokio::test]
  async fn test_network_first_offline_returns_cached() {
    let f = fixture();
    f.seed(LogicalCache::Dynamic, PAGE, "yesterday");
    f.network.fail(PAGE);

    let result = f
      .layer
      .network_first(&nav(PAGE), LogicalCache::Dynamic, Some(Fallback::OfflineDocument))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.text(), "yesterday");
  }

  #[tokio::test]
  async fn test_network_first_offline_uses_shell_cache() {
    let f = fixture();
    f.seed(LogicalCache::Static, "https://app.example.com/", "shell index");
    f.network.fail("https://app.example.com/");

    let result = f
      .layer
      .network_first(&nav("https://app.example.com/"), LogicalCache::Dynamic, Some(Fallback::OfflineDocument))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.text(), "shell index");
  }

  #[tokio::test]
  async fn test_navigation_without_cache_gets_offline_document() {
    let f = fixture();
    f.seed(LogicalCache::Static, "https://app.example.com/offline.html", "offline page");
    f.network.fail(PAGE);

    let result = f
      .layer
      .network_first(&nav(PAGE), LogicalCache::Dynamic, Some(Fallback::OfflineDocument))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Fallback);
    assert_eq!(result.data.text(), "offline page");
  }

  #[tokio::test]
  async fn test_navigation_builtin_offline_document() {
    let f = fixture();
    f.network.fail(PAGE);

    let result = f
      .layer
      .network_first(&nav(PAGE), LogicalCache::Dynamic, Some(Fallback::OfflineDocument))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Fallback);
    assert!(result.data.text().contains("You are offline"));
  }

  #[tokio::test]
  async fn test_network_first_without_fallback_propagates() {
    let f = fixture();
    f.network.fail(API);

    let err = f
      .layer
      .network_first(&Request::parse(API).unwrap(), LogicalCache::Dynamic, None)
      .await
      .unwrap_err();

    assert!(matches!(
      err.downcast_ref::<FetchError>(),
      Some(FetchError::Unavailable(_))
    ));
  }

  #[tokio::test]
  async fn test_swr_returns_stale_without_waiting() {
    let f = fixture();
    f.seed(LogicalCache::Dynamic, SCRIPT, "old");
    f.network
      .respond_after(SCRIPT, Duration::from_millis(400), "new");

    let started = Instant::now();
    let result = f
      .layer
      .stale_while_revalidate(&Request::parse(SCRIPT).unwrap(), LogicalCache::Dynamic)
      .await
      .unwrap();

    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(result.source, CacheSource::CacheStale);
    assert_eq!(result.data.text(), "old");

    f.layer.settle().await;
    assert_eq!(f.cached(LogicalCache::Dynamic, SCRIPT).as_deref(), Some("new"));
    assert_eq!(f.network.calls(SCRIPT), 1);
  }

  #[tokio::test]
  async fn test_swr_refresh_failure_is_swallowed() {
    let f = fixture();
    f.seed(LogicalCache::Dynamic, SCRIPT, "old");
    f.network.fail(SCRIPT);

    let result = f
      .layer
      .stale_while_revalidate(&Request::parse(SCRIPT).unwrap(), LogicalCache::Dynamic)
      .await
      .unwrap();
    f.layer.settle().await;

    assert_eq!(result.data.text(), "old");
    assert_eq!(f.cached(LogicalCache::Dynamic, SCRIPT).as_deref(), Some("old"));
  }

  #[tokio::test]
  async fn test_swr_miss_waits_for_network() {
    let f = fixture();
    f.network.respond(SCRIPT, 200, "fresh");

    let result = f
      .layer
      .stale_while_revalidate(&Request::parse(SCRIPT).unwrap(), LogicalCache::Dynamic)
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.text(), "fresh");
    assert_eq!(f.cached(LogicalCache::Dynamic, SCRIPT).as_deref(), Some("fresh"));
  }

  #[tokio::test]
  async fn test_swr_miss_offline_propagates() {
    let f = fixture();
    f.network.fail(SCRIPT);

    let result = f
      .layer
      .stale_while_revalidate(&Request::parse(SCRIPT).unwrap(), LogicalCache::Dynamic)
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_returned_copy_is_independent_of_stored_copy() {
    let f = fixture();
    f.network.respond(API, 200, "payload");

    let mut result = f
      .layer
      .network_first(&Request::parse(API).unwrap(), LogicalCache::Dynamic, None)
      .await
      .unwrap();
    result.data.body.clear();

    assert_eq!(f.cached(LogicalCache::Dynamic, API).as_deref(), Some("payload"));
  }

  /// Concurrent fetches of one key are not coordinated: both reach the
  /// network and the last completed write wins.
  #[tokio::test]
  async fn test_concurrent_fetches_last_writer_wins() {
    let f = fixture();
    let slow = Request::parse(API).unwrap();
    let fast = Request::parse(API).unwrap();

    f.network.respond_after(API, Duration::from_millis(100), "slow");
    let first = f.layer.network_first(&slow, LogicalCache::Dynamic, None);
    let second = async {
      tokio::time::sleep(Duration::from_millis(20)).await;
      f.network.respond(API, 200, "fast");
      f.layer.network_first(&fast, LogicalCache::Dynamic, None).await
    };

    let (a, b) = tokio::join!(first, second);
    assert_eq!(a.unwrap().data.text(), "slow");
    assert_eq!(b.unwrap().data.text(), "fast");
    assert_eq!(f.network.calls(API), 2);
    assert_eq!(f.cached(LogicalCache::Dynamic, API).as_deref(), Some("slow"));
  }

  #[tokio::test]
  async fn test_execute_dispatches_by_route() {
    let f = fixture();
    f.seed(LogicalCache::Images, IMAGE, "cached");

    let route = crate::router::Route::for_class(crate::router::ResourceClass::Image);
    let result = f.layer.execute(&route, &Request::parse(IMAGE).unwrap()).await.unwrap();
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(f.network.total_calls(), 0);
  }

  #[tokio::test]
  async fn test_finished_refreshes_are_reaped() {
    let f = fixture();
    f.seed(LogicalCache::Dynamic, SCRIPT, "old");
    f.network.respond(SCRIPT, 200, "new");

    for _ in 0..5 {
      f.layer
        .stale_while_revalidate(&Request::parse(SCRIPT).unwrap(), LogicalCache::Dynamic)
        .await
        .unwrap();
      tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(f.network.calls(SCRIPT), 5);
    assert!(f.layer.tracked_revalidations() <= 1);
    f.layer.settle().await;
    assert_eq!(f.layer.tracked_revalidations(), 0);
  }
}
