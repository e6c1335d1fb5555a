//! Request classification.
//!
//! `Router::classify` is an ordered, total function from a request to either
//! a bypass reason or a route. The first matching rule wins:
//!
//! 1. bypass: non-http(s) scheme, untrusted origin, non-GET method
//! 2. API call → network-first, dynamic store
//! 3. image → cache-first, image store, placeholder fallback
//! 4. script/stylesheet → stale-while-revalidate, dynamic store
//! 5. navigation → network-first, dynamic store, offline document fallback
//! 6. anything else → network-first, dynamic store

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use url::{Origin, Url};

use crate::cache::LogicalCache;
use crate::config::Config;
use crate::net::{Destination, Request};
use crate::strategy::StrategyKind;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "avif", "bmp"];
const SCRIPT_EXTENSIONS: &[&str] = &["js", "mjs"];
const STYLE_EXTENSIONS: &[&str] = &["css"];

/// Class of an intercepted resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
  Api,
  Image,
  Script,
  Style,
  Navigation,
  Other,
}

/// Why a request passes through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bypass {
  UnsupportedScheme,
  UntrustedOrigin,
  UncacheableMethod,
}

/// Terminal fallback resource of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
  OfflineDocument,
  PlaceholderImage,
}

/// Strategy, target cache and fallback for a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
  pub class: ResourceClass,
  pub strategy: StrategyKind,
  pub cache: LogicalCache,
  pub fallback: Option<Fallback>,
}

impl Route {
  /// The fixed routing table.
  pub fn for_class(class: ResourceClass) -> Self {
    let (strategy, cache, fallback) = match class {
      ResourceClass::Api => (StrategyKind::NetworkFirst, LogicalCache::Dynamic, None),
      ResourceClass::Image => (
        StrategyKind::CacheFirst,
        LogicalCache::Images,
        Some(Fallback::PlaceholderImage),
      ),
      ResourceClass::Script | ResourceClass::Style => (
        StrategyKind::StaleWhileRevalidate,
        LogicalCache::Dynamic,
        None,
      ),
      ResourceClass::Navigation => (
        StrategyKind::NetworkFirst,
        LogicalCache::Dynamic,
        Some(Fallback::OfflineDocument),
      ),
      ResourceClass::Other => (StrategyKind::NetworkFirst, LogicalCache::Dynamic, None),
    };

    Self {
      class,
      strategy,
      cache,
      fallback,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
  Bypass(Bypass),
  Route(Route),
}

#[derive(Debug, Clone)]
pub struct Router {
  origin: Origin,
  trusted: Vec<Origin>,
  backend_hosts: Vec<String>,
  api_prefixes: Vec<String>,
}

impl Router {
  pub fn from_config(config: &Config) -> Result<Self> {
    let trusted = config
      .trusted_origins
      .iter()
      .map(|o| {
        Url::parse(o)
          .map(|u| u.origin())
          .map_err(|e| eyre!("Invalid trusted origin '{}': {}", o, e))
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(Self {
      origin: config.origin_url()?.origin(),
      trusted,
      backend_hosts: config
        .routing
        .backend_hosts
        .iter()
        .map(|h| h.trim_start_matches('.').to_lowercase())
        .collect(),
      api_prefixes: config.routing.api_path_prefixes.clone(),
    })
  }

  pub fn classify(&self, request: &Request) -> Decision {
    if let Some(reason) = self.bypass_reason(request) {
      return Decision::Bypass(reason);
    }
    Decision::Route(Route::for_class(self.resource_class(request)))
  }

  fn bypass_reason(&self, request: &Request) -> Option<Bypass> {
    if !matches!(request.url.scheme(), "http" | "https") {
      return Some(Bypass::UnsupportedScheme);
    }

    let origin = request.url.origin();
    if origin != self.origin && !self.trusted.contains(&origin) {
      return Some(Bypass::UntrustedOrigin);
    }

    if request.method != Method::GET {
      return Some(Bypass::UncacheableMethod);
    }

    None
  }

  fn resource_class(&self, request: &Request) -> ResourceClass {
    let extension = request.extension();
    let has_extension = |list: &[&str]| {
      extension
        .as_deref()
        .map(|ext| list.contains(&ext))
        .unwrap_or(false)
    };

    if self.is_api(request) {
      ResourceClass::Api
    } else if request.destination == Destination::Image || has_extension(IMAGE_EXTENSIONS) {
      ResourceClass::Image
    } else if request.destination == Destination::Script || has_extension(SCRIPT_EXTENSIONS) {
      ResourceClass::Script
    } else if request.destination == Destination::Style || has_extension(STYLE_EXTENSIONS) {
      ResourceClass::Style
    } else if request.is_navigation() {
      ResourceClass::Navigation
    } else {
      ResourceClass::Other
    }
  }

  fn is_api(&self, request: &Request) -> bool {
    let path = request.url.path();
    if self.api_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
      return true;
    }

    let wants_data = request.destination == Destination::Empty
      && request
        .header("accept")
        .map(|a| a.contains("application/json"))
        .unwrap_or(false);
    if wants_data {
      return true;
    }

    match request.url.host_str() {
      Some(host) => {
        let host = host.to_lowercase();
        self
          .backend_hosts
          .iter()
          .any(|b| host == *b || host.ends_with(&format!(".{}", b)))
      }
      None => false,
    }
  }
}
