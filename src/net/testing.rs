//! Scripted fetcher for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use super::{FetchError, Fetcher, Request, Response};

#[derive(Clone)]
enum Route {
  Respond(Response, Option<Duration>),
  Fail,
}

/// Answers requests from a URL table. Unknown URLs fail as if offline.
#[derive(Default)]
pub struct MockFetcher {
  routes: Mutex<HashMap<String, Route>>,
  calls: Mutex<Vec<Request>>,
}

impl MockFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, status: u16, body: &str) {
    self.set(url, Route::Respond(Response::new(status, body), None));
  }

  pub fn respond_after(&self, url: &str, delay: Duration, body: &str) {
    self.set(url, Route::Respond(Response::ok(body), Some(delay)));
  }

  pub fn fail(&self, url: &str) {
    self.set(url, Route::Fail);
  }

  fn set(&self, url: &str, route: Route) {
    self.routes.lock().unwrap().insert(url.to_string(), route);
  }

  /// Number of requests seen for a URL
  pub fn calls(&self, url: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url.as_str() == url)
      .count()
  }

  pub fn total_calls(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn requests(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }
}

impl Fetcher for MockFetcher {
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, FetchError>> {
    let route = self.routes.lock().unwrap().get(request.url.as_str()).cloned();
    let url = request.url.to_string();
    self.calls.lock().unwrap().push(request);

    async move {
      match route {
        Some(Route::Respond(response, delay)) => {
          if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
          }
          Ok(response)
        }
        Some(Route::Fail) | None => Err(FetchError::Unavailable(url)),
      }
    }
    .boxed()
  }
}
