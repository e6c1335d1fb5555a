use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

use super::{Request, Response};

/// A failed network round trip.
///
/// An HTTP error status is not a `FetchError`; it arrives as a `Response`.
#[derive(Error, Debug)]
pub enum FetchError {
  #[error("Network error: {0}")]
  Network(#[from] reqwest::Error),

  #[error("Network unavailable: {0}")]
  Unavailable(String),
}

/// The network side of the gateway.
pub trait Fetcher: Send + Sync {
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, FetchError>>;
}

/// reqwest-backed fetcher.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpFetcher {
  client: Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, FetchError>> {
    let client = self.client.clone();

    async move {
      debug!("fetching {}", request);

      let mut builder = client.request(request.method.clone(), request.url.clone());
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if let Some(body) = request.body {
        builder = builder.body(body);
      }

      let response = builder.send().await?;
      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
      let body = response.bytes().await?.to_vec();

      Ok(Response {
        status,
        headers,
        body,
      })
    }
    .boxed()
  }
}
