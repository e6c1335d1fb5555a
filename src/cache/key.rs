//! Canonical request keys.

use sha2::{Digest, Sha256};

use crate::net::Request;

/// Canonicalized request identity: method, URL without fragment, and the
/// values of the configured key headers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  method: String,
  url: String,
  vary: Vec<(String, String)>,
}

impl CacheKey {
  pub fn from_request(request: &Request, key_headers: &[String]) -> Self {
    let mut url = request.url.clone();
    url.set_fragment(None);

    let mut vary: Vec<(String, String)> = key_headers
      .iter()
      .map(|name| {
        let name = name.to_lowercase();
        let value = request.header(&name).unwrap_or_default().trim().to_string();
        (name, value)
      })
      .collect();
    vary.sort();
    vary.dedup();

    Self {
      method: request.method.as_str().to_uppercase(),
      url: url.to_string(),
      vary,
    }
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// SHA256 hex digest used as the storage key.
  pub fn digest(&self) -> String {
    let mut input = format!("{} {}", self.method, self.url);
    for (name, value) in &self.vary {
      input.push('\n');
      input.push_str(name);
      input.push(':');
      input.push_str(value);
    }

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}
