use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use url::Url;

/// What the requester intends to do with the response (`Sec-Fetch-Dest`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Destination {
  Document,
  Image,
  Script,
  Style,
  Font,
  Manifest,
  /// `fetch()` / XHR calls
  #[default]
  Empty,
  Other,
}

impl FromStr for Destination {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_lowercase().as_str() {
      "document" | "iframe" | "frame" => Ok(Self::Document),
      "image" => Ok(Self::Image),
      "script" | "worker" | "sharedworker" => Ok(Self::Script),
      "style" => Ok(Self::Style),
      "font" => Ok(Self::Font),
      "manifest" => Ok(Self::Manifest),
      "" | "empty" => Ok(Self::Empty),
      "other" => Ok(Self::Other),
      other => Err(eyre!("Unknown request destination: {}", other)),
    }
  }
}

/// Request mode; `Navigate` marks a full-page load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  Navigate,
  SameOrigin,
  #[default]
  Cors,
  NoCors,
}

impl FromStr for RequestMode {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_lowercase().as_str() {
      "navigate" => Ok(Self::Navigate),
      "same-origin" => Ok(Self::SameOrigin),
      "cors" => Ok(Self::Cors),
      "no-cors" => Ok(Self::NoCors),
      other => Err(eyre!("Unknown request mode: {}", other)),
    }
  }
}

/// An intercepted outbound request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  /// Header names are stored lowercase
  pub headers: BTreeMap<String, String>,
  pub destination: Destination,
  pub mode: RequestMode,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: BTreeMap::new(),
      destination: Destination::default(),
      mode: RequestMode::default(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// Parse an absolute URL into a GET request.
  pub fn parse(url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid request URL '{}': {}", url, e))?;
    Ok(Self::get(url))
  }

  /// A top-level document load.
  pub fn navigate(url: Url) -> Self {
    Self::get(url)
      .with_destination(Destination::Document)
      .with_mode(RequestMode::Navigate)
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = Some(body);
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_lowercase()).map(String::as_str)
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate || self.destination == Destination::Document
  }

  /// Lowercased extension of the last path segment, if any.
  pub fn extension(&self) -> Option<String> {
    let segment = self.url.path_segments()?.last()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
      return None;
    }
    Some(ext.to_lowercase())
  }
}

impl fmt::Display for Request {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}
