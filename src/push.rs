//! Push payload decoding and notification actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::NotificationConfig;

pub const ACTION_VIEW: &str = "view";
pub const ACTION_CLOSE: &str = "close";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

/// Notification handed to the host for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub actions: Vec<NotificationAction>,
  /// Correlation token echoed back on click
  pub token: String,
  /// View opened by the "view" action
  pub url: String,
}

/// What the host should do after a notification click.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  OpenView(String),
  Dismissed,
}

#[derive(Deserialize)]
struct StructuredPayload {
  body: String,
  title: Option<String>,
}

pub struct PushHandler {
  config: NotificationConfig,
  view_url: String,
}

impl PushHandler {
  /// `view_url` is the absolute URL opened by the "view" action.
  pub fn new(config: NotificationConfig, view_url: impl Into<String>) -> Self {
    Self {
      config,
      view_url: view_url.into(),
    }
  }

  pub fn decode(&self, payload: Option<&[u8]>) -> Notification {
    self.decode_at(payload, Utc::now())
  }

  fn decode_at(&self, payload: Option<&[u8]>, received_at: DateTime<Utc>) -> Notification {
    let (title, body) = self.read_payload(payload);
    let token = correlation_token(&body, received_at);

    Notification {
      title,
      body,
      icon: self.config.icon.clone(),
      badge: self.config.badge.clone(),
      vibrate: self.config.vibrate.clone(),
      actions: vec![
        NotificationAction {
          action: ACTION_VIEW.to_string(),
          title: "View".to_string(),
        },
        NotificationAction {
          action: ACTION_CLOSE.to_string(),
          title: "Close".to_string(),
        },
      ],
      token,
      url: self.view_url.clone(),
    }
  }

  fn read_payload(&self, payload: Option<&[u8]>) -> (String, String) {
    let default = (self.config.title.clone(), self.config.default_body.clone());

    let text = match payload.map(std::str::from_utf8) {
      Some(Ok(text)) if !text.is_empty() => text,
      Some(Err(e)) => {
        debug!("push payload is not UTF-8 ({}), using default message", e);
        return default;
      }
      _ => return default,
    };

    if text.trim_start().starts_with('{') {
      if let Ok(structured) = serde_json::from_str::<StructuredPayload>(text) {
        return (
          structured.title.unwrap_or(default.0),
          structured.body,
        );
      }
    }

    (default.0, text.to_string())
  }

  pub fn on_click(&self, action: Option<&str>) -> ClickOutcome {
    match action {
      Some(ACTION_VIEW) => ClickOutcome::OpenView(self.view_url.clone()),
      Some(ACTION_CLOSE) | None => ClickOutcome::Dismissed,
      Some(other) => {
        debug!("unknown notification action '{}'", other);
        ClickOutcome::Dismissed
      }
    }
  }
}

fn correlation_token(body: &str, received_at: DateTime<Utc>) -> String {
  let mut hasher = Sha256::new();
  hasher.update(body.as_bytes());
  hasher.update(received_at.to_rfc3339().as_bytes());
  hex::encode(&hasher.finalize()[..16])
}
