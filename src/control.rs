//! Host-to-gateway control messages

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
  /// Activate a waiting version now
  SkipWaiting,
  /// Delete every cache generation
  ClearCache,
}

struct Known {
  message: ControlMessage,
  name: &'static str,
}

const KNOWN: &[Known] = &[
  Known {
    message: ControlMessage::SkipWaiting,
    name: "SKIP_WAITING",
  },
  Known {
    message: ControlMessage::ClearCache,
    name: "CLEAR_CACHE",
  },
];

#[derive(Deserialize)]
struct Envelope {
  #[serde(rename = "type")]
  kind: String,
}

impl ControlMessage {
  /// Parse a raw message: a bare name (`skip-waiting`, `SKIP_WAITING`, ...)
  /// or a JSON object `{"type": "SKIP_WAITING"}`. Anything else is `None`.
  pub fn parse(raw: &str) -> Option<Self> {
    let raw = raw.trim();
    if raw.starts_with('{') {
      let envelope: Envelope = serde_json::from_str(raw).ok()?;
      return Self::by_name(&envelope.kind);
    }
    Self::by_name(raw)
  }

  fn by_name(name: &str) -> Option<Self> {
    let normalized = name.trim().replace('-', "_").to_uppercase();
    KNOWN
      .iter()
      .find(|k| k.name == normalized)
      .map(|k| k.message)
  }
}
