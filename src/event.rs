use color_eyre::Result;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::cache::CacheResult;
use crate::lifecycle::LifecycleState;
use crate::net::{Request, Response};
use crate::push::Notification;

/// Events delivered to the gateway
#[derive(Debug)]
pub enum Event {
  /// Install the configured version
  Install,
  /// Clients of the previous version are gone
  ClientsReleased,
  /// Intercepted resource request
  Fetch {
    request: Request,
    respond_to: oneshot::Sender<Result<CacheResult<Response>>>,
  },
  /// Host-to-gateway control message
  Message(String),
  /// Connectivity restored for a sync tag
  Sync(String),
  /// Inbound push payload
  Push(Option<Vec<u8>>),
  /// User interacted with a notification
  NotificationClick {
    action: Option<String>,
    token: Option<String>,
  },
}

/// Events delivered from the gateway to the host application
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum HostEvent {
  StateChanged {
    version: String,
    state: LifecycleState,
  },
  ShowNotification(Notification),
  OpenView {
    url: String,
    token: Option<String>,
  },
  SyncFinished {
    tag: String,
    ok: bool,
    error: Option<String>,
  },
  CachesCleared {
    deleted: Vec<String>,
  },
}

/// Sending side of the host channel. Events are dropped once the host stops listening.
#[derive(Debug, Clone, Default)]
pub struct HostEvents {
  tx: Option<mpsc::UnboundedSender<HostEvent>>,
}

impl HostEvents {
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx: Some(tx) }, rx)
  }

  /// A sink nobody listens to
  #[cfg(test)]
  pub fn detached() -> Self {
    Self::default()
  }

  pub fn emit(&self, event: HostEvent) {
    if let Some(tx) = &self.tx {
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(event);
    }
  }
}

/// Inbound event queue feeding the gateway loop.
///
/// The loop ends once every sender has been dropped and the queue is drained.
pub struct EventLoop {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventLoop {
  pub fn channel() -> (mpsc::UnboundedSender<Event>, Self) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Self { rx })
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
