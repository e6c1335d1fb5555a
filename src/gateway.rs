//! The gateway: wires the router, strategies, lifecycle, sync and push
//! handling behind one event dispatch.

use std::sync::Arc;

use color_eyre::Result;
use serde::Serialize;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::cache::{CacheResult, CacheStoreManager, SqliteStorage};
use crate::config::Config;
use crate::control::ControlMessage;
use crate::db::state::PendingTag;
use crate::db::Database;
use crate::event::{Event, EventLoop, HostEvent, HostEvents};
use crate::lifecycle::{LifecycleController, LifecycleState};
use crate::net::{Fetcher, Request, Response};
use crate::push::{ClickOutcome, PushHandler};
use crate::router::{Decision, Router};
use crate::strategy::{FallbackResources, StrategyLayer};
use crate::sync::{FileOutbox, SyncQueue, WorkoutSync, WORKOUT_SYNC_TAG};

/// Snapshot of the gateway for the host.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
  pub version: String,
  pub state: LifecycleState,
  pub active_version: Option<String>,
  pub generations: Vec<String>,
  pub pending_sync: Vec<PendingTag>,
}

pub struct Gateway {
  router: Router,
  strategies: StrategyLayer,
  caches: Arc<CacheStoreManager>,
  lifecycle: LifecycleController,
  sync: SyncQueue,
  push: PushHandler,
  fetcher: Arc<dyn Fetcher>,
  host: HostEvents,
}

impl Gateway {
  pub fn new(
    config: &Config,
    db: Arc<Database>,
    fetcher: Arc<dyn Fetcher>,
    host: HostEvents,
  ) -> Result<Self> {
    let caches = Arc::new(CacheStoreManager::new(
      SqliteStorage::new(db.clone()),
      config.cache_prefix.clone(),
      config.cache.limits(),
    ));

    let strategies = StrategyLayer::new(
      caches.clone(),
      fetcher.clone(),
      FallbackResources {
        offline_document: config.resolve(&config.shell.offline_document)?,
        placeholder_image: config.resolve(&config.shell.placeholder_image)?,
      },
      config.cache.key_headers.clone(),
    );

    let lifecycle = LifecycleController::new(
      config.version.clone(),
      config.manifest_urls()?,
      config.cache.key_headers.clone(),
      caches.clone(),
      fetcher.clone(),
      db.clone(),
      host.clone(),
    );
    lifecycle.restore()?;

    let workouts = WorkoutSync::new(
      Arc::new(FileOutbox::new(config.outbox_path()?)),
      fetcher.clone(),
      config.resolve(&config.sync.workouts_endpoint)?,
    );
    let sync = SyncQueue::new(db, host.clone()).with_handler(WORKOUT_SYNC_TAG, Arc::new(workouts));

    let view_url = config.resolve(&config.notifications.view_path)?;
    let push = PushHandler::new(config.notifications.clone(), view_url.to_string());

    Ok(Self {
      router: Router::from_config(config)?,
      strategies,
      caches,
      lifecycle,
      sync,
      push,
      fetcher,
      host,
    })
  }

  pub fn lifecycle(&self) -> &LifecycleController {
    &self.lifecycle
  }

  pub fn caches(&self) -> &CacheStoreManager {
    &self.caches
  }

  pub fn sync(&self) -> &SyncQueue {
    &self.sync
  }

  /// Serve an intercepted request.
  ///
  /// Bypassed requests, and every request while no version is active, go
  /// straight to the network.
  pub async fn intercept(&self, request: Request) -> Result<CacheResult<Response>> {
    match self.router.classify(&request) {
      Decision::Bypass(reason) => {
        debug!("{} bypassed: {:?}", request, reason);
        self.passthrough(request).await
      }
      Decision::Route(route) => {
        if self.caches.current_version().is_none() {
          debug!("{} passed through: no active version", request);
          return self.passthrough(request).await;
        }
        debug!("{} classified as {:?}", request, route.class);
        self.strategies.execute(&route, &request).await
      }
    }
  }

  async fn passthrough(&self, request: Request) -> Result<CacheResult<Response>> {
    let response = self.fetcher.fetch(request).await?;
    Ok(CacheResult::from_network(response))
  }

  /// Handle one event.
  pub async fn dispatch(&self, event: Event) -> Result<()> {
    match event {
      Event::Install => self.lifecycle.install().await,
      Event::ClientsReleased => self.lifecycle.release_clients().await,
      Event::Fetch {
        request,
        respond_to,
      } => {
        let result = self.intercept(request).await;
        if respond_to.send(result).is_err() {
          debug!("requester went away before the response was ready");
        }
        Ok(())
      }
      Event::Message(raw) => self.handle_message(&raw).await,
      Event::Sync(tag) => self.sync.on_sync(&tag).await.map(|_| ()),
      Event::Push(payload) => {
        let notification = self.push.decode(payload.as_deref());
        info!("showing notification: {}", notification.body);
        self.host.emit(HostEvent::ShowNotification(notification));
        Ok(())
      }
      Event::NotificationClick { action, token } => {
        match self.push.on_click(action.as_deref()) {
          ClickOutcome::OpenView(url) => {
            info!("opening {}", url);
            self.host.emit(HostEvent::OpenView { url, token });
          }
          ClickOutcome::Dismissed => debug!("notification dismissed"),
        }
        Ok(())
      }
    }
  }

  pub async fn handle_message(&self, raw: &str) -> Result<()> {
    match ControlMessage::parse(raw) {
      Some(ControlMessage::SkipWaiting) => self.lifecycle.skip_waiting().await,
      Some(ControlMessage::ClearCache) => {
        let deleted = self.caches.clear_all()?;
        info!("cleared {} cache generations", deleted.len());
        self.host.emit(HostEvent::CachesCleared { deleted });
        Ok(())
      }
      None => {
        info!("ignoring unrecognized message '{}'", raw);
        Ok(())
      }
    }
  }

  /// Drive the gateway until every event sender is gone.
  ///
  /// Fetches run as separate tasks and interleave; every other event is
  /// handled in arrival order. Returns once every fetch and the background
  /// refreshes they started have finished.
  pub async fn run(self: Arc<Self>, mut events: EventLoop) -> Result<()> {
    let mut fetches = JoinSet::new();

    while let Some(event) = events.next().await {
      while let Some(finished) = fetches.try_join_next() {
        log_fetch_task(finished);
      }

      if let Event::Fetch { .. } = event {
        let gateway = Arc::clone(&self);
        fetches.spawn(async move {
          if let Err(e) = gateway.dispatch(event).await {
            warn!("fetch handling failed: {}", e);
          }
        });
        continue;
      }

      if let Err(e) = self.dispatch(event).await {
        warn!("event handling failed: {}", e);
      }
    }

    while let Some(finished) = fetches.join_next().await {
      log_fetch_task(finished);
    }
    self.settle().await;
    Ok(())
  }

  /// Wait for background cache refreshes.
  pub async fn settle(&self) {
    self.strategies.settle().await;
  }

  pub fn status(&self) -> Result<Status> {
    Ok(Status {
      version: self.lifecycle.version().to_string(),
      state: self.lifecycle.state(),
      active_version: self.caches.current_version(),
      generations: self.caches.list_generations()?,
      pending_sync: self.sync.pending()?,
    })
  }
}

fn log_fetch_task(result: std::result::Result<(), JoinError>) {
  if let Err(e) = result {
    warn!("fetch task failed: {}", e);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheKey, CacheSource, LogicalCache};
  use crate::net::testing::MockFetcher;
  use tokio::sync::{mpsc, oneshot};
  use url::Url;

  const IMAGE: &str = "https://app.example.com/img/squat.png";

  struct Fixture {
    gateway: Arc<Gateway>,
    network: Arc<MockFetcher>,
    host_rx: mpsc::UnboundedReceiver<HostEvent>,
  }

  fn fixture() -> Fixture {
    let yaml = format!(
      r#"
origin: https://app.example.com
version: v1
cache_prefix: gym
shell:
  manifest: [/, /offline.html]
sync:
  outbox_path: {}
"#,
      std::env::temp_dir()
        .join(format!("shellgate-gateway-{}.json", std::process::id()))
        .display()
    );
    let config = Config::from_yaml(&yaml).unwrap();

    let network = Arc::new(MockFetcher::new());
    network.respond("https://app.example.com/", 200, "<html>shell</html>");
    network.respond("https://app.example.com/offline.html", 200, "<html>offline</html>");

    let (host, host_rx) = HostEvents::channel();
    let db = Arc::new(Database::in_memory().unwrap());
    let fetcher: Arc<dyn Fetcher> = network.clone();
    let gateway = Arc::new(Gateway::new(&config, db, fetcher, host).unwrap());

    Fixture {
      gateway,
      network,
      host_rx,
    }
  }

  fn drain(rx: &mut mpsc::UnboundedReceiver<HostEvent>) -> Vec<HostEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
      events.push(event);
    }
    events
  }

  #[tokio::test]
  async fn test_passthrough_without_active_version() {
    let f = fixture();
    f.network.respond(IMAGE, 200, "png");

    let result = f.gateway.intercept(Request::parse(IMAGE).unwrap()).await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert!(f.gateway.caches().list_generations().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_shell_served_offline_after_install() {
    let f = fixture();
    f.gateway.dispatch(Event::Install).await.unwrap();
    assert_eq!(f.gateway.lifecycle().state(), LifecycleState::Active);

    f.network.fail("https://app.example.com/");
    let request = Request::navigate(Url::parse("https://app.example.com/").unwrap());
    let result = f.gateway.intercept(request).await.unwrap();

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.text(), "<html>shell</html>");
  }

  #[tokio::test]
  async fn test_clear_cache_forces_network() {
    let mut f = fixture();
    f.gateway.dispatch(Event::Install).await.unwrap();
    f.network.respond(IMAGE, 200, "png");

    f.gateway.intercept(Request::parse(IMAGE).unwrap()).await.unwrap();
    let hit = f.gateway.intercept(Request::parse(IMAGE).unwrap()).await.unwrap();
    assert_eq!(hit.source, CacheSource::Cache);
    assert_eq!(f.network.calls(IMAGE), 1);

    f.gateway
      .dispatch(Event::Message("CLEAR_CACHE".to_string()))
      .await
      .unwrap();

    let miss = f.gateway.intercept(Request::parse(IMAGE).unwrap()).await.unwrap();
    assert_eq!(miss.source, CacheSource::Network);
    assert_eq!(f.network.calls(IMAGE), 2);

    let cleared = drain(&mut f.host_rx)
      .into_iter()
      .find_map(|e| match e {
        HostEvent::CachesCleared { deleted } => Some(deleted),
        _ => None,
      })
      .unwrap();
    assert!(cleared.contains(&"gym-static-v1".to_string()));
    assert!(cleared.contains(&"gym-images-v1".to_string()));
  }

  #[tokio::test]
  async fn test_unknown_message_is_ignored() {
    let mut f = fixture();
    f.gateway.dispatch(Event::Install).await.unwrap();
    drain(&mut f.host_rx);

    f.gateway
      .dispatch(Event::Message("RELOAD_EVERYTHING".to_string()))
      .await
      .unwrap();

    assert!(drain(&mut f.host_rx).is_empty());
    assert_eq!(f.gateway.caches().list_generations().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_bypassed_request_is_not_cached() {
    let f = fixture();
    f.gateway.dispatch(Event::Install).await.unwrap();
    let url = "https://tracker.example.net/pixel.png";
    f.network.respond(url, 200, "gif");

    f.gateway.intercept(Request::parse(url).unwrap()).await.unwrap();
    f.gateway.intercept(Request::parse(url).unwrap()).await.unwrap();

    assert_eq!(f.network.calls(url), 2);
  }

  #[tokio::test]
  async fn test_push_and_click() {
    let mut f = fixture();

    f.gateway
      .dispatch(Event::Push(Some(b"Leg day ready".to_vec())))
      .await
      .unwrap();
    let token = match drain(&mut f.host_rx).pop() {
      Some(HostEvent::ShowNotification(n)) => {
        assert_eq!(n.body, "Leg day ready");
        n.token
      }
      other => panic!("expected a notification, got {:?}", other),
    };

    f.gateway
      .dispatch(Event::NotificationClick {
        action: Some("view".to_string()),
        token: Some(token.clone()),
      })
      .await
      .unwrap();
    assert_eq!(
      drain(&mut f.host_rx),
      vec![HostEvent::OpenView {
        url: "https://app.example.com/workouts".to_string(),
        token: Some(token),
      }]
    );

    f.gateway
      .dispatch(Event::NotificationClick {
        action: Some("close".to_string()),
        token: None,
      })
      .await
      .unwrap();
    assert!(drain(&mut f.host_rx).is_empty());
  }

  #[tokio::test]
  async fn test_event_loop_dispatches_in_order() {
    let mut f = fixture();
    let (tx, events) = EventLoop::channel();
    let runner = tokio::spawn(Arc::clone(&f.gateway).run(events));

    tx.send(Event::Install).unwrap();
    let (respond_to, response) = oneshot::channel();
    let request = Request::navigate(Url::parse("https://app.example.com/").unwrap());
    tx.send(Event::Fetch {
      request,
      respond_to,
    })
    .unwrap();
    tx.send(Event::Push(None)).unwrap();
    drop(tx);

    let served = response.await.unwrap().unwrap();
    assert_eq!(served.data.text(), "<html>shell</html>");
    runner.await.unwrap().unwrap();

    let events = drain(&mut f.host_rx);
    assert!(events.contains(&HostEvent::StateChanged {
      version: "v1".to_string(),
      state: LifecycleState::Active,
    }));
    assert!(events.iter().any(|e| matches!(
      e,
      HostEvent::ShowNotification(n) if n.body == "You have a new update from your coach"
    )));
  }

  #[tokio::test]
  async fn test_event_loop_finishes_background_refresh() {
    let f = fixture();
    f.gateway.dispatch(Event::Install).await.unwrap();

    let script = "https://app.example.com/assets/app.js";
    let key = CacheKey::from_request(&Request::parse(script).unwrap(), &[]);
    let handle = f.gateway.caches().open(LogicalCache::Dynamic).unwrap();
    f.gateway
      .caches()
      .put(&handle, &key, &Response::ok("old"))
      .unwrap();
    f.network.respond(script, 200, "new");

    // One fetch, then the sender goes away, as a single CLI invocation does
    let (tx, events) = EventLoop::channel();
    let runner = tokio::spawn(Arc::clone(&f.gateway).run(events));
    let (respond_to, response) = oneshot::channel();
    tx.send(Event::Fetch {
      request: Request::parse(script).unwrap(),
      respond_to,
    })
    .unwrap();
    drop(tx);

    let served = response.await.unwrap().unwrap();
    runner.await.unwrap().unwrap();

    assert_eq!(served.source, CacheSource::CacheStale);
    assert_eq!(served.data.text(), "old");
    let cached = f.gateway.caches().match_entry(&handle, &key).unwrap().unwrap();
    assert_eq!(cached.response.text(), "new");
  }

  #[tokio::test]
  async fn test_status_reports_pending_sync() {
    let f = fixture();
    f.gateway.dispatch(Event::Install).await.unwrap();
    f.gateway.sync().register(WORKOUT_SYNC_TAG).unwrap();

    let status = f.gateway.status().unwrap();
    assert_eq!(status.state, LifecycleState::Active);
    assert_eq!(status.active_version.as_deref(), Some("v1"));
    assert_eq!(status.generations, vec!["gym-static-v1"]);
    let tags: Vec<&str> = status.pending_sync.iter().map(|p| p.tag.as_str()).collect();
    assert_eq!(tags, vec![WORKOUT_SYNC_TAG]);
    assert_eq!(status.pending_sync[0].attempts, 0);
    assert!(status.pending_sync[0].last_error.is_none());
  }
}
