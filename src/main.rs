mod cache;
mod config;
mod control;
mod db;
mod event;
mod gateway;
mod lifecycle;
mod net;
mod push;
mod router;
mod strategy;
mod sync;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cache::CacheSource;
use crate::config::Config;
use crate::db::Database;
use crate::event::{Event, EventLoop, HostEvent, HostEvents};
use crate::gateway::Gateway;
use crate::net::{Destination, HttpFetcher, Request, RequestMode};

#[derive(Parser, Debug)]
#[command(name = "shellgate")]
#[command(about = "An offline-first resource caching gateway for web application shells")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shellgate/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Override the configured cache version
  #[arg(long, global = true)]
  cache_version: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured version, seeding the shell cache
  Install,
  /// Activate an installed version once the previous one has no clients
  Activate,
  /// Serve a request through the gateway
  Fetch {
    url: String,
    /// Request destination (document, image, script, style, font, manifest)
    #[arg(long)]
    dest: Option<Destination>,
    /// Treat as a top-level navigation
    #[arg(long)]
    navigate: bool,
    /// Request mode (navigate, same-origin, cors, no-cors)
    #[arg(long)]
    mode: Option<RequestMode>,
    /// Accept header
    #[arg(long)]
    accept: Option<String>,
    /// Write the body to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Send a control message (SKIP_WAITING, CLEAR_CACHE)
  Message { raw: String },
  /// Replay a sync tag, or every pending tag
  Sync {
    tag: Option<String>,
    /// Only mark the tag pending
    #[arg(long)]
    register: bool,
  },
  /// Deliver a push payload
  Push { payload: Option<String> },
  /// Click a notification action (view, close)
  Click {
    action: Option<String>,
    #[arg(long)]
    token: Option<String>,
  },
  /// List cache generations
  Generations,
  /// Show lifecycle and sync state
  Status,
}

/// Metadata printed for a served request.
#[derive(Serialize)]
struct Served {
  url: String,
  status: u16,
  source: CacheSource,
  cached_at: Option<String>,
  bytes: usize,
}

/// Log to stderr and to a daily rolling file under the data directory.
/// The returned guard flushes the file writer on drop.
fn init_tracing() -> Result<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shellgate=info"));

  let log_dir = db::data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;
  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "shellgate.log"));

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(io::stderr))
    .with(fmt::layer().with_ansi(false).with_writer(file_writer))
    .with(filter)
    .init();

  Ok(guard)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;

  // Override version if specified on command line
  let config = if let Some(version) = args.cache_version {
    Config { version, ..config }
  } else {
    config
  };

  let _guard = init_tracing()?;
  info!("shellgate {} starting", config.version);

  let db = Arc::new(Database::open(config.database_path.as_deref())?);
  let fetcher = Arc::new(HttpFetcher::new(config.network.timeout())?);
  let (host, mut host_rx) = HostEvents::channel();
  let gateway = Arc::new(Gateway::new(&config, db, fetcher, host)?);

  let result = run_command(&config, &gateway, args.command).await;
  print_host_events(&mut host_rx)?;
  result
}

async fn run_command(config: &Config, gateway: &Arc<Gateway>, command: Command) -> Result<()> {
  match command {
    Command::Install => gateway.dispatch(Event::Install).await,
    Command::Activate => gateway.dispatch(Event::ClientsReleased).await,
    Command::Fetch {
      url,
      dest,
      navigate,
      mode,
      accept,
      output,
    } => {
      let mut request = if navigate {
        Request::navigate(config.resolve(&url)?)
      } else {
        Request::get(config.resolve(&url)?)
      };
      if let Some(dest) = dest {
        request = request.with_destination(dest);
      }
      if let Some(mode) = mode {
        request = request.with_mode(mode);
      }
      if let Some(accept) = accept {
        request = request.with_header("accept", &accept);
      }
      fetch(gateway, request, output.as_deref()).await
    }
    Command::Message { raw } => gateway.dispatch(Event::Message(raw)).await,
    Command::Sync { tag, register } => match (tag, register) {
      (Some(tag), true) => gateway.sync().register(&tag),
      (None, true) => Err(eyre!("--register needs a tag")),
      (Some(tag), false) => gateway.dispatch(Event::Sync(tag)).await,
      (None, false) => {
        let completed = gateway.sync().replay_pending().await?;
        info!("{} sync tags completed", completed.len());
        Ok(())
      }
    },
    Command::Push { payload } => {
      gateway
        .dispatch(Event::Push(payload.map(String::into_bytes)))
        .await
    }
    Command::Click { action, token } => {
      gateway
        .dispatch(Event::NotificationClick { action, token })
        .await
    }
    Command::Generations => {
      for name in gateway.caches().list_generations()? {
        println!("{}", name);
      }
      Ok(())
    }
    Command::Status => print_json(&gateway.status()?),
  }
}

/// Serve a request through the gateway event loop and write the result.
async fn fetch(gateway: &Arc<Gateway>, request: Request, output: Option<&Path>) -> Result<()> {
  let (tx, events) = EventLoop::channel();
  let runner = tokio::spawn(Arc::clone(gateway).run(events));

  let url = request.url.to_string();
  let (respond_to, response) = oneshot::channel();
  tx.send(Event::Fetch {
    request,
    respond_to,
  })
  .map_err(|e| eyre!("Gateway stopped: {}", e))?;
  drop(tx);

  let served = response
    .await
    .map_err(|e| eyre!("Gateway dropped the request: {}", e))??;
  runner
    .await
    .map_err(|e| eyre!("Gateway task failed: {}", e))??;

  let meta = Served {
    url,
    status: served.data.status,
    source: served.source,
    cached_at: served.cached_at.map(db::state::timestamp),
    bytes: served.data.body.len(),
  };

  match output {
    Some(path) => {
      std::fs::write(path, &served.data.body)
        .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
      print_json(&meta)
    }
    None => {
      info!("{} {} from {:?}", meta.status, meta.url, meta.source);
      io::stdout()
        .write_all(&served.data.body)
        .map_err(|e| eyre!("Failed to write response body: {}", e))
    }
  }
}

fn print_host_events(rx: &mut mpsc::UnboundedReceiver<HostEvent>) -> Result<()> {
  while let Ok(event) = rx.try_recv() {
    print_json(&event)?;
  }
  Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let line = serde_json::to_string(value).map_err(|e| eyre!("Failed to serialize output: {}", e))?;
  println!("{}", line);
  Ok(())
}
