mod cache;
mod config;
mod event;
mod generation;
mod lifecycle;
mod logging;
mod manifest;
mod network;
mod pipeline;
mod prefetch;
mod registry;
mod rewrite;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheSource, CacheStore, MemoryStore, RequestContext, SqliteStore};
use crate::event::{Event, EventHandler, Message};
use crate::lifecycle::Lifecycle;
use crate::manifest::Manifest;
use crate::network::{HttpNetwork, Network};

#[derive(Parser, Debug)]
#[command(name = "offline-cache")]
#[command(about = "Interception and caching layer that keeps a hosted app usable offline")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-cache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Local origin that bundled assets are served from
  #[arg(long)]
  origin: Option<String>,

  /// Directory for the cache database and logs
  #[arg(long)]
  data_dir: Option<PathBuf>,

  /// Keep the cache in memory only
  #[arg(long)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install, activate and serve JSON-lines messages from stdin
  Run,
  /// Install this build's generation (minimal manifest only)
  Install,
  /// Activate this build's generation, delete stale ones and prefetch deferred assets
  Activate,
  /// Dispatch requests through the interception pipeline
  Fetch {
    urls: Vec<String>,
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Client id the requests belong to
    #[arg(long)]
    client: Option<String>,
  },
  /// Show the effective target and cache key for URLs
  Rewrite { urls: Vec<String> },
  /// List stored generations
  Generations,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Command line overrides
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(data_dir) = args.data_dir {
    config.data_dir = Some(data_dir);
  }

  let _guard = logging::init(&config.log, &config.data_dir()?)?;

  if args.ephemeral {
    execute(Arc::new(MemoryStore::new()), args.command, &config).await
  } else {
    let store = SqliteStore::open(&config.database_path()?)?;
    execute(Arc::new(store), args.command, &config).await
  }
}

async fn execute<S: CacheStore + 'static>(
  store: Arc<S>,
  command: Command,
  config: &config::Config,
) -> Result<()> {
  let origin = config.origin_url()?;
  let network = Arc::new(HttpNetwork::new(origin.clone(), config.request_timeout())?);
  let lifecycle = Lifecycle::new(
    Arc::clone(&store),
    network,
    origin,
    Manifest::builtin(),
    config.prefetch_concurrency,
  )?;

  match command {
    Command::Run => run(Arc::new(lifecycle), config.tick_rate()).await,
    Command::Install => {
      lifecycle.install().await?;
      println!("installed {}", lifecycle.generation_name());
      Ok(())
    }
    Command::Activate => {
      let cleanup = lifecycle.activate()?;
      for name in &cleanup.deleted {
        println!("deleted {}", name);
      }
      for name in &cleanup.failed {
        eprintln!("could not delete {}", name);
      }
      println!("active {}", lifecycle.generation_name());

      if let Some(report) = lifecycle.finish_prefetch().await {
        println!(
          "prefetched {} assets, {} failed",
          report.stored,
          report.failed.len()
        );
      }
      Ok(())
    }
    Command::Fetch {
      urls,
      method,
      client,
    } => {
      for url in urls {
        let line = serve(&lifecycle, &url, &method, client.as_deref()).await;
        println!("{}", line);
      }
      Ok(())
    }
    Command::Rewrite { urls } => {
      let pipeline = lifecycle.pipeline();
      for url in urls {
        let parsed = Url::parse(&url).map_err(|e| eyre!("Invalid URL {}: {}", url, e))?;
        let rewrite = pipeline.rewrite(&RequestContext::get(parsed));
        let rule = pipeline
          .rewriter()
          .matching_rule(&url)
          .map(|r| r.fragment.as_str())
          .unwrap_or("-");
        println!(
          "{} -> {} key={} rule={} bypass={}",
          url,
          rewrite.target,
          cache::cache_key(&rewrite.target, pipeline.rewriter().origin()),
          rule,
          pipeline.is_bypassed(&url)
        );
      }
      Ok(())
    }
    Command::Generations => {
      let active = store.active_generation()?;
      for generation in store.generations()? {
        let marker = if active.as_deref() == Some(generation.name.as_str()) {
          "*"
        } else {
          " "
        };
        println!(
          "{} {} entries={} created={}",
          marker,
          generation.name,
          generation.entries,
          generation.created_at.format("%Y-%m-%d %H:%M:%S")
        );
      }
      Ok(())
    }
  }
}

/// Long-running mode: lifecycle plus request dispatch from stdin.
async fn run<S: CacheStore + 'static, N: Network>(
  lifecycle: Arc<Lifecycle<S, N>>,
  tick_rate: Duration,
) -> Result<()> {
  let mut events = EventHandler::new(tick_rate);
  let mut in_flight = JoinSet::new();
  let installer = lifecycle.start();

  while let Some(event) = events.next().await {
    match event {
      Event::Tick => {
        if let Err(e) = lifecycle.check() {
          warn!("lifecycle check failed: {}", e);
        }
      }
      Event::Message(Message::ForceActivate) => lifecycle.force_activate(),
      Event::Message(Message::Register { client }) => {
        let pipeline = lifecycle.pipeline();
        pipeline.register_client(&client)?;
        info!(%client, clients = pipeline.clients().len()?, "client registered");
      }
      Event::Message(Message::Release { client }) => {
        let pipeline = lifecycle.pipeline();
        if pipeline.release_client(&client)? {
          info!(%client, clients = pipeline.clients().len()?, "client released");
        }
      }
      Event::Message(Message::Fetch {
        url,
        method,
        client,
      }) => {
        let lifecycle = Arc::clone(&lifecycle);
        in_flight.spawn(async move {
          let line = serve(&lifecycle, &url, &method, client.as_deref()).await;
          println!("{}", line);
        });
      }
      Event::Invalid(line) => warn!("ignoring message: {}", line),
      Event::Closed => break,
    }

    // Reap finished requests
    while in_flight.try_join_next().is_some() {}
  }

  while in_flight.join_next().await.is_some() {}
  if let Err(e) = installer.await {
    warn!("install task failed: {}", e);
  }

  if let Some(report) = lifecycle.finish_prefetch().await {
    info!(
      stored = report.stored,
      failed = report.failed.len(),
      "deferred prefetch complete"
    );
  }

  Ok(())
}

/// Dispatch one request and describe the outcome as a JSON line.
async fn serve<S: CacheStore + 'static, N: Network>(
  lifecycle: &Lifecycle<S, N>,
  url: &str,
  method: &str,
  client: Option<&str>,
) -> serde_json::Value {
  let parsed = match Url::parse(url) {
    Ok(parsed) => parsed,
    Err(e) => return json!({ "url": url, "outcome": "error", "error": e.to_string() }),
  };

  let mut ctx = RequestContext::get(parsed).with_method(method);
  if let Some(client) = client {
    ctx = ctx.with_client(client);
  }

  match lifecycle.dispatch(ctx).await {
    Ok(served) => json!({
      "url": url,
      "outcome": served.source.label(),
      "stored": matches!(served.source, CacheSource::Network { stored: true }),
      "status": served.response.status,
      "bytes": served.response.body.len(),
      "key": served.key,
    }),
    Err(e) => json!({ "url": url, "outcome": "error", "error": e.to_string() }),
  }
}
