use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use prsync::cache::{CacheLayer, CacheSource, DurableStore, NoopStore, SqliteStore};
use prsync::config::Config;
use prsync::model::{Entity, EntityKey, EntityKind};
use prsync::remote::{HttpRemote, RemoteSource};
use prsync::service::EntityService;
use prsync::store::MemoryStateStore;
use prsync::sync::{SyncEvent, SyncOrchestrator};

#[derive(Parser, Debug)]
#[command(name = "prsync")]
#[command(about = "Offline-first cache and sync for pull requests and comment threads")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/prsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Increase log verbosity (-v info, -vv debug, -vvv trace)
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the background synchronizer and print its events
  Watch {
    /// Containers to sync (overrides the config file)
    #[arg(short = 'C', long = "container")]
    containers: Vec<String>,
  },
  /// Fetch one pull request (or comment thread) through the cache
  Show {
    container: String,
    id: String,
    /// Look up a comment thread instead of a pull request
    #[arg(long)]
    thread: bool,
  },
  /// Inspect or reset the durable cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// Print entry count and size on disk
  Stats,
  /// Delete every cached entry
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = prsync::logging::init(args.verbose, config.log_dir.as_deref())?;

  match args.command {
    Command::Watch { containers } => watch(config, containers).await,
    Command::Show { container, id, thread } => show(config, container, id, thread).await,
    Command::Cache { action } => cache_command(config, action).await,
  }
}

fn open_cache(config: &Config) -> Result<CacheLayer<Entity>> {
  let store: Arc<dyn DurableStore> = if config.cache.persist {
    Arc::new(SqliteStore::open()?)
  } else {
    Arc::new(NoopStore)
  };
  Ok(CacheLayer::new(store, config.cache.options()))
}

fn open_remote(config: &Config) -> Result<Arc<dyn RemoteSource>> {
  Ok(Arc::new(HttpRemote::new(&config.remote, Config::api_token())?))
}

async fn watch(mut config: Config, containers: Vec<String>) -> Result<()> {
  if !containers.is_empty() {
    config.sync.containers = containers;
  }
  if config.sync.containers.is_empty() {
    return Err(eyre!("No containers to sync. Set sync.containers or pass --container"));
  }

  let cache = open_cache(&config)?;
  let orchestrator = SyncOrchestrator::builder(open_remote(&config)?, Arc::new(MemoryStateStore::new()), cache.clone())
    .config(config.sync.clone())
    .retry(config.retry)
    .build();

  let shutdown = CancellationToken::new();
  let sweeper = cache.start_sweeper(config.cache.sweep_interval(), shutdown.clone());
  let mut events = orchestrator.subscribe();
  orchestrator.start();

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = events.recv() => match event {
        Ok(event) => print_event(&event),
        Err(RecvError::Lagged(skipped)) => warn!("Event printer fell behind, skipped {}", skipped),
        Err(RecvError::Closed) => break,
      },
    }
  }

  info!("Shutting down");
  orchestrator.dispose();
  shutdown.cancel();
  let _ = sweeper.await;
  cache.flush().await;

  let status = orchestrator.status();
  println!(
    "{} pulls, {} retries, {} pending conflicts, {} queued tasks",
    status.counters.entity_pulls, status.counters.retries, status.counters.conflicts, status.queued_tasks
  );
  Ok(())
}

fn print_event(event: &SyncEvent) {
  match serde_json::to_string(event) {
    Ok(line) => println!("{}", line),
    Err(e) => warn!("Failed to serialize event: {}", e),
  }
}

async fn show(config: Config, container: String, id: String, thread: bool) -> Result<()> {
  let cache = open_cache(&config)?;
  let service = EntityService::new(open_remote(&config)?, cache.clone(), config.retry.pull);

  let kind = if thread {
    EntityKind::CommentThread
  } else {
    EntityKind::PullRequest
  };
  let result = service
    .get_entity(kind, &EntityKey::new(container, id))
    .await
    .map_err(|e| eyre!("Failed to fetch entity: {}", e))?;

  let source = match (result.source, result.cached_at) {
    (CacheSource::Cache, Some(at)) => format!("cache, stored {}", at.to_rfc3339()),
    _ => "network".to_string(),
  };
  println!("{} ({})", serde_json::to_string_pretty(&result.data)?, source);

  // Let the write-behind worker persist the entry before exit
  cache.flush().await;
  Ok(())
}

async fn cache_command(config: Config, action: CacheAction) -> Result<()> {
  if !config.cache.persist {
    return Err(eyre!("Durable cache is disabled (cache.persist: false)"));
  }

  let store = SqliteStore::open()?;
  match action {
    CacheAction::Stats => {
      let (rows, bytes) = store.usage()?;
      println!("{}: {} entries, {} bytes", SqliteStore::default_path()?.display(), rows, bytes);
    }
    CacheAction::Clear => {
      for key in store.keys().await? {
        store.delete(&key).await?;
      }
      println!("Cache cleared");
    }
  }
  Ok(())
}
