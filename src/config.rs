use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheOptions;
use crate::retry::RetryPolicy;
use crate::sync::{DrainMode, ResolutionStrategy};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  /// Directory for log files (logs go to stderr only when unset)
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub max_memory_entries: usize,
  pub default_ttl_secs: u64,
  pub sweep_interval_secs: u64,
  pub compression_threshold_bytes: usize,
  /// Keep a SQLite durable tier under the data directory
  pub persist: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_memory_entries: 500,
      default_ttl_secs: 300,
      sweep_interval_secs: 60,
      compression_threshold_bytes: 16 * 1024,
      persist: true,
    }
  }
}

impl CacheConfig {
  pub fn options(&self) -> CacheOptions {
    CacheOptions {
      max_memory_entries: self.max_memory_entries,
      default_ttl: i64::try_from(self.default_ttl_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX),
      compression_threshold: self.compression_threshold_bytes,
    }
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.sweep_interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Containers (repositories) to keep in sync
  pub containers: Vec<String>,
  pub entity_interval_secs: u64,
  pub thread_interval_secs: u64,
  pub activity_interval_secs: u64,
  pub probe_interval_secs: u64,
  pub batch_size: usize,
  pub drain_mode: DrainMode,
  pub max_recent_errors: usize,
  pub offline_queue_capacity: usize,
  pub task_max_retries: u32,
  /// Strategy applied to freshly detected conflicts; unset leaves them pending
  pub auto_resolve: Option<ResolutionStrategy>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      containers: Vec::new(),
      entity_interval_secs: 60,
      thread_interval_secs: 120,
      activity_interval_secs: 300,
      probe_interval_secs: 15,
      batch_size: 5,
      drain_mode: DrainMode::Batched,
      max_recent_errors: 20,
      offline_queue_capacity: 256,
      task_max_retries: 3,
      auto_resolve: None,
    }
  }
}

/// Retry policies per call site.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub pull: RetryPolicy,
  pub push: RetryPolicy,
  pub probe: RetryPolicy,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      pull: RetryPolicy::new(3, Duration::from_millis(1000)),
      push: RetryPolicy::new(2, Duration::from_millis(500)),
      probe: RetryPolicy::none(),
    }
  }
}

fn default_timeout_secs() -> u64 {
  30
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./prsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/prsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/prsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("prsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("prsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;

    if config.sync.auto_resolve == Some(ResolutionStrategy::Manual) {
      return Err(eyre!("sync.auto_resolve cannot be 'manual'"));
    }

    Ok(config)
  }

  /// Get the remote API token from the environment, if set.
  pub fn api_token() -> Option<String> {
    std::env::var("PRSYNC_TOKEN").ok().filter(|t| !t.is_empty())
  }
}
