//! Classified errors shared by the cache, the retry executor and the sync engine.

use std::time::Duration;
use thiserror::Error;

/// Error raised by remote operations and the sync engine.
///
/// Every variant belongs to exactly one [`ErrorKind`], which is what callers
/// branch on. Transport details never leak past this type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
  /// Connection reset, DNS failure, timeout or an unreachable host
  #[error("network error: {0}")]
  Network(String),

  /// HTTP 429
  #[error("rate limited{}", retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
  RateLimit { retry_after: Option<Duration> },

  /// Rejected input, fixable by the caller
  #[error("validation failed: {0}")]
  Validation(String),

  #[error("not found: {0}")]
  NotFound(String),

  /// Remote failed with a 5xx status
  #[error("server error {status}: {message}")]
  Server { status: u16, message: String },

  /// Local and remote versions diverged; routed to the conflict set
  #[error("conflict: {0}")]
  Conflict(String),

  /// Cache or queue full; the lowest priority item was dropped
  #[error("capacity exceeded: {0}")]
  Capacity(String),

  /// Operation cancelled mid-flight
  #[error("operation cancelled")]
  Cancelled,

  /// Orchestrator has been shut down
  #[error("sync engine disposed")]
  Disposed,
}

/// Coarse classification of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  Network,
  RateLimit,
  Validation,
  NotFound,
  Server,
  Conflict,
  Capacity,
  Cancelled,
}

impl SyncError {
  pub fn network(message: impl Into<String>) -> Self {
    Self::Network(message.into())
  }

  pub fn validation(message: impl Into<String>) -> Self {
    Self::Validation(message.into())
  }

  pub fn server(status: u16, message: impl Into<String>) -> Self {
    Self::Server {
      status,
      message: message.into(),
    }
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Network(_) => ErrorKind::Network,
      Self::RateLimit { .. } => ErrorKind::RateLimit,
      Self::Validation(_) => ErrorKind::Validation,
      Self::NotFound(_) => ErrorKind::NotFound,
      Self::Server { .. } => ErrorKind::Server,
      Self::Conflict(_) => ErrorKind::Conflict,
      Self::Capacity(_) => ErrorKind::Capacity,
      Self::Cancelled | Self::Disposed => ErrorKind::Cancelled,
    }
  }

  /// Whether the retry executor may try the operation again.
  ///
  /// Only connection-level failures, rate limiting and 503/504 qualify.
  /// Everything else fails fast.
  pub fn is_retryable(&self) -> bool {
    match self {
      Self::Network(_) | Self::RateLimit { .. } => true,
      Self::Server { status, .. } => matches!(status, 503 | 504),
      _ => false,
    }
  }

  /// Whether this error moves the engine into offline mode.
  pub fn is_network(&self) -> bool {
    matches!(self, Self::Network(_))
  }
}
