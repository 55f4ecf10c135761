//! Bounded retry with exponential backoff for remote operations.
//!
//! Each call site picks its own [`RetryPolicy`]; there is no engine-wide
//! default. Delays are deterministic: `base_delay * 2^(attempt - 1)`.

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SyncError;

/// Retry budget for one call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
  /// Retries after the first attempt (0 = try once)
  pub max_retries: u32,
  #[serde(rename = "base_delay_ms", deserialize_with = "millis::deserialize")]
  pub base_delay: Duration,
}

impl RetryPolicy {
  pub const fn new(max_retries: u32, base_delay: Duration) -> Self {
    Self {
      max_retries,
      base_delay,
    }
  }

  /// Single attempt, no backoff.
  pub const fn none() -> Self {
    Self::new(0, Duration::ZERO)
  }

  /// Backoff before retry number `attempt` (1-based).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    self.base_delay.saturating_mul(factor)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::new(3, Duration::from_millis(1000))
  }
}

/// Reported to the observer before each backoff sleep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
  /// Retry number, starting at 1
  pub attempt: u32,
  pub max_retries: u32,
  pub delay: Duration,
  pub error: SyncError,
}

/// Runs an async operation under a [`RetryPolicy`].
pub struct RetryExecutor<'a> {
  policy: RetryPolicy,
  cancel: Option<CancellationToken>,
  on_retry: Option<Box<dyn Fn(&RetryAttempt) + Send + Sync + 'a>>,
}

impl<'a> RetryExecutor<'a> {
  pub fn new(policy: RetryPolicy) -> Self {
    Self {
      policy,
      cancel: None,
      on_retry: None,
    }
  }

  /// Abort between attempts (and mid-backoff) once `token` is cancelled.
  pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
    self.cancel = Some(token);
    self
  }

  /// Hook invoked with the attempt number and delay of every retry.
  pub fn on_retry(mut self, hook: impl Fn(&RetryAttempt) + Send + Sync + 'a) -> Self {
    self.on_retry = Some(Box::new(hook));
    self
  }

  /// Run `operation` until it succeeds, fails with a non-retryable error,
  /// or the retry budget is spent. The last error is returned as-is.
  pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, SyncError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
  {
    let mut attempt: u32 = 0;

    loop {
      if self.is_cancelled() {
        return Err(SyncError::Cancelled);
      }

      let error = match operation().await {
        Ok(value) => return Ok(value),
        Err(e) => e,
      };

      if !error.is_retryable() || attempt >= self.policy.max_retries {
        if attempt > 0 {
          debug!("Giving up after {} retries: {}", attempt, error);
        }
        return Err(error);
      }

      attempt += 1;
      let delay = self.policy.delay_for(attempt);
      warn!(
        "Retryable error, attempt {}/{} in {:?}: {}",
        attempt, self.policy.max_retries, delay, error
      );

      if let Some(hook) = &self.on_retry {
        hook(&RetryAttempt {
          attempt,
          max_retries: self.policy.max_retries,
          delay,
          error,
        });
      }

      match &self.cancel {
        Some(token) => {
          tokio::select! {
            _ = token.cancelled() => return Err(SyncError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
          }
        }
        None => tokio::time::sleep(delay).await,
      }
    }
  }

  fn is_cancelled(&self) -> bool {
    self
      .cancel
      .as_ref()
      .map(|t| t.is_cancelled())
      .unwrap_or(false)
  }
}

/// Shorthand for a one-off retry without hooks.
pub async fn execute_with_retry<T, F, Fut>(policy: RetryPolicy, operation: F) -> Result<T, SyncError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, SyncError>>,
{
  RetryExecutor::new(policy).run(operation).await
}

mod millis {
  use serde::{Deserialize, Deserializer};
  use std::time::Duration;

  pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
  where
    D: Deserializer<'de>,
  {
    Ok(Duration::from_millis(u64::deserialize(deserializer)?))
  }
}
