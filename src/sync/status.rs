//! Observable state of one sync orchestrator.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
  Online,
  Offline,
  Unknown,
}

impl fmt::Display for NetworkState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Online => write!(f, "online"),
      Self::Offline => write!(f, "offline"),
      Self::Unknown => write!(f, "unknown"),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounters {
  /// Completed remote pulls
  pub entity_pulls: u64,
  /// Conflicts currently pending resolution
  pub conflicts: u64,
  /// Retry attempts made by the retry executor
  pub retries: u64,
}

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncErrorRecord {
  pub at: DateTime<Utc>,
  /// Which task or operation failed
  pub source: String,
  #[serde(skip)]
  pub kind: Option<ErrorKind>,
  pub message: String,
}

/// Most recent failures, oldest dropped first once full.
#[derive(Debug, Clone, Serialize)]
pub struct RecentErrors {
  capacity: usize,
  records: VecDeque<SyncErrorRecord>,
}

impl RecentErrors {
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity: capacity.max(1),
      records: VecDeque::new(),
    }
  }

  pub fn push(&mut self, record: SyncErrorRecord) {
    while self.records.len() >= self.capacity {
      self.records.pop_front();
    }
    self.records.push_back(record);
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  pub fn latest(&self) -> Option<&SyncErrorRecord> {
    self.records.back()
  }

  pub fn iter(&self) -> impl Iterator<Item = &SyncErrorRecord> {
    self.records.iter()
  }

  pub fn clear(&mut self) {
    self.records.clear();
  }
}

/// Snapshot of orchestrator state for UI consumers.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
  pub enabled: bool,
  pub last_sync_at: Option<DateTime<Utc>>,
  pub is_syncing: bool,
  pub recent_errors: RecentErrors,
  pub counters: SyncCounters,
  pub network_state: NetworkState,
  pub queued_tasks: usize,
}

impl SyncStatus {
  pub fn new(max_recent_errors: usize) -> Self {
    Self {
      enabled: true,
      last_sync_at: None,
      is_syncing: false,
      recent_errors: RecentErrors::new(max_recent_errors),
      counters: SyncCounters::default(),
      // Optimistic until a network error says otherwise
      network_state: NetworkState::Online,
      queued_tasks: 0,
    }
  }
}
