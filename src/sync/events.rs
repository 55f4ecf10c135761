//! Sync lifecycle events, published fire-and-forget to any subscribers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use super::status::NetworkState;
use crate::model::EntityKey;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEventKind {
  SyncStarted {
    task: String,
  },
  SyncCompleted {
    task: String,
    pulled: usize,
    applied: usize,
    conflicts: usize,
  },
  SyncFailed {
    task: String,
    error: String,
  },
  ConflictDetected {
    conflict_id: String,
    key: EntityKey,
  },
  ConflictResolved {
    conflict_id: String,
    strategy: String,
  },
  NetworkStatusChanged {
    from: NetworkState,
    to: NetworkState,
  },
  OfflineModeActivated,
  OfflineModeDeactivated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncEvent {
  pub at: DateTime<Utc>,
  #[serde(flatten)]
  pub kind: SyncEventKind,
}

/// Broadcast fan-out of [`SyncEvent`]s.
///
/// Publishing never blocks and never fails: with no subscribers the event
/// is dropped, and a subscriber that falls behind loses the oldest events
/// without affecting anyone else.
#[derive(Clone)]
pub struct EventBus {
  tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity.max(1));
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.tx.subscribe()
  }

  pub fn publish(&self, at: DateTime<Utc>, kind: SyncEventKind) {
    trace!("Publishing {:?}", kind);
    let _ = self.tx.send(SyncEvent { at, kind });
  }

  pub fn subscriber_count(&self) -> usize {
    self.tx.receiver_count()
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(256)
  }
}
