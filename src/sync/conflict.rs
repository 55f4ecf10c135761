//! Conflict detection, resolution strategies and the pending-conflict set.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;
use crate::model::{Entity, EntityKey, EntityKind, EntityStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
  /// Discard local, adopt remote
  ServerWins,
  /// Re-push local over remote
  ClientWins,
  /// Field-level reconciliation
  Merge,
  /// Ask the user
  Manual,
}

impl fmt::Display for ResolutionStrategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::ServerWins => "server-wins",
      Self::ClientWins => "client-wins",
      Self::Merge => "merge",
      Self::Manual => "manual",
    };
    write!(f, "{}", name)
  }
}

impl FromStr for ResolutionStrategy {
  type Err = SyncError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "server-wins" => Ok(Self::ServerWins),
      "client-wins" => Ok(Self::ClientWins),
      "merge" => Ok(Self::Merge),
      "manual" => Ok(Self::Manual),
      other => Err(SyncError::validation(format!(
        "unknown resolution strategy '{}'",
        other
      ))),
    }
  }
}

/// Divergence between the local and remote copy of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncConflict {
  pub id: String,
  pub entity_kind: EntityKind,
  pub key: EntityKey,
  pub local: Entity,
  pub remote: Entity,
  /// Last remote version both sides agreed on, if known
  pub base: Option<Entity>,
  pub detected_at: DateTime<Utc>,
  /// Strategy chosen for this conflict; set while its resolution is applied
  pub resolution: Option<ResolutionStrategy>,
}

impl SyncConflict {
  pub fn new(local: Entity, remote: Entity, base: Option<Entity>, detected_at: DateTime<Utc>) -> Self {
    Self {
      id: conflict_id(remote.kind, &remote.key, detected_at),
      entity_kind: remote.kind,
      key: remote.key.clone(),
      local,
      remote,
      base,
      detected_at,
      resolution: None,
    }
  }
}

fn conflict_id(kind: EntityKind, key: &EntityKey, at: DateTime<Utc>) -> String {
  let mut hasher = Sha256::new();
  hasher.update(kind.prefix().as_bytes());
  hasher.update(key.container_id.as_bytes());
  hasher.update([0]);
  hasher.update(key.entity_id.as_bytes());
  hasher.update(at.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
  hex::encode(&hasher.finalize()[..8])
}

/// What a diff should do with a remote record that differs from local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Divergence {
  /// Ordinary update; overwrite local
  Update,
  /// Raise a conflict
  Conflict,
  /// Local holds an unpushed change the remote hasn't seen yet
  KeepLocal,
}

/// Classify a differing local/remote pair.
///
/// Only status transitions are inspected. `initiated` is the status the
/// local side last pushed for this record, if any.
pub fn classify(local: &Entity, remote: &Entity, initiated: Option<EntityStatus>) -> Divergence {
  if local.status == remote.status {
    return Divergence::Update;
  }

  if initiated == Some(remote.status) {
    return Divergence::Update;
  }

  match (local.status.is_terminal(), remote.status.is_terminal()) {
    // Remote finished the record through a path we didn't take
    (false, true) => Divergence::Conflict,
    // Completed here, abandoned there (or the reverse)
    (true, true) => Divergence::Conflict,
    (true, false) if initiated == Some(local.status) => Divergence::KeepLocal,
    // Remote reopened something local considers finished
    (true, false) => Divergence::Conflict,
    // Draft/active churn is normal lifecycle progression
    (false, false) => Divergence::Update,
  }
}

/// Field-level reconciliation of a conflict.
///
/// Status always takes the more advanced lifecycle stage (remote on ties).
/// Pull requests keep locally edited title, description and reviewers when
/// the remote left them at the base value. Comment threads take remote
/// fields and the larger comment count.
pub fn merge(base: Option<&Entity>, local: &Entity, remote: &Entity) -> Entity {
  let mut merged = remote.clone();

  merged.status = if local.status.stage() > remote.status.stage() {
    local.status
  } else {
    remote.status
  };
  merged.updated_at = local.updated_at.max(remote.updated_at);

  match remote.kind {
    EntityKind::PullRequest => {
      if let Some(base) = base {
        if local.title != base.title && remote.title == base.title {
          merged.title = local.title.clone();
        }
        if local.description != base.description && remote.description == base.description {
          merged.description = local.description.clone();
        }
        if local.reviewers != base.reviewers && remote.reviewers == base.reviewers {
          merged.reviewers = local.reviewers.clone();
        }
      }
    }
    EntityKind::CommentThread => {
      merged.comment_count = local.comment_count.max(remote.comment_count);
    }
  }

  merged
}

/// Pending conflicts, at most one per record.
#[derive(Debug, Default)]
pub struct ConflictSet {
  by_id: HashMap<String, SyncConflict>,
  by_entity: HashMap<(EntityKind, EntityKey), String>,
}

impl ConflictSet {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add `conflict`, replacing any pending conflict on the same record.
  /// Returns the replaced conflict's id.
  pub fn insert(&mut self, conflict: SyncConflict) -> Option<String> {
    let slot = (conflict.entity_kind, conflict.key.clone());
    let replaced = self.by_entity.insert(slot, conflict.id.clone());

    if let Some(old) = &replaced {
      self.by_id.remove(old);
    }
    self.by_id.insert(conflict.id.clone(), conflict);
    replaced
  }

  pub fn get(&self, id: &str) -> Option<&SyncConflict> {
    self.by_id.get(id)
  }

  pub fn for_entity(&self, kind: EntityKind, key: &EntityKey) -> Option<&SyncConflict> {
    self
      .by_entity
      .get(&(kind, key.clone()))
      .and_then(|id| self.by_id.get(id))
  }

  /// Record the strategy chosen for a pending conflict.
  pub fn set_resolution(&mut self, id: &str, strategy: ResolutionStrategy) -> bool {
    match self.by_id.get_mut(id) {
      Some(conflict) => {
        conflict.resolution = Some(strategy);
        true
      }
      None => false,
    }
  }

  pub fn remove(&mut self, id: &str) -> Option<SyncConflict> {
    let conflict = self.by_id.remove(id)?;
    self
      .by_entity
      .remove(&(conflict.entity_kind, conflict.key.clone()));
    Some(conflict)
  }

  /// Pending conflicts, oldest first.
  pub fn list(&self) -> Vec<SyncConflict> {
    let mut all: Vec<_> = self.by_id.values().cloned().collect();
    all.sort_by(|a, b| a.detected_at.cmp(&b.detected_at).then(a.id.cmp(&b.id)));
    all
  }

  pub fn len(&self) -> usize {
    self.by_id.len()
  }

  pub fn is_empty(&self) -> bool {
    self.by_id.is_empty()
  }

  pub fn clear(&mut self) {
    self.by_id.clear();
    self.by_entity.clear();
  }
}

/// External collaborator that lets a user pick a strategy for one conflict.
#[async_trait]
pub trait ConflictArbiter: Send + Sync {
  /// Return the chosen strategy, or `None` to leave the conflict pending.
  async fn choose(&self, conflict: &SyncConflict) -> Option<ResolutionStrategy>;
}
