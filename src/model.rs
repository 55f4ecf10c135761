//! Synced domain records: pull requests and comment threads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cache::Cacheable;

/// Stable composite identity of a remote record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
  /// Repository (or project) the record lives in
  pub container_id: String,
  pub entity_id: String,
}

impl EntityKey {
  pub fn new(container_id: impl Into<String>, entity_id: impl Into<String>) -> Self {
    Self {
      container_id: container_id.into(),
      entity_id: entity_id.into(),
    }
  }
}

impl fmt::Display for EntityKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.container_id, self.entity_id)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
  PullRequest,
  CommentThread,
}

impl EntityKind {
  /// Short prefix used in cache keys
  pub fn prefix(&self) -> &'static str {
    match self {
      Self::PullRequest => "pr",
      Self::CommentThread => "thread",
    }
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::PullRequest => write!(f, "pull request"),
      Self::CommentThread => write!(f, "comment thread"),
    }
  }
}

/// Lifecycle status shared by pull requests and threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
  Draft,
  Active,
  /// Pull request merged
  Completed,
  Abandoned,
  /// Thread resolved
  Resolved,
  /// Thread closed without a fix
  Closed,
}

impl EntityStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      Self::Completed | Self::Abandoned | Self::Resolved | Self::Closed
    )
  }

  /// Position in the lifecycle; statuses only ever move forward.
  pub fn stage(&self) -> u8 {
    match self {
      Self::Draft => 0,
      Self::Active => 1,
      _ => 2,
    }
  }
}

/// A pull request or comment thread as seen locally or remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
  pub key: EntityKey,
  pub kind: EntityKind,
  pub title: String,
  #[serde(default)]
  pub description: Option<String>,
  pub status: EntityStatus,
  #[serde(default)]
  pub merge_status: Option<String>,
  #[serde(default)]
  pub reviewers: Vec<String>,
  #[serde(default)]
  pub comment_count: u32,
  pub updated_at: DateTime<Utc>,
}

impl Entity {
  pub fn pull_request(
    container_id: &str,
    entity_id: &str,
    title: &str,
    status: EntityStatus,
  ) -> Self {
    Self {
      key: EntityKey::new(container_id, entity_id),
      kind: EntityKind::PullRequest,
      title: title.to_string(),
      description: None,
      status,
      merge_status: None,
      reviewers: Vec::new(),
      comment_count: 0,
      updated_at: Utc::now(),
    }
  }

  pub fn comment_thread(
    container_id: &str,
    entity_id: &str,
    title: &str,
    status: EntityStatus,
  ) -> Self {
    Self {
      kind: EntityKind::CommentThread,
      ..Self::pull_request(container_id, entity_id, title, status)
    }
  }

  /// Whether the synced fields differ. `updated_at` is ignored.
  pub fn differs_from(&self, other: &Entity) -> bool {
    self.title != other.title
      || self.description != other.description
      || self.status != other.status
      || self.merge_status != other.merge_status
      || self.reviewers != other.reviewers
      || self.comment_count != other.comment_count
  }
}

/// Cache key for a record of `kind` identified by `key`.
pub fn cache_key(kind: EntityKind, key: &EntityKey) -> String {
  format!("{}:{}:{}", kind.prefix(), key.container_id, key.entity_id)
}

/// Tag shared by every cached record of one container.
pub fn container_tag(container_id: &str) -> String {
  format!("container:{}", container_id)
}

impl Cacheable for Entity {
  fn cache_key(&self) -> String {
    cache_key(self.kind, &self.key)
  }

  fn cache_tags(&self) -> Vec<String> {
    vec![
      container_tag(&self.key.container_id),
      format!("kind:{}", self.kind.prefix()),
    ]
  }
}
