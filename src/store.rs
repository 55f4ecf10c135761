//! Local state store: the source of truth for "local version" while diffing.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::error::SyncError;
use crate::model::{Entity, EntityKey, EntityKind};

/// Owner of local entity storage. The sync engine only reads and writes
/// through this interface.
#[async_trait]
pub trait LocalStore: Send + Sync {
  async fn get_entity(&self, kind: EntityKind, key: &EntityKey) -> Result<Option<Entity>, SyncError>;

  async fn upsert_entity(&self, entity: Entity) -> Result<(), SyncError>;

  async fn list_entities(&self, container_id: &str) -> Result<Vec<Entity>, SyncError>;
}

/// In-memory [`LocalStore`], ordered by kind then key.
#[derive(Default)]
pub struct MemoryStateStore {
  entities: RwLock<BTreeMap<(u8, EntityKey), Entity>>,
}

impl MemoryStateStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn len(&self) -> usize {
    self.entities.read().await.len()
  }

  fn slot(kind: EntityKind, key: &EntityKey) -> (u8, EntityKey) {
    let rank = match kind {
      EntityKind::PullRequest => 0,
      EntityKind::CommentThread => 1,
    };
    (rank, key.clone())
  }
}

#[async_trait]
impl LocalStore for MemoryStateStore {
  async fn get_entity(&self, kind: EntityKind, key: &EntityKey) -> Result<Option<Entity>, SyncError> {
    Ok(self.entities.read().await.get(&Self::slot(kind, key)).cloned())
  }

  async fn upsert_entity(&self, entity: Entity) -> Result<(), SyncError> {
    let slot = Self::slot(entity.kind, &entity.key);
    self.entities.write().await.insert(slot, entity);
    Ok(())
  }

  async fn list_entities(&self, container_id: &str) -> Result<Vec<Entity>, SyncError> {
    Ok(
      self
        .entities
        .read()
        .await
        .values()
        .filter(|e| e.key.container_id == container_id)
        .cloned()
        .collect(),
    )
  }
}
