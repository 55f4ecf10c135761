//! Cache-first access to remote entities.

use std::sync::Arc;

use crate::cache::{CacheLayer, CacheResult, Cacheable, EntryOptions, InvalidationRule};
use crate::error::SyncError;
use crate::model::{cache_key, container_tag, Entity, EntityKey, EntityKind};
use crate::remote::RemoteSource;
use crate::retry::{execute_with_retry, RetryPolicy};
use crate::sync::{PushOutcome, SyncOrchestrator};

/// Remote source with transparent caching.
///
/// Reads are served from the cache while fresh and fetched (with retry) on
/// a miss. Writes go through the sync orchestrator when one is attached so
/// that offline changes are queued instead of lost.
#[derive(Clone)]
pub struct EntityService {
  remote: Arc<dyn RemoteSource>,
  cache: CacheLayer<Entity>,
  fetch_policy: RetryPolicy,
  ttl: Option<chrono::Duration>,
  orchestrator: Option<SyncOrchestrator>,
}

impl EntityService {
  pub fn new(remote: Arc<dyn RemoteSource>, cache: CacheLayer<Entity>, fetch_policy: RetryPolicy) -> Self {
    Self {
      remote,
      cache,
      fetch_policy,
      ttl: None,
      orchestrator: None,
    }
  }

  /// Override the cache's default TTL for entities fetched here.
  pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  pub fn with_orchestrator(mut self, orchestrator: SyncOrchestrator) -> Self {
    self.orchestrator = Some(orchestrator);
    self
  }

  /// Get one entity, cache first.
  pub async fn get_entity(&self, kind: EntityKind, key: &EntityKey) -> Result<CacheResult<Entity>, SyncError> {
    let cache_key = cache_key(kind, key);

    if let Some(entry) = self.cache.get_entry(&cache_key).await {
      return Ok(CacheResult::from_cache(entry.data, entry.created_at));
    }

    let remote = &self.remote;
    let entity = execute_with_retry(self.fetch_policy, || remote.fetch_entity(kind, key)).await?;
    self.store(&entity);

    Ok(CacheResult::from_network(entity))
  }

  /// Get a pull request by container and id.
  pub async fn get_pull_request(&self, container_id: &str, id: &str) -> Result<CacheResult<Entity>, SyncError> {
    self
      .get_entity(EntityKind::PullRequest, &EntityKey::new(container_id, id))
      .await
  }

  /// List one kind of entity in a container, caching each item individually.
  pub async fn list_entities(&self, container_id: &str, kind: EntityKind) -> Result<Vec<Entity>, SyncError> {
    let remote = &self.remote;
    let entities =
      execute_with_retry(self.fetch_policy, || remote.fetch_entities(container_id, kind)).await?;

    for entity in &entities {
      self.store(entity);
    }
    Ok(entities)
  }

  /// Push a local change.
  ///
  /// With an orchestrator attached, an unreachable remote queues the change
  /// and returns [`PushOutcome::Queued`]. Without one the error comes back.
  pub async fn push_entity(&self, entity: Entity) -> Result<PushOutcome, SyncError> {
    if let Some(orchestrator) = &self.orchestrator {
      return orchestrator.push_entity(entity).await;
    }

    let remote = &self.remote;
    let accepted = execute_with_retry(self.fetch_policy, || remote.push_entity(&entity)).await?;
    self
      .cache
      .invalidate(&[InvalidationRule::Exact(accepted.cache_key())]);
    Ok(PushOutcome::Applied(accepted))
  }

  /// Drop every cached entity belonging to `container_id`.
  pub fn invalidate_container(&self, container_id: &str) -> usize {
    self
      .cache
      .invalidate(&[InvalidationRule::tags([container_tag(container_id)])])
  }

  fn store(&self, entity: &Entity) {
    let mut options = EntryOptions::default().tags(entity.cache_tags());
    if let Some(ttl) = self.ttl {
      options = options.ttl(ttl);
    }
    self.cache.set(entity.cache_key(), entity.clone(), options);
  }
}
