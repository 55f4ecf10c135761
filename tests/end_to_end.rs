use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use prsync::cache::{CacheLayer, CacheOptions, CacheSource, MemoryStore};
use prsync::clock::ManualClock;
use prsync::model::{Entity, EntityKey, EntityKind, EntityStatus};
use prsync::remote::RemoteSource;
use prsync::retry::RetryPolicy;
use prsync::service::EntityService;
use prsync::sync::PushOutcome;
use prsync::SyncError;

/// Remote holding a fixed set of pull requests.
struct CountingRemote {
  entities: Vec<Entity>,
  fetches: AtomicUsize,
  /// Fetches that fail with a network error before succeeding
  failures: AtomicUsize,
}

impl CountingRemote {
  fn new(entities: Vec<Entity>) -> Arc<Self> {
    Arc::new(Self {
      entities,
      fetches: AtomicUsize::new(0),
      failures: AtomicUsize::new(0),
    })
  }

  fn fetches(&self) -> usize {
    self.fetches.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl RemoteSource for CountingRemote {
  async fn fetch_entities(&self, container_id: &str, kind: EntityKind) -> Result<Vec<Entity>, SyncError> {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    Ok(
      self
        .entities
        .iter()
        .filter(|e| e.key.container_id == container_id && e.kind == kind)
        .cloned()
        .collect(),
    )
  }

  async fn fetch_entity(&self, kind: EntityKind, key: &EntityKey) -> Result<Entity, SyncError> {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    if self
      .failures
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok()
    {
      return Err(SyncError::network("timed out"));
    }

    self
      .entities
      .iter()
      .find(|e| e.kind == kind && &e.key == key)
      .cloned()
      .ok_or_else(|| SyncError::NotFound(key.to_string()))
  }

  async fn push_entity(&self, entity: &Entity) -> Result<Entity, SyncError> {
    Ok(entity.clone())
  }

  async fn fetch_activity(&self) -> Result<Vec<Entity>, SyncError> {
    Ok(Vec::new())
  }

  async fn probe(&self) -> Result<(), SyncError> {
    Ok(())
  }
}

fn service(remote: Arc<CountingRemote>, clock: &ManualClock) -> EntityService {
  let cache = CacheLayer::with_clock(
    Arc::new(MemoryStore::new()),
    CacheOptions::default(),
    Arc::new(clock.clone()),
  );
  EntityService::new(remote, cache, RetryPolicy::new(3, std::time::Duration::from_millis(10)))
    .with_ttl(Duration::seconds(30))
}

#[tokio::test]
async fn test_cache_first_reads_with_ttl() {
  let remote = CountingRemote::new(vec![
    Entity::pull_request("repo1", "1", "Add retry executor", EntityStatus::Active),
    Entity::pull_request("repo1", "2", "Add cache layer", EntityStatus::Draft),
  ]);
  let clock = ManualClock::new(Utc::now());
  let service = service(remote.clone(), &clock);

  let first = service.get_pull_request("repo1", "1").await.unwrap();
  assert_eq!(first.source, CacheSource::Network);
  assert_eq!(first.data.title, "Add retry executor");
  assert_eq!(remote.fetches(), 1);

  clock.advance(Duration::seconds(20));
  let second = service.get_pull_request("repo1", "1").await.unwrap();
  assert!(second.is_cached());
  assert_eq!(second.data, first.data);
  assert_eq!(remote.fetches(), 1);

  clock.advance(Duration::seconds(11));
  let third = service.get_pull_request("repo1", "1").await.unwrap();
  assert_eq!(third.source, CacheSource::Network);
  assert_eq!(remote.fetches(), 2);

  // The other record is independent
  let other = service.get_pull_request("repo1", "2").await.unwrap();
  assert_eq!(other.data.status, EntityStatus::Draft);
  assert_eq!(remote.fetches(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_before_caching() {
  let remote = CountingRemote::new(vec![Entity::pull_request(
    "repo1",
    "1",
    "Flaky",
    EntityStatus::Active,
  )]);
  remote.failures.store(2, Ordering::SeqCst);
  let clock = ManualClock::default();
  let service = service(remote.clone(), &clock);

  let result = service.get_pull_request("repo1", "1").await.unwrap();
  assert_eq!(result.source, CacheSource::Network);
  assert_eq!(remote.fetches(), 3);

  assert!(service.get_pull_request("repo1", "1").await.unwrap().is_cached());
  assert_eq!(remote.fetches(), 3);
}

#[tokio::test]
async fn test_not_found_is_not_cached() {
  let remote = CountingRemote::new(Vec::new());
  let clock = ManualClock::default();
  let service = service(remote.clone(), &clock);

  for _ in 0..2 {
    let result = service.get_pull_request("repo1", "404").await;
    assert!(matches!(result, Err(SyncError::NotFound(_))));
  }
  // Not retried, not cached
  assert_eq!(remote.fetches(), 2);
}

#[tokio::test]
async fn test_list_populates_cache_and_container_invalidation_clears_it() {
  let remote = CountingRemote::new(vec![
    Entity::pull_request("repo1", "1", "one", EntityStatus::Active),
    Entity::pull_request("repo1", "2", "two", EntityStatus::Active),
    Entity::pull_request("repo2", "1", "elsewhere", EntityStatus::Active),
  ]);
  let clock = ManualClock::default();
  let service = service(remote.clone(), &clock);

  let listed = service.list_entities("repo1", EntityKind::PullRequest).await.unwrap();
  assert_eq!(listed.len(), 2);
  assert!(service.get_pull_request("repo1", "2").await.unwrap().is_cached());
  assert_eq!(remote.fetches(), 1);

  assert_eq!(service.invalidate_container("repo1"), 2);
  assert!(!service.get_pull_request("repo1", "2").await.unwrap().is_cached());
}

#[tokio::test]
async fn test_push_without_orchestrator_invalidates_cached_copy() {
  let remote = CountingRemote::new(vec![Entity::pull_request(
    "repo1",
    "1",
    "one",
    EntityStatus::Active,
  )]);
  let clock = ManualClock::default();
  let service = service(remote.clone(), &clock);
  let cached = service.get_pull_request("repo1", "1").await.unwrap().data;

  let mut completed = cached.clone();
  completed.status = EntityStatus::Completed;
  let outcome = service.push_entity(completed.clone()).await.unwrap();

  assert_eq!(outcome, PushOutcome::Applied(completed));
  assert!(!service.get_pull_request("repo1", "1").await.unwrap().is_cached());
}
