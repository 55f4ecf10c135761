use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

use prsync::cache::{
  decode_entry, is_compressed, CacheLayer, CacheOptions, DurableStore, EntryOptions, InvalidationRule, MemoryStore,
  MetaValue,
};
use prsync::clock::{Clock, ManualClock};
use prsync::model::{Entity, EntityStatus};

fn options(max_memory_entries: usize) -> CacheOptions {
  CacheOptions {
    max_memory_entries,
    default_ttl: Duration::minutes(5),
    compression_threshold: 16 * 1024,
  }
}

fn layer<T>(store: &Arc<MemoryStore>, opts: CacheOptions, clock: &ManualClock) -> CacheLayer<T>
where
  T: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
  CacheLayer::with_clock(store.clone(), opts, Arc::new(clock.clone()))
}

#[tokio::test]
async fn test_entry_expires_at_ttl() {
  let clock = ManualClock::new(Utc::now());
  let store = Arc::new(MemoryStore::new());
  let cache: CacheLayer<String> = layer(&store, options(10), &clock);

  cache.set("k", "v".to_string(), EntryOptions::default().ttl(Duration::seconds(30)));

  clock.advance(Duration::seconds(29));
  assert_eq!(cache.get("k").await.as_deref(), Some("v"));

  clock.advance(Duration::seconds(1));
  assert_eq!(cache.get("k").await, None);

  let stats = cache.stats();
  assert_eq!(stats.hits, 1);
  assert_eq!(stats.misses, 1);
  assert_eq!(stats.expirations, 1);
  assert_eq!(stats.memory_entries, 0);
}

#[tokio::test]
async fn test_non_positive_ttl_is_not_cached() {
  let clock = ManualClock::default();
  let store = Arc::new(MemoryStore::new());
  let cache: CacheLayer<String> = layer(&store, options(10), &clock);

  cache.set("zero", "v".to_string(), EntryOptions::default().ttl(Duration::zero()));
  cache.set("negative", "v".to_string(), EntryOptions::default().ttl(Duration::seconds(-5)));
  cache.flush().await;

  assert!(cache.is_empty());
  assert!(store.is_empty());
  assert_eq!(cache.stats().sets, 0);
}

#[tokio::test]
async fn test_lru_eviction_spares_recently_read_entries() {
  let clock = ManualClock::default();
  let store = Arc::new(MemoryStore::new());
  let cache: CacheLayer<u32> = layer(&store, options(2), &clock);

  cache.set("a", 1, EntryOptions::default());
  cache.set("b", 2, EntryOptions::default());
  // Same instant: the access order alone decides
  assert_eq!(cache.get("a").await, Some(1));
  cache.set("c", 3, EntryOptions::default());

  assert!(cache.contains("a"));
  assert!(!cache.contains("b"));
  assert!(cache.contains("c"));
  assert_eq!(cache.len(), 2);
  assert_eq!(cache.stats().evictions, 1);

  // Eviction only frees memory; the durable copy can be promoted again
  cache.flush().await;
  assert!(store.contains("b"));
  assert_eq!(cache.get("b").await, Some(2));
  assert_eq!(cache.stats().durable_hits, 1);
}

#[tokio::test]
async fn test_durable_hit_is_promoted_to_memory() {
  let clock = ManualClock::default();
  let store = Arc::new(MemoryStore::new());

  let writer: CacheLayer<String> = layer(&store, options(10), &clock);
  writer.set("pr:repo1:1", "persisted".to_string(), EntryOptions::default());
  writer.flush().await;

  let reader: CacheLayer<String> = layer(&store, options(10), &clock);
  assert!(!reader.contains("pr:repo1:1"));
  assert_eq!(reader.get("pr:repo1:1").await.as_deref(), Some("persisted"));
  assert!(reader.contains("pr:repo1:1"));

  let stats = reader.stats();
  assert_eq!(stats.durable_hits, 1);
  assert_eq!(stats.memory_hits, 0);
}

#[tokio::test]
async fn test_expired_durable_entry_is_a_miss_and_removed() {
  let clock = ManualClock::default();
  let store = Arc::new(MemoryStore::new());

  let writer: CacheLayer<String> = layer(&store, options(10), &clock);
  writer.set("k", "old".to_string(), EntryOptions::default().ttl(Duration::seconds(10)));
  writer.flush().await;

  clock.advance(Duration::seconds(11));
  let reader: CacheLayer<String> = layer(&store, options(10), &clock);
  assert_eq!(reader.get("k").await, None);

  reader.flush().await;
  assert!(!store.contains("k"));
}

#[tokio::test]
async fn test_delete_is_not_undone_by_a_pending_promotion() {
  let clock = ManualClock::default();
  let store = Arc::new(MemoryStore::new());
  let cache: CacheLayer<String> = layer(&store, options(10), &clock);

  cache.set("k", "v".to_string(), EntryOptions::default());
  assert!(cache.delete("k"));
  // The durable read is queued behind the set and the delete
  assert_eq!(cache.get("k").await, None);
  assert!(!store.contains("k"));
}

/// Durable store whose reads park until the test releases them.
struct GatedStore {
  inner: MemoryStore,
  reading: Notify,
  gate: Semaphore,
}

impl GatedStore {
  fn new() -> Arc<Self> {
    Arc::new(Self {
      inner: MemoryStore::new(),
      reading: Notify::new(),
      gate: Semaphore::new(0),
    })
  }
}

#[async_trait]
impl DurableStore for GatedStore {
  async fn get(&self, key: &str) -> color_eyre::Result<Option<Vec<u8>>> {
    self.reading.notify_one();
    let _permit = self.gate.acquire().await?;
    self.inner.get(key).await
  }

  async fn set(&self, key: &str, value: Vec<u8>) -> color_eyre::Result<()> {
    self.inner.set(key, value).await
  }

  async fn delete(&self, key: &str) -> color_eyre::Result<()> {
    self.inner.delete(key).await
  }

  async fn keys(&self) -> color_eyre::Result<Vec<String>> {
    self.inner.keys().await
  }
}

/// Start a durable read of "k", run `remove` while it is parked, then let it
/// finish. The removal must win.
async fn remove_during_durable_read(remove: impl FnOnce(&CacheLayer<String>)) {
  let clock = ManualClock::default();
  let store = GatedStore::new();

  // Seed the durable tier through a separate layer so "k" is not in memory
  let writer: CacheLayer<String> = CacheLayer::with_clock(store.clone(), options(10), Arc::new(clock.clone()));
  writer.set("k", "v".to_string(), EntryOptions::default());
  writer.flush().await;

  let cache: CacheLayer<String> = CacheLayer::with_clock(store.clone(), options(10), Arc::new(clock.clone()));
  let pending = tokio::spawn({
    let cache = cache.clone();
    async move { cache.get("k").await }
  });

  store.reading.notified().await;
  remove(&cache);
  store.gate.add_permits(1);

  assert_eq!(pending.await.unwrap(), None);
  cache.flush().await;
  assert!(!cache.contains("k"));
  assert!(!store.inner.contains("k"));
  assert_eq!(cache.get("k").await, None);
}

#[tokio::test]
async fn test_delete_during_durable_read_is_not_undone() {
  remove_during_durable_read(|cache| {
    cache.delete("k");
  })
  .await;
}

#[tokio::test]
async fn test_invalidate_during_durable_read_is_not_undone() {
  remove_during_durable_read(|cache| {
    cache.invalidate(&[InvalidationRule::prefix("k")]);
  })
  .await;
}

#[tokio::test]
async fn test_clear_during_durable_read_is_not_undone() {
  remove_during_durable_read(|cache| cache.clear()).await;
}

#[tokio::test]
async fn test_invalidate_by_tag_prefix_and_pattern() {
  let clock = ManualClock::default();
  let store = Arc::new(MemoryStore::new());
  let cache: CacheLayer<u32> = layer(&store, options(100), &clock);

  cache.set("pr:repo1:1", 1, EntryOptions::default().tag("container:repo1"));
  cache.set("pr:repo1:2", 2, EntryOptions::default().tag("container:repo1"));
  cache.set("pr:repo2:1", 3, EntryOptions::default().tag("container:repo2"));
  cache.set("thread:repo2:9", 4, EntryOptions::default().tag("container:repo2"));
  cache.set("user:me", 5, EntryOptions::default());
  cache.flush().await;

  let removed = cache.invalidate(&[InvalidationRule::tags(["container:repo1"])]);
  assert_eq!(removed, 2);

  let removed = cache.invalidate(&[InvalidationRule::prefix("thread:")]);
  assert_eq!(removed, 1);

  let rule = InvalidationRule::pattern(r"^pr:repo\d:1$").unwrap();
  assert_eq!(cache.invalidate(&[rule]), 1);

  assert_eq!(cache.len(), 1);
  assert!(cache.contains("user:me"));
  assert_eq!(cache.stats().invalidations, 4);

  // Durable tier follows once the worker catches up
  cache.flush().await;
  assert_eq!(store.len(), 1);
  assert!(store.contains("user:me"));
}

#[tokio::test]
async fn test_several_rules_in_one_call() {
  let clock = ManualClock::default();
  let store = Arc::new(MemoryStore::new());
  let cache: CacheLayer<u32> = layer(&store, options(100), &clock);

  cache.set("a", 1, EntryOptions::default());
  cache.set("b", 2, EntryOptions::default());
  cache.set("c", 3, EntryOptions::default());

  let removed = cache.invalidate(&[InvalidationRule::exact("a"), InvalidationRule::exact("c")]);
  assert_eq!(removed, 2);
  assert!(cache.contains("b"));
}

#[tokio::test]
async fn test_sweep_removes_expired_entries_from_both_tiers() {
  let clock = ManualClock::default();
  let store = Arc::new(MemoryStore::new());
  let cache: CacheLayer<u32> = layer(&store, options(100), &clock);

  cache.set("short", 1, EntryOptions::default().ttl(Duration::seconds(5)));
  cache.set("long", 2, EntryOptions::default().ttl(Duration::hours(1)));
  clock.advance(Duration::seconds(6));

  assert_eq!(cache.sweep_expired(), 1);
  cache.flush().await;

  assert!(!store.contains("short"));
  assert!(store.contains("long"));
  assert_eq!(cache.stats().expirations, 1);
}

#[tokio::test]
async fn test_large_entries_are_compressed_transparently() {
  let clock = ManualClock::default();
  let store = Arc::new(MemoryStore::new());
  let opts = CacheOptions {
    compression_threshold: 256,
    ..options(10)
  };

  let mut pr = Entity::pull_request("repo1", "42", "Rework cache", EntityStatus::Active);
  let description = "lorem ipsum dolor sit amet ".repeat(200);
  pr.description = Some(description.clone());

  let writer: CacheLayer<Entity> = layer(&store, opts.clone(), &clock);
  writer.set("pr:repo1:42", pr.clone(), EntryOptions::default());
  writer.set("small", Entity::pull_request("repo1", "1", "x", EntityStatus::Draft), EntryOptions::default());
  writer.flush().await;

  let raw = store.raw("pr:repo1:42").unwrap();
  assert!(is_compressed(&raw));
  assert!(raw.len() < description.len());
  assert!(!is_compressed(&store.raw("small").unwrap()));

  let reader: CacheLayer<Entity> = layer(&store, opts, &clock);
  assert_eq!(reader.get("pr:repo1:42").await, Some(pr));
}

#[tokio::test]
async fn test_metadata_and_tags_survive_the_durable_tier() {
  let clock = ManualClock::default();
  let store = Arc::new(MemoryStore::new());
  let cache: CacheLayer<String> = layer(&store, options(10), &clock);

  cache.set(
    "k",
    "v".to_string(),
    EntryOptions::default()
      .tag("container:repo1")
      .meta("etag", "abc")
      .meta("page", 3i64),
  );
  cache.flush().await;

  let entry = decode_entry::<String>(&store.raw("k").unwrap()).unwrap();
  assert!(entry.tags.contains("container:repo1"));
  assert_eq!(entry.metadata.get("etag"), Some(&MetaValue::Str("abc".into())));
  assert_eq!(entry.metadata.get("page"), Some(&MetaValue::Int(3)));
}

#[tokio::test]
async fn test_get_entry_counts_accesses() {
  let clock = ManualClock::default();
  let store = Arc::new(MemoryStore::new());
  let cache: CacheLayer<String> = layer(&store, options(10), &clock);

  cache.set("k", "v".to_string(), EntryOptions::default());
  clock.advance(Duration::seconds(3));
  cache.get("k").await;
  let entry = cache.get_entry("k").await.unwrap();

  assert_eq!(entry.access_count, 2);
  assert_eq!(entry.last_accessed_at, clock.now());
  assert_eq!(entry.expires_at - entry.created_at, Duration::minutes(5));
}

#[tokio::test]
async fn test_get_or_set_runs_factory_only_on_miss() {
  let clock = ManualClock::default();
  let store = Arc::new(MemoryStore::new());
  let cache: CacheLayer<String> = layer(&store, options(10), &clock);
  let calls = AtomicUsize::new(0);

  for _ in 0..3 {
    let value = cache
      .get_or_set("k", EntryOptions::default(), || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, String>("fresh".to_string())
      })
      .await
      .unwrap();
    assert_eq!(value, "fresh");
  }
  assert_eq!(calls.load(Ordering::SeqCst), 1);

  let failed = cache
    .get_or_set("broken", EntryOptions::default(), || async { Err::<String, _>("boom".to_string()) })
    .await;
  assert_eq!(failed, Err("boom".to_string()));
  assert!(!cache.contains("broken"));
}

#[tokio::test]
async fn test_clear_empties_both_tiers_and_hit_rate() {
  let clock = ManualClock::default();
  let store = Arc::new(MemoryStore::new());
  let cache: CacheLayer<u32> = layer(&store, options(10), &clock);

  cache.set("a", 1, EntryOptions::default());
  cache.get("a").await;
  cache.get("missing").await;
  assert!((cache.stats().hit_rate() - 0.5).abs() < f64::EPSILON);

  cache.clear();
  cache.flush().await;
  assert!(cache.is_empty());
  assert!(store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_runs_until_cancelled() {
  let clock = ManualClock::default();
  let store = Arc::new(MemoryStore::new());
  let cache: CacheLayer<u32> = layer(&store, options(10), &clock);
  let cancel = tokio_util::sync::CancellationToken::new();

  cache.set("k", 1, EntryOptions::default().ttl(Duration::seconds(1)));
  clock.advance(Duration::seconds(2));

  let sweeper = cache.start_sweeper(std::time::Duration::from_secs(60), cancel.clone());
  tokio::time::sleep(std::time::Duration::from_secs(61)).await;
  assert_eq!(cache.len(), 0);

  cancel.cancel();
  sweeper.await.unwrap();
}
