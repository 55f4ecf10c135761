//! Two-tier cache: a bounded in-memory tier in front of a durable store.
//!
//! Reads check memory first, then the durable tier, promoting valid durable
//! hits back into memory. Writes land in memory immediately and reach the
//! durable tier through a single background worker, which applies them in
//! submission order. Durable reads are queued behind pending writes, and a
//! read that overlaps a delete or invalidation is not promoted, so a removed
//! key cannot be resurrected.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::de::IgnoredAny;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::durable::{decode_entry, encode_entry, DurableStore};
use super::entry::{CacheEntry, EntryOptions};
use super::rules::InvalidationRule;
use crate::clock::{Clock, SystemClock};

/// Tuning knobs for a [`CacheLayer`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
  pub max_memory_entries: usize,
  pub default_ttl: Duration,
  /// Entries whose JSON form exceeds this many bytes are zstd-compressed
  /// before reaching the durable tier
  pub compression_threshold: usize,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      max_memory_entries: 500,
      default_ttl: Duration::minutes(5),
      compression_threshold: 16 * 1024,
    }
  }
}

/// Hit/miss and housekeeping counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  pub memory_hits: u64,
  pub durable_hits: u64,
  pub sets: u64,
  pub evictions: u64,
  pub expirations: u64,
  pub invalidations: u64,
  pub memory_entries: usize,
}

impl CacheStats {
  pub fn hit_rate(&self) -> f64 {
    let total = self.hits + self.misses;
    if total == 0 {
      0.0
    } else {
      self.hits as f64 / total as f64
    }
  }
}

enum DurableOp {
  Set { key: String, bytes: Vec<u8> },
  Delete(String),
  Clear,
  Invalidate(InvalidationRule),
  Sweep(DateTime<Utc>),
  Get {
    key: String,
    reply: oneshot::Sender<Option<Vec<u8>>>,
  },
  Flush(oneshot::Sender<()>),
}

struct MemoryTier<T> {
  entries: HashMap<String, CacheEntry<T>>,
  /// Monotonic access counter used to order same-instant accesses
  seq: u64,
  /// Bumped by every removal; a durable read that straddles one is not promoted
  epoch: u64,
  stats: CacheStats,
}

impl<T> MemoryTier<T> {
  fn next_seq(&mut self) -> u64 {
    self.seq += 1;
    self.seq
  }

  /// Drop the least recently accessed entries until within `max`.
  fn evict_over_capacity(&mut self, max: usize) -> usize {
    if self.entries.len() <= max {
      return 0;
    }

    let excess = self.entries.len() - max;
    let mut by_access: Vec<(DateTime<Utc>, u64, String)> = self
      .entries
      .iter()
      .map(|(k, e)| (e.last_accessed_at, e.access_seq, k.clone()))
      .collect();
    by_access.sort();

    for (_, _, key) in by_access.into_iter().take(excess) {
      trace!("Evicting {}", key);
      self.entries.remove(&key);
    }

    self.stats.evictions += excess as u64;
    excess
  }
}

struct Inner<T> {
  memory: Mutex<MemoryTier<T>>,
  options: CacheOptions,
  clock: Arc<dyn Clock>,
  durable_tx: mpsc::UnboundedSender<DurableOp>,
}

/// Two-tier TTL/LRU cache for values of type `T`.
///
/// Must be created inside a Tokio runtime: construction spawns the durable
/// tier worker, which stops once every clone of the layer is dropped.
pub struct CacheLayer<T> {
  inner: Arc<Inner<T>>,
}

impl<T> Clone for CacheLayer<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T> CacheLayer<T>
where
  T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
  /// Create a cache layer backed by `store`, using the system clock.
  pub fn new(store: Arc<dyn DurableStore>, options: CacheOptions) -> Self {
    Self::with_clock(store, options, Arc::new(SystemClock))
  }

  pub fn with_clock(
    store: Arc<dyn DurableStore>,
    options: CacheOptions,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let (durable_tx, durable_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_durable_worker(store, durable_rx));

    Self {
      inner: Arc::new(Inner {
        memory: Mutex::new(MemoryTier {
          entries: HashMap::new(),
          seq: 0,
          epoch: 0,
          stats: CacheStats::default(),
        }),
        options,
        clock,
        durable_tx,
      }),
    }
  }

  /// Look up `key`, returning the value only if it has not expired.
  pub async fn get(&self, key: &str) -> Option<T> {
    self.get_entry(key).await.map(|e| e.data)
  }

  /// Like [`get`](Self::get) but returns the whole entry (after the access
  /// has been recorded).
  pub async fn get_entry(&self, key: &str) -> Option<CacheEntry<T>> {
    let now = self.inner.clock.now();

    let epoch = {
      let mut memory = self.inner.memory.lock();
      let seq = memory.next_seq();
      let tier = &mut *memory;

      match tier.entries.get_mut(key) {
        Some(entry) if !entry.is_expired(now) => {
          entry.touch(now, seq);
          tier.stats.hits += 1;
          tier.stats.memory_hits += 1;
          trace!("Memory hit for {}", key);
          return Some(entry.clone());
        }
        Some(_) => {
          tier.entries.remove(key);
          tier.stats.expirations += 1;
          self.send(DurableOp::Delete(key.to_string()));
        }
        None => {}
      }
      tier.epoch
    };

    let promoted = match self.read_durable(key).await {
      Some(bytes) => match decode_entry::<T>(&bytes) {
        Ok(entry) => Some(entry),
        Err(e) => {
          warn!("Dropping unreadable durable entry {}: {}", key, e);
          self.send(DurableOp::Delete(key.to_string()));
          None
        }
      },
      None => None,
    };

    let now = self.inner.clock.now();
    let mut memory = self.inner.memory.lock();

    let mut entry = match promoted {
      Some(entry) if !entry.is_expired(now) => entry,
      Some(_) => {
        memory.stats.expirations += 1;
        memory.stats.misses += 1;
        drop(memory);
        self.send(DurableOp::Delete(key.to_string()));
        debug!("Durable entry {} expired", key);
        return None;
      }
      None => {
        memory.stats.misses += 1;
        debug!("Cache miss for {}", key);
        return None;
      }
    };

    let seq = memory.next_seq();

    // A concurrent set won the race; its value is newer than the durable one
    if let Some(current) = memory.entries.get_mut(key) {
      current.touch(now, seq);
      let current = current.clone();
      memory.stats.hits += 1;
      memory.stats.durable_hits += 1;
      return Some(current);
    }

    if memory.epoch != epoch {
      memory.stats.misses += 1;
      debug!("Not promoting {}: removed while reading the durable tier", key);
      return None;
    }

    memory.stats.hits += 1;
    memory.stats.durable_hits += 1;

    entry.touch(now, seq);
    memory.entries.insert(key.to_string(), entry.clone());
    memory.evict_over_capacity(self.inner.options.max_memory_entries);
    debug!("Promoted {} from durable tier", key);

    Some(entry)
  }

  /// Store `data` under `key`.
  ///
  /// The memory tier is updated before this returns; the durable write is
  /// queued. A non-positive TTL stores nothing.
  pub fn set(&self, key: impl Into<String>, data: T, options: EntryOptions) {
    let key = key.into();
    let now = self.inner.clock.now();
    let ttl = options.ttl.unwrap_or(self.inner.options.default_ttl);

    let Some(mut entry) = CacheEntry::new(data, now, ttl, options) else {
      debug!("Not caching {} with non-positive ttl", key);
      return;
    };

    let encoded = encode_entry(&entry, self.inner.options.compression_threshold);

    {
      let mut memory = self.inner.memory.lock();
      let seq = memory.next_seq();
      entry.access_seq = seq;
      memory.entries.insert(key.clone(), entry);
      memory.stats.sets += 1;
      memory.evict_over_capacity(self.inner.options.max_memory_entries);

      // Queue while holding the lock so durable order matches memory order
      match encoded {
        Ok(bytes) => self.send(DurableOp::Set { key, bytes }),
        Err(e) => warn!("Failed to encode {} for durable tier: {}", key, e),
      }
    }
  }

  /// Return the cached value or compute, cache and return a fresh one.
  ///
  /// Concurrent misses on the same key each run `factory`.
  pub async fn get_or_set<F, Fut, E>(
    &self,
    key: &str,
    options: EntryOptions,
    factory: F,
  ) -> Result<T, E>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    if let Some(hit) = self.get(key).await {
      return Ok(hit);
    }

    let fresh = factory().await?;
    self.set(key, fresh.clone(), options);
    Ok(fresh)
  }

  /// Remove `key` from both tiers. Returns whether it was in memory.
  pub fn delete(&self, key: &str) -> bool {
    let mut memory = self.inner.memory.lock();
    let removed = memory.entries.remove(key).is_some();
    memory.epoch += 1;
    self.send(DurableOp::Delete(key.to_string()));
    removed
  }

  pub fn clear(&self) {
    let mut memory = self.inner.memory.lock();
    memory.entries.clear();
    memory.epoch += 1;
    self.send(DurableOp::Clear);
  }

  /// Apply each rule in turn. Returns how many memory entries were removed;
  /// matching durable entries are removed asynchronously.
  pub fn invalidate(&self, rules: &[InvalidationRule]) -> usize {
    let mut memory = self.inner.memory.lock();
    let mut removed = 0;
    memory.epoch += 1;

    for rule in rules {
      let before = memory.entries.len();
      memory.entries.retain(|key, entry| !rule.matches(key, entry));
      removed += before - memory.entries.len();
      self.send(DurableOp::Invalidate(rule.clone()));
    }

    memory.stats.invalidations += removed as u64;
    if removed > 0 {
      debug!("Invalidated {} entries", removed);
    }
    removed
  }

  /// Remove every expired entry from both tiers.
  pub fn sweep_expired(&self) -> usize {
    let now = self.inner.clock.now();
    let mut memory = self.inner.memory.lock();

    let before = memory.entries.len();
    memory.entries.retain(|_, entry| !entry.is_expired(now));
    let removed = before - memory.entries.len();
    memory.stats.expirations += removed as u64;

    self.send(DurableOp::Sweep(now));
    removed
  }

  /// Run [`sweep_expired`](Self::sweep_expired) every `every` until
  /// `cancel` fires.
  pub fn start_sweeper(&self, every: std::time::Duration, cancel: CancellationToken) -> JoinHandle<()> {
    let cache = self.clone();

    tokio::spawn(async move {
      let mut interval = tokio::time::interval(every);
      // The first tick completes immediately
      interval.tick().await;

      loop {
        tokio::select! {
          _ = cancel.cancelled() => break,
          _ = interval.tick() => {
            let removed = cache.sweep_expired();
            if removed > 0 {
              debug!("Expiry sweep removed {} entries", removed);
            }
          }
        }
      }
    })
  }

  /// Wait until every durable operation queued so far has been applied.
  pub async fn flush(&self) {
    let (tx, rx) = oneshot::channel();
    self.send(DurableOp::Flush(tx));
    let _ = rx.await;
  }

  /// Whether `key` is live in the memory tier. Does not count as an access.
  pub fn contains(&self, key: &str) -> bool {
    let now = self.inner.clock.now();
    self
      .inner
      .memory
      .lock()
      .entries
      .get(key)
      .map(|e| !e.is_expired(now))
      .unwrap_or(false)
  }

  pub fn len(&self) -> usize {
    self.inner.memory.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn stats(&self) -> CacheStats {
    let memory = self.inner.memory.lock();
    CacheStats {
      memory_entries: memory.entries.len(),
      ..memory.stats
    }
  }

  async fn read_durable(&self, key: &str) -> Option<Vec<u8>> {
    let (reply, rx) = oneshot::channel();
    self.send(DurableOp::Get {
      key: key.to_string(),
      reply,
    });
    rx.await.ok().flatten()
  }

  fn send(&self, op: DurableOp) {
    if self.inner.durable_tx.send(op).is_err() {
      warn!("Durable tier worker is gone; operation dropped");
    }
  }
}

/// Applies durable operations one at a time, in order. Failures are logged
/// and never surface to cache callers.
async fn run_durable_worker(store: Arc<dyn DurableStore>, mut rx: mpsc::UnboundedReceiver<DurableOp>) {
  while let Some(op) = rx.recv().await {
    match op {
      DurableOp::Set { key, bytes } => {
        if let Err(e) = store.set(&key, bytes).await {
          warn!("Durable write of {} failed: {}", key, e);
        }
      }
      DurableOp::Delete(key) => {
        if let Err(e) = store.delete(&key).await {
          warn!("Durable delete of {} failed: {}", key, e);
        }
      }
      DurableOp::Clear => {
        remove_keys(store.as_ref(), |_| true).await;
      }
      DurableOp::Invalidate(rule) => {
        if rule.is_key_rule() {
          remove_keys(store.as_ref(), |key| rule.matches_key(key)).await;
        } else {
          remove_entries(store.as_ref(), |key, entry| match entry {
            Some(entry) => rule.matches(key, entry),
            None => false,
          })
          .await;
        }
      }
      DurableOp::Sweep(now) => {
        remove_entries(store.as_ref(), |_, entry| match entry {
          Some(entry) => entry.is_expired(now),
          // Unreadable entries are garbage
          None => true,
        })
        .await;
      }
      DurableOp::Get { key, reply } => {
        let value = match store.get(&key).await {
          Ok(value) => value,
          Err(e) => {
            warn!("Durable read of {} failed: {}", key, e);
            None
          }
        };
        let _ = reply.send(value);
      }
      DurableOp::Flush(done) => {
        let _ = done.send(());
      }
    }
  }

  trace!("Durable tier worker stopped");
}

/// Delete every durable key matching `predicate`.
async fn remove_keys<P>(store: &dyn DurableStore, predicate: P)
where
  P: Fn(&str) -> bool,
{
  for key in list_keys(store).await {
    if predicate(&key) {
      delete_key(store, &key).await;
    }
  }
}

/// Delete every durable entry matching `predicate`, which receives `None`
/// for entries that cannot be decoded.
async fn remove_entries<P>(store: &dyn DurableStore, predicate: P)
where
  P: Fn(&str, Option<&CacheEntry<IgnoredAny>>) -> bool,
{
  for key in list_keys(store).await {
    let bytes = match store.get(&key).await {
      Ok(Some(bytes)) => bytes,
      Ok(None) => continue,
      Err(e) => {
        warn!("Durable read of {} failed: {}", key, e);
        continue;
      }
    };

    let entry = decode_entry::<IgnoredAny>(&bytes).ok();
    if predicate(&key, entry.as_ref()) {
      delete_key(store, &key).await;
    }
  }
}

async fn list_keys(store: &dyn DurableStore) -> Vec<String> {
  store.keys().await.unwrap_or_else(|e| {
    warn!("Failed to list durable keys: {}", e);
    Vec::new()
  })
}

async fn delete_key(store: &dyn DurableStore, key: &str) {
  if let Err(e) = store.delete(key).await {
    warn!("Durable delete of {} failed: {}", key, e);
  }
}
