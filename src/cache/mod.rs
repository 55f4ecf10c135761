//! Generic two-tier caching layer.
//!
//! This module knows nothing about pull requests or sync. It provides:
//! - A memory tier with per-entry TTL and LRU capacity eviction
//! - A best-effort durable tier behind an ordered write-behind worker
//! - Exact, prefix, pattern and tag invalidation
//! - Hit/miss statistics and a periodic expiry sweep

mod durable;
mod entry;
mod layer;
mod rules;
mod traits;

pub use durable::{decode_entry, encode_entry, is_compressed, DurableStore, MemoryStore, NoopStore, SqliteStore};
pub use entry::{CacheEntry, EntryOptions, MetaValue, Metadata};
pub use layer::{CacheLayer, CacheOptions, CacheStats};
pub use rules::InvalidationRule;
pub use traits::{CacheResult, CacheSource, Cacheable};
