//! Cache entries and the options used to create them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Scalar metadata value attached to an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum MetaValue {
  Str(String),
  Int(i64),
  Float(f64),
  Bool(bool),
}

impl From<&str> for MetaValue {
  fn from(v: &str) -> Self {
    Self::Str(v.to_string())
  }
}

impl From<String> for MetaValue {
  fn from(v: String) -> Self {
    Self::Str(v)
  }
}

impl From<i64> for MetaValue {
  fn from(v: i64) -> Self {
    Self::Int(v)
  }
}

impl From<f64> for MetaValue {
  fn from(v: f64) -> Self {
    Self::Float(v)
  }
}

impl From<bool> for MetaValue {
  fn from(v: bool) -> Self {
    Self::Bool(v)
  }
}

pub type Metadata = BTreeMap<String, MetaValue>;

/// A cached value plus its bookkeeping.
///
/// `expires_at` is always strictly after `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
  pub data: T,
  pub created_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
  pub access_count: u64,
  pub last_accessed_at: DateTime<Utc>,
  #[serde(default)]
  pub tags: BTreeSet<String>,
  #[serde(default)]
  pub metadata: Metadata,
  /// Tie-breaker for entries touched within the same clock instant
  #[serde(skip)]
  pub(crate) access_seq: u64,
}

impl<T> CacheEntry<T> {
  /// Returns `None` when `ttl` is not positive.
  pub fn new(data: T, now: DateTime<Utc>, ttl: Duration, options: EntryOptions) -> Option<Self> {
    if ttl <= Duration::zero() {
      return None;
    }

    Some(Self {
      data,
      created_at: now,
      // Too far out to represent means it never expires
      expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
      access_count: 0,
      last_accessed_at: now,
      tags: options.tags,
      metadata: options.metadata,
      access_seq: 0,
    })
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at
  }

  pub fn has_any_tag(&self, tags: &BTreeSet<String>) -> bool {
    !self.tags.is_disjoint(tags)
  }

  pub(crate) fn touch(&mut self, now: DateTime<Utc>, seq: u64) {
    self.access_count += 1;
    self.last_accessed_at = now;
    self.access_seq = seq;
  }
}

/// Optional arguments to `CacheLayer::set`.
#[derive(Debug, Clone, Default)]
pub struct EntryOptions {
  /// Overrides the layer's default TTL
  pub ttl: Option<Duration>,
  pub tags: BTreeSet<String>,
  pub metadata: Metadata,
}

impl EntryOptions {
  pub fn ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  pub fn tag(mut self, tag: impl Into<String>) -> Self {
    self.tags.insert(tag.into());
    self
  }

  pub fn tags<I, S>(mut self, tags: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.tags.extend(tags.into_iter().map(Into::into));
    self
  }

  pub fn meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
    self.metadata.insert(key.into(), value.into());
    self
  }
}
