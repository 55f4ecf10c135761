//! Invalidation rules.

use regex::Regex;
use std::collections::BTreeSet;

use super::entry::CacheEntry;

/// Selects entries to drop from the cache.
///
/// Rules passed together to `CacheLayer::invalidate` are applied one after
/// another; they do not combine into a single predicate.
#[derive(Debug, Clone)]
pub enum InvalidationRule {
  Exact(String),
  Prefix(String),
  /// Regular expression matched against the key
  Pattern(Regex),
  /// Entries whose tag set intersects these tags
  Tag(BTreeSet<String>),
}

impl InvalidationRule {
  pub fn exact(key: impl Into<String>) -> Self {
    Self::Exact(key.into())
  }

  pub fn prefix(prefix: impl Into<String>) -> Self {
    Self::Prefix(prefix.into())
  }

  pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
    Ok(Self::Pattern(Regex::new(pattern)?))
  }

  pub fn tags<I, S>(tags: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self::Tag(tags.into_iter().map(Into::into).collect())
  }

  /// Whether the rule can be decided from the key alone.
  pub fn is_key_rule(&self) -> bool {
    !matches!(self, Self::Tag(_))
  }

  pub fn matches_key(&self, key: &str) -> bool {
    match self {
      Self::Exact(k) => k == key,
      Self::Prefix(p) => key.starts_with(p.as_str()),
      Self::Pattern(re) => re.is_match(key),
      Self::Tag(_) => false,
    }
  }

  pub fn matches<T>(&self, key: &str, entry: &CacheEntry<T>) -> bool {
    match self {
      Self::Tag(tags) => entry.has_any_tag(tags),
      _ => self.matches_key(key),
    }
  }
}
