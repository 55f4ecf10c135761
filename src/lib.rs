//! Offline-first cache and sync engine for pull requests and comment threads.
//!
//! - [`retry`]: exponential backoff around fallible async calls
//! - [`cache`]: generic two-tier cache with TTL, LRU and rule-based invalidation
//! - [`sync`]: background synchronizer with offline queueing and conflict handling
//! - [`service`]: cache-first access to remote entities

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod remote;
pub mod retry;
pub mod service;
pub mod store;
pub mod sync;

pub use error::{ErrorKind, SyncError};
