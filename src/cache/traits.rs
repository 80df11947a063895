//! Core types for the caching system.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::http::{Response, ResponseType};

/// A response read back from a cache store.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// Request URL the entry was stored under
  pub url: String,
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a cache-first lookup got its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Entry found in the store, no network round-trip
  Cache,
  /// Fetched from network after a miss
  Network,
}

/// Why a network response was not written to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
  Status(u16),
  ResponseType(ResponseType),
  /// The store was deleted while the response was in flight
  StoreDeleted,
  Storage(String),
}

impl fmt::Display for SkipReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SkipReason::Status(status) => write!(f, "status {} is not cacheable", status),
      SkipReason::ResponseType(kind) => write!(f, "{} responses are not cached", kind),
      SkipReason::StoreDeleted => f.write_str("store no longer exists"),
      SkipReason::Storage(e) => write!(f, "cache write failed: {}", e),
    }
  }
}

/// Only complete same-origin responses are cached.
pub fn check_cacheable(response: &Response) -> Result<(), SkipReason> {
  if response.status != 200 {
    return Err(SkipReason::Status(response.status));
  }
  if response.response_type != ResponseType::Basic {
    return Err(SkipReason::ResponseType(response.response_type));
  }
  Ok(())
}

/// Stable, fixed-length storage key for an entry URL.
pub fn entry_hash(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  hex::encode(hasher.finalize())
}
