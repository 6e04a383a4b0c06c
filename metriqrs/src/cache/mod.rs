//! Content-addressed result cache with pluggable backends.
//!
//! Keys are query fingerprints (see [`fingerprint`]). Backends are
//! interchangeable behind [`ResultCache`]; picking one is configuration,
//! not a core decision. Backend failures are reported as [`MetriqError::Cache`]
//! and the engine degrades them to a miss, never a request failure.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

#[allow(unused_imports)]
use crate::error::MetriqError;

pub mod fingerprint;
mod memory;
mod sqlite;

pub use memory::MemoryCache;
pub use sqlite::SqliteCache;

/// Cached rows plus column metadata, mirroring a connector result.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CachedPayload {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStatus {
    pub entries: usize,
    pub approximate_bytes: u64,
}

/// The cache contract.
///
/// Concurrent callers missing on the same fingerprint each execute
/// upstream independently; there is deliberately no single-flight
/// de-duplication. Reads and writes rely on the backend's own
/// concurrency guarantees.
pub trait ResultCache: Send + Sync {
    fn get(&self, fingerprint: &str) -> Result<Option<CachedPayload>>;
    fn put(&self, fingerprint: &str, payload: &CachedPayload, ttl: Duration) -> Result<()>;
    fn invalidate(&self, fingerprint: &str) -> Result<()>;
    /// Drop expired entries, returning how many were removed.
    fn evict_expired(&self) -> Result<usize>;
    fn clear(&self) -> Result<()>;
    fn status(&self) -> Result<CacheStatus>;
}
