//! In-process cache backend.
//!
//! Single instance, lost on restart. TTL tracked per entry; when full,
//! the oldest entry is evicted to make room.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{MetriqError, Result};

use super::{CacheStatus, CachedPayload, ResultCache};

#[derive(Debug)]
struct Entry {
    payload: CachedPayload,
    inserted_at: Instant,
    ttl: Duration,
    approximate_bytes: u64,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

#[derive(Debug)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    max_size: usize,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl MemoryCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_size: max_size.max(1),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| MetriqError::Cache("memory cache lock poisoned".to_string()))
    }
}

impl ResultCache for MemoryCache {
    fn get(&self, fingerprint: &str) -> Result<Option<CachedPayload>> {
        let entries = self.lock()?;
        Ok(entries.get(fingerprint).and_then(|entry| {
            if entry.is_expired() {
                // Expired - treat as a miss; eviction happens lazily.
                None
            } else {
                Some(entry.payload.clone())
            }
        }))
    }

    fn put(&self, fingerprint: &str, payload: &CachedPayload, ttl: Duration) -> Result<()> {
        let approximate_bytes = serde_json::to_string(payload)
            .map(|s| s.len() as u64)
            .unwrap_or(0);
        let mut entries = self.lock()?;
        if entries.len() >= self.max_size && !entries.contains_key(fingerprint) {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone())
            {
                tracing::debug!(fingerprint = %oldest, "evicting oldest cache entry");
                entries.remove(&oldest);
            }
        }
        entries.insert(
            fingerprint.to_string(),
            Entry {
                payload: payload.clone(),
                inserted_at: Instant::now(),
                ttl,
                approximate_bytes,
            },
        );
        Ok(())
    }

    fn invalidate(&self, fingerprint: &str) -> Result<()> {
        self.lock()?.remove(fingerprint);
        Ok(())
    }

    fn evict_expired(&self) -> Result<usize> {
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        Ok(before - entries.len())
    }

    fn clear(&self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }

    fn status(&self) -> Result<CacheStatus> {
        let entries = self.lock()?;
        Ok(CacheStatus {
            entries: entries.len(),
            approximate_bytes: entries.values().map(|e| e.approximate_bytes).sum(),
        })
    }
}
