//! SQLite-backed cache backend.
//!
//! Shared across instances through a common database file and survives
//! restarts. Entries carry an absolute expiry in epoch seconds; the
//! schema is versioned and auto-clears on mismatch.

use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{MetriqError, Result};

use super::{CacheStatus, CachedPayload, ResultCache};

/// Current cache schema version. Bump this when the layout changes.
const CACHE_VERSION: i64 = 1;

pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    /// Open or create a cache database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| MetriqError::Cache(format!("open cache db: {e}")))?;
        let cache = Self {
            conn: Mutex::new(conn),
        };
        cache.init_schema()?;
        Ok(cache)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_meta (key TEXT PRIMARY KEY, value INTEGER NOT NULL);
             CREATE TABLE IF NOT EXISTS cache_entries (
                 fingerprint TEXT PRIMARY KEY,
                 payload TEXT NOT NULL,
                 created_at INTEGER NOT NULL,
                 expires_at INTEGER NOT NULL
             );",
        )
        .map_err(sqlite_err)?;

        let version: Option<i64> = conn
            .query_row(
                "SELECT value FROM cache_meta WHERE key = 'version'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(sqlite_err)?;

        match version {
            Some(v) if v == CACHE_VERSION => {}
            Some(_) => {
                tracing::info!("cache schema version mismatch, clearing");
                conn.execute("DELETE FROM cache_entries", [])
                    .map_err(sqlite_err)?;
                conn.execute(
                    "INSERT OR REPLACE INTO cache_meta (key, value) VALUES ('version', ?1)",
                    params![CACHE_VERSION],
                )
                .map_err(sqlite_err)?;
            }
            None => {
                conn.execute(
                    "INSERT OR REPLACE INTO cache_meta (key, value) VALUES ('version', ?1)",
                    params![CACHE_VERSION],
                )
                .map_err(sqlite_err)?;
            }
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| MetriqError::Cache("sqlite cache lock poisoned".to_string()))
    }
}

fn sqlite_err(e: rusqlite::Error) -> MetriqError {
    MetriqError::Cache(format!("sqlite: {e}"))
}

fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl ResultCache for SqliteCache {
    fn get(&self, fingerprint: &str) -> Result<Option<CachedPayload>> {
        let conn = self.lock()?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT payload, expires_at FROM cache_entries WHERE fingerprint = ?1",
                params![fingerprint],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(sqlite_err)?;

        match row {
            Some((payload, expires_at)) if expires_at > epoch_secs() => {
                let payload: CachedPayload = serde_json::from_str(&payload)?;
                Ok(Some(payload))
            }
            Some(_) => {
                // Expired - drop eagerly so shared readers agree.
                conn.execute(
                    "DELETE FROM cache_entries WHERE fingerprint = ?1",
                    params![fingerprint],
                )
                .map_err(sqlite_err)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn put(&self, fingerprint: &str, payload: &CachedPayload, ttl: Duration) -> Result<()> {
        let serialized = serde_json::to_string(payload)?;
        let now = epoch_secs();
        let expires_at = now + ttl.as_secs() as i64;
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO cache_entries (fingerprint, payload, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![fingerprint, serialized, now, expires_at],
            )
            .map_err(sqlite_err)?;
        Ok(())
    }

    fn invalidate(&self, fingerprint: &str) -> Result<()> {
        self.lock()?
            .execute(
                "DELETE FROM cache_entries WHERE fingerprint = ?1",
                params![fingerprint],
            )
            .map_err(sqlite_err)?;
        Ok(())
    }

    fn evict_expired(&self) -> Result<usize> {
        let removed = self
            .lock()?
            .execute(
                "DELETE FROM cache_entries WHERE expires_at <= ?1",
                params![epoch_secs()],
            )
            .map_err(sqlite_err)?;
        Ok(removed)
    }

    fn clear(&self) -> Result<()> {
        self.lock()?
            .execute("DELETE FROM cache_entries", [])
            .map_err(sqlite_err)?;
        Ok(())
    }

    fn status(&self) -> Result<CacheStatus> {
        let conn = self.lock()?;
        let (entries, bytes): (i64, Option<i64>) = conn
            .query_row(
                "SELECT COUNT(*), SUM(LENGTH(payload)) FROM cache_entries",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(sqlite_err)?;
        Ok(CacheStatus {
            entries: entries as usize,
            approximate_bytes: bytes.unwrap_or(0) as u64,
        })
    }
}
