//! Query history recording.
//!
//! Every execution appends a record: cache hits included (marked as
//! such), failures included (with error detail). Records are never
//! mutated; the only deletion is the bulk older-than purge.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::SystemTime;

use serde::Serialize;

use crate::error::{MetriqError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct QueryExecutionRecord {
    pub id: u64,
    pub metric: String,
    pub sql: String,
    pub success: bool,
    pub error: Option<String>,
    pub row_count: usize,
    pub duration_ms: u64,
    pub cache_hit: bool,
    pub executed_at: SystemTime,
}

/// A record before the store assigns id and timestamp.
#[derive(Debug, Clone, Default)]
pub struct NewExecutionRecord {
    pub metric: String,
    pub sql: String,
    pub success: bool,
    pub error: Option<String>,
    pub row_count: usize,
    pub duration_ms: u64,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub metric: Option<String>,
    pub success: Option<bool>,
    pub since: Option<SystemTime>,
    pub until: Option<SystemTime>,
    pub limit: Option<usize>,
}

/// Append-only persistence for execution records.
pub trait HistoryStore: Send + Sync {
    fn append(&self, record: NewExecutionRecord) -> Result<u64>;
    fn get(&self, id: u64) -> Result<Option<QueryExecutionRecord>>;
    /// Newest records first.
    fn list(&self, filter: &HistoryFilter) -> Result<Vec<QueryExecutionRecord>>;
    fn purge_older_than(&self, cutoff: SystemTime) -> Result<usize>;
}

/// In-memory store with a bounded record count; the oldest records drop
/// when the cap is reached.
pub struct MemoryHistoryStore {
    records: RwLock<Vec<QueryExecutionRecord>>,
    next_id: AtomicU64,
    max_records: usize,
}

impl Default for MemoryHistoryStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl MemoryHistoryStore {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            max_records: max_records.max(1),
        }
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn append(&self, record: NewExecutionRecord) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut records = self
            .records
            .write()
            .map_err(|_| MetriqError::Other(anyhow::anyhow!("history lock poisoned")))?;
        if records.len() >= self.max_records {
            let overflow = records.len() + 1 - self.max_records;
            records.drain(0..overflow);
        }
        records.push(QueryExecutionRecord {
            id,
            metric: record.metric,
            sql: record.sql,
            success: record.success,
            error: record.error,
            row_count: record.row_count,
            duration_ms: record.duration_ms,
            cache_hit: record.cache_hit,
            executed_at: SystemTime::now(),
        });
        Ok(id)
    }

    fn get(&self, id: u64) -> Result<Option<QueryExecutionRecord>> {
        let records = self
            .records
            .read()
            .map_err(|_| MetriqError::Other(anyhow::anyhow!("history lock poisoned")))?;
        Ok(records.iter().find(|r| r.id == id).cloned())
    }

    fn list(&self, filter: &HistoryFilter) -> Result<Vec<QueryExecutionRecord>> {
        let records = self
            .records
            .read()
            .map_err(|_| MetriqError::Other(anyhow::anyhow!("history lock poisoned")))?;
        let mut matched: Vec<_> = records
            .iter()
            .filter(|r| matches_filter(r, filter))
            .cloned()
            .collect();
        matched.reverse();
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    fn purge_older_than(&self, cutoff: SystemTime) -> Result<usize> {
        let mut records = self
            .records
            .write()
            .map_err(|_| MetriqError::Other(anyhow::anyhow!("history lock poisoned")))?;
        let before = records.len();
        records.retain(|r| r.executed_at >= cutoff);
        Ok(before - records.len())
    }
}

fn matches_filter(record: &QueryExecutionRecord, filter: &HistoryFilter) -> bool {
    if let Some(metric) = &filter.metric {
        if record.metric != *metric {
            return false;
        }
    }
    if let Some(success) = filter.success {
        if record.success != success {
            return false;
        }
    }
    if let Some(since) = filter.since {
        if record.executed_at < since {
            return false;
        }
    }
    if let Some(until) = filter.until {
        if record.executed_at > until {
            return false;
        }
    }
    true
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HistoryStats {
    pub total: usize,
    pub succeeded: usize,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub p95_duration_ms: u64,
    pub cache_hit_rate: f64,
}

/// Aggregate statistics over the records matching `filter`.
pub fn stats(store: &dyn HistoryStore, filter: &HistoryFilter) -> Result<HistoryStats> {
    let records = store.list(&HistoryFilter {
        limit: None,
        ..filter.clone()
    })?;
    if records.is_empty() {
        return Ok(HistoryStats::default());
    }

    let total = records.len();
    let succeeded = records.iter().filter(|r| r.success).count();
    let cache_hits = records.iter().filter(|r| r.cache_hit).count();
    let total_duration: u64 = records.iter().map(|r| r.duration_ms).sum();

    let mut durations: Vec<u64> = records.iter().map(|r| r.duration_ms).collect();
    durations.sort_unstable();
    let p95_idx = ((total as f64 * 0.95).ceil() as usize).clamp(1, total) - 1;

    Ok(HistoryStats {
        total,
        succeeded,
        success_rate: succeeded as f64 / total as f64,
        avg_duration_ms: total_duration as f64 / total as f64,
        p95_duration_ms: durations[p95_idx],
        cache_hit_rate: cache_hits as f64 / total as f64,
    })
}

/// Executions slower than `threshold_ms`, newest first.
pub fn slow_queries(
    store: &dyn HistoryStore,
    threshold_ms: u64,
    since: Option<SystemTime>,
) -> Result<Vec<QueryExecutionRecord>> {
    let records = store.list(&HistoryFilter {
        since,
        ..HistoryFilter::default()
    })?;
    Ok(records
        .into_iter()
        .filter(|r| r.duration_ms >= threshold_ms)
        .collect())
}
