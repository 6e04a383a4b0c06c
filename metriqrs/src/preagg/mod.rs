//! Pre-aggregation (rollup) specifications and build state.
//!
//! A spec selects a dimension/measure subset of a source metric and is
//! materialized into a storage object that can transparently satisfy
//! queries covered by that subset. Builds run asynchronously; the state
//! machine here is the only coordination: `pending -> building ->
//! completed`, `building -> failed`, and re-entry into `building` on
//! refresh or retry. Only one build may be in flight per spec.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MetriqError, Result};
use crate::metrics::TimeGrain;

mod planner;

pub use planner::BuildOutcome;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreAggregationSpec {
    pub id: String,
    /// Source metric name.
    pub metric: String,
    /// Retained dimensions (by name).
    pub dimensions: Vec<String>,
    /// Retained measures (by name).
    pub measures: Vec<String>,
    #[serde(default)]
    pub rollup_type: RollupType,
    #[serde(default)]
    pub partition: Option<PartitionSpec>,
    pub refresh: RefreshPolicy,
    #[serde(default)]
    pub storage: StorageMode,
}

impl PreAggregationSpec {
    /// The name of the materialized storage object.
    pub fn storage_name(&self) -> String {
        format!("preagg_{}", self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RollupType {
    #[default]
    Rollup,
    /// Materialize the metric's full original query instead of a subset.
    OriginalSql,
    /// Rollup whose freshness degenerates to the refresh cadence; served
    /// exactly like `Rollup`.
    RollupLambda,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionSpec {
    pub dimension: String,
    pub granularity: TimeGrain,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// Rebuild on a fixed wall-clock interval.
    Every { secs: u64 },
    /// Rebuild only when a driving max-timestamp query reports new data.
    Sql { check_sql: String },
    /// Rebuild only when the last build is older than the staleness window.
    MaxAge { secs: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    #[default]
    Table,
    MaterializedView,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    #[default]
    Pending,
    Building,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct BuildState {
    pub status: BuildStatus,
    pub built_at: Option<SystemTime>,
    pub row_count: Option<usize>,
    pub message: Option<String>,
    /// Last observed value of a `Sql` refresh policy's driving query.
    pub watermark: Option<Value>,
}

/// Spec store plus per-spec build state.
///
/// The planner is advisory: it never mutates a spec concurrently with a
/// build, and a refresh against a spec already building fails fast.
#[derive(Default)]
pub struct PreAggregationPlanner {
    specs: Mutex<HashMap<String, PreAggregationSpec>>,
    states: Mutex<HashMap<String, BuildState>>,
}

impl PreAggregationPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or update a spec. Rejected while a build is in flight.
    pub fn upsert_spec(&self, spec: PreAggregationSpec) -> Result<()> {
        if let Some(partition) = &spec.partition {
            if !spec.dimensions.contains(&partition.dimension) {
                return Err(MetriqError::PreAggregation(format!(
                    "partition dimension {} must be one of the retained dimensions",
                    partition.dimension
                )));
            }
        }
        let state = self.state(&spec.id);
        if state.status == BuildStatus::Building {
            return Err(MetriqError::PreAggregation(format!(
                "pre-aggregation {} is building; try again after the build finishes",
                spec.id
            )));
        }
        self.lock_states()?
            .entry(spec.id.clone())
            .or_default();
        self.lock_specs()?.insert(spec.id.clone(), spec);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<PreAggregationSpec> {
        self.specs.lock().ok()?.get(id).cloned()
    }

    pub fn list(&self) -> Vec<PreAggregationSpec> {
        match self.specs.lock() {
            Ok(specs) => {
                let mut all: Vec<_> = specs.values().cloned().collect();
                all.sort_by(|a, b| a.id.cmp(&b.id));
                all
            }
            Err(_) => Vec::new(),
        }
    }

    /// Remove a spec, returning it so the caller can drop its storage.
    pub fn remove(&self, id: &str) -> Result<Option<PreAggregationSpec>> {
        let state = self.state(id);
        if state.status == BuildStatus::Building {
            return Err(MetriqError::PreAggregation(format!(
                "pre-aggregation {id} is building and cannot be deleted"
            )));
        }
        self.lock_states()?.remove(id);
        Ok(self.lock_specs()?.remove(id))
    }

    /// Specs covering a given metric, most recently completed first kept
    /// in stable id order.
    pub fn specs_for_metric(&self, metric: &str) -> Vec<PreAggregationSpec> {
        self.list()
            .into_iter()
            .filter(|spec| spec.metric == metric)
            .collect()
    }

    pub fn state(&self, id: &str) -> BuildState {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(id).cloned())
            .unwrap_or_default()
    }

    /// Transition into `building`, failing fast if a build is in flight.
    fn begin_build(&self, id: &str) -> Result<()> {
        let mut states = self.lock_states()?;
        let state = states.entry(id.to_string()).or_default();
        if state.status == BuildStatus::Building {
            return Err(MetriqError::PreAggregation(format!(
                "pre-aggregation {id} is already building"
            )));
        }
        state.status = BuildStatus::Building;
        state.message = None;
        Ok(())
    }

    fn complete_build(&self, id: &str, row_count: usize, watermark: Option<Value>) -> Result<()> {
        let mut states = self.lock_states()?;
        let state = states.entry(id.to_string()).or_default();
        state.status = BuildStatus::Completed;
        state.built_at = Some(SystemTime::now());
        state.row_count = Some(row_count);
        state.message = None;
        if watermark.is_some() {
            state.watermark = watermark;
        }
        Ok(())
    }

    fn fail_build(&self, id: &str, message: String) -> Result<()> {
        let mut states = self.lock_states()?;
        let state = states.entry(id.to_string()).or_default();
        state.status = BuildStatus::Failed;
        state.message = Some(message);
        Ok(())
    }

    fn lock_specs(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, PreAggregationSpec>>> {
        self.specs
            .lock()
            .map_err(|_| MetriqError::PreAggregation("spec store lock poisoned".to_string()))
    }

    fn lock_states(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, BuildState>>> {
        self.states
            .lock()
            .map_err(|_| MetriqError::PreAggregation("state store lock poisoned".to_string()))
    }
}
