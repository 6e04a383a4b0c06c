//! The execution engine.
//!
//! Orchestrates resolve -> compile -> cache lookup -> pre-aggregation
//! rewrite -> connector dispatch -> cache store -> history logging. The
//! engine is stateless per request beyond the injected cache and
//! pre-aggregation state, so multiple instances can run against a shared
//! cache backend without coordination.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::cache::{CacheStatus, CachedPayload, ResultCache};
use crate::compiler::{self, CompileOptions, CompiledQuery, QueryScope};
use crate::config::MetriqConfig;
use crate::connectors::{Connector, ConnectorManager, QueryResult};
use crate::context::ContextProvider;
use crate::error::{MetriqError, Result};
use crate::history::{HistoryStore, NewExecutionRecord};
use crate::metrics::{ModifierSet, SemanticMetric};
use crate::preagg::{BuildOutcome, PreAggregationPlanner, RefreshPolicy};
use crate::registry::MetricRegistry;
use crate::resolver::{self, ResolvedMetric};

/// What to execute: a registered metric or variant by name, or an inline
/// definition.
#[derive(Debug, Clone)]
pub enum ExecuteTarget {
    Named(String),
    Inline(Box<SemanticMetric>),
}

#[derive(Debug, Clone, Default)]
pub struct CachePreference {
    pub enabled: Option<bool>,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub target: ExecuteTarget,
    pub modifiers: Option<ModifierSet>,
    pub params: HashMap<String, Value>,
    pub context_id: Option<String>,
    pub cache: CachePreference,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub grouped: Option<bool>,
    pub scope: QueryScope,
}

impl ExecuteRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            target: ExecuteTarget::Named(name.into()),
            modifiers: None,
            params: HashMap::new(),
            context_id: None,
            cache: CachePreference::default(),
            limit: None,
            offset: None,
            grouped: None,
            scope: QueryScope::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionMetadata {
    pub sql: String,
    pub cached: bool,
    /// Id of the pre-aggregation that served the query, if any.
    pub rollup: Option<String>,
    pub execution_time_ms: u64,
}

/// Structured outcome of an execution. Connector failures arrive here as
/// `success = false` with error detail, never as a panic or an `Err`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub success: bool,
    pub columns: Vec<String>,
    pub data: Vec<Map<String, Value>>,
    pub metadata: ExecutionMetadata,
    pub errors: Vec<String>,
}

pub struct ExecutionEngine {
    registry: Arc<RwLock<MetricRegistry>>,
    connectors: ConnectorManager,
    cache: Arc<dyn ResultCache>,
    preaggs: Arc<PreAggregationPlanner>,
    history: Arc<dyn HistoryStore>,
    context: Arc<dyn ContextProvider>,
    config: MetriqConfig,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<RwLock<MetricRegistry>>,
        connectors: ConnectorManager,
        cache: Arc<dyn ResultCache>,
        preaggs: Arc<PreAggregationPlanner>,
        history: Arc<dyn HistoryStore>,
        context: Arc<dyn ContextProvider>,
        config: MetriqConfig,
    ) -> Self {
        Self {
            registry,
            connectors,
            cache,
            preaggs,
            history,
            context,
            config,
        }
    }

    pub fn registry(&self) -> Arc<RwLock<MetricRegistry>> {
        self.registry.clone()
    }

    pub fn history(&self) -> Arc<dyn HistoryStore> {
        self.history.clone()
    }

    pub fn preaggs(&self) -> Arc<PreAggregationPlanner> {
        self.preaggs.clone()
    }

    /// Execute a metric or variant.
    pub async fn execute(&self, request: ExecuteRequest) -> ExecutionResult {
        let start = Instant::now();
        let target_name = match &request.target {
            ExecuteTarget::Named(name) => name.clone(),
            ExecuteTarget::Inline(metric) => metric.name.clone(),
        };

        let resolved = match self.resolve_target(&request) {
            Ok(resolved) => resolved,
            Err(e) => return self.failure(&target_name, String::new(), start, e),
        };
        let metric = &resolved.metric;

        let connector = match self.connectors.get(&metric.data_source) {
            Some(connector) => connector.clone(),
            None => {
                return self.failure(
                    &metric.name,
                    String::new(),
                    start,
                    MetriqError::Connector(format!(
                        "data source {} not registered",
                        metric.data_source
                    )),
                )
            }
        };

        let options = match self.build_options(&request, metric).await {
            Ok(options) => options,
            Err(e) => return self.failure(&metric.name, String::new(), start, e),
        };

        let compiled = match compiler::compile(&resolved, connector.dialect(), &options) {
            Ok(compiled) => compiled,
            Err(e) => return self.failure(&metric.name, String::new(), start, e),
        };

        let (cache_enabled, ttl) = self.cache_preference(&request, metric);

        if cache_enabled {
            match self.cache.get(&compiled.fingerprint) {
                Ok(Some(payload)) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    self.record(NewExecutionRecord {
                        metric: metric.name.clone(),
                        sql: compiled.sql.clone(),
                        success: true,
                        error: None,
                        row_count: payload.rows.len(),
                        duration_ms: elapsed,
                        cache_hit: true,
                    });
                    return ExecutionResult {
                        success: true,
                        columns: payload.columns,
                        data: payload.rows,
                        metadata: ExecutionMetadata {
                            sql: compiled.sql,
                            cached: true,
                            rollup: None,
                            execution_time_ms: elapsed,
                        },
                        errors: Vec::new(),
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    // Cache backends degrade to a forced miss.
                    tracing::warn!(error = %e, "cache lookup failed; executing directly");
                }
            }
        }

        // A completed rollup covering the query serves it instead of the
        // raw source.
        let mut rollup = None;
        let mut effective = compiled.clone();
        if let Some(spec) = self.preaggs.find_serving_spec(&metric.name, &resolved) {
            match self
                .preaggs
                .rewrite(&spec, &resolved, connector.dialect(), &options)
            {
                Ok(rewritten) => {
                    tracing::debug!(spec = %spec.id, metric = %metric.name, "serving from rollup");
                    rollup = Some(spec.id.clone());
                    effective = rewritten;
                }
                Err(e) => {
                    tracing::warn!(spec = %spec.id, error = %e, "rollup rewrite failed; using raw source");
                }
            }
        }

        let timeout = self.query_timeout(&metric.data_source);
        let dispatch = tokio::time::timeout(
            timeout,
            connector.execute(&effective.sql, &effective.bindings),
        )
        .await;
        let outcome = match dispatch {
            Ok(result) => result,
            Err(_) => Err(MetriqError::Connector(format!(
                "query timed out after {} ms",
                timeout.as_millis()
            ))),
        };

        match outcome {
            Ok(result) => {
                let elapsed = start.elapsed().as_millis() as u64;
                if cache_enabled {
                    let payload = to_payload(&result);
                    if let Err(e) = self.cache.put(&compiled.fingerprint, &payload, ttl) {
                        tracing::warn!(error = %e, "cache store failed");
                    }
                }
                self.record(NewExecutionRecord {
                    metric: metric.name.clone(),
                    sql: effective.sql.clone(),
                    success: true,
                    error: None,
                    row_count: result.rows.len(),
                    duration_ms: elapsed,
                    cache_hit: false,
                });
                ExecutionResult {
                    success: true,
                    columns: result.columns.iter().map(|c| c.name.clone()).collect(),
                    data: result.rows,
                    metadata: ExecutionMetadata {
                        sql: effective.sql,
                        cached: false,
                        rollup,
                        execution_time_ms: elapsed,
                    },
                    errors: Vec::new(),
                }
            }
            Err(e) => self.failure(&metric.name, effective.sql, start, e),
        }
    }

    /// Compile without dispatching: the preview surface.
    pub async fn compile_only(&self, request: &ExecuteRequest) -> Result<CompiledQuery> {
        let resolved = self.resolve_target(request)?;
        let connector = self
            .connectors
            .get(&resolved.metric.data_source)
            .ok_or_else(|| {
                MetriqError::Connector(format!(
                    "data source {} not registered",
                    resolved.metric.data_source
                ))
            })?;
        let options = self.build_options(request, &resolved.metric).await?;
        compiler::compile(&resolved, connector.dialect(), &options)
    }

    fn resolve_target(&self, request: &ExecuteRequest) -> Result<ResolvedMetric> {
        let registry = self
            .registry
            .read()
            .map_err(|_| MetriqError::Other(anyhow::anyhow!("registry lock poisoned")))?;
        match &request.target {
            ExecuteTarget::Inline(metric) => {
                resolver::resolve(metric, request.modifiers.as_ref(), None, &[])
            }
            ExecuteTarget::Named(name) => {
                if let Some(variant) = registry.get_variant(name) {
                    resolver::resolve_variant(variant, request.modifiers.as_ref(), |id| {
                        registry.get_metric(id).cloned()
                    })
                } else if let Some(metric) = registry.get_metric(name) {
                    resolver::resolve(metric, request.modifiers.as_ref(), None, &[])
                } else {
                    Err(MetriqError::Resolution(format!(
                        "unknown metric or variant {name}"
                    )))
                }
            }
        }
    }

    async fn build_options(
        &self,
        request: &ExecuteRequest,
        metric: &SemanticMetric,
    ) -> Result<CompileOptions> {
        let context = match &request.context_id {
            Some(context_id) => self.context.resolve(context_id).await?,
            None => HashMap::new(),
        };

        let query_cfg = &self.config.for_datasource(&metric.data_source).query;
        let mut limit = request.limit.or(metric.limit);
        if limit.is_none() && query_cfg.default_row_limit > 0 {
            limit = Some(query_cfg.default_row_limit);
        }
        if query_cfg.max_row_limit > 0 {
            limit = limit.map(|l| l.min(query_cfg.max_row_limit));
        }

        Ok(CompileOptions {
            params: request.params.clone(),
            context,
            limit,
            offset: request.offset,
            grouped: request.grouped,
            scope: request.scope.clone(),
        })
    }

    fn cache_preference(
        &self,
        request: &ExecuteRequest,
        metric: &SemanticMetric,
    ) -> (bool, Duration) {
        let policy = metric.cache.as_ref();
        let enabled = request
            .cache
            .enabled
            .or(policy.map(|p| p.enabled))
            .unwrap_or(self.config.defaults.cache.enabled);
        // A request-level TTL always wins over the metric default.
        let ttl_secs = request
            .cache
            .ttl_secs
            .or(policy.and_then(|p| p.ttl_secs))
            .unwrap_or(self.config.defaults.cache.ttl_secs);
        (enabled, Duration::from_secs(ttl_secs))
    }

    fn query_timeout(&self, data_source: &str) -> Duration {
        Duration::from_millis(self.config.for_datasource(data_source).query.timeout_ms)
    }

    fn failure(
        &self,
        metric: &str,
        sql: String,
        start: Instant,
        error: MetriqError,
    ) -> ExecutionResult {
        let elapsed = start.elapsed().as_millis() as u64;
        let message = error.to_string();
        tracing::warn!(metric = metric, error = %message, "execution failed");
        self.record(NewExecutionRecord {
            metric: metric.to_string(),
            sql: sql.clone(),
            success: false,
            error: Some(message.clone()),
            row_count: 0,
            duration_ms: elapsed,
            cache_hit: false,
        });
        ExecutionResult {
            success: false,
            columns: Vec::new(),
            data: Vec::new(),
            metadata: ExecutionMetadata {
                sql,
                cached: false,
                rollup: None,
                execution_time_ms: elapsed,
            },
            errors: vec![message],
        }
    }

    fn record(&self, record: NewExecutionRecord) {
        if let Err(e) = self.history.append(record) {
            tracing::warn!(error = %e, "failed to append history record");
        }
    }

    // ------------------------------------------------------------------
    // Pre-aggregation entry points (called by the host's scheduler)
    // ------------------------------------------------------------------

    /// Build or refresh a pre-aggregation. A dry run returns the
    /// materialization statement without executing it or touching build
    /// state.
    pub async fn refresh_preagg(&self, spec_id: &str, dry_run: bool) -> Result<BuildOutcome> {
        let spec = self.preaggs.get(spec_id).ok_or_else(|| {
            MetriqError::PreAggregation(format!("unknown pre-aggregation {spec_id}"))
        })?;
        let source = self.source_metric(&spec.metric)?;
        let connector = self.connector_for(&source)?;

        let watermark = match &spec.refresh {
            RefreshPolicy::Sql { check_sql } => {
                Some(self.run_watermark_query(&connector, check_sql).await?)
            }
            _ => None,
        };

        self.preaggs
            .build(spec_id, &source, &connector, dry_run, watermark)
            .await
    }

    /// Whether the spec's refresh policy says it is due, evaluating the
    /// driving query for `Sql` policies.
    pub async fn preagg_due_for_refresh(&self, spec_id: &str) -> Result<bool> {
        let spec = self.preaggs.get(spec_id).ok_or_else(|| {
            MetriqError::PreAggregation(format!("unknown pre-aggregation {spec_id}"))
        })?;
        let watermark = match &spec.refresh {
            RefreshPolicy::Sql { check_sql } => {
                let source = self.source_metric(&spec.metric)?;
                let connector = self.connector_for(&source)?;
                Some(self.run_watermark_query(&connector, check_sql).await?)
            }
            _ => None,
        };
        Ok(self.preaggs.should_refresh(&spec, watermark.as_ref()))
    }

    /// Delete a spec and drop its materialized storage.
    pub async fn delete_preagg(&self, spec_id: &str) -> Result<bool> {
        let Some(spec) = self.preaggs.remove(spec_id)? else {
            return Ok(false);
        };
        match self.source_metric(&spec.metric) {
            Ok(source) => match self.connector_for(&source) {
                Ok(connector) => {
                    let statement = self.preaggs.drop_statement(&spec, connector.dialect());
                    if let Err(e) = connector.execute_statement(&statement).await {
                        tracing::warn!(spec = spec_id, error = %e, "failed to drop rollup storage");
                    }
                }
                Err(e) => {
                    tracing::warn!(spec = spec_id, error = %e, "no connector to drop rollup storage")
                }
            },
            Err(e) => {
                tracing::warn!(spec = spec_id, error = %e, "source metric missing while dropping storage")
            }
        }
        Ok(true)
    }

    async fn run_watermark_query(
        &self,
        connector: &Arc<dyn Connector>,
        check_sql: &str,
    ) -> Result<Value> {
        let result = connector.execute(check_sql, &[]).await?;
        Ok(first_value(&result).unwrap_or(Value::Null))
    }

    fn source_metric(&self, name: &str) -> Result<SemanticMetric> {
        let registry = self
            .registry
            .read()
            .map_err(|_| MetriqError::Other(anyhow::anyhow!("registry lock poisoned")))?;
        registry.get_metric(name).cloned().ok_or_else(|| {
            MetriqError::PreAggregation(format!("source metric {name} not found"))
        })
    }

    fn connector_for(&self, metric: &SemanticMetric) -> Result<Arc<dyn Connector>> {
        self.connectors
            .get(&metric.data_source)
            .cloned()
            .ok_or_else(|| {
                MetriqError::Connector(format!(
                    "data source {} not registered",
                    metric.data_source
                ))
            })
    }

    // ------------------------------------------------------------------
    // Cache administration (operator surface)
    // ------------------------------------------------------------------

    pub fn cache_status(&self) -> Result<CacheStatus> {
        self.cache.status()
    }

    pub fn cache_evict_expired(&self) -> Result<usize> {
        self.cache.evict_expired()
    }

    pub fn cache_invalidate(&self, fingerprint: &str) -> Result<()> {
        self.cache.invalidate(fingerprint)
    }

    pub fn cache_clear(&self) -> Result<()> {
        self.cache.clear()
    }
}

fn to_payload(result: &QueryResult) -> CachedPayload {
    CachedPayload {
        columns: result.columns.iter().map(|c| c.name.clone()).collect(),
        rows: result.rows.clone(),
    }
}

fn first_value(result: &QueryResult) -> Option<Value> {
    let row = result.rows.first()?;
    let column = result.columns.first()?;
    row.get(&column.name).cloned()
}
