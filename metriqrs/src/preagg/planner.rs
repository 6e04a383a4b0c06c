//! Rollup eligibility, query rewriting, builds and refresh evaluation.

use std::sync::Arc;

use serde_json::Value;

use crate::compiler::{self, CompileOptions, CompiledQuery};
use crate::connectors::Connector;
use crate::dialect::Dialect;
use crate::error::{MetriqError, Result};
use crate::metrics::{
    Aggregation, Dimension, Expr, Filter, FilterType, Measure, SemanticMetric,
};
use crate::resolver::ResolvedMetric;
use crate::sql_ast::{inline_query_binds, SqlRenderer};

use super::{
    BuildStatus, PreAggregationPlanner, PreAggregationSpec, RefreshPolicy, RollupType, StorageMode,
};

/// Result of a build request.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub statement: String,
    pub row_count: Option<usize>,
    pub dry_run: bool,
}

/// How a measure's stored aggregate is folded when reading the rollup.
///
/// SUM and COUNT re-aggregate with SUM; MIN and MAX are associative and
/// reuse their own function. Averages, distinct counts and custom
/// aggregations cannot be re-aggregated from a rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaggStrategy {
    Sum,
    SameAgg,
    NotServable,
}

fn classify_aggregation(agg: &Aggregation) -> ReaggStrategy {
    match agg {
        Aggregation::Sum | Aggregation::Count => ReaggStrategy::Sum,
        Aggregation::Min | Aggregation::Max => ReaggStrategy::SameAgg,
        Aggregation::Avg | Aggregation::CountDistinct | Aggregation::Custom { .. } => {
            ReaggStrategy::NotServable
        }
    }
}

fn reaggregate(agg: &Aggregation) -> Option<Aggregation> {
    match classify_aggregation(agg) {
        ReaggStrategy::Sum => Some(Aggregation::Sum),
        ReaggStrategy::SameAgg => Some(agg.clone()),
        ReaggStrategy::NotServable => None,
    }
}

/// The retained dimension a filter is expressible against, if any.
fn filter_dimension<'m>(metric: &'m SemanticMetric, filter: &Filter) -> Option<&'m Dimension> {
    let column = match &filter.expr {
        Expr::Column { column } => column.rsplit('.').next()?,
        _ => return None,
    };
    metric.dimensions.iter().find(|dim| {
        if dim.name == column {
            return true;
        }
        matches!(
            &dim.expr,
            Some(Expr::Column { column: expr_col })
                if expr_col.rsplit('.').next() == Some(column)
        )
    })
}

impl PreAggregationPlanner {
    /// Whether a completed rollup can satisfy the resolved metric without
    /// changing its semantics: every requested dimension and measure must
    /// be retained, every measure re-aggregatable, and every filter
    /// expressible against a retained dimension.
    pub fn can_serve(&self, spec: &PreAggregationSpec, resolved: &ResolvedMetric) -> bool {
        let metric = &resolved.metric;
        if !metric.grouped {
            return false;
        }
        for dim in &metric.dimensions {
            if !spec.dimensions.contains(&dim.name) {
                return false;
            }
        }
        for measure in &metric.measures {
            if !spec.measures.contains(&measure.name) {
                return false;
            }
            if classify_aggregation(&measure.agg) == ReaggStrategy::NotServable {
                return false;
            }
        }
        for filter in metric.filters.iter().filter(|f| f.active) {
            if filter.filter_type == FilterType::Having {
                return false;
            }
            match filter_dimension(metric, filter) {
                Some(dim) if spec.dimensions.contains(&dim.name) => {}
                _ => return false,
            }
        }
        true
    }

    /// The first completed spec for `metric_name` able to serve the
    /// resolved metric.
    pub fn find_serving_spec(
        &self,
        metric_name: &str,
        resolved: &ResolvedMetric,
    ) -> Option<PreAggregationSpec> {
        self.specs_for_metric(metric_name)
            .into_iter()
            .find(|spec| {
                self.state(&spec.id).status == BuildStatus::Completed
                    && self.can_serve(spec, resolved)
            })
    }

    /// Rewrite the resolved metric to read from the rollup's storage
    /// object. Dimensions become plain columns, measures re-aggregate the
    /// stored aggregates, filters move onto the retained dimension
    /// columns; derived entities compile unchanged on top.
    pub fn rewrite(
        &self,
        spec: &PreAggregationSpec,
        resolved: &ResolvedMetric,
        dialect: &dyn Dialect,
        options: &CompileOptions,
    ) -> Result<CompiledQuery> {
        let metric = &resolved.metric;
        let storage = spec.storage_name();

        let dimensions = metric
            .dimensions
            .iter()
            .map(|dim| Dimension {
                name: dim.name.clone(),
                expr: Some(Expr::Column {
                    column: dim.name.clone(),
                }),
                table: None,
                combine: None,
                conditional: None,
                format: dim.format.clone(),
                description: None,
            })
            .collect();

        let mut measures = Vec::with_capacity(metric.measures.len());
        for measure in &metric.measures {
            let agg = reaggregate(&measure.agg).ok_or_else(|| {
                MetriqError::PreAggregation(format!(
                    "measure {} cannot be re-aggregated from rollup {}",
                    measure.name, spec.id
                ))
            })?;
            measures.push(Measure {
                name: measure.name.clone(),
                agg,
                expr: Some(Expr::Column {
                    column: measure.name.clone(),
                }),
                table: None,
                conditional: None,
                format: measure.format.clone(),
                description: None,
            });
        }

        let mut filters = Vec::new();
        for filter in metric.filters.iter().filter(|f| f.active) {
            let dim = filter_dimension(metric, filter).ok_or_else(|| {
                MetriqError::PreAggregation(format!(
                    "filter {} is not expressible against rollup {}",
                    filter.name, spec.id
                ))
            })?;
            filters.push(Filter {
                name: filter.name.clone(),
                expr: Expr::Column {
                    column: dim.name.clone(),
                },
                op: filter.op,
                value: filter.value.clone(),
                filter_type: FilterType::Where,
                active: true,
                description: None,
            });
        }

        let rollup_metric = SemanticMetric {
            name: metric.name.clone(),
            alias: None,
            data_source: metric.data_source.clone(),
            table: Some(storage),
            sql: None,
            grouped: true,
            ordered: metric.ordered,
            order: metric.order.clone(),
            limit: metric.limit,
            measures,
            dimensions,
            filters,
            joins: Vec::new(),
            parameters: metric.parameters.clone(),
            cache: metric.cache.clone(),
            description: None,
        };

        compiler::compile(
            &ResolvedMetric {
                metric: rollup_metric,
                derived: resolved.derived.clone(),
            },
            dialect,
            options,
        )
    }

    /// The materialization statement for a spec.
    pub fn build_statement(
        &self,
        spec: &PreAggregationSpec,
        source: &SemanticMetric,
        dialect: &dyn Dialect,
    ) -> Result<String> {
        let defining = match spec.rollup_type {
            RollupType::Rollup | RollupType::RollupLambda => restrict_metric(spec, source)?,
            RollupType::OriginalSql => {
                let mut metric = source.clone();
                metric.limit = None;
                metric.ordered = false;
                metric.order.clear();
                metric
            }
        };

        let query = compiler::build_select(
            &ResolvedMetric::plain(defining),
            dialect,
            &CompileOptions::default(),
        )?;
        // Rollup builds run without caller input; literals inline.
        let rendered = SqlRenderer::new(dialect).render_select(&inline_query_binds(&query));

        let storage = dialect.quote_ident(&spec.storage_name());
        let statement = match spec.storage {
            StorageMode::Table => {
                format!("CREATE OR REPLACE TABLE {storage} AS {}", rendered.sql)
            }
            StorageMode::MaterializedView => format!(
                "CREATE OR REPLACE MATERIALIZED VIEW {storage} AS {}",
                rendered.sql
            ),
        };
        Ok(statement)
    }

    /// Compile and optionally execute a spec's materialization.
    ///
    /// A dry run returns the statement without touching build state. A
    /// real build transitions `building -> completed` (recording row
    /// count) or `building -> failed` (recording the error message).
    pub async fn build(
        &self,
        spec_id: &str,
        source: &SemanticMetric,
        connector: &Arc<dyn Connector>,
        dry_run: bool,
        watermark: Option<Value>,
    ) -> Result<BuildOutcome> {
        let spec = self.get(spec_id).ok_or_else(|| {
            MetriqError::PreAggregation(format!("unknown pre-aggregation {spec_id}"))
        })?;

        let statement = match self.build_statement(&spec, source, connector.dialect()) {
            Ok(statement) => statement,
            Err(e) => {
                if !dry_run {
                    self.fail_build(spec_id, e.to_string())?;
                }
                return Err(e);
            }
        };
        if dry_run {
            return Ok(BuildOutcome {
                statement,
                row_count: None,
                dry_run: true,
            });
        }

        self.begin_build(spec_id)?;
        tracing::info!(spec = spec_id, "building pre-aggregation");
        match connector.execute_statement(&statement).await {
            Ok(affected) => {
                self.complete_build(spec_id, affected, watermark)?;
                tracing::info!(spec = spec_id, rows = affected, "pre-aggregation built");
                Ok(BuildOutcome {
                    statement,
                    row_count: Some(affected),
                    dry_run: false,
                })
            }
            Err(e) => {
                let message = e.to_string();
                self.fail_build(spec_id, message.clone())?;
                tracing::warn!(spec = spec_id, error = %message, "pre-aggregation build failed");
                Err(MetriqError::PreAggregation(message))
            }
        }
    }

    /// Evaluate a spec's refresh policy. `current_watermark` is the
    /// present value of a `Sql` policy's driving query, when one was run.
    pub fn should_refresh(
        &self,
        spec: &PreAggregationSpec,
        current_watermark: Option<&Value>,
    ) -> bool {
        let state = self.state(&spec.id);
        match state.status {
            BuildStatus::Building => return false,
            BuildStatus::Pending | BuildStatus::Failed => return true,
            BuildStatus::Completed => {}
        }
        match &spec.refresh {
            RefreshPolicy::Every { secs } | RefreshPolicy::MaxAge { secs } => state
                .built_at
                .and_then(|at| at.elapsed().ok())
                .map(|elapsed| elapsed.as_secs() >= *secs)
                .unwrap_or(true),
            RefreshPolicy::Sql { .. } => match current_watermark {
                Some(current) => state.watermark.as_ref() != Some(current),
                None => false,
            },
        }
    }

    /// The statement dropping a spec's storage object.
    pub fn drop_statement(&self, spec: &PreAggregationSpec, dialect: &dyn Dialect) -> String {
        let storage = dialect.quote_ident(&spec.storage_name());
        match spec.storage {
            StorageMode::Table => format!("DROP TABLE IF EXISTS {storage}"),
            StorageMode::MaterializedView => {
                format!("DROP MATERIALIZED VIEW IF EXISTS {storage}")
            }
        }
    }
}

/// Restrict a source metric to the spec's dimension/measure subset. The
/// rollup stores the raw grain: source filters, ordering and limits do
/// not apply at build time.
fn restrict_metric(
    spec: &PreAggregationSpec,
    source: &SemanticMetric,
) -> Result<SemanticMetric> {
    let mut metric = source.clone();

    let mut dimensions = Vec::with_capacity(spec.dimensions.len());
    for name in &spec.dimensions {
        let dim = source.dimension(name).ok_or_else(|| {
            MetriqError::PreAggregation(format!(
                "pre-aggregation {} retains unknown dimension {name}",
                spec.id
            ))
        })?;
        dimensions.push(dim.clone());
    }

    let mut measures = Vec::with_capacity(spec.measures.len());
    for name in &spec.measures {
        let measure = source.measure(name).ok_or_else(|| {
            MetriqError::PreAggregation(format!(
                "pre-aggregation {} retains unknown measure {name}",
                spec.id
            ))
        })?;
        measures.push(measure.clone());
    }

    metric.dimensions = dimensions;
    metric.measures = measures;
    metric.filters.clear();
    metric.grouped = true;
    metric.ordered = false;
    metric.order.clear();
    metric.limit = None;
    Ok(metric)
}
