//! The SQL compiler.
//!
//! Turns a resolved metric into a parameterized, dialect-specific SQL
//! statement. Compilation is pure: the same resolved metric, dialect and
//! options always produce byte-identical SQL and the same fingerprint.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::fingerprint::query_fingerprint;
use crate::dialect::Dialect;
use crate::error::{MetriqError, Result};
use crate::resolver::ResolvedMetric;
use crate::sql_ast::{SelectItem, SelectQuery, SqlRenderer};

mod components;
mod derive;
mod filters;
mod joins;
mod params;
mod render;

pub use components::{QueryComponents, ResolvedDimension, ResolvedMeasure};
pub use render::parse_qualified;

pub(crate) use params::placeholder_names;

/// Tenant/environment isolation scope. Part of every fingerprint so that
/// logically identical queries from different environments never collide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryScope {
    pub tenant: String,
    pub environment: String,
}

impl Default for QueryScope {
    fn default() -> Self {
        Self {
            tenant: "default".to_string(),
            environment: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Explicit runtime parameter values.
    pub params: HashMap<String, Value>,
    /// Consumer-context values for `ctx.`-prefixed parameters.
    pub context: HashMap<String, Value>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Overrides the metric's grouped flag for this execution.
    pub grouped: Option<bool>,
    pub scope: QueryScope,
}

/// Immutable result of compilation.
#[derive(Debug, Clone, Serialize)]
pub struct CompiledQuery {
    pub sql: String,
    pub bindings: Vec<Value>,
    pub fingerprint: String,
}

/// Compile a resolved metric for a target dialect.
pub fn compile(
    resolved: &ResolvedMetric,
    dialect: &dyn Dialect,
    options: &CompileOptions,
) -> Result<CompiledQuery> {
    let query = build_select(resolved, dialect, options)?;
    let rendered = SqlRenderer::new(dialect).render_select(&query);
    let fingerprint = query_fingerprint(&rendered.sql, &rendered.bindings, &options.scope)?;
    Ok(CompiledQuery {
        sql: rendered.sql,
        bindings: rendered.bindings,
        fingerprint,
    })
}

/// Build the select statement without rendering. The pre-aggregation
/// planner reuses this to derive rollup definitions.
pub(crate) fn build_select(
    resolved: &ResolvedMetric,
    dialect: &dyn Dialect,
    options: &CompileOptions,
) -> Result<SelectQuery> {
    let metric = &resolved.metric;
    let components = components::resolve_components(metric, options)?;

    let mut query = SelectQuery {
        from: components.base.clone(),
        joins: components.joins.clone(),
        ..SelectQuery::default()
    };

    for dim in &components.dimensions {
        query.select.push(SelectItem {
            expr: dim.expr.clone(),
            alias: Some(dim.name.clone()),
        });
    }
    for measure in &components.measures {
        query.select.push(SelectItem {
            expr: measure.expr.clone(),
            alias: Some(measure.name.clone()),
        });
    }

    // Derived entities come last: they may reference any measure in the
    // effective list.
    let derived_items = derive::build_derived_selects(&components, &resolved.derived, dialect)?;
    query.select.extend(derived_items);

    if query.select.is_empty() {
        return Err(MetriqError::Compilation(format!(
            "metric {} selects no dimensions, measures or derived entities",
            metric.name
        )));
    }

    query.filters = components.where_filters.clone();
    query.having = components.having_filters.clone();
    if components.grouped {
        query.group_by = components
            .dimensions
            .iter()
            .map(|d| d.expr.clone())
            .collect();
    }
    query.order_by = components.order.clone();
    query.limit = components.limit;
    query.offset = components.offset;

    Ok(query)
}
