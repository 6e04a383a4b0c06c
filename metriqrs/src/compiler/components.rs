//! Resolved query components collected from a metric.
//!
//! This is the intermediate representation between the resolved metric
//! and the final select statement.

use std::collections::HashSet;

use crate::error::{MetriqError, Result};
use crate::metrics::{Aggregation, FilterType, SemanticMetric};
use crate::sql_ast::{Join, OrderItem, SqlExpr, TableRef};

use super::filters::render_filter_expr;
use super::joins::{build_joins, known_tables};
use super::params::{substitute_raw_sql, substitute_value};
use super::render::expr_to_sql;
use super::CompileOptions;

#[derive(Clone, Debug)]
pub struct ResolvedDimension {
    pub name: String,
    pub expr: SqlExpr,
}

#[derive(Clone, Debug)]
pub struct ResolvedMeasure {
    pub name: String,
    pub agg: Aggregation,
    /// The full aggregate expression.
    pub expr: SqlExpr,
}

#[derive(Clone, Debug)]
pub struct QueryComponents {
    pub base: TableRef,
    pub known_tables: HashSet<String>,
    pub dimensions: Vec<ResolvedDimension>,
    pub measures: Vec<ResolvedMeasure>,
    pub where_filters: Vec<SqlExpr>,
    pub having_filters: Vec<SqlExpr>,
    pub order: Vec<OrderItem>,
    pub joins: Vec<Join>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub grouped: bool,
}

impl QueryComponents {
    pub fn measure_expr(&self, name: &str) -> Option<&SqlExpr> {
        self.measures
            .iter()
            .find(|m| m.name == name)
            .map(|m| &m.expr)
    }

    pub fn dimension_expr(&self, name: &str) -> Option<&SqlExpr> {
        self.dimensions
            .iter()
            .find(|d| d.name == name)
            .map(|d| &d.expr)
    }
}

pub fn resolve_components(
    metric: &SemanticMetric,
    options: &CompileOptions,
) -> Result<QueryComponents> {
    let base_alias = metric.base_alias().to_string();
    let known = known_tables(metric);
    let joins = build_joins(metric)?;

    let base = match (&metric.sql, &metric.table) {
        (Some(sql), _) => TableRef {
            name: base_alias.clone(),
            alias: Some(base_alias.clone()),
            subquery: Some(substitute_raw_sql(sql, metric, options)?),
        },
        (None, Some(table)) => TableRef {
            name: table.clone(),
            alias: if *table == base_alias {
                None
            } else {
                Some(base_alias.clone())
            },
            subquery: None,
        },
        (None, None) => {
            return Err(MetriqError::Compilation(format!(
                "metric {} has neither a table nor a sql source",
                metric.name
            )))
        }
    };

    let mut dimensions = Vec::with_capacity(metric.dimensions.len());
    for dim in &metric.dimensions {
        let owner = dim.table.as_deref().unwrap_or(&base_alias);
        dimensions.push(ResolvedDimension {
            name: dim.name.clone(),
            expr: expr_to_sql(&dim.output_expr(), owner, &known)?,
        });
    }

    let mut measures = Vec::with_capacity(metric.measures.len());
    for measure in &metric.measures {
        let owner = measure.table.as_deref().unwrap_or(&base_alias);
        let input = expr_to_sql(&measure.input_expr(), owner, &known)?;
        measures.push(ResolvedMeasure {
            name: measure.name.clone(),
            agg: measure.agg.clone(),
            expr: SqlExpr::Aggregate {
                agg: measure.agg.clone(),
                expr: Box::new(input),
            },
        });
    }

    let mut where_filters = Vec::new();
    let mut having_filters = Vec::new();
    for filter in &metric.filters {
        if !filter.active {
            continue;
        }
        let value = substitute_value(&filter.value, metric, options)?;
        match filter.filter_type {
            FilterType::Where => {
                let base_expr = expr_to_sql(&filter.expr, &base_alias, &known)?;
                where_filters.push(render_filter_expr(base_expr, filter.op, &value)?);
            }
            FilterType::Having => {
                // Group-level filters compare against a measure's
                // aggregate; a bare column naming a measure resolves to it.
                let base_expr = match &filter.expr {
                    crate::metrics::Expr::Column { column } => {
                        match measures.iter().find(|m| m.name == *column) {
                            Some(measure) => measure.expr.clone(),
                            None => {
                                return Err(MetriqError::Compilation(format!(
                                    "having filter {} references unknown measure {column}",
                                    filter.name
                                )))
                            }
                        }
                    }
                    other => expr_to_sql(other, &base_alias, &known)?,
                };
                having_filters.push(render_filter_expr(base_expr, filter.op, &value)?);
            }
        }
    }

    let mut order = Vec::new();
    if metric.ordered {
        for item in &metric.order {
            let expr = match dimensions.iter().find(|d| d.name == item.column) {
                Some(dim) => dim.expr.clone(),
                None => match measures.iter().find(|m| m.name == item.column) {
                    // Measures order by their output name.
                    Some(measure) => SqlExpr::Column {
                        table: None,
                        name: measure.name.clone(),
                    },
                    None => expr_to_sql(
                        &crate::metrics::Expr::Column {
                            column: item.column.clone(),
                        },
                        &base_alias,
                        &known,
                    )?,
                },
            };
            order.push(OrderItem {
                expr,
                direction: item.direction,
            });
        }
    }

    let grouped = options.grouped.unwrap_or(metric.grouped);
    let limit = options.limit.or(metric.limit);
    let offset = options.offset;

    Ok(QueryComponents {
        base,
        known_tables: known,
        dimensions,
        measures,
        where_filters,
        having_filters,
        order,
        joins,
        limit,
        offset,
        grouped,
    })
}
