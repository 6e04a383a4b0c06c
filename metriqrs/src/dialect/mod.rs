//! SQL dialect abstractions for the supported database engines.
//!
//! Dialects are always compiled in, independent of which connectors are
//! enabled: compile-only previews must work for every engine.

use crate::metrics::{Aggregation, Derivation, Function, TimeGrain};

/// Dialects render identifiers and primitive expression pieces.
/// Expression tree walking lives in the SQL renderer; the dialect
/// only maps logical constructs to SQL fragments.
pub trait Dialect {
    fn quote_ident(&self, ident: &str) -> String;

    fn placeholder(&self, _idx: usize) -> String {
        "?".to_string()
    }

    fn supports_window_functions(&self) -> bool {
        true
    }

    fn render_function(&self, func: &Function, args: Vec<String>) -> String;

    fn render_aggregation(&self, agg: &Aggregation, expr: &str) -> String {
        match agg {
            Aggregation::Sum => format!("SUM({expr})"),
            Aggregation::Avg => format!("AVG({expr})"),
            Aggregation::Count => format!("COUNT({expr})"),
            Aggregation::CountDistinct => format!("COUNT(DISTINCT {expr})"),
            Aggregation::Min => format!("MIN({expr})"),
            Aggregation::Max => format!("MAX({expr})"),
            Aggregation::Custom { function } => format!("{function}({expr})"),
        }
    }

    /// Render a window-analytic call. The OVER clause pieces arrive
    /// pre-rendered; shapes are standard SQL and shared by the supported
    /// engines.
    fn render_window_function(&self, call: &WindowCall) -> String {
        let over = call.over();
        match call.derivation {
            Derivation::RunningTotal => {
                format!(
                    "SUM({}) OVER ({} ROWS UNBOUNDED PRECEDING)",
                    call.arg(),
                    over
                )
            }
            Derivation::PercentOfTotal => {
                let partition = call.partition.clone().unwrap_or_default();
                format!(
                    "{} * 100.0 / NULLIF(SUM({}) OVER ({}), 0)",
                    call.arg(),
                    call.arg(),
                    partition
                )
            }
            Derivation::Rank => format!("RANK() OVER ({over})"),
            Derivation::DenseRank => format!("DENSE_RANK() OVER ({over})"),
            Derivation::RowNumber => format!("ROW_NUMBER() OVER ({over})"),
            Derivation::Lag | Derivation::Lead => {
                let func = if call.derivation == Derivation::Lag {
                    "LAG"
                } else {
                    "LEAD"
                };
                let offset = call.offset.unwrap_or(1);
                match &call.default {
                    Some(default) => {
                        format!("{func}({}, {offset}, {default}) OVER ({over})", call.arg())
                    }
                    None => format!("{func}({}, {offset}) OVER ({over})", call.arg()),
                }
            }
            Derivation::Ntile => format!("NTILE({}) OVER ({over})", call.n.unwrap_or(1)),
            Derivation::NthValue => {
                format!("NTH_VALUE({}, {}) OVER ({over})", call.arg(), call.n.unwrap_or(1))
            }
            Derivation::MovingAverage => {
                let preceding = call.n.unwrap_or(1).saturating_sub(1);
                format!(
                    "AVG({}) OVER ({} ROWS BETWEEN {} PRECEDING AND CURRENT ROW)",
                    call.arg(),
                    over,
                    preceding
                )
            }
            Derivation::Divide
            | Derivation::Multiply
            | Derivation::Add
            | Derivation::Subtract => {
                // Arithmetic derivations never reach the window renderer.
                "NULL".to_string()
            }
        }
    }

    fn render_limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        let mut sql = String::new();
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        sql
    }

    /// Render a literal directly into SQL text. Used only for DDL
    /// statements (rollup builds); query paths bind literals as
    /// parameters instead.
    fn render_literal(&self, value: &serde_json::Value) -> String {
        match value {
            serde_json::Value::Null => "NULL".to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => format!("'{}'", s.replace('\'', "''")),
            serde_json::Value::Array(items) => {
                let rendered: Vec<String> = items.iter().map(|v| self.render_literal(v)).collect();
                rendered.join(", ")
            }
            serde_json::Value::Object(_) => {
                format!("'{}'", value.to_string().replace('\'', "''"))
            }
        }
    }
}

/// A window-analytic call with its OVER clause pieces pre-rendered.
#[derive(Debug, Clone)]
pub struct WindowCall {
    pub derivation: Derivation,
    /// Rendered source expression, absent for rank/row_number/ntile.
    pub arg: Option<String>,
    /// Rendered `PARTITION BY …` fragment.
    pub partition: Option<String>,
    /// Rendered `ORDER BY …` fragment.
    pub order: Option<String>,
    pub offset: Option<i64>,
    pub n: Option<u64>,
    /// Rendered default value for lag/lead.
    pub default: Option<String>,
}

impl WindowCall {
    fn arg(&self) -> &str {
        self.arg.as_deref().unwrap_or("NULL")
    }

    /// The combined OVER clause body.
    fn over(&self) -> String {
        match (&self.partition, &self.order) {
            (Some(p), Some(o)) => format!("{p} {o}"),
            (Some(p), None) => p.clone(),
            (None, Some(o)) => o.clone(),
            (None, None) => String::new(),
        }
    }
}

/// Convert TimeGrain to a SQL interval unit string (shared by DuckDB and
/// PostgreSQL; BigQuery uppercases it).
pub(crate) fn grain_to_str(grain: &TimeGrain) -> &'static str {
    match grain {
        TimeGrain::Day => "day",
        TimeGrain::Week => "week",
        TimeGrain::Month => "month",
        TimeGrain::Quarter => "quarter",
        TimeGrain::Year => "year",
    }
}

mod bigquery;
mod duckdb;
mod postgres;

pub use bigquery::BigQueryDialect;
pub use duckdb::DuckDbDialect;
pub use postgres::PostgresDialect;

/// Look up a dialect implementation by engine name.
pub fn dialect_for(engine: &str) -> Option<Box<dyn Dialect + Send + Sync>> {
    match engine {
        "duckdb" => Some(Box::new(DuckDbDialect)),
        "postgres" | "postgresql" => Some(Box::new(PostgresDialect)),
        "bigquery" => Some(Box::new(BigQueryDialect)),
        _ => None,
    }
}
