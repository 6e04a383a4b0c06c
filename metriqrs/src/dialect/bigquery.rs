//! BigQuery dialect implementation.
//!
//! Compile-only: there is no BigQuery connector, but previews must render
//! correct GoogleSQL.

use crate::metrics::{Function, TimeGrain};

use super::Dialect;

#[derive(Debug, Default, Clone, Copy)]
pub struct BigQueryDialect;

impl Dialect for BigQueryDialect {
    fn quote_ident(&self, ident: &str) -> String {
        // BigQuery uses backticks for identifiers
        format!("`{}`", ident.replace('`', "\\`"))
    }

    fn placeholder(&self, idx: usize) -> String {
        // BigQuery uses @p0, @p1, ... for named parameters
        format!("@p{idx}")
    }

    fn render_limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        // BigQuery requires LIMIT whenever OFFSET is present
        match (limit, offset) {
            (Some(limit), Some(offset)) => format!(" LIMIT {limit} OFFSET {offset}"),
            (Some(limit), None) => format!(" LIMIT {limit}"),
            (None, Some(offset)) => format!(" LIMIT {} OFFSET {offset}", i64::MAX),
            (None, None) => String::new(),
        }
    }

    fn render_function(&self, func: &Function, args: Vec<String>) -> String {
        match func {
            // === Date/Time ===
            Function::DateTrunc(grain) => {
                let unit = bq_grain_to_str(grain);
                // BigQuery: TIMESTAMP_TRUNC(timestamp, MONTH)
                format!("TIMESTAMP_TRUNC({}, {})", args.join(", "), unit)
            }
            Function::DatePart { field } => match args.as_slice() {
                [expr] => format!("EXTRACT({field} FROM {expr})"),
                _ => "NULL".to_string(),
            },
            Function::Now => "CURRENT_TIMESTAMP()".to_string(),
            Function::CurrentDate => "CURRENT_DATE()".to_string(),

            // === String ===
            Function::Lower => format!("LOWER({})", args.join(", ")),
            Function::Upper => format!("UPPER({})", args.join(", ")),
            Function::Concat => format!("CONCAT({})", args.join(", ")),
            Function::ConcatWs { sep } => {
                // BigQuery has no CONCAT_WS, use ARRAY_TO_STRING
                let quoted = sep.replace('\'', "\\'");
                format!("ARRAY_TO_STRING([{}], '{quoted}')", args.join(", "))
            }
            Function::Substring => match args.as_slice() {
                [expr, start, len] => format!("SUBSTR({expr}, {start}, {len})"),
                [expr, start] => format!("SUBSTR({expr}, {start})"),
                _ => "NULL".to_string(),
            },
            Function::Length => format!("LENGTH({})", args.join(", ")),
            Function::Trim => format!("TRIM({})", args.join(", ")),

            // === Null handling ===
            Function::Coalesce => format!("COALESCE({})", args.join(", ")),
            Function::IfNull => format!("IFNULL({})", args.join(", ")),
            Function::NullIf => match args.as_slice() {
                [expr1, expr2] => format!("NULLIF({expr1}, {expr2})"),
                _ => "NULL".to_string(),
            },

            // === Math ===
            Function::Greatest => format!("GREATEST({})", args.join(", ")),
            Function::Least => format!("LEAST({})", args.join(", ")),
            Function::SafeDivide => match args.as_slice() {
                [left, right] => format!("SAFE_DIVIDE({left}, {right})"),
                _ => "NULL".to_string(),
            },
            Function::Abs => format!("ABS({})", args.join(", ")),
            Function::Round => match args.as_slice() {
                [expr, decimals] => format!("ROUND({expr}, {decimals})"),
                [expr] => format!("ROUND({expr})"),
                _ => "NULL".to_string(),
            },

            // === Type conversion ===
            Function::Cast { data_type } => match args.as_slice() {
                [expr] => format!("CAST({expr} AS {data_type})"),
                _ => "NULL".to_string(),
            },
        }
    }
}

/// Convert TimeGrain to a BigQuery date part keyword.
fn bq_grain_to_str(grain: &TimeGrain) -> &'static str {
    match grain {
        TimeGrain::Day => "DAY",
        TimeGrain::Week => "WEEK",
        TimeGrain::Month => "MONTH",
        TimeGrain::Quarter => "QUARTER",
        TimeGrain::Year => "YEAR",
    }
}
