//! DuckDB dialect implementation.

use crate::metrics::Function;

use super::{grain_to_str, Dialect};

#[derive(Debug, Default, Clone, Copy)]
pub struct DuckDbDialect;

impl Dialect for DuckDbDialect {
    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn render_function(&self, func: &Function, args: Vec<String>) -> String {
        match func {
            // === Date/Time ===
            Function::DateTrunc(grain) => {
                let unit = grain_to_str(grain);
                format!("date_trunc('{unit}', {})", args.join(", "))
            }
            Function::DatePart { field } => match args.as_slice() {
                [expr] => format!("date_part('{field}', {expr})"),
                _ => "NULL".to_string(),
            },
            Function::Now => "now()".to_string(),
            Function::CurrentDate => "current_date".to_string(),

            // === String ===
            Function::Lower => format!("lower({})", args.join(", ")),
            Function::Upper => format!("upper({})", args.join(", ")),
            Function::Concat => format!("concat({})", args.join(", ")),
            Function::ConcatWs { sep } => {
                let quoted = sep.replace('\'', "''");
                format!("concat_ws('{quoted}', {})", args.join(", "))
            }
            Function::Substring => match args.as_slice() {
                [expr, start, len] => format!("substring({expr}, {start}, {len})"),
                [expr, start] => format!("substring({expr}, {start})"),
                _ => "NULL".to_string(),
            },
            Function::Length => format!("length({})", args.join(", ")),
            Function::Trim => format!("trim({})", args.join(", ")),

            // === Null handling ===
            Function::Coalesce => format!("coalesce({})", args.join(", ")),
            Function::IfNull => format!("ifnull({})", args.join(", ")),
            Function::NullIf => match args.as_slice() {
                [expr1, expr2] => format!("nullif({expr1}, {expr2})"),
                _ => "NULL".to_string(),
            },

            // === Math ===
            Function::Greatest => format!("greatest({})", args.join(", ")),
            Function::Least => format!("least({})", args.join(", ")),
            Function::SafeDivide => match args.as_slice() {
                [left, right] => format!("{left} / NULLIF({right}, 0)"),
                _ => "NULL".to_string(),
            },
            Function::Abs => format!("abs({})", args.join(", ")),
            Function::Round => match args.as_slice() {
                [expr, decimals] => format!("round({expr}, {decimals})"),
                [expr] => format!("round({expr})"),
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
