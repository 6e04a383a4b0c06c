//! Filter lowering: operator dispatch and value binding.

use serde_json::Value;

use crate::error::{MetriqError, Result};
use crate::metrics::FilterOp;
use crate::sql_ast::{SqlBinaryOperator, SqlExpr};

/// Lower a filter to a predicate over `base_expr`. Every comparison value
/// becomes a bound parameter.
pub fn render_filter_expr(base_expr: SqlExpr, op: FilterOp, value: &Value) -> Result<SqlExpr> {
    match op {
        FilterOp::In | FilterOp::NotIn => {
            let list = match value {
                Value::Array(items) => items.iter().map(|v| SqlExpr::Bind(v.clone())).collect(),
                other => vec![SqlExpr::Bind(other.clone())],
            };
            Ok(SqlExpr::InList {
                expr: Box::new(base_expr),
                list,
                negated: matches!(op, FilterOp::NotIn),
            })
        }
        FilterOp::Between => match value {
            Value::Array(items) if items.len() == 2 => Ok(SqlExpr::Between {
                expr: Box::new(base_expr),
                low: Box::new(SqlExpr::Bind(items[0].clone())),
                high: Box::new(SqlExpr::Bind(items[1].clone())),
            }),
            _ => Err(MetriqError::Compilation(
                "between filter requires a two-element value range".to_string(),
            )),
        },
        FilterOp::IsNull => Ok(SqlExpr::IsNull {
            expr: Box::new(base_expr),
            negated: false,
        }),
        FilterOp::IsNotNull => Ok(SqlExpr::IsNull {
            expr: Box::new(base_expr),
            negated: true,
        }),
        _ => {
            let op = match op {
                FilterOp::Eq => SqlBinaryOperator::Eq,
                FilterOp::Neq => SqlBinaryOperator::Neq,
                FilterOp::Gt => SqlBinaryOperator::Gt,
                FilterOp::Gte => SqlBinaryOperator::Gte,
                FilterOp::Lt => SqlBinaryOperator::Lt,
                FilterOp::Lte => SqlBinaryOperator::Lte,
                FilterOp::Like => SqlBinaryOperator::Like,
                FilterOp::ILike => SqlBinaryOperator::ILike,
                FilterOp::In
                | FilterOp::NotIn
                | FilterOp::Between
                | FilterOp::IsNull
                | FilterOp::IsNotNull => unreachable!(),
            };
            Ok(SqlExpr::BinaryOp {
                op,
                left: Box::new(base_expr),
                right: Box::new(SqlExpr::Bind(value.clone())),
            })
        }
    }
}
