//! Logical-expression to SQL-AST lowering.

use std::collections::HashSet;

use crate::error::{MetriqError, Result};
use crate::metrics::{BinaryOp, Expr};
use crate::sql_ast::{SqlBinaryOperator, SqlExpr};

/// Lower a logical expression, qualifying bare columns with the owning
/// table. Column references may be written `table.column`; the referenced
/// table must exist in the metric's join graph.
pub fn expr_to_sql(expr: &Expr, owner: &str, known_tables: &HashSet<String>) -> Result<SqlExpr> {
    match expr {
        Expr::Column { column } => {
            let (table, name) = match parse_qualified(column) {
                Some((table, name)) => (table.to_string(), name.to_string()),
                None => (owner.to_string(), column.clone()),
            };
            if !known_tables.contains(&table) {
                return Err(MetriqError::Compilation(format!(
                    "column {column} references table {table} which is not in the join graph"
                )));
            }
            Ok(SqlExpr::Column {
                table: Some(table),
                name,
            })
        }
        Expr::Literal { value } => Ok(SqlExpr::Bind(value.clone())),
        Expr::Func { func, args } => {
            let mut lowered = Vec::with_capacity(args.len());
            for arg in args {
                lowered.push(expr_to_sql(arg, owner, known_tables)?);
            }
            Ok(SqlExpr::Function {
                func: func.clone(),
                args: lowered,
            })
        }
        Expr::Case {
            branches,
            else_expr,
        } => {
            let mut lowered = Vec::with_capacity(branches.len());
            for branch in branches {
                lowered.push((
                    expr_to_sql(&branch.when, owner, known_tables)?,
                    expr_to_sql(&branch.then, owner, known_tables)?,
                ));
            }
            Ok(SqlExpr::Case {
                branches: lowered,
                else_expr: Box::new(expr_to_sql(else_expr, owner, known_tables)?),
            })
        }
        Expr::Binary { op, left, right } => Ok(SqlExpr::BinaryOp {
            op: binary_op(op),
            left: Box::new(expr_to_sql(left, owner, known_tables)?),
            right: Box::new(expr_to_sql(right, owner, known_tables)?),
        }),
    }
}

fn binary_op(op: &BinaryOp) -> SqlBinaryOperator {
    match op {
        BinaryOp::Add => SqlBinaryOperator::Add,
        BinaryOp::Subtract => SqlBinaryOperator::Subtract,
        BinaryOp::Multiply => SqlBinaryOperator::Multiply,
        BinaryOp::Divide => SqlBinaryOperator::Divide,
        BinaryOp::Modulo => SqlBinaryOperator::Modulo,
        BinaryOp::Eq => SqlBinaryOperator::Eq,
        BinaryOp::Neq => SqlBinaryOperator::Neq,
        BinaryOp::Gt => SqlBinaryOperator::Gt,
        BinaryOp::Gte => SqlBinaryOperator::Gte,
        BinaryOp::Lt => SqlBinaryOperator::Lt,
        BinaryOp::Lte => SqlBinaryOperator::Lte,
        BinaryOp::And => SqlBinaryOperator::And,
        BinaryOp::Or => SqlBinaryOperator::Or,
    }
}

pub fn parse_qualified(name: &str) -> Option<(&str, &str)> {
    let mut parts = name.splitn(2, '.');
    let table = parts.next()?;
    let column = parts.next()?;
    if table.is_empty() || column.is_empty() {
        return None;
    }
    Some((table, column))
}
