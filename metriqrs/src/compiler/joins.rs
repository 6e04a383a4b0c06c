//! Join graph validation and lowering.

use std::collections::HashSet;

use crate::error::{MetriqError, Result};
use crate::metrics::SemanticMetric;
use crate::sql_ast::{Join, SqlBinaryOperator, SqlExpr, TableRef};

/// Validate the metric's join graph and lower it to SQL joins.
///
/// Every join must attach to the base table or to the right side of an
/// earlier join; duplicate right-side tables and dangling left sides are
/// rejected.
pub fn build_joins(metric: &SemanticMetric) -> Result<Vec<Join>> {
    let base_alias = metric.base_alias().to_string();
    let mut reachable: HashSet<String> = HashSet::new();
    reachable.insert(base_alias);

    let mut joins = Vec::with_capacity(metric.joins.len());
    for join in &metric.joins {
        if !reachable.contains(&join.left) {
            return Err(MetriqError::Compilation(format!(
                "join {} references table {} which is not reachable from the base table",
                join.name, join.left
            )));
        }
        if !reachable.insert(join.right.clone()) {
            return Err(MetriqError::Compilation(format!(
                "join {} duplicates table {}",
                join.name, join.right
            )));
        }
        if join.on.is_empty() {
            return Err(MetriqError::Compilation(format!(
                "join {} must include at least one column pair",
                join.name
            )));
        }

        let on_clause: Vec<SqlExpr> = join
            .on
            .iter()
            .map(|key| SqlExpr::BinaryOp {
                op: SqlBinaryOperator::Eq,
                left: Box::new(SqlExpr::Column {
                    table: Some(join.left.clone()),
                    name: key.left.clone(),
                }),
                right: Box::new(SqlExpr::Column {
                    table: Some(join.right.clone()),
                    name: key.right.clone(),
                }),
            })
            .collect();

        joins.push(Join {
            join_type: join.join_type.into(),
            table: TableRef {
                name: join.right.clone(),
                alias: None,
                subquery: None,
            },
            on: on_clause,
        });
    }
    Ok(joins)
}

/// All table identifiers a column may legally reference.
pub fn known_tables(metric: &SemanticMetric) -> HashSet<String> {
    let mut tables: HashSet<String> = HashSet::new();
    tables.insert(metric.base_alias().to_string());
    for join in &metric.joins {
        tables.insert(join.right.clone());
    }
    tables
}
