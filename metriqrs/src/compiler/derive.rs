//! Derived entity lowering.
//!
//! Derived entities compile after the effective measure list is final:
//! arithmetic derivations combine two aggregate expressions, window
//! derivations wrap one in a dialect window function.

use crate::dialect::Dialect;
use crate::error::{MetriqError, Result};
use crate::metrics::{Derivation, DerivedEntity, SortDirection};
use crate::sql_ast::{OrderItem, SelectItem, SqlBinaryOperator, SqlExpr};

use super::components::QueryComponents;

pub fn build_derived_selects(
    components: &QueryComponents,
    derived: &[DerivedEntity],
    dialect: &dyn Dialect,
) -> Result<Vec<SelectItem>> {
    let mut items = Vec::with_capacity(derived.len());
    for entity in derived {
        let expr = if entity.derivation.is_arithmetic() {
            build_arithmetic(components, entity)?
        } else {
            build_window(components, entity, dialect)?
        };
        items.push(SelectItem {
            expr,
            alias: Some(entity.name.clone()),
        });
    }
    Ok(items)
}

fn source_measure(components: &QueryComponents, entity: &DerivedEntity, name: &str) -> Result<SqlExpr> {
    components.measure_expr(name).cloned().ok_or_else(|| {
        MetriqError::Compilation(format!(
            "derived entity {} references unknown measure {name}",
            entity.name
        ))
    })
}

fn build_arithmetic(components: &QueryComponents, entity: &DerivedEntity) -> Result<SqlExpr> {
    let left = source_measure(components, entity, &entity.measure)?;
    let second = entity.second_measure.as_deref().ok_or_else(|| {
        MetriqError::Compilation(format!(
            "arithmetic derivation {} requires a second measure operand",
            entity.name
        ))
    })?;
    let right = source_measure(components, entity, second)?;

    Ok(match entity.derivation {
        // NULL-guarded division
        Derivation::Divide => SqlExpr::Function {
            func: crate::metrics::Function::SafeDivide,
            args: vec![left, right],
        },
        Derivation::Multiply => binary(SqlBinaryOperator::Multiply, left, right),
        Derivation::Add => binary(SqlBinaryOperator::Add, left, right),
        Derivation::Subtract => binary(SqlBinaryOperator::Subtract, left, right),
        _ => unreachable!("window derivations are handled separately"),
    })
}

fn binary(op: SqlBinaryOperator, left: SqlExpr, right: SqlExpr) -> SqlExpr {
    SqlExpr::BinaryOp {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn build_window(
    components: &QueryComponents,
    entity: &DerivedEntity,
    dialect: &dyn Dialect,
) -> Result<SqlExpr> {
    if !dialect.supports_window_functions() {
        return Err(MetriqError::Compilation(format!(
            "derived entity {} requires window functions, which this dialect does not support",
            entity.name
        )));
    }
    if entity.order_by.is_empty() {
        return Err(MetriqError::Compilation(format!(
            "window derivation {} requires at least one ordering dimension",
            entity.name
        )));
    }

    let arg = match entity.derivation {
        // Pure ranking functions take no argument.
        Derivation::Rank | Derivation::DenseRank | Derivation::RowNumber | Derivation::Ntile => {
            None
        }
        _ => Some(Box::new(source_measure(components, entity, &entity.measure)?)),
    };

    let partition_by = resolve_dimension_list(components, entity, &entity.partition_by)?;
    let order_exprs = resolve_dimension_list(components, entity, &entity.order_by)?;
    let order_by = order_exprs
        .into_iter()
        .map(|expr| OrderItem {
            expr,
            direction: SortDirection::Asc,
        })
        .collect();

    Ok(SqlExpr::Window {
        derivation: entity.derivation,
        arg,
        partition_by,
        order_by,
        offset: entity.offset,
        n: entity.n,
        default: entity.default_value.clone(),
    })
}

fn resolve_dimension_list(
    components: &QueryComponents,
    entity: &DerivedEntity,
    names: &[String],
) -> Result<Vec<SqlExpr>> {
    let mut exprs = Vec::with_capacity(names.len());
    for name in names {
        let expr = components.dimension_expr(name).cloned().ok_or_else(|| {
            MetriqError::Compilation(format!(
                "derived entity {} references unknown dimension {name}",
                entity.name
            ))
        })?;
        exprs.push(expr);
    }
    Ok(exprs)
}
