//! Static validation of metric and variant definitions.
//!
//! Runs before execution, without touching any data source: join graph
//! shape, component ownership, derivation operands and parameter
//! references are all checkable from the definitions alone.

use std::collections::HashSet;

use serde_json::Value;

use crate::compiler::placeholder_names;
use crate::error::{MetriqError, Result};
use crate::metrics::{
    Derivation, DerivedEntity, Expr, MetricRef, MetricVariant, SemanticMetric, CONTEXT_PREFIX,
};
use crate::registry::MetricRegistry;

pub struct Validator {
    warn_only: bool,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Validator {
    pub fn new(warn_only: bool) -> Self {
        Self { warn_only }
    }

    pub fn validate_registry(&self, registry: &MetricRegistry) -> Result<()> {
        for metric in registry.metrics.values() {
            self.validate_metric(metric)?;
        }
        for variant in registry.variants.values() {
            self.validate_variant(variant, registry)?;
        }
        Ok(())
    }

    pub fn validate_metric(&self, metric: &SemanticMetric) -> Result<()> {
        self.check(
            metric.table.is_some() != metric.sql.is_some(),
            format!(
                "metric {} must have exactly one of table or sql",
                metric.name
            ),
        )?;

        let mut tables: HashSet<String> = HashSet::new();
        tables.insert(metric.base_alias().to_string());
        for join in &metric.joins {
            self.check(
                tables.contains(&join.left),
                format!(
                    "join {} in metric {} targets unknown table {}",
                    join.name, metric.name, join.left
                ),
            )?;
            self.check(
                tables.insert(join.right.clone()),
                format!(
                    "join {} in metric {} duplicates table {}",
                    join.name, metric.name, join.right
                ),
            )?;
            self.check(
                !join.on.is_empty(),
                format!(
                    "join {} in metric {} must include at least one column pair",
                    join.name, metric.name
                ),
            )?;
        }

        self.check_unique(
            metric.measures.iter().map(|m| m.name.as_str()),
            &metric.name,
            "measure",
        )?;
        self.check_unique(
            metric.dimensions.iter().map(|d| d.name.as_str()),
            &metric.name,
            "dimension",
        )?;
        self.check_unique(
            metric.filters.iter().map(|f| f.name.as_str()),
            &metric.name,
            "filter",
        )?;

        for measure in &metric.measures {
            if let Some(table) = &measure.table {
                self.check(
                    tables.contains(table),
                    format!(
                        "measure {} in metric {} references table {table} outside the join graph",
                        measure.name, metric.name
                    ),
                )?;
            }
        }
        for dimension in &metric.dimensions {
            if let Some(table) = &dimension.table {
                self.check(
                    tables.contains(table),
                    format!(
                        "dimension {} in metric {} references table {table} outside the join graph",
                        dimension.name, metric.name
                    ),
                )?;
            }
        }

        for filter in &metric.filters {
            self.validate_parameter_refs(metric, &filter.value, &filter.name)?;
            if filter.filter_type == crate::metrics::FilterType::Having {
                if let Expr::Column { column } = &filter.expr {
                    self.check(
                        metric.measure(column).is_some(),
                        format!(
                            "having filter {} in metric {} references unknown measure {column}",
                            filter.name, metric.name
                        ),
                    )?;
                }
            }
        }

        if let Some(sql) = &metric.sql {
            for name in placeholder_names(sql) {
                self.check_parameter_declared(metric, &name)?;
            }
        }

        Ok(())
    }

    pub fn validate_variant(&self, variant: &MetricVariant, registry: &MetricRegistry) -> Result<()> {
        match &variant.source {
            MetricRef::Id(id) => self.check(
                registry.get_metric(id).is_some(),
                format!("variant {} references unknown metric {id}", variant.name),
            )?,
            MetricRef::Inline(inline) => self.validate_metric(inline)?,
        }
        for combine in &variant.combine {
            self.check(
                registry.get_metric(&combine.metric).is_some(),
                format!(
                    "variant {} combines unknown metric {}",
                    variant.name, combine.metric
                ),
            )?;
        }
        for entity in &variant.derived {
            self.validate_derived(entity, &variant.name)?;
        }
        Ok(())
    }

    fn validate_derived(&self, entity: &DerivedEntity, owner: &str) -> Result<()> {
        if entity.derivation.is_arithmetic() {
            self.check(
                entity.second_measure.is_some(),
                format!(
                    "arithmetic derivation {} in {owner} requires a second measure",
                    entity.name
                ),
            )?;
        } else {
            self.check(
                !entity.order_by.is_empty(),
                format!(
                    "window derivation {} in {owner} requires at least one ordering dimension",
                    entity.name
                ),
            )?;
        }
        if matches!(entity.derivation, Derivation::Ntile | Derivation::NthValue) {
            self.check(
                entity.n.is_some(),
                format!(
                    "derivation {} in {owner} requires the n parameter",
                    entity.name
                ),
            )?;
        }
        Ok(())
    }

    fn validate_parameter_refs(
        &self,
        metric: &SemanticMetric,
        value: &Value,
        filter_name: &str,
    ) -> Result<()> {
        match value {
            Value::String(s) => {
                for name in placeholder_names(s) {
                    self.check_parameter_declared(metric, &name).map_err(|_| {
                        MetriqError::Validation(format!(
                            "filter {filter_name} in metric {} references undeclared parameter {name}",
                            metric.name
                        ))
                    })?;
                }
                Ok(())
            }
            Value::Array(items) => {
                for item in items {
                    self.validate_parameter_refs(metric, item, filter_name)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn check_parameter_declared(&self, metric: &SemanticMetric, name: &str) -> Result<()> {
        // Context parameters resolve from the consumer context, not the
        // metric's parameter list.
        if name.starts_with(CONTEXT_PREFIX) {
            return Ok(());
        }
        self.check(
            metric.parameter(name).is_some(),
            format!(
                "metric {} references undeclared parameter {name}",
                metric.name
            ),
        )
    }

    fn check_unique<'a>(
        &self,
        names: impl Iterator<Item = &'a str>,
        metric: &str,
        kind: &str,
    ) -> Result<()> {
        let mut seen = HashSet::new();
        for name in names {
            self.check(
                seen.insert(name.to_string()),
                format!("duplicate {kind} {name} in metric {metric}"),
            )?;
        }
        Ok(())
    }

    fn check(&self, condition: bool, message: String) -> Result<()> {
        if condition {
            return Ok(());
        }
        if self.warn_only {
            tracing::warn!("{message}");
            Ok(())
        } else {
            Err(MetriqError::Validation(message))
        }
    }
}
