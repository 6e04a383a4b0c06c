//! Modifier and variant resolution.
//!
//! Produces the effective metric a query executes against. The base
//! metric is never mutated: resolution always builds a new value, and a
//! variant never shares an instance with its source.
//!
//! Override application order is include, exclude, replace, add, combine,
//! scalar config — so a component can be excluded and an unrelated
//! component re-added under the same name without conflict. Derived
//! entities are attached last and compile after the effective measure
//! list is final.

use crate::error::{MetriqError, Result};
use crate::metrics::{
    CombineMetric, ComponentSet, Dimension, ExcludeSet, Filter, IncludeList, Join, Measure,
    MetricOverrides, MetricRef, MetricVariant, ModifierSet, Parameter, SemanticMetric,
};

/// A metric ready for compilation, with its derived entities.
#[derive(Debug, Clone)]
pub struct ResolvedMetric {
    pub metric: SemanticMetric,
    pub derived: Vec<crate::metrics::DerivedEntity>,
}

impl ResolvedMetric {
    pub fn plain(metric: SemanticMetric) -> Self {
        Self {
            metric,
            derived: Vec::new(),
        }
    }
}

/// Resolve a base metric with optional ad-hoc modifiers, variant
/// overrides and derivations.
pub fn resolve(
    base: &SemanticMetric,
    modifiers: Option<&ModifierSet>,
    overrides: Option<&MetricOverrides>,
    derived: &[crate::metrics::DerivedEntity],
) -> Result<ResolvedMetric> {
    let mut metric = base.clone();

    if let Some(overrides) = overrides {
        apply_overrides(&mut metric, overrides)?;
    }
    if let Some(modifiers) = modifiers {
        apply_modifiers(&mut metric, modifiers);
    }

    Ok(ResolvedMetric {
        metric,
        derived: derived.to_vec(),
    })
}

/// Resolve a persisted variant against its source metric.
///
/// `lookup` supplies metrics by id for `source` references and `combine`
/// entries.
pub fn resolve_variant<F>(
    variant: &MetricVariant,
    modifiers: Option<&ModifierSet>,
    lookup: F,
) -> Result<ResolvedMetric>
where
    F: Fn(&str) -> Option<SemanticMetric>,
{
    let mut metric = match &variant.source {
        MetricRef::Id(id) => lookup(id).ok_or_else(|| {
            MetriqError::Resolution(format!(
                "variant {} references unknown metric {id}",
                variant.name
            ))
        })?,
        MetricRef::Inline(inline) => (**inline).clone(),
    };

    if let Some(include) = &variant.include {
        apply_include(&mut metric, include);
    }
    apply_overrides(&mut metric, &variant.overrides)?;
    for combine in &variant.combine {
        apply_combine(&mut metric, combine, &lookup, &variant.name)?;
    }
    for param in &variant.parameters {
        upsert_by_name(&mut metric.parameters, param.clone(), |p: &Parameter| {
            p.name.clone()
        });
    }
    if variant.cache.is_some() {
        metric.cache = variant.cache.clone();
    }

    if let Some(modifiers) = modifiers {
        apply_modifiers(&mut metric, modifiers);
    }

    metric.name = variant.name.clone();

    Ok(ResolvedMetric {
        metric,
        derived: variant.derived.clone(),
    })
}

/// Ad-hoc modifiers are upserts: a matching name replaces the base
/// component, a new name appends. Modifiers never delete.
fn apply_modifiers(metric: &mut SemanticMetric, modifiers: &ModifierSet) {
    for measure in &modifiers.measures {
        upsert_by_name(&mut metric.measures, measure.clone(), |m: &Measure| {
            m.name.clone()
        });
    }
    for dimension in &modifiers.dimensions {
        upsert_by_name(&mut metric.dimensions, dimension.clone(), |d: &Dimension| {
            d.name.clone()
        });
    }
    for filter in &modifiers.filters {
        upsert_by_name(&mut metric.filters, filter.clone(), |f: &Filter| {
            f.name.clone()
        });
    }
    for join in &modifiers.joins {
        upsert_by_name(&mut metric.joins, join.clone(), |j: &Join| j.name.clone());
    }
    if let Some(order) = &modifiers.order {
        metric.order = order.clone();
        metric.ordered = true;
    }
    if let Some(limit) = modifiers.limit {
        metric.limit = Some(limit);
    }
}

fn apply_include(metric: &mut SemanticMetric, include: &IncludeList) {
    if let Some(keep) = &include.measures {
        metric.measures.retain(|m| keep.contains(&m.name));
    }
    if let Some(keep) = &include.dimensions {
        metric.dimensions.retain(|d| keep.contains(&d.name));
    }
    if let Some(keep) = &include.filters {
        metric.filters.retain(|f| keep.contains(&f.name));
    }
    if let Some(keep) = &include.joins {
        metric.joins.retain(|j| keep.contains(&j.name));
    }
}

fn apply_overrides(metric: &mut SemanticMetric, overrides: &MetricOverrides) -> Result<()> {
    apply_excludes(metric, &overrides.exclude)?;
    apply_replaces(metric, &overrides.replace)?;
    apply_adds(metric, &overrides.add)?;

    let config = &overrides.config;
    if let Some(table) = &config.table {
        metric.table = Some(table.clone());
        metric.sql = None;
    }
    if let Some(limit) = config.limit {
        metric.limit = Some(limit);
    }
    if let Some(grouped) = config.grouped {
        metric.grouped = grouped;
    }
    if let Some(ordered) = config.ordered {
        metric.ordered = ordered;
    }
    Ok(())
}

fn apply_excludes(metric: &mut SemanticMetric, exclude: &ExcludeSet) -> Result<()> {
    exclude_by_name(&mut metric.measures, &exclude.measures, "measure", |m| {
        m.name.clone()
    })?;
    exclude_by_name(
        &mut metric.dimensions,
        &exclude.dimensions,
        "dimension",
        |d| d.name.clone(),
    )?;
    exclude_by_name(&mut metric.filters, &exclude.filters, "filter", |f| {
        f.name.clone()
    })?;
    exclude_by_name(&mut metric.joins, &exclude.joins, "join", |j| {
        j.name.clone()
    })?;
    exclude_by_name(
        &mut metric.parameters,
        &exclude.parameters,
        "parameter",
        |p| p.name.clone(),
    )?;
    Ok(())
}

fn apply_replaces(metric: &mut SemanticMetric, replace: &ComponentSet) -> Result<()> {
    replace_by_name(&mut metric.measures, &replace.measures, "measure", |m| {
        m.name.clone()
    })?;
    replace_by_name(
        &mut metric.dimensions,
        &replace.dimensions,
        "dimension",
        |d| d.name.clone(),
    )?;
    replace_by_name(&mut metric.filters, &replace.filters, "filter", |f| {
        f.name.clone()
    })?;
    replace_by_name(&mut metric.joins, &replace.joins, "join", |j| {
        j.name.clone()
    })?;
    replace_by_name(
        &mut metric.parameters,
        &replace.parameters,
        "parameter",
        |p| p.name.clone(),
    )?;
    Ok(())
}

fn apply_adds(metric: &mut SemanticMetric, add: &ComponentSet) -> Result<()> {
    add_by_name(&mut metric.measures, &add.measures, "measure", |m| {
        m.name.clone()
    })?;
    add_by_name(&mut metric.dimensions, &add.dimensions, "dimension", |d| {
        d.name.clone()
    })?;
    add_by_name(&mut metric.filters, &add.filters, "filter", |f| {
        f.name.clone()
    })?;
    add_by_name(&mut metric.joins, &add.joins, "join", |j| j.name.clone())?;
    add_by_name(&mut metric.parameters, &add.parameters, "parameter", |p| {
        p.name.clone()
    })?;
    Ok(())
}

/// Merge another metric's components in via a join. Name collisions are
/// resolution errors; merged components keep their owning table.
fn apply_combine<F>(
    metric: &mut SemanticMetric,
    combine: &CombineMetric,
    lookup: &F,
    variant_name: &str,
) -> Result<()>
where
    F: Fn(&str) -> Option<SemanticMetric>,
{
    let other = lookup(&combine.metric).ok_or_else(|| {
        MetriqError::Resolution(format!(
            "variant {variant_name} combines unknown metric {}",
            combine.metric
        ))
    })?;
    if other.data_source != metric.data_source {
        return Err(MetriqError::Resolution(format!(
            "variant {variant_name} combines metric {} from a different data source ({})",
            other.name, other.data_source
        )));
    }

    let other_alias = other.base_alias().to_string();
    add_by_name(
        &mut metric.joins,
        std::slice::from_ref(&combine.join),
        "join",
        |j| j.name.clone(),
    )?;
    for join in &other.joins {
        add_by_name(&mut metric.joins, std::slice::from_ref(join), "join", |j| {
            j.name.clone()
        })?;
    }

    let qualified = |table: &Option<String>| -> Option<String> {
        Some(table.clone().unwrap_or_else(|| other_alias.clone()))
    };
    for measure in &other.measures {
        let mut measure = measure.clone();
        measure.table = qualified(&measure.table);
        add_by_name(
            &mut metric.measures,
            std::slice::from_ref(&measure),
            "measure",
            |m| m.name.clone(),
        )?;
    }
    for dimension in &other.dimensions {
        let mut dimension = dimension.clone();
        dimension.table = qualified(&dimension.table);
        add_by_name(
            &mut metric.dimensions,
            std::slice::from_ref(&dimension),
            "dimension",
            |d| d.name.clone(),
        )?;
    }
    for parameter in &other.parameters {
        upsert_by_name(&mut metric.parameters, parameter.clone(), |p: &Parameter| {
            p.name.clone()
        });
    }
    Ok(())
}

fn upsert_by_name<T, K>(items: &mut Vec<T>, item: T, name_of: K)
where
    K: Fn(&T) -> String,
{
    let name = name_of(&item);
    match items.iter_mut().find(|existing| name_of(existing) == name) {
        Some(existing) => *existing = item,
        None => items.push(item),
    }
}

fn exclude_by_name<T, K>(items: &mut Vec<T>, names: &[String], kind: &str, name_of: K) -> Result<()>
where
    K: Fn(&T) -> String,
{
    for name in names {
        let before = items.len();
        items.retain(|item| name_of(item) != *name);
        if items.len() == before {
            return Err(MetriqError::Resolution(format!(
                "cannot exclude {kind} {name}: not present in the base metric"
            )));
        }
    }
    Ok(())
}

fn replace_by_name<T: Clone, K>(
    items: &mut Vec<T>,
    replacements: &[T],
    kind: &str,
    name_of: K,
) -> Result<()>
where
    K: Fn(&T) -> String,
{
    for replacement in replacements {
        let name = name_of(replacement);
        match items.iter_mut().find(|item| name_of(item) == name) {
            Some(existing) => *existing = replacement.clone(),
            None => {
                return Err(MetriqError::Resolution(format!(
                    "cannot replace {kind} {name}: not present in the base metric"
                )))
            }
        }
    }
    Ok(())
}

fn add_by_name<T: Clone, K>(items: &mut Vec<T>, additions: &[T], kind: &str, name_of: K) -> Result<()>
where
    K: Fn(&T) -> String,
{
    for addition in additions {
        let name = name_of(addition);
        if items.iter().any(|item| name_of(item) == name) {
            return Err(MetriqError::Resolution(format!(
                "cannot add {kind} {name}: name already present in the base metric"
            )));
        }
        items.push(addition.clone());
    }
    Ok(())
}
