//! Parameter placeholder substitution.
//!
//! Values and custom SQL sources may reference parameters with a
//! `{{ name }}` placeholder. Explicit parameters come from the caller's
//! runtime map; names under the reserved `ctx.` prefix resolve from the
//! consumer-context map only.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{MetriqError, Result};
use crate::metrics::{SemanticMetric, CONTEXT_PREFIX};
use crate::sql_ast::{RawSegment, RawSql};

use super::CompileOptions;

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\}\}").expect("valid regex"));

/// Resolve a single parameter name to its bound value.
pub fn resolve_param(name: &str, metric: &SemanticMetric, options: &CompileOptions) -> Result<Value> {
    if let Some(context_key) = name.strip_prefix(CONTEXT_PREFIX) {
        return options.context.get(context_key).cloned().ok_or_else(|| {
            MetriqError::Compilation(format!(
                "context parameter {name} not present in consumer context"
            ))
        });
    }

    if let Some(value) = options.params.get(name) {
        return Ok(value.clone());
    }

    match metric.parameter(name) {
        Some(param) => match &param.default {
            Some(default) => Ok(default.clone()),
            None if param.required => Err(MetriqError::Compilation(format!(
                "missing required parameter {name}"
            ))),
            None => Ok(Value::Null),
        },
        None => Err(MetriqError::Compilation(format!(
            "unknown parameter {name}"
        ))),
    }
}

/// Substitute placeholders in a filter value. A string that is exactly one
/// placeholder resolves to the parameter's typed value; arrays substitute
/// element-wise. Everything else passes through untouched.
pub fn substitute_value(
    value: &Value,
    metric: &SemanticMetric,
    options: &CompileOptions,
) -> Result<Value> {
    match value {
        Value::String(s) => match exact_placeholder(s) {
            Some(name) => resolve_param(&name, metric, options),
            None => Ok(value.clone()),
        },
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(substitute_value(item, metric, options)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

/// Split a custom SQL source at its placeholders, resolving each into a
/// bound segment.
pub fn substitute_raw_sql(
    sql: &str,
    metric: &SemanticMetric,
    options: &CompileOptions,
) -> Result<RawSql> {
    let mut segments = Vec::new();
    let mut last = 0;
    for caps in PLACEHOLDER_RE.captures_iter(sql) {
        let whole = caps.get(0).expect("match");
        let name = &caps[1];
        if whole.start() > last {
            segments.push(RawSegment::Text(sql[last..whole.start()].to_string()));
        }
        segments.push(RawSegment::Bind(resolve_param(name, metric, options)?));
        last = whole.end();
    }
    if last < sql.len() {
        segments.push(RawSegment::Text(sql[last..].to_string()));
    }
    Ok(RawSql { segments })
}

/// All placeholder names appearing in a string, in order of appearance.
pub(crate) fn placeholder_names(s: &str) -> Vec<String> {
    PLACEHOLDER_RE
        .captures_iter(s)
        .map(|caps| caps[1].to_string())
        .collect()
}

fn exact_placeholder(s: &str) -> Option<String> {
    let caps = PLACEHOLDER_RE.captures(s)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == s.len() {
        Some(caps[1].to_string())
    } else {
        None
    }
}
