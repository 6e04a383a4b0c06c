//! Registry loading and static validation tests.

mod common;

use std::fs;

use metriq::error::MetriqError;
use metriq::metrics::{Aggregation, Expr, Function, TimeGrain};
use metriq::registry::MetricRegistry;
use metriq::validation::Validator;

const METRIC_YAML: &str = r#"
name: monthly_revenue
data_source: warehouse
table: sales
alias: s
limit: 1000
measures:
  - name: revenue
    agg: sum
    expr: amount
  - name: us_revenue
    agg: sum
    conditional:
      branches:
        - when:
            type: binary
            op: eq
            left:
              type: column
              column: country
            right:
              type: literal
              value: US
          then: amount
      else_expr:
        type: literal
        value: 0
dimensions:
  - name: month
    expr:
      type: func
      func:
        date_trunc: month
      args:
        - sale_date
  - name: country
filters:
  - name: us_only
    expr: country
    op: "=="
    value: US
"#;

const VARIANT_YAML: &str = r#"
name: revenue_ranked
source: monthly_revenue
overrides:
  exclude:
    filters: [us_only]
derived:
  - name: revenue_rank
    derivation: rank
    measure: revenue
    order_by: [month]
"#;

fn write_registry_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("metrics")).unwrap();
    fs::create_dir_all(dir.path().join("variants")).unwrap();
    fs::write(dir.path().join("metrics/monthly_revenue.yml"), METRIC_YAML).unwrap();
    fs::write(dir.path().join("variants/revenue_ranked.yml"), VARIANT_YAML).unwrap();
    dir
}

#[test]
fn loads_metrics_and_variants_from_dir() {
    let dir = write_registry_dir();
    let registry = MetricRegistry::load_from_dir(dir.path()).unwrap();

    let metric = registry.get_metric("monthly_revenue").expect("metric loaded");
    assert_eq!(metric.measures.len(), 2);
    assert_eq!(metric.measures[0].agg, Aggregation::Sum);
    assert!(metric.measures[1].conditional.is_some());
    // Bare dimension falls back to a column of the same name.
    let country = metric.dimension("country").unwrap();
    assert!(matches!(
        country.output_expr(),
        Expr::Column { column } if column == "country"
    ));
    // Function shorthand round-trips.
    let month = metric.dimension("month").unwrap();
    assert!(matches!(
        month.output_expr(),
        Expr::Func {
            func: Function::DateTrunc(TimeGrain::Month),
            ..
        }
    ));

    let variant = registry.get_variant("revenue_ranked").expect("variant loaded");
    assert_eq!(variant.derived.len(), 1);
}

#[test]
fn registry_round_trips_through_validator() {
    let dir = write_registry_dir();
    let registry = metriq::load_and_validate(dir.path(), &Validator::default()).unwrap();
    assert_eq!(registry.metrics.len(), 1);
    assert_eq!(registry.variants.len(), 1);
}

#[test]
fn missing_metrics_dir_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = MetricRegistry::load_from_dir(dir.path()).unwrap_err();
    assert!(matches!(err, MetriqError::Validation(_)));
}

#[test]
fn metric_with_both_table_and_sql_is_rejected() {
    let yaml = r#"
name: broken
data_source: warehouse
table: sales
sql: SELECT 1
measures:
  - name: n
    agg: count
    expr: id
"#;
    let err = serde_yaml::from_str::<metriq::metrics::SemanticMetric>(yaml).unwrap_err();
    assert!(err.to_string().contains("mutually exclusive"));
}

#[test]
fn unknown_fields_are_rejected() {
    let yaml = r#"
name: broken
data_source: warehouse
table: sales
surprise: true
"#;
    assert!(serde_yaml::from_str::<metriq::metrics::SemanticMetric>(yaml).is_err());
}

#[test]
fn upsert_and_remove() {
    let mut registry = MetricRegistry::new();
    registry.upsert_metric(common::monthly_revenue_metric());
    assert!(registry.get_metric("monthly_revenue").is_some());
    assert!(registry.remove_metric("monthly_revenue").is_some());
    assert!(registry.get_metric("monthly_revenue").is_none());
}

// ============================================================================
// Static validation
// ============================================================================

#[test]
fn validator_rejects_dangling_join() {
    let mut metric = common::monthly_revenue_metric();
    metric.joins.push(metriq::metrics::Join {
        name: "bad".to_string(),
        join_type: metriq::metrics::JoinType::Left,
        left: "not_there".to_string(),
        right: "customers".to_string(),
        on: vec![metriq::metrics::JoinKey {
            left: "customer_id".to_string(),
            right: "id".to_string(),
        }],
        description: None,
    });
    let err = Validator::default().validate_metric(&metric).unwrap_err();
    match err {
        MetriqError::Validation(msg) => assert!(msg.contains("not_there")),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn validator_rejects_undeclared_parameter_reference() {
    let mut metric = common::monthly_revenue_metric();
    metric.filters[0].value = serde_json::json!("{{ mystery }}");
    let err = Validator::default().validate_metric(&metric).unwrap_err();
    match err {
        MetriqError::Validation(msg) => assert!(msg.contains("mystery")),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn validator_rejects_duplicate_measure_names() {
    let mut metric = common::monthly_revenue_metric();
    metric
        .measures
        .push(common::measure("revenue", Aggregation::Avg, "amount"));
    let err = Validator::default().validate_metric(&metric).unwrap_err();
    match err {
        MetriqError::Validation(msg) => assert!(msg.contains("duplicate measure")),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn warn_only_validator_lets_problems_pass() {
    let mut metric = common::monthly_revenue_metric();
    metric.filters[0].value = serde_json::json!("{{ mystery }}");
    assert!(Validator::new(true).validate_metric(&metric).is_ok());
}

#[test]
fn validator_checks_variant_derivations() {
    let dir = write_registry_dir();
    let mut registry = MetricRegistry::load_from_dir(dir.path()).unwrap();

    let mut variant = registry.get_variant("revenue_ranked").unwrap().clone();
    variant.derived[0].order_by.clear();
    registry.upsert_variant(variant);

    let err = Validator::default().validate_registry(&registry).unwrap_err();
    match err {
        MetriqError::Validation(msg) => assert!(msg.contains("ordering dimension")),
        other => panic!("unexpected error {other:?}"),
    }
}
