//! Integration tests for the execution engine.

mod common;

use serde_json::json;

use common::{dimension, engine_with, monthly_revenue_metric, parameterized_metric, row};
use metriq::engine::{ExecuteRequest, ExecuteTarget};
use metriq::error::MetriqError;
use metriq::history::HistoryFilter;
use metriq::metrics::{
    ComponentSet, Expr, ExcludeSet, MetricOverrides, MetricRef, MetricVariant,
};
use metriq::preagg::{
    BuildStatus, PreAggregationSpec, RefreshPolicy, RollupType, StorageMode,
};

fn result_rows() -> Vec<serde_json::Map<String, serde_json::Value>> {
    vec![
        row(&[("month", json!("2024-01-01")), ("revenue", json!(1200))]),
        row(&[("month", json!("2024-02-01")), ("revenue", json!(1800))]),
    ]
}

#[tokio::test]
async fn execute_dispatches_and_returns_rows() {
    let harness = engine_with(vec![monthly_revenue_metric()], vec![], result_rows());
    let mut request = ExecuteRequest::named("monthly_revenue");
    request.limit = Some(12);

    let result = harness.engine.execute(request).await;
    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.data.len(), 2);
    assert_eq!(result.columns, vec!["month", "revenue"]);
    assert!(!result.metadata.cached);
    assert!(result.metadata.sql.contains("GROUP BY"));
    assert!(result.metadata.sql.contains("LIMIT 12"));
    assert_eq!(harness.connector.execution_count(), 1);
}

#[tokio::test]
async fn second_identical_execution_hits_cache() {
    let harness = engine_with(vec![monthly_revenue_metric()], vec![], result_rows());
    let mut request = ExecuteRequest::named("monthly_revenue");
    request.limit = Some(12);

    let first = harness.engine.execute(request.clone()).await;
    assert!(first.success);
    assert!(!first.metadata.cached);

    let second = harness.engine.execute(request).await;
    assert!(second.success);
    assert!(second.metadata.cached);
    assert_eq!(second.data, first.data);
    // Zero additional connector dispatch.
    assert_eq!(harness.connector.execution_count(), 1);

    // Both executions are in the history, the second marked as a hit.
    let records = harness
        .engine
        .history()
        .list(&HistoryFilter::default())
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records[0].cache_hit);
    assert!(!records[1].cache_hit);
}

#[tokio::test]
async fn disabling_cache_forces_dispatch() {
    let harness = engine_with(vec![monthly_revenue_metric()], vec![], result_rows());
    let mut request = ExecuteRequest::named("monthly_revenue");
    request.cache.enabled = Some(false);

    harness.engine.execute(request.clone()).await;
    harness.engine.execute(request).await;
    assert_eq!(harness.connector.execution_count(), 2);
}

#[tokio::test]
async fn different_scopes_do_not_share_cache_entries() {
    let harness = engine_with(vec![monthly_revenue_metric()], vec![], result_rows());
    let request = ExecuteRequest::named("monthly_revenue");

    harness.engine.execute(request.clone()).await;

    let mut scoped = request;
    scoped.scope.tenant = "acme".to_string();
    let result = harness.engine.execute(scoped).await;
    assert!(!result.metadata.cached);
    assert_eq!(harness.connector.execution_count(), 2);
}

#[tokio::test]
async fn connector_failure_is_structured_not_raised() {
    let harness = engine_with(vec![monthly_revenue_metric()], vec![], result_rows());
    harness
        .connector
        .fail
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let result = harness
        .engine
        .execute(ExecuteRequest::named("monthly_revenue"))
        .await;
    assert!(!result.success);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("simulated failure"));

    let records = harness
        .engine
        .history()
        .list(&HistoryFilter {
            success: Some(false),
            ..HistoryFilter::default()
        })
        .unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].error.as_deref().unwrap_or_default().contains("simulated"));
}

#[tokio::test]
async fn unknown_metric_is_a_structured_failure() {
    let harness = engine_with(vec![], vec![], vec![]);
    let result = harness.engine.execute(ExecuteRequest::named("ghost")).await;
    assert!(!result.success);
    assert!(result.errors[0].contains("ghost"));
    assert_eq!(harness.connector.execution_count(), 0);
}

#[tokio::test]
async fn missing_required_parameter_fails_before_dispatch() {
    let harness = engine_with(vec![parameterized_metric()], vec![], result_rows());
    let result = harness
        .engine
        .execute(ExecuteRequest::named("revenue_by_country"))
        .await;
    assert!(!result.success);
    assert!(result.errors[0].contains("country"));
    assert_eq!(harness.connector.execution_count(), 0);
}

#[tokio::test]
async fn parameters_flow_into_bindings() {
    let harness = engine_with(vec![parameterized_metric()], vec![], result_rows());
    let mut request = ExecuteRequest::named("revenue_by_country");
    request.params.insert("country".to_string(), json!("DE"));

    let result = harness.engine.execute(request).await;
    assert!(result.success, "errors: {:?}", result.errors);
    assert!(!result.metadata.sql.contains("DE"));
}

#[tokio::test]
async fn context_parameters_resolve_through_provider() {
    let mut metric = monthly_revenue_metric();
    metric.filters = vec![common::where_filter(
        "tenant",
        "tenant_id",
        metriq::metrics::FilterOp::Eq,
        json!("{{ ctx.tenant_id }}"),
    )];
    let harness = engine_with(vec![metric], vec![], result_rows());

    let mut request = ExecuteRequest::named("monthly_revenue");
    request.context_id = Some("ctx-1".to_string());
    let result = harness.engine.execute(request).await;
    assert!(result.success, "errors: {:?}", result.errors);

    // Without the context id the reserved parameter cannot resolve.
    let result = harness
        .engine
        .execute(ExecuteRequest::named("monthly_revenue"))
        .await;
    assert!(!result.success);
    assert!(result.errors[0].contains("ctx.tenant_id"));
}

#[tokio::test]
async fn variant_executes_with_overrides_applied() {
    let variant = MetricVariant {
        name: "revenue_no_filter".to_string(),
        source: MetricRef::Id("monthly_revenue".to_string()),
        include: None,
        overrides: MetricOverrides {
            exclude: ExcludeSet {
                filters: vec!["us_only".to_string()],
                ..ExcludeSet::default()
            },
            add: ComponentSet::default(),
            replace: ComponentSet::default(),
            config: Default::default(),
        },
        derived: Vec::new(),
        combine: Vec::new(),
        cache: None,
        parameters: Vec::new(),
        description: None,
    };
    let harness = engine_with(
        vec![monthly_revenue_metric()],
        vec![variant],
        result_rows(),
    );

    let result = harness
        .engine
        .execute(ExecuteRequest::named("revenue_no_filter"))
        .await;
    assert!(result.success, "errors: {:?}", result.errors);
    assert!(!result.metadata.sql.contains("WHERE"));

    // The variant's history records carry the variant name.
    let records = harness
        .engine
        .history()
        .list(&HistoryFilter {
            metric: Some("revenue_no_filter".to_string()),
            ..HistoryFilter::default()
        })
        .unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn inline_metric_executes_without_registry() {
    let harness = engine_with(vec![], vec![], result_rows());
    let mut request = ExecuteRequest::named("unused");
    request.target = ExecuteTarget::Inline(Box::new(monthly_revenue_metric()));

    let result = harness.engine.execute(request).await;
    assert!(result.success, "errors: {:?}", result.errors);
}

#[tokio::test]
async fn compile_only_returns_sql_without_dispatch() {
    let harness = engine_with(vec![monthly_revenue_metric()], vec![], result_rows());
    let compiled = harness
        .engine
        .compile_only(&ExecuteRequest::named("monthly_revenue"))
        .await
        .unwrap();
    assert!(compiled.sql.starts_with("SELECT"));
    assert_eq!(compiled.bindings, vec![json!("US")]);
    assert_eq!(harness.connector.execution_count(), 0);
}

#[tokio::test]
async fn compile_only_surfaces_errors_synchronously() {
    let harness = engine_with(vec![monthly_revenue_metric()], vec![], result_rows());
    let err = harness
        .engine
        .compile_only(&ExecuteRequest::named("ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, MetriqError::Resolution(_)));
}

// ============================================================================
// Pre-aggregation integration
// ============================================================================

fn rollup_spec() -> PreAggregationSpec {
    PreAggregationSpec {
        id: "monthly".to_string(),
        metric: "monthly_revenue".to_string(),
        dimensions: vec!["month".to_string()],
        measures: vec!["revenue".to_string()],
        rollup_type: RollupType::Rollup,
        partition: None,
        refresh: RefreshPolicy::Every { secs: 3600 },
        storage: StorageMode::Table,
    }
}

/// Fixture metric whose filter lands on the retained dimension's column,
/// so the rollup stays eligible.
fn rollup_friendly_metric() -> metriq::metrics::SemanticMetric {
    let mut metric = monthly_revenue_metric();
    metric.filters.clear();
    metric.dimensions = vec![dimension(
        "month",
        Expr::Column {
            column: "month".to_string(),
        },
    )];
    metric
}

#[tokio::test]
async fn completed_rollup_serves_the_query() {
    let harness = engine_with(vec![rollup_friendly_metric()], vec![], result_rows());
    harness.preaggs.upsert_spec(rollup_spec()).unwrap();

    // Before the build the raw source serves the query.
    let before = harness
        .engine
        .execute(ExecuteRequest::named("monthly_revenue"))
        .await;
    assert!(before.success);
    assert!(before.metadata.rollup.is_none());
    assert!(before.metadata.sql.contains("FROM \"sales\""));

    let outcome = harness.engine.refresh_preagg("monthly", false).await.unwrap();
    assert!(outcome.statement.contains("CREATE OR REPLACE TABLE \"preagg_monthly\""));
    assert_eq!(harness.preaggs.state("monthly").status, BuildStatus::Completed);

    let mut request = ExecuteRequest::named("monthly_revenue");
    request.cache.enabled = Some(false); // bypass the result cache to observe the rewrite
    let after = harness.engine.execute(request).await;
    assert!(after.success, "errors: {:?}", after.errors);
    assert_eq!(after.metadata.rollup.as_deref(), Some("monthly"));
    assert!(after.metadata.sql.contains("FROM \"preagg_monthly\""));
    assert!(after.metadata.sql.contains("SUM(\"preagg_monthly\".\"revenue\")"));
}

#[tokio::test]
async fn failed_rollup_does_not_block_queries() {
    let harness = engine_with(vec![rollup_friendly_metric()], vec![], result_rows());
    harness.preaggs.upsert_spec(rollup_spec()).unwrap();
    harness
        .connector
        .fail
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let err = harness.engine.refresh_preagg("monthly", false).await.unwrap_err();
    assert!(matches!(err, MetriqError::PreAggregation(_)));
    assert_eq!(harness.preaggs.state("monthly").status, BuildStatus::Failed);
    harness
        .connector
        .fail
        .store(false, std::sync::atomic::Ordering::SeqCst);

    // Queries simply bypass the rollup.
    let result = harness
        .engine
        .execute(ExecuteRequest::named("monthly_revenue"))
        .await;
    assert!(result.success);
    assert!(result.metadata.rollup.is_none());
}

#[tokio::test]
async fn dry_run_refresh_previews_statement() {
    let harness = engine_with(vec![rollup_friendly_metric()], vec![], result_rows());
    harness.preaggs.upsert_spec(rollup_spec()).unwrap();

    let outcome = harness.engine.refresh_preagg("monthly", true).await.unwrap();
    assert!(outcome.dry_run);
    assert_eq!(harness.preaggs.state("monthly").status, BuildStatus::Pending);
    // Nothing was executed.
    assert!(harness.connector.executed_sql().is_empty());
}

#[tokio::test]
async fn delete_preagg_drops_storage() {
    let harness = engine_with(vec![rollup_friendly_metric()], vec![], result_rows());
    harness.preaggs.upsert_spec(rollup_spec()).unwrap();

    assert!(harness.engine.delete_preagg("monthly").await.unwrap());
    let statements = harness.connector.executed_sql();
    assert!(statements
        .iter()
        .any(|s| s.contains("DROP TABLE IF EXISTS \"preagg_monthly\"")));
    assert!(harness.preaggs.get("monthly").is_none());
    assert!(!harness.engine.delete_preagg("monthly").await.unwrap());
}

#[tokio::test]
async fn sql_refresh_policy_runs_watermark_query() {
    let harness = engine_with(
        vec![rollup_friendly_metric()],
        vec![],
        vec![row(&[("max_month", json!("2024-06-01"))])],
    );
    let mut spec = rollup_spec();
    spec.refresh = RefreshPolicy::Sql {
        check_sql: "SELECT max(month) AS max_month FROM sales".to_string(),
    };
    harness.preaggs.upsert_spec(spec).unwrap();

    // Never built: due.
    assert!(harness.engine.preagg_due_for_refresh("monthly").await.unwrap());

    harness.engine.refresh_preagg("monthly", false).await.unwrap();
    // Watermark unchanged: not due.
    assert!(!harness.engine.preagg_due_for_refresh("monthly").await.unwrap());
}

// ============================================================================
// Cache administration
// ============================================================================

#[tokio::test]
async fn cache_admin_surface() {
    let harness = engine_with(vec![monthly_revenue_metric()], vec![], result_rows());
    harness
        .engine
        .execute(ExecuteRequest::named("monthly_revenue"))
        .await;

    let status = harness.engine.cache_status().unwrap();
    assert_eq!(status.entries, 1);
    assert!(status.approximate_bytes > 0);

    harness.engine.cache_clear().unwrap();
    assert_eq!(harness.engine.cache_status().unwrap().entries, 0);
}
