//! Integration tests for the pre-aggregation planner.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use common::{dimension, measure, monthly_revenue_metric, MockConnector};
use metriq::compiler::CompileOptions;
use metriq::connectors::{Connector, QueryResult, TableSchema};
use metriq::dialect::{Dialect, DuckDbDialect};
use metriq::error::{MetriqError, Result};
use metriq::metrics::{Aggregation, Expr, SemanticMetric};
use metriq::preagg::{
    BuildStatus, PreAggregationPlanner, PreAggregationSpec, RefreshPolicy, RollupType, StorageMode,
};
use metriq::resolver::ResolvedMetric;

fn spec(id: &str, dimensions: &[&str], measures: &[&str]) -> PreAggregationSpec {
    PreAggregationSpec {
        id: id.to_string(),
        metric: "monthly_revenue".to_string(),
        dimensions: dimensions.iter().map(|s| s.to_string()).collect(),
        measures: measures.iter().map(|s| s.to_string()).collect(),
        rollup_type: RollupType::Rollup,
        partition: None,
        refresh: RefreshPolicy::Every { secs: 3600 },
        storage: StorageMode::Table,
    }
}

/// The §"monthly revenue by date and product" style source with two
/// dimensions, so coverage subsets are meaningful.
fn sales_metric() -> SemanticMetric {
    let mut metric = monthly_revenue_metric();
    metric.filters.clear();
    metric.dimensions = vec![
        dimension(
            "date",
            Expr::Column {
                column: "sale_date".to_string(),
            },
        ),
        dimension(
            "product",
            Expr::Column {
                column: "product".to_string(),
            },
        ),
    ];
    metric
}

fn resolved(mut metric: SemanticMetric, keep_dims: &[&str]) -> ResolvedMetric {
    metric.dimensions.retain(|d| keep_dims.contains(&d.name.as_str()));
    ResolvedMetric::plain(metric)
}

// ============================================================================
// Eligibility
// ============================================================================

#[test]
fn rollup_serves_dimension_subset() {
    let planner = PreAggregationPlanner::new();
    let spec = spec("daily", &["date", "product"], &["revenue"]);

    // {date} / {revenue} is covered.
    assert!(planner.can_serve(&spec, &resolved(sales_metric(), &["date"])));

    // An additional dimension outside the rollup is not.
    let mut wide = sales_metric();
    wide.dimensions.push(dimension(
        "region",
        Expr::Column {
            column: "region".to_string(),
        },
    ));
    assert!(!planner.can_serve(&spec, &ResolvedMetric::plain(wide)));
}

#[test]
fn non_reaggregatable_measures_are_not_served() {
    let planner = PreAggregationPlanner::new();
    let spec = spec("daily", &["date", "product"], &["revenue", "avg_amount"]);

    let mut metric = sales_metric();
    metric
        .measures
        .push(measure("avg_amount", Aggregation::Avg, "amount"));
    assert!(!planner.can_serve(&spec, &ResolvedMetric::plain(metric)));
}

#[test]
fn filters_must_land_on_retained_dimensions() {
    let planner = PreAggregationPlanner::new();
    let spec = spec("daily", &["date", "product"], &["revenue"]);

    // Filter on a retained dimension's column: servable.
    let mut metric = sales_metric();
    metric.filters = vec![common::where_filter(
        "one_product",
        "product",
        metriq::metrics::FilterOp::Eq,
        json!("widget"),
    )];
    assert!(planner.can_serve(&spec, &ResolvedMetric::plain(metric)));

    // Filter on a column no retained dimension exposes: not servable.
    let mut metric = sales_metric();
    metric.filters = vec![common::where_filter(
        "country",
        "country",
        metriq::metrics::FilterOp::Eq,
        json!("US"),
    )];
    assert!(!planner.can_serve(&spec, &ResolvedMetric::plain(metric)));
}

// ============================================================================
// Rewrite
// ============================================================================

#[test]
fn rewrite_reads_rollup_storage_and_reaggregates() {
    let planner = PreAggregationPlanner::new();
    let spec = spec("daily", &["date", "product"], &["revenue"]);

    let compiled = planner
        .rewrite(
            &spec,
            &resolved(sales_metric(), &["date"]),
            &DuckDbDialect,
            &CompileOptions::default(),
        )
        .unwrap();

    assert!(compiled.sql.contains("FROM \"preagg_daily\""));
    assert!(compiled.sql.contains("SUM(\"preagg_daily\".\"revenue\") AS \"revenue\""));
    assert!(compiled.sql.contains("GROUP BY \"preagg_daily\".\"date\""));
}

#[test]
fn rewrite_moves_filters_onto_dimension_columns() {
    let planner = PreAggregationPlanner::new();
    let spec = spec("daily", &["date", "product"], &["revenue"]);

    let mut metric = sales_metric();
    metric.filters = vec![common::where_filter(
        "one_product",
        "product",
        metriq::metrics::FilterOp::Eq,
        json!("widget"),
    )];

    let compiled = planner
        .rewrite(
            &spec,
            &ResolvedMetric::plain(metric),
            &DuckDbDialect,
            &CompileOptions::default(),
        )
        .unwrap();
    assert!(compiled.sql.contains("WHERE (\"preagg_daily\".\"product\" = ?)"));
    assert_eq!(compiled.bindings, vec![json!("widget")]);
}

// ============================================================================
// Build
// ============================================================================

#[test]
fn build_statement_materializes_the_subset() {
    let planner = PreAggregationPlanner::new();
    planner
        .upsert_spec(spec("daily", &["date", "product"], &["revenue"]))
        .unwrap();
    let statement = planner
        .build_statement(
            &planner.get("daily").unwrap(),
            &sales_metric(),
            &DuckDbDialect,
        )
        .unwrap();

    assert!(statement.starts_with("CREATE OR REPLACE TABLE \"preagg_daily\" AS SELECT"));
    assert!(statement.contains("SUM(\"s\".\"amount\") AS \"revenue\""));
    assert!(statement.contains("GROUP BY"));
    // No residual parameters in DDL.
    assert!(!statement.contains('?'));
}

#[test]
fn build_statement_for_materialized_view() {
    let planner = PreAggregationPlanner::new();
    let mut view_spec = spec("mv", &["date"], &["revenue"]);
    view_spec.storage = StorageMode::MaterializedView;
    planner.upsert_spec(view_spec).unwrap();
    let statement = planner
        .build_statement(&planner.get("mv").unwrap(), &sales_metric(), &DuckDbDialect)
        .unwrap();
    assert!(statement.starts_with("CREATE OR REPLACE MATERIALIZED VIEW \"preagg_mv\""));
}

#[tokio::test]
async fn dry_run_previews_without_state_change() {
    let planner = PreAggregationPlanner::new();
    planner
        .upsert_spec(spec("daily", &["date"], &["revenue"]))
        .unwrap();
    let connector: Arc<dyn Connector> = Arc::new(MockConnector::default());

    let outcome = planner
        .build("daily", &sales_metric(), &connector, true, None)
        .await
        .unwrap();
    assert!(outcome.dry_run);
    assert!(outcome.statement.contains("CREATE OR REPLACE TABLE"));
    assert_eq!(planner.state("daily").status, BuildStatus::Pending);
}

#[tokio::test]
async fn successful_build_completes_with_row_count() {
    let planner = PreAggregationPlanner::new();
    planner
        .upsert_spec(spec("daily", &["date"], &["revenue"]))
        .unwrap();
    let connector: Arc<dyn Connector> = Arc::new(MockConnector::default());

    let outcome = planner
        .build("daily", &sales_metric(), &connector, false, None)
        .await
        .unwrap();
    assert_eq!(outcome.row_count, Some(42));

    let state = planner.state("daily");
    assert_eq!(state.status, BuildStatus::Completed);
    assert_eq!(state.row_count, Some(42));
    assert!(state.built_at.is_some());
}

#[tokio::test]
async fn failed_build_records_message_and_allows_retry() {
    let planner = PreAggregationPlanner::new();
    planner
        .upsert_spec(spec("daily", &["date"], &["revenue"]))
        .unwrap();
    let failing = MockConnector::default();
    failing.fail.store(true, std::sync::atomic::Ordering::SeqCst);
    let connector: Arc<dyn Connector> = Arc::new(failing);

    let err = planner
        .build("daily", &sales_metric(), &connector, false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, MetriqError::PreAggregation(_)));

    let state = planner.state("daily");
    assert_eq!(state.status, BuildStatus::Failed);
    assert!(state.message.as_deref().unwrap_or_default().contains("simulated"));

    // failed -> building is allowed.
    let retry: Arc<dyn Connector> = Arc::new(MockConnector::default());
    planner
        .build("daily", &sales_metric(), &retry, false, None)
        .await
        .unwrap();
    assert_eq!(planner.state("daily").status, BuildStatus::Completed);
}

/// Connector whose DDL execution parks until released, to hold a spec in
/// the `building` state.
struct ParkedConnector {
    dialect: DuckDbDialect,
    release: Arc<Notify>,
}

#[async_trait]
impl Connector for ParkedConnector {
    fn dialect(&self) -> &(dyn Dialect + Send + Sync) {
        &self.dialect
    }

    async fn execute(&self, _sql: &str, _bindings: &[Value]) -> Result<QueryResult> {
        Ok(QueryResult::default())
    }

    async fn execute_statement(&self, _sql: &str) -> Result<usize> {
        self.release.notified().await;
        Ok(1)
    }

    async fn introspect_schema(&self, _table: &str) -> Result<TableSchema> {
        Ok(TableSchema::default())
    }
}

#[tokio::test]
async fn concurrent_build_request_fails_fast() {
    let planner = Arc::new(PreAggregationPlanner::new());
    planner
        .upsert_spec(spec("daily", &["date"], &["revenue"]))
        .unwrap();

    let release = Arc::new(Notify::new());
    let parked: Arc<dyn Connector> = Arc::new(ParkedConnector {
        dialect: DuckDbDialect,
        release: release.clone(),
    });

    let background = {
        let planner = planner.clone();
        let parked = parked.clone();
        tokio::spawn(async move {
            planner
                .build("daily", &sales_metric(), &parked, false, None)
                .await
        })
    };

    // Wait until the first build reaches `building`.
    while planner.state("daily").status != BuildStatus::Building {
        tokio::task::yield_now().await;
    }

    let second: Arc<dyn Connector> = Arc::new(MockConnector::default());
    let err = planner
        .build("daily", &sales_metric(), &second, false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, MetriqError::PreAggregation(_)));
    // The in-flight build is unaffected.
    assert_eq!(planner.state("daily").status, BuildStatus::Building);

    release.notify_one();
    background.await.unwrap().unwrap();
    assert_eq!(planner.state("daily").status, BuildStatus::Completed);
}

// ============================================================================
// Refresh policies and spec lifecycle
// ============================================================================

#[tokio::test]
async fn refresh_policy_evaluation() {
    let planner = PreAggregationPlanner::new();
    let connector: Arc<dyn Connector> = Arc::new(MockConnector::default());

    // Never built: always due.
    let fresh = spec("due", &["date"], &["revenue"]);
    planner.upsert_spec(fresh.clone()).unwrap();
    assert!(planner.should_refresh(&fresh, None));

    planner
        .build("due", &sales_metric(), &connector, false, None)
        .await
        .unwrap();

    // Every { 0 } is immediately due again; a long max-age is not.
    let mut every_now = fresh.clone();
    every_now.refresh = RefreshPolicy::Every { secs: 0 };
    assert!(planner.should_refresh(&every_now, None));

    let mut max_age = fresh.clone();
    max_age.refresh = RefreshPolicy::MaxAge { secs: 3600 };
    assert!(!planner.should_refresh(&max_age, None));
}

#[tokio::test]
async fn sql_refresh_policy_compares_watermarks() {
    let planner = PreAggregationPlanner::new();
    let connector: Arc<dyn Connector> = Arc::new(MockConnector::default());

    let mut wm_spec = spec("wm", &["date"], &["revenue"]);
    wm_spec.refresh = RefreshPolicy::Sql {
        check_sql: "SELECT max(sale_date) FROM sales".to_string(),
    };
    planner.upsert_spec(wm_spec.clone()).unwrap();

    planner
        .build(
            "wm",
            &sales_metric(),
            &connector,
            false,
            Some(json!("2024-06-01")),
        )
        .await
        .unwrap();

    assert!(!planner.should_refresh(&wm_spec, Some(&json!("2024-06-01"))));
    assert!(planner.should_refresh(&wm_spec, Some(&json!("2024-07-01"))));
    // No watermark observation: stay put.
    assert!(!planner.should_refresh(&wm_spec, None));
}

#[test]
fn partition_dimension_must_be_retained() {
    let planner = PreAggregationPlanner::new();
    let mut bad = spec("bad", &["date"], &["revenue"]);
    bad.partition = Some(metriq::preagg::PartitionSpec {
        dimension: "product".to_string(),
        granularity: metriq::metrics::TimeGrain::Day,
    });
    let err = planner.upsert_spec(bad).unwrap_err();
    assert!(matches!(err, MetriqError::PreAggregation(_)));
}

#[test]
fn remove_returns_spec_for_storage_drop() {
    let planner = PreAggregationPlanner::new();
    planner
        .upsert_spec(spec("gone", &["date"], &["revenue"]))
        .unwrap();
    let removed = planner.remove("gone").unwrap().unwrap();
    assert_eq!(
        planner.drop_statement(&removed, &DuckDbDialect),
        "DROP TABLE IF EXISTS \"preagg_gone\""
    );
    assert!(planner.get("gone").is_none());
    assert!(planner.remove("gone").unwrap().is_none());
}
