//! End-to-end demo against an in-memory DuckDB database: seed a table,
//! execute a metric twice, and show the second hit coming from the cache.

#[cfg(feature = "duckdb")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use std::collections::HashMap;
    use std::sync::{Arc, RwLock};

    use metriq::cache::MemoryCache;
    use metriq::config::MetriqConfig;
    use metriq::connectors::{Connector, ConnectorManager};
    use metriq::context::StaticContextProvider;
    use metriq::engine::{ExecuteRequest, ExecutionEngine};
    use metriq::history::MemoryHistoryStore;
    use metriq::metrics::{
        Aggregation, Dimension, Expr, Filter, FilterOp, FilterType, Measure, SemanticMetric,
    };
    use metriq::preagg::PreAggregationPlanner;
    use metriq::registry::MetricRegistry;
    use metriq::DuckDbConnector;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let connector = Arc::new(DuckDbConnector::new(":memory:"));
    connector
        .execute_statement(
            "CREATE TABLE sales AS SELECT * FROM (VALUES \
             ('2024-01-05'::DATE, 'US', 120.0), \
             ('2024-01-19'::DATE, 'US', 80.0), \
             ('2024-02-02'::DATE, 'DE', 45.0), \
             ('2024-02-11'::DATE, 'US', 200.0)) AS t(sale_date, country, amount)",
        )
        .await?;

    let metric = SemanticMetric {
        name: "monthly_revenue".to_string(),
        alias: Some("s".to_string()),
        data_source: "local".to_string(),
        table: Some("sales".to_string()),
        sql: None,
        grouped: true,
        ordered: false,
        order: Vec::new(),
        limit: Some(12),
        measures: vec![Measure {
            name: "revenue".to_string(),
            agg: Aggregation::Sum,
            expr: Some(Expr::Column {
                column: "amount".to_string(),
            }),
            table: None,
            conditional: None,
            format: None,
            description: None,
        }],
        dimensions: vec![Dimension {
            name: "month".to_string(),
            expr: Some(Expr::Func {
                func: metriq::metrics::Function::DateTrunc(metriq::metrics::TimeGrain::Month),
                args: vec![Expr::Column {
                    column: "sale_date".to_string(),
                }],
            }),
            table: None,
            combine: None,
            conditional: None,
            format: None,
            description: None,
        }],
        filters: vec![Filter {
            name: "us_only".to_string(),
            expr: Expr::Column {
                column: "country".to_string(),
            },
            op: FilterOp::Eq,
            value: serde_json::json!("US"),
            filter_type: FilterType::Where,
            active: true,
            description: None,
        }],
        joins: Vec::new(),
        parameters: Vec::new(),
        cache: None,
        description: None,
    };

    let registry = Arc::new(RwLock::new(MetricRegistry::from_parts(vec![metric], vec![])));
    let mut connectors = ConnectorManager::new();
    connectors.insert("local", connector);

    let engine = ExecutionEngine::new(
        registry,
        connectors,
        Arc::new(MemoryCache::default()),
        Arc::new(PreAggregationPlanner::new()),
        Arc::new(MemoryHistoryStore::default()),
        Arc::new(StaticContextProvider::new()),
        MetriqConfig::default(),
    );

    for round in 1..=2 {
        let result = engine
            .execute(ExecuteRequest {
                params: HashMap::new(),
                ..ExecuteRequest::named("monthly_revenue")
            })
            .await;
        println!(
            "round {round}: success={} cached={} rows={}",
            result.success,
            result.metadata.cached,
            result.data.len()
        );
        for row in &result.data {
            println!("  {}", serde_json::to_string(row)?);
        }
    }

    Ok(())
}

#[cfg(not(feature = "duckdb"))]
fn main() {
    eprintln!("run_query requires the duckdb feature");
}
