//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use metriq::cache::MemoryCache;
use metriq::config::MetriqConfig;
use metriq::connectors::{ColumnMeta, Connector, ConnectorManager, QueryResult, TableSchema};
use metriq::context::StaticContextProvider;
use metriq::dialect::{Dialect, DuckDbDialect};
use metriq::engine::ExecutionEngine;
use metriq::error::{MetriqError, Result};
use metriq::history::MemoryHistoryStore;
use metriq::metrics::{
    Aggregation, Dimension, Expr, Filter, FilterOp, FilterType, Function, Measure, MetricVariant,
    Parameter, ParamType, SemanticMetric, TimeGrain,
};
use metriq::preagg::PreAggregationPlanner;
use metriq::registry::MetricRegistry;

/// Connector double: returns canned rows, counts dispatches, records
/// statements.
pub struct MockConnector {
    dialect: DuckDbDialect,
    pub rows: Mutex<Vec<Map<String, Value>>>,
    pub executions: AtomicUsize,
    pub statements: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self {
            dialect: DuckDbDialect,
            rows: Mutex::new(Vec::new()),
            executions: AtomicUsize::new(0),
            statements: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }
}

impl MockConnector {
    pub fn with_rows(rows: Vec<Map<String, Value>>) -> Self {
        Self {
            rows: Mutex::new(rows),
            ..Self::default()
        }
    }

    pub fn execution_count(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn dialect(&self) -> &(dyn Dialect + Send + Sync) {
        &self.dialect
    }

    async fn execute(&self, sql: &str, _bindings: &[Value]) -> Result<QueryResult> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.statements.lock().unwrap().push(sql.to_string());
        if self.fail.load(Ordering::SeqCst) {
            return Err(MetriqError::Connector("simulated failure".to_string()));
        }
        let rows = self.rows.lock().unwrap().clone();
        let columns = rows
            .first()
            .map(|row| {
                row.keys()
                    .map(|name| ColumnMeta { name: name.clone() })
                    .collect()
            })
            .unwrap_or_default();
        Ok(QueryResult { columns, rows })
    }

    async fn execute_statement(&self, sql: &str) -> Result<usize> {
        self.statements.lock().unwrap().push(sql.to_string());
        if self.fail.load(Ordering::SeqCst) {
            return Err(MetriqError::Connector("simulated failure".to_string()));
        }
        Ok(42)
    }

    async fn introspect_schema(&self, _table: &str) -> Result<TableSchema> {
        Ok(TableSchema::default())
    }
}

pub fn measure(name: &str, agg: Aggregation, column: &str) -> Measure {
    Measure {
        name: name.to_string(),
        agg,
        expr: Some(Expr::Column {
            column: column.to_string(),
        }),
        table: None,
        conditional: None,
        format: None,
        description: None,
    }
}

pub fn dimension(name: &str, expr: Expr) -> Dimension {
    Dimension {
        name: name.to_string(),
        expr: Some(expr),
        table: None,
        combine: None,
        conditional: None,
        format: None,
        description: None,
    }
}

pub fn where_filter(name: &str, column: &str, op: FilterOp, value: Value) -> Filter {
    Filter {
        name: name.to_string(),
        expr: Expr::Column {
            column: column.to_string(),
        },
        op,
        value,
        filter_type: FilterType::Where,
        active: true,
        description: None,
    }
}

/// The canonical fixture: `sum(amount)` as `revenue`, monthly grain on
/// `sale_date`, US-only filter.
pub fn monthly_revenue_metric() -> SemanticMetric {
    SemanticMetric {
        name: "monthly_revenue".to_string(),
        alias: Some("s".to_string()),
        data_source: "warehouse".to_string(),
        table: Some("sales".to_string()),
        sql: None,
        grouped: true,
        ordered: false,
        order: Vec::new(),
        limit: None,
        measures: vec![measure("revenue", Aggregation::Sum, "amount")],
        dimensions: vec![dimension(
            "month",
            Expr::Func {
                func: Function::DateTrunc(TimeGrain::Month),
                args: vec![Expr::Column {
                    column: "sale_date".to_string(),
                }],
            },
        )],
        filters: vec![where_filter(
            "us_only",
            "country",
            FilterOp::Eq,
            json!("US"),
        )],
        joins: Vec::new(),
        parameters: Vec::new(),
        cache: None,
        description: None,
    }
}

/// Metric with a declared parameter referenced from a filter.
pub fn parameterized_metric() -> SemanticMetric {
    let mut metric = monthly_revenue_metric();
    metric.name = "revenue_by_country".to_string();
    metric.filters = vec![where_filter(
        "country_filter",
        "country",
        FilterOp::Eq,
        json!("{{ country }}"),
    )];
    metric.parameters = vec![Parameter {
        name: "country".to_string(),
        param_type: ParamType::String,
        required: true,
        default: None,
        description: None,
    }];
    metric
}

pub struct TestEngine {
    pub engine: ExecutionEngine,
    pub connector: Arc<MockConnector>,
    pub preaggs: Arc<PreAggregationPlanner>,
}

pub fn engine_with(
    metrics: Vec<SemanticMetric>,
    variants: Vec<MetricVariant>,
    rows: Vec<Map<String, Value>>,
) -> TestEngine {
    let registry = Arc::new(RwLock::new(MetricRegistry::from_parts(metrics, variants)));
    let connector = Arc::new(MockConnector::with_rows(rows));
    let mut connectors = ConnectorManager::new();
    connectors.insert("warehouse", connector.clone());

    let preaggs = Arc::new(PreAggregationPlanner::new());
    let mut context = StaticContextProvider::new();
    context.insert(
        "ctx-1",
        HashMap::from([("tenant_id".to_string(), json!("t-42"))]),
    );

    let mut config = MetriqConfig::default();
    config.defaults.query.default_row_limit = 0;

    let engine = ExecutionEngine::new(
        registry,
        connectors,
        Arc::new(MemoryCache::new(100)),
        preaggs.clone(),
        Arc::new(MemoryHistoryStore::default()),
        Arc::new(context),
        config,
    );
    TestEngine {
        engine,
        connector,
        preaggs,
    }
}

pub fn row(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
