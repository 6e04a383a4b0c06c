//! Database connector implementations.
//!
//! Connectors are the only blocking I/O in the execute path. Each backend
//! is implemented in its own file and gated behind a feature flag; the
//! manager is an explicitly constructed, injected dependency.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::dialect::Dialect;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TableSchema {
    pub columns: Vec<ColumnSchema>,
    pub primary_keys: Vec<String>,
}

/// Unified interface over database engines.
#[async_trait]
pub trait Connector: Send + Sync {
    fn dialect(&self) -> &(dyn Dialect + Send + Sync);

    /// Execute a parameterized query.
    async fn execute(&self, sql: &str, bindings: &[Value]) -> Result<QueryResult>;

    /// Execute a statement without a result set (rollup DDL/DML),
    /// returning the affected row count where the engine reports one.
    async fn execute_statement(&self, sql: &str) -> Result<usize>;

    async fn introspect_schema(&self, table: &str) -> Result<TableSchema>;
}

/// Minimal connector manager keyed by data source name.
#[derive(Clone, Default)]
pub struct ConnectorManager {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorManager {
    pub fn new() -> Self {
        Self {
            connectors: HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, connector: Arc<dyn Connector>) {
        self.connectors.insert(name.into(), connector);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Connector>> {
        self.connectors.get(name)
    }
}

// Feature-gated connector implementations
#[cfg(feature = "duckdb")]
mod duckdb;
#[cfg(feature = "duckdb")]
pub use duckdb::DuckDbConnector;

#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "postgres")]
pub use postgres::PostgresConnector;
