//! DuckDB connector implementation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use duckdb::types::Value as DuckValue;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};

use crate::dialect::{Dialect, DuckDbDialect};
use crate::error::{MetriqError, Result};

use super::{ColumnMeta, ColumnSchema, Connector, QueryResult, TableSchema};

/// DuckDB connector with a bounded in-flight query limit and a small
/// connection pool.
#[derive(Clone)]
pub struct DuckDbConnector {
    database_path: PathBuf,
    dialect: DuckDbDialect,
    limiter: Arc<Semaphore>,
    pool: Arc<Mutex<Vec<duckdb::Connection>>>,
}

impl DuckDbConnector {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            database_path: path.as_ref().to_path_buf(),
            dialect: DuckDbDialect,
            limiter: Arc::new(Semaphore::new(16)),
            pool: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Configure maximum concurrent executions.
    pub fn with_max_concurrency(mut self, max_in_flight: usize) -> Self {
        self.limiter = Arc::new(Semaphore::new(max_in_flight.max(1)));
        self
    }

    async fn acquire_slot(&self) -> Result<SemaphorePermit<'_>> {
        self.limiter
            .acquire()
            .await
            .map_err(|e| MetriqError::Connector(format!("limiter closed: {e}")))
    }

    async fn checkout_connection(&self) -> Result<duckdb::Connection> {
        if let Some(conn) = self.pool.lock().await.pop() {
            return Ok(conn);
        }
        duckdb::Connection::open(self.database_path.clone())
            .map_err(|e| MetriqError::Connector(format!("open duckdb: {e}")))
    }

    async fn return_connection(&self, conn: duckdb::Connection) {
        self.pool.lock().await.push(conn);
    }
}

#[async_trait]
impl Connector for DuckDbConnector {
    fn dialect(&self) -> &(dyn Dialect + Send + Sync) {
        &self.dialect
    }

    async fn execute(&self, sql: &str, bindings: &[Value]) -> Result<QueryResult> {
        let sql = sql.to_string();
        let params: Vec<DuckValue> = bindings.iter().map(json_to_duck).collect();
        let _permit = self.acquire_slot().await?;
        let conn = self.checkout_connection().await?;

        let result =
            tokio::task::spawn_blocking(move || -> Result<(QueryResult, duckdb::Connection)> {
                let start = Instant::now();
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(|e| MetriqError::Connector(format!("prepare: {e}")))?;
                let mut rows_iter = stmt
                    .query(duckdb::params_from_iter(params))
                    .map_err(|e| MetriqError::Connector(format!("query: {e}")))?;
                let stmt_ref = rows_iter
                    .as_ref()
                    .ok_or_else(|| MetriqError::Connector("statement missing".to_string()))?;
                let mut column_names = Vec::new();
                for idx in 0..stmt_ref.column_count() {
                    let name = stmt_ref
                        .column_name(idx)
                        .map_err(|e| MetriqError::Connector(e.to_string()))?;
                    column_names.push(name.to_string());
                }
                let mut rows = Vec::new();
                while let Some(row) = rows_iter
                    .next()
                    .map_err(|e| MetriqError::Connector(format!("fetch: {e}")))?
                {
                    let mut map = Map::new();
                    for (idx, name) in column_names.iter().enumerate() {
                        let value = duck_value_to_json(
                            row.get_ref(idx)
                                .map_err(|e| MetriqError::Connector(e.to_string()))?
                                .to_owned(),
                        );
                        map.insert(name.clone(), value);
                    }
                    rows.push(map);
                }

                let columns: Vec<_> = column_names
                    .into_iter()
                    .map(|name| ColumnMeta { name })
                    .collect();
                let elapsed = start.elapsed();
                tracing::debug!(
                    rows = rows.len(),
                    columns = columns.len(),
                    ms = elapsed.as_millis(),
                    "duckdb execute"
                );
                drop(rows_iter);
                drop(stmt);
                Ok((QueryResult { columns, rows }, conn))
            })
            .await
            .map_err(|e| MetriqError::Connector(format!("task join error: {e}")))?;

        let (result, conn) = result?;
        self.return_connection(conn).await;
        Ok(result)
    }

    async fn execute_statement(&self, sql: &str) -> Result<usize> {
        let sql = sql.to_string();
        let _permit = self.acquire_slot().await?;
        let conn = self.checkout_connection().await?;
        let result = tokio::task::spawn_blocking(move || -> Result<(usize, duckdb::Connection)> {
            let affected = conn
                .execute(&sql, [])
                .map_err(|e| MetriqError::Connector(format!("execute: {e}")))?;
            Ok((affected, conn))
        })
        .await
        .map_err(|e| MetriqError::Connector(format!("task join error: {e}")))?;

        let (affected, conn) = result?;
        self.return_connection(conn).await;
        Ok(affected)
    }

    async fn introspect_schema(&self, table: &str) -> Result<TableSchema> {
        let table = table.to_string();
        let conn = self.checkout_connection().await?;
        let result =
            tokio::task::spawn_blocking(move || -> Result<(TableSchema, duckdb::Connection)> {
                let start = Instant::now();
                let pragma_sql = format!("PRAGMA table_info('{table}')");
                let mut stmt = conn
                    .prepare(&pragma_sql)
                    .map_err(|e| MetriqError::Connector(format!("prepare: {e}")))?;
                let mut rows = stmt
                    .query([])
                    .map_err(|e| MetriqError::Connector(format!("query: {e}")))?;
                let mut columns = Vec::new();
                let mut primary_keys = Vec::new();
                while let Some(row) = rows
                    .next()
                    .map_err(|e| MetriqError::Connector(format!("fetch: {e}")))?
                {
                    let name: String = row
                        .get("name")
                        .map_err(|e| MetriqError::Connector(e.to_string()))?;
                    let data_type: String = row
                        .get("type")
                        .map_err(|e| MetriqError::Connector(e.to_string()))?;
                    let not_null: bool = row
                        .get("notnull")
                        .map_err(|e| MetriqError::Connector(e.to_string()))?;
                    let pk_flag: bool = row
                        .get("pk")
                        .map_err(|e| MetriqError::Connector(e.to_string()))?;
                    if pk_flag {
                        primary_keys.push(name.clone());
                    }
                    columns.push(ColumnSchema {
                        name,
                        data_type,
                        nullable: !not_null,
                    });
                }
                let elapsed = start.elapsed();
                tracing::debug!(
                    table = table.as_str(),
                    ms = elapsed.as_millis(),
                    "duckdb introspect_schema"
                );
                drop(rows);
                drop(stmt);
                Ok((
                    TableSchema {
                        columns,
                        primary_keys,
                    },
                    conn,
                ))
            })
            .await
            .map_err(|e| MetriqError::Connector(format!("task join error: {e}")))?;

        let (schema, conn) = result?;
        self.return_connection(conn).await;
        Ok(schema)
    }
}

fn json_to_duck(value: &Value) -> DuckValue {
    match value {
        Value::Null => DuckValue::Null,
        Value::Bool(b) => DuckValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                DuckValue::BigInt(i)
            } else {
                DuckValue::Double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => DuckValue::Text(s.clone()),
        other => DuckValue::Text(other.to_string()),
    }
}

pub(crate) fn duck_value_to_json(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(i) => Value::from(i),
        DuckValue::SmallInt(i) => Value::from(i),
        DuckValue::Int(i) => Value::from(i),
        DuckValue::BigInt(i) => Value::from(i),
        DuckValue::HugeInt(i) => Value::String(i.to_string()),
        DuckValue::UTinyInt(i) => Value::from(i),
        DuckValue::USmallInt(i) => Value::from(i),
        DuckValue::UInt(i) => Value::from(i),
        DuckValue::UBigInt(i) => Value::from(i),
        DuckValue::Float(f) => Value::from(f),
        DuckValue::Double(f) => Value::from(f),
        DuckValue::Decimal(d) => Value::String(d.to_string()),
        DuckValue::Timestamp(unit, t) => Value::String(format!("{t} ({unit:?})")),
        DuckValue::Text(s) => Value::String(s),
        DuckValue::Blob(bytes) => Value::String(hex::encode(bytes)),
        DuckValue::Date32(d) => Value::from(d),
        DuckValue::Time64(unit, t) => Value::String(format!("{t} ({unit:?})")),
        DuckValue::Interval {
            months,
            days,
            nanos,
        } => Value::String(format!("{months} months {days} days {nanos} nanos")),
        DuckValue::List(items) => {
            let values = items.into_iter().map(duck_value_to_json).collect();
            Value::Array(values)
        }
        DuckValue::Enum(s) => Value::String(s),
        DuckValue::Struct(fields) => {
            let mut map = Map::new();
            for (key, val) in fields.iter() {
                map.insert(key.clone(), duck_value_to_json(val.clone()));
            }
            Value::Object(map)
        }
        DuckValue::Array(items) => {
            let values = items.into_iter().map(duck_value_to_json).collect();
            Value::Array(values)
        }
        DuckValue::Map(entries) => {
            let pairs: Vec<Value> = entries
                .iter()
                .map(|(k, v)| {
                    Value::Array(vec![
                        duck_value_to_json(k.clone()),
                        duck_value_to_json(v.clone()),
                    ])
                })
                .collect();
            Value::Array(pairs)
        }
        DuckValue::Union(inner) => duck_value_to_json(*inner),
        // `duckdb::types::Value` is #[non_exhaustive]; a wildcard is required.
        _ => Value::Null,
    }
}
