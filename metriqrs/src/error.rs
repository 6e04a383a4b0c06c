use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetriqError>;

#[derive(Debug, Error)]
pub enum MetriqError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("resolution error: {0}")]
    Resolution(String),
    #[error("compilation error: {0}")]
    Compilation(String),
    #[error("connector error: {0}")]
    Connector(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("pre-aggregation error: {0}")]
    PreAggregation(String),
    #[cfg(feature = "duckdb")]
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
