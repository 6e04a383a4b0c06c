//! Configuration system for metriq.
//!
//! Supports TOML-based configuration with global defaults and
//! per-datasource overrides.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MetriqError, Result};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MetriqConfig {
    /// Global defaults applied to all datasources unless overridden.
    pub defaults: GlobalDefaults,

    /// Per-datasource configuration overrides (keyed by datasource name).
    #[serde(default)]
    pub datasources: HashMap<String, DatasourceConfig>,
}

/// Global default settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct GlobalDefaults {
    pub query: QueryConfig,
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    pub history: HistoryConfig,
}

/// Query execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Query timeout in milliseconds (default: 30000).
    pub timeout_ms: u64,
    /// Maximum rows to return (0 = unlimited).
    pub max_row_limit: u64,
    /// Default row limit when not specified in the metric or request.
    pub default_row_limit: u64,
}

/// Result cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether results are cached when the request does not say.
    pub enabled: bool,
    /// Which backend to construct.
    pub backend: CacheBackendKind,
    /// Default TTL in seconds when neither request nor metric sets one.
    pub ttl_secs: u64,
    /// Maximum entries for the memory backend.
    pub max_size: usize,
    /// Database file for the sqlite backend.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendKind {
    #[default]
    Memory,
    Sqlite,
}

/// Connection pooling configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum pool size (default: 16).
    pub size: usize,
    /// Idle connection timeout in seconds (default: 300).
    pub idle_timeout_secs: u64,
}

/// Query history configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Maximum records kept by the in-memory store.
    pub max_records: usize,
    /// Threshold for the slow-query view in milliseconds.
    pub slow_query_ms: u64,
}

/// Per-datasource configuration (can override globals).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DatasourceConfig {
    pub query: Option<QueryConfig>,
    pub pool: Option<PoolConfig>,

    /// DuckDB-specific options.
    pub duckdb: Option<DuckDbConfig>,

    /// PostgreSQL-specific options.
    pub postgres: Option<PostgresConfig>,
}

/// DuckDB-specific configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DuckDbConfig {
    /// Maximum concurrent queries (default: 16).
    pub max_concurrency: usize,
}

/// PostgreSQL-specific configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PostgresConfig {
    /// Connection pool size (overrides pool.size for Postgres).
    pub pool_size: usize,
    /// Statement timeout in milliseconds.
    pub statement_timeout_ms: u64,
}

// Default implementations

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_row_limit: 0, // 0 = unlimited
            default_row_limit: 1000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackendKind::Memory,
            ttl_secs: 300,
            max_size: 1000,
            path: None,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 16,
            idle_timeout_secs: 300,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_records: 10_000,
            slow_query_ms: 5_000,
        }
    }
}

impl Default for DuckDbConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
        }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            pool_size: 16,
            statement_timeout_ms: 30_000,
        }
    }
}

impl MetriqConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| MetriqError::Config(format!("failed to read config file: {e}")))?;
        toml::from_str(&contents)
            .map_err(|e| MetriqError::Config(format!("failed to parse config: {e}")))
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| MetriqError::Config(format!("failed to parse config: {e}")))
    }

    /// Load from default locations (env var, cwd, user config dir, or
    /// defaults).
    ///
    /// Search order:
    /// 1. `METRIQ_CONFIG` environment variable
    /// 2. `./metriq.toml` (current directory)
    /// 3. `~/.config/metriq/config.toml` (user config dir)
    /// 4. Built-in defaults
    pub fn load_default() -> Self {
        if let Ok(path) = std::env::var("METRIQ_CONFIG") {
            if let Ok(cfg) = Self::from_file(&path) {
                tracing::info!(path = %path, "loaded config from METRIQ_CONFIG");
                return cfg;
            }
        }

        if let Ok(cfg) = Self::from_file("metriq.toml") {
            tracing::info!("loaded config from ./metriq.toml");
            return cfg;
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("metriq").join("config.toml");
            if let Ok(cfg) = Self::from_file(&user_config) {
                tracing::info!(path = %user_config.display(), "loaded config from user config dir");
                return cfg;
            }
        }

        tracing::debug!("no config file found, using defaults");
        Self::default()
    }

    /// Get resolved config for a specific datasource (merges global
    /// defaults).
    pub fn for_datasource(&self, name: &str) -> ResolvedDatasourceConfig {
        let ds_config = self.datasources.get(name);
        ResolvedDatasourceConfig::merge(&self.defaults, ds_config)
    }
}

/// Fully resolved configuration for a datasource (no Option fields).
#[derive(Debug, Clone)]
pub struct ResolvedDatasourceConfig {
    pub query: QueryConfig,
    pub pool: PoolConfig,
    pub duckdb: DuckDbConfig,
    pub postgres: PostgresConfig,
}

impl ResolvedDatasourceConfig {
    fn merge(defaults: &GlobalDefaults, override_cfg: Option<&DatasourceConfig>) -> Self {
        match override_cfg {
            Some(ds) => Self {
                query: ds.query.clone().unwrap_or_else(|| defaults.query.clone()),
                pool: ds.pool.clone().unwrap_or_else(|| defaults.pool.clone()),
                duckdb: ds.duckdb.clone().unwrap_or_default(),
                postgres: ds.postgres.clone().unwrap_or_default(),
            },
            None => Self {
                query: defaults.query.clone(),
                pool: defaults.pool.clone(),
                duckdb: DuckDbConfig::default(),
                postgres: PostgresConfig::default(),
            },
        }
    }
}
