pub mod cache;
pub mod compiler;
pub mod config;
pub mod connectors;
pub mod context;
pub mod dialect;
pub mod engine;
pub mod error;
pub mod history;
pub mod metrics;
pub mod preagg;
pub mod registry;
pub mod resolver;
pub mod sql_ast;
pub mod validation;

use std::path::Path;

use crate::error::Result;
use crate::registry::MetricRegistry;

/// Load metric definitions from disk and validate them with the provided
/// validator.
pub fn load_and_validate<P: AsRef<Path>>(
    model_dir: P,
    validator: &crate::validation::Validator,
) -> Result<MetricRegistry> {
    let registry = MetricRegistry::load_from_dir(model_dir)?;
    validator.validate_registry(&registry)?;
    Ok(registry)
}

pub use crate::cache::{MemoryCache, ResultCache, SqliteCache};
pub use crate::compiler::{CompileOptions, CompiledQuery, QueryScope};
pub use crate::config::MetriqConfig;
pub use crate::connectors::{Connector, ConnectorManager, QueryResult};
#[cfg(feature = "duckdb")]
pub use crate::connectors::DuckDbConnector;
pub use crate::engine::{ExecuteRequest, ExecutionEngine, ExecutionResult};
pub use crate::error::MetriqError;
pub use crate::metrics::{MetricVariant, SemanticMetric};
pub use crate::preagg::{PreAggregationPlanner, PreAggregationSpec};
pub use crate::validation::Validator;
