//! Consumer-context resolution.
//!
//! `ctx.`-prefixed parameters are substituted from a context map keyed by
//! an opaque context id, supplied by the host application rather than the
//! caller.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// Resolve a context id to its value map. An unknown id resolves to
    /// an empty map; individual missing keys surface later as
    /// compilation errors naming the parameter.
    async fn resolve(&self, context_id: &str) -> Result<HashMap<String, Value>>;
}

/// Fixed in-memory provider.
#[derive(Debug, Clone, Default)]
pub struct StaticContextProvider {
    contexts: HashMap<String, HashMap<String, Value>>,
}

impl StaticContextProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, context_id: impl Into<String>, values: HashMap<String, Value>) {
        self.contexts.insert(context_id.into(), values);
    }
}

#[async_trait]
impl ContextProvider for StaticContextProvider {
    async fn resolve(&self, context_id: &str) -> Result<HashMap<String, Value>> {
        Ok(self.contexts.get(context_id).cloned().unwrap_or_default())
    }
}
