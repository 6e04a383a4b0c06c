use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use glob::glob;

use crate::error::{MetriqError, Result};
use crate::metrics::{MetricVariant, SemanticMetric};

/// In-memory metadata repository: metric and variant definitions keyed
/// by name. Definitions load from YAML on disk or arrive through the
/// upsert API.
#[derive(Debug, Default, Clone)]
pub struct MetricRegistry {
    pub metrics: HashMap<String, SemanticMetric>,
    pub variants: HashMap<String, MetricVariant>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(metrics: Vec<SemanticMetric>, variants: Vec<MetricVariant>) -> Self {
        let mut registry = MetricRegistry::new();
        for metric in metrics {
            registry.metrics.insert(metric.name.clone(), metric);
        }
        for variant in variants {
            registry.variants.insert(variant.name.clone(), variant);
        }
        registry
    }

    /// Load definitions from `<root>/metrics/*.y[a]ml` and
    /// `<root>/variants/*.y[a]ml`. The metrics directory is required;
    /// variants are optional.
    pub fn load_from_dir<P: AsRef<Path>>(root: P) -> Result<Self> {
        let mut registry = MetricRegistry::new();
        registry.load_metrics(root.as_ref().join("metrics"))?;
        registry.load_variants(root.as_ref().join("variants"))?;
        Ok(registry)
    }

    fn load_metrics(&mut self, dir: PathBuf) -> Result<()> {
        if !dir.exists() {
            return Err(MetriqError::Validation(format!(
                "metrics directory not found: {}",
                dir.display()
            )));
        }
        for entry in yaml_files(&dir)? {
            let contents = fs::read_to_string(&entry)?;
            let metric: SemanticMetric = serde_yaml::from_str(&contents)?;
            self.metrics.insert(metric.name.clone(), metric);
        }
        Ok(())
    }

    fn load_variants(&mut self, dir: PathBuf) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }
        for entry in yaml_files(&dir)? {
            let contents = fs::read_to_string(&entry)?;
            let variant: MetricVariant = serde_yaml::from_str(&contents)?;
            self.variants.insert(variant.name.clone(), variant);
        }
        Ok(())
    }

    pub fn get_metric(&self, name: &str) -> Option<&SemanticMetric> {
        self.metrics.get(name)
    }

    pub fn get_variant(&self, name: &str) -> Option<&MetricVariant> {
        self.variants.get(name)
    }

    pub fn upsert_metric(&mut self, metric: SemanticMetric) {
        self.metrics.insert(metric.name.clone(), metric);
    }

    pub fn upsert_variant(&mut self, variant: MetricVariant) {
        self.variants.insert(variant.name.clone(), variant);
    }

    pub fn remove_metric(&mut self, name: &str) -> Option<SemanticMetric> {
        self.metrics.remove(name)
    }

    pub fn remove_variant(&mut self, name: &str) -> Option<MetricVariant> {
        self.variants.remove(name)
    }
}

fn yaml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for pattern in ["yml", "yaml"] {
        for entry in glob(&format!("{}/*.{pattern}", dir.display()))
            .map_err(|e| MetriqError::Other(e.into()))?
            .flatten()
        {
            files.push(entry);
        }
    }
    files.sort();
    Ok(files)
}
