//! Semantic Registry
//!
//! Process-wide, read-only view of which metrics and dimensions exist.
//! Built once by the loader and shared behind an `Arc`; nothing mutates
//! it afterwards.

use crate::semantic::dimension::SemanticDimension;
use crate::semantic::metric::SemanticMetric;
use std::collections::BTreeMap;

/// Name resolution used by the plan validator.
pub trait SemanticRegistry: Send + Sync {
    fn dataset(&self) -> &str;
    fn metric(&self, name: &str) -> Option<&SemanticMetric>;
    fn dimension(&self, name: &str) -> Option<&SemanticDimension>;
    fn list_metrics(&self) -> Vec<String>;
    fn list_dimensions(&self) -> Vec<String>;
}

/// The semantic model for one dataset backed by a single fact table.
#[derive(Debug, Clone)]
pub struct SemanticModel {
    pub dataset: String,
    pub table: String,
    /// Timestamp column every time window is applied to.
    pub time_column: String,
    metrics: BTreeMap<String, SemanticMetric>,
    dimensions: BTreeMap<String, SemanticDimension>,
}

impl SemanticModel {
    pub fn new(
        dataset: impl Into<String>,
        table: impl Into<String>,
        time_column: impl Into<String>,
    ) -> Self {
        Self {
            dataset: dataset.into(),
            table: table.into(),
            time_column: time_column.into(),
            metrics: BTreeMap::new(),
            dimensions: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, metric: SemanticMetric) -> Self {
        self.register_metric(metric);
        self
    }

    pub fn with_dimension(mut self, dimension: SemanticDimension) -> Self {
        self.register_dimension(dimension);
        self
    }

    pub fn register_metric(&mut self, metric: SemanticMetric) {
        self.metrics.insert(metric.name.clone(), metric);
    }

    pub fn register_dimension(&mut self, dimension: SemanticDimension) {
        self.dimensions.insert(dimension.name.clone(), dimension);
    }

    pub fn metrics(&self) -> impl Iterator<Item = &SemanticMetric> {
        self.metrics.values()
    }

    pub fn dimensions(&self) -> impl Iterator<Item = &SemanticDimension> {
        self.dimensions.values()
    }
}

impl SemanticRegistry for SemanticModel {
    fn dataset(&self) -> &str {
        &self.dataset
    }

    fn metric(&self, name: &str) -> Option<&SemanticMetric> {
        self.metrics.get(name)
    }

    fn dimension(&self, name: &str) -> Option<&SemanticDimension> {
        self.dimensions.get(name)
    }

    fn list_metrics(&self) -> Vec<String> {
        self.metrics.keys().cloned().collect()
    }

    fn list_dimensions(&self) -> Vec<String> {
        self.dimensions.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::{Aggregation, DimensionType};

    #[test]
    fn lookups_are_exact() {
        let model = SemanticModel::new("crime", "crime_raw", "DATE OCC")
            .with_metric(SemanticMetric::new("incidents", None, Aggregation::Count))
            .with_dimension(SemanticDimension::new("area", "AREA NAME", DimensionType::Text));
        assert!(model.metric("incidents").is_some());
        assert!(model.metric("Incidents").is_none());
        assert!(model.dimension("area").is_some());
        assert_eq!(model.list_dimensions(), vec!["area".to_string()]);
    }
}
