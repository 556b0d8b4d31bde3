//! Semantic Model Loader
//!
//! Loads the semantic model from a JSON document:
//!
//! ```json
//! {
//!   "dataset": "la_crime",
//!   "table": "la_crime_raw",
//!   "time_column": "DATE OCC",
//!   "metrics": [{ "name": "incidents", "aggregation": "count" }],
//!   "dimensions": [{ "name": "area", "column": "AREA NAME", "data_type": "text" }]
//! }
//! ```

use crate::error::{NqlError, Result};
use crate::semantic::dimension::SemanticDimension;
use crate::semantic::metric::SemanticMetric;
use crate::semantic::registry::{SemanticModel, SemanticRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SemanticModelJson {
    pub dataset: String,
    pub table: String,
    pub time_column: String,
    pub metrics: Vec<SemanticMetric>,
    pub dimensions: Vec<SemanticDimension>,
}

pub fn load_from_json(json_str: &str) -> Result<Arc<SemanticModel>> {
    let model_json: SemanticModelJson = serde_json::from_str(json_str)
        .map_err(|e| NqlError::Config(format!("Failed to parse semantic model JSON: {}", e)))?;

    let mut seen = HashSet::new();
    let names = model_json
        .metrics
        .iter()
        .map(|m| &m.name)
        .chain(model_json.dimensions.iter().map(|d| &d.name));
    for name in names {
        if name.trim().is_empty() {
            return Err(NqlError::Config("semantic model contains an empty name".to_string()));
        }
        if !seen.insert(name.clone()) {
            return Err(NqlError::Config(format!(
                "'{}' is declared more than once in the semantic model",
                name
            )));
        }
    }

    let mut model = SemanticModel::new(model_json.dataset, model_json.table, model_json.time_column);
    for metric in model_json.metrics {
        model.register_metric(metric);
    }
    for dimension in model_json.dimensions {
        model.register_dimension(dimension);
    }

    info!(
        dataset = %model.dataset,
        metrics = model.list_metrics().len(),
        dimensions = model.list_dimensions().len(),
        "Loaded semantic model"
    );
    Ok(Arc::new(model))
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<Arc<SemanticModel>> {
    let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        NqlError::Config(format!(
            "Failed to read semantic model {}: {}",
            path.as_ref().display(),
            e
        ))
    })?;
    load_from_json(&content)
}
