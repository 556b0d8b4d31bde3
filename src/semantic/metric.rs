//! Semantic Metric Definition
//!
//! A metric is a named measure over the model's fact table: an optional
//! source column plus the aggregation applied when a plan does not pick one.

use crate::nql::sql::quote_ident;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    #[serde(alias = "count_distinct")]
    DistinctCount,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Count => "count",
            Aggregation::Sum => "sum",
            Aggregation::Avg => "avg",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
            Aggregation::DistinctCount => "distinct_count",
        }
    }

    /// Whether partial aggregates can be combined by re-aggregating them.
    pub fn is_decomposable(&self) -> bool {
        !matches!(self, Aggregation::DistinctCount)
    }

    /// Every aggregation except `count` needs a source column.
    pub fn needs_column(&self) -> bool {
        !matches!(self, Aggregation::Count)
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticMetric {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Source column; `None` for row-count metrics.
    #[serde(default)]
    pub column: Option<String>,
    pub aggregation: Aggregation,
}

impl SemanticMetric {
    pub fn new(name: impl Into<String>, column: Option<&str>, aggregation: Aggregation) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            column: column.map(str::to_string),
            aggregation,
        }
    }

    pub fn column_sql(&self) -> Option<String> {
        self.column.as_deref().map(quote_ident)
    }

    /// SQL aggregate expression for this metric under `aggregation`.
    ///
    /// Returns `None` when the aggregation needs a column the metric lacks.
    pub fn aggregate_sql(&self, aggregation: Aggregation) -> Option<String> {
        let column = self.column_sql();
        let expr = match (aggregation, column) {
            (Aggregation::Count, None) => "COUNT(*)".to_string(),
            (Aggregation::Count, Some(col)) => format!("COUNT({})", col),
            (Aggregation::Sum, Some(col)) => format!("SUM({})", col),
            (Aggregation::Avg, Some(col)) => format!("AVG({})", col),
            (Aggregation::Min, Some(col)) => format!("MIN({})", col),
            (Aggregation::Max, Some(col)) => format!("MAX({})", col),
            (Aggregation::DistinctCount, Some(col)) => format!("COUNT(DISTINCT {})", col),
            (_, None) => return None,
        };
        Some(expr)
    }
}
