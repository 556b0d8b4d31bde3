//! Semantic Dimension Definition

use crate::nql::sql::quote_ident;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionType {
    #[serde(alias = "string", alias = "enum", alias = "category")]
    Text,
    #[serde(alias = "integer", alias = "decimal")]
    Number,
    #[serde(alias = "time", alias = "timestamp")]
    Date,
}

impl DimensionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DimensionType::Text => "text",
            DimensionType::Number => "number",
            DimensionType::Date => "date",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticDimension {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub column: String,
    #[serde(default = "default_data_type")]
    pub data_type: DimensionType,
    /// Expression used instead of the bare column, e.g. a CASE mapping.
    #[serde(default)]
    pub sql_expression: Option<String>,
}

fn default_data_type() -> DimensionType {
    DimensionType::Text
}

impl SemanticDimension {
    pub fn new(name: impl Into<String>, column: impl Into<String>, data_type: DimensionType) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            column: column.into(),
            data_type,
            sql_expression: None,
        }
    }

    /// Row-level SQL for this dimension.
    pub fn expression(&self) -> String {
        match &self.sql_expression {
            Some(expr) => format!("({})", expr),
            None => quote_ident(&self.column),
        }
    }

    pub fn is_time(&self) -> bool {
        self.data_type == DimensionType::Date
    }

    pub fn is_numeric(&self) -> bool {
        self.data_type == DimensionType::Number
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_expression_overrides_column() {
        let mut dim = SemanticDimension::new("area", "AREA NAME", DimensionType::Text);
        assert_eq!(dim.expression(), "\"AREA NAME\"");
        dim.sql_expression = Some("UPPER(\"AREA NAME\")".to_string());
        assert_eq!(dim.expression(), "(UPPER(\"AREA NAME\"))");
    }

    #[test]
    fn legacy_type_names_are_accepted() {
        let ty: DimensionType = serde_json::from_str("\"integer\"").unwrap();
        assert_eq!(ty, DimensionType::Number);
        let ty: DimensionType = serde_json::from_str("\"string\"").unwrap();
        assert_eq!(ty, DimensionType::Text);
    }
}
