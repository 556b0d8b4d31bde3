use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A plan reference that does not resolve against the semantic model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnknownField {
    pub field: String,
    /// Where in the plan the reference lives, e.g. `group_by[1]`.
    pub plan_location: String,
}

impl fmt::Display for UnknownField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' at {}", self.field, self.plan_location)
    }
}

/// Ranked candidate offered when a filter value cannot be resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub candidate: String,
    pub score: f64,
}

#[derive(Error, Debug)]
pub enum NqlError {
    #[error("Unknown field(s): {}", display_fields(.fields))]
    UnknownField { fields: Vec<UnknownField> },

    #[error("Unsupported plan shape: {0}")]
    UnsupportedPlanShape(String),

    #[error("Value '{token}' not found for dimension '{dimension}' ({} suggestion(s))", .suggestions.len())]
    ValueNotFound {
        dimension: String,
        token: String,
        suggestions: Vec<Suggestion>,
    },

    #[error("Invalid time range: {0}")]
    InvalidRange(String),

    #[error("Canonical store unavailable: {0}")]
    CanonicalStoreUnavailable(String),

    #[error("Invalid promotion: {0}")]
    InvalidPromotion(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for NqlError {
    fn from(err: rusqlite::Error) -> Self {
        NqlError::CanonicalStoreUnavailable(err.to_string())
    }
}

/// Stable tags used when errors are reported to telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValueNotFound,
    UnknownField,
    UnsupportedPlanShape,
    InvalidRange,
    StoreUnavailable,
    InvalidPromotion,
    Config,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValueNotFound => "value_not_found",
            ErrorKind::UnknownField => "unknown_field",
            ErrorKind::UnsupportedPlanShape => "unsupported_plan_shape",
            ErrorKind::InvalidRange => "invalid_range",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::InvalidPromotion => "invalid_promotion",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        }
    }
}

impl NqlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NqlError::UnknownField { .. } => ErrorKind::UnknownField,
            NqlError::UnsupportedPlanShape(_) => ErrorKind::UnsupportedPlanShape,
            NqlError::ValueNotFound { .. } => ErrorKind::ValueNotFound,
            NqlError::InvalidRange(_) => ErrorKind::InvalidRange,
            NqlError::CanonicalStoreUnavailable(_) => ErrorKind::StoreUnavailable,
            NqlError::InvalidPromotion(_) => ErrorKind::InvalidPromotion,
            NqlError::Config(_) => ErrorKind::Config,
            NqlError::Io(_) | NqlError::Json(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        NqlError::UnsupportedPlanShape(msg.into())
    }

    pub(crate) fn unavailable(msg: impl Into<String>) -> Self {
        NqlError::CanonicalStoreUnavailable(msg.into())
    }
}

fn display_fields(fields: &[UnknownField]) -> String {
    fields
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, NqlError>;
