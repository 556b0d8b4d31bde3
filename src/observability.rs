//! Structured events for compilation, filter resolution and promotion.
//!
//! Each event is a small serializable record that is also emitted through
//! `tracing`, so the same facts reach log output and any caller that wants
//! to ship them elsewhere.

use crate::canonical::repository::UpsertOutcome;
use crate::error::NqlError;
use crate::nql::lineage::Lineage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct CompileEvent {
    pub at: DateTime<Utc>,
    pub shape: &'static str,
    pub version: &'static str,
    pub limit_requested: i64,
    pub limit_applied: i64,
    pub small_n_suppressed: bool,
    pub approximate: bool,
}

impl CompileEvent {
    pub fn from_lineage(lineage: &Lineage) -> Self {
        Self {
            at: Utc::now(),
            shape: lineage.shape.as_str(),
            version: lineage.version.as_str(),
            limit_requested: lineage.limit_requested,
            limit_applied: lineage.limit_applied,
            small_n_suppressed: lineage.small_n_suppressed,
            approximate: lineage.approximate,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolutionMissEvent {
    pub at: DateTime<Utc>,
    pub dimension: String,
    pub token: String,
    pub suggestions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromotionEvent {
    pub at: DateTime<Utc>,
    pub dimension: String,
    pub synonym: String,
    pub version: i64,
    pub updated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub at: DateTime<Utc>,
    pub stage: String,
    pub kind: &'static str,
    pub message: String,
}

pub fn record_compile(lineage: &Lineage) -> CompileEvent {
    let event = CompileEvent::from_lineage(lineage);
    info!(
        shape = event.shape,
        version = event.version,
        limit_requested = event.limit_requested,
        limit_applied = event.limit_applied,
        small_n_suppressed = event.small_n_suppressed,
        approximate = event.approximate,
        "nql.compile"
    );
    event
}

pub fn record_resolution_miss(dimension: &str, token: &str, suggestions: usize) -> ResolutionMissEvent {
    let event = ResolutionMissEvent {
        at: Utc::now(),
        dimension: dimension.to_string(),
        token: token.to_string(),
        suggestions,
    };
    info!(
        dimension = %event.dimension,
        token = %event.token,
        suggestions = event.suggestions,
        "nql.resolution_miss"
    );
    event
}

pub fn record_promotion(dimension: &str, synonym: &str, outcome: &UpsertOutcome) -> PromotionEvent {
    let event = PromotionEvent {
        at: Utc::now(),
        dimension: dimension.to_string(),
        synonym: synonym.to_string(),
        version: outcome.version(),
        updated: matches!(outcome, UpsertOutcome::Updated { .. }),
    };
    info!(
        dimension = %event.dimension,
        synonym = %event.synonym,
        version = event.version,
        updated = event.updated,
        "nql.promotion"
    );
    event
}

pub fn record_error(stage: &str, err: &NqlError) -> ErrorEvent {
    let event = ErrorEvent {
        at: Utc::now(),
        stage: stage.to_string(),
        kind: err.kind().as_str(),
        message: err.to_string(),
    };
    warn!(stage = %event.stage, kind = event.kind, error = %event.message, "nql.error");
    event
}
