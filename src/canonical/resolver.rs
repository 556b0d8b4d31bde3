//! Filter resolution
//!
//! Turns the filter values of a validated plan into bind-ready values.
//! Text dimensions under `eq`/`in` go through the canonical store; every
//! other value passes through as a literal. The first value that cannot be
//! resolved fails the whole plan with `ValueNotFound`.

use crate::canonical::store::{CanonicalStore, ResolvedFilter, WILDCARD};
use crate::error::{NqlError, Result};
use crate::nql::model::{FilterOperator, FilterSpec};
use crate::nql::sql::BindValue;
use crate::nql::validator::ValidatedPlan;
use crate::semantic::{DimensionType, SemanticModel, SemanticRegistry};
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;

/// One value of a plan filter after resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolvedValue {
    /// Went through the canonical store.
    Text(ResolvedFilter),
    Literal { value: BindValue },
}

impl ResolvedValue {
    pub fn literal(value: BindValue) -> Self {
        ResolvedValue::Literal { value }
    }

    pub fn bind(&self) -> BindValue {
        match self {
            ResolvedValue::Text(resolved) => BindValue::Text(resolved.value.clone()),
            ResolvedValue::Literal { value } => value.clone(),
        }
    }

    /// True when the value must be matched with LIKE.
    pub fn is_pattern(&self) -> bool {
        match self {
            ResolvedValue::Text(resolved) => resolved.like_bypass,
            ResolvedValue::Literal { value: BindValue::Text(s) } => s.contains(WILDCARD),
            ResolvedValue::Literal { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedPlanFilter {
    pub field: String,
    pub operator: FilterOperator,
    pub values: Vec<ResolvedValue>,
}

impl ResolvedPlanFilter {
    /// Values that were rewritten by a promoted mapping.
    pub fn canonicalized(&self) -> impl Iterator<Item = &ResolvedFilter> {
        self.values.iter().filter_map(|v| match v {
            ResolvedValue::Text(resolved) if resolved.canonicalization_applied => Some(resolved),
            _ => None,
        })
    }
}

/// Resolved filters, index-aligned with `plan.filters`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolvedFilters {
    filters: Vec<ResolvedPlanFilter>,
}

impl ResolvedFilters {
    pub fn new(filters: Vec<ResolvedPlanFilter>) -> Self {
        Self { filters }
    }

    /// Every value as a literal, without consulting a store.
    pub fn passthrough(plan: &ValidatedPlan, model: &SemanticModel) -> Self {
        let filters = plan
            .plan()
            .filters
            .iter()
            .map(|filter| {
                let data_type = dimension_type(model, &filter.field);
                ResolvedPlanFilter {
                    field: filter.field.clone(),
                    operator: filter.operator,
                    values: raw_values(filter)
                        .iter()
                        .filter_map(|v| literal(v, data_type))
                        .collect(),
                }
            })
            .collect();
        Self { filters }
    }

    pub fn get(&self, index: usize) -> Option<&ResolvedPlanFilter> {
        self.filters.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedPlanFilter> {
        self.filters.iter()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

pub struct FilterResolver {
    store: CanonicalStore,
    model: Arc<SemanticModel>,
}

impl FilterResolver {
    pub fn new(store: CanonicalStore, model: Arc<SemanticModel>) -> Self {
        Self { store, model }
    }

    /// Resolve every filter value, blocking on the store without a time bound.
    ///
    /// Meant for offline tools and tests; request handling uses
    /// [`resolve_with_timeout`](Self::resolve_with_timeout).
    pub fn resolve(&self, plan: &ValidatedPlan) -> Result<ResolvedFilters> {
        let mut filters = Vec::with_capacity(plan.plan().filters.len());
        for filter in &plan.plan().filters {
            let data_type = dimension_type(&self.model, &filter.field);
            let mut values = Vec::new();
            for raw in raw_values(filter) {
                match canonical_token(filter, data_type, raw) {
                    Some(token) => {
                        values.push(ResolvedValue::Text(require(self.store.lookup(&filter.field, token)?)?))
                    }
                    None => values.extend(literal(raw, data_type)),
                }
            }
            filters.push(ResolvedPlanFilter { field: filter.field.clone(), operator: filter.operator, values });
        }
        Ok(ResolvedFilters { filters })
    }

    /// Same as [`resolve`](Self::resolve) with every store access bounded by the store timeout.
    pub async fn resolve_with_timeout(&self, plan: &ValidatedPlan) -> Result<ResolvedFilters> {
        let mut filters = Vec::with_capacity(plan.plan().filters.len());
        for filter in &plan.plan().filters {
            let data_type = dimension_type(&self.model, &filter.field);
            let mut values = Vec::new();
            for raw in raw_values(filter) {
                match canonical_token(filter, data_type, raw) {
                    Some(token) => {
                        let resolved = self.store.lookup_with_timeout(&filter.field, token).await?;
                        values.push(ResolvedValue::Text(require(resolved)?));
                    }
                    None => values.extend(literal(raw, data_type)),
                }
            }
            filters.push(ResolvedPlanFilter { field: filter.field.clone(), operator: filter.operator, values });
        }
        Ok(ResolvedFilters { filters })
    }
}

fn require(resolved: ResolvedFilter) -> Result<ResolvedFilter> {
    if resolved.is_resolved() {
        return Ok(resolved);
    }
    Err(NqlError::ValueNotFound {
        dimension: resolved.dimension,
        token: resolved.original,
        suggestions: resolved.suggestions,
    })
}

fn dimension_type(model: &SemanticModel, field: &str) -> DimensionType {
    model.dimension(field).map(|d| d.data_type).unwrap_or(DimensionType::Text)
}

fn raw_values(filter: &FilterSpec) -> Vec<&serde_json::Value> {
    match &filter.value {
        serde_json::Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

/// The string to canonicalize, if this value goes through the store.
fn canonical_token<'a>(
    filter: &FilterSpec,
    data_type: DimensionType,
    raw: &'a serde_json::Value,
) -> Option<&'a str> {
    let canonicalizes = matches!(filter.operator, FilterOperator::Eq | FilterOperator::In)
        && data_type == DimensionType::Text;
    if canonicalizes {
        raw.as_str()
    } else {
        None
    }
}

fn literal(raw: &serde_json::Value, data_type: DimensionType) -> Option<ResolvedValue> {
    if data_type == DimensionType::Date {
        if let Some(date) = raw.as_str().and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()) {
            return Some(ResolvedValue::literal(BindValue::Date(date)));
        }
    }
    BindValue::from_json(raw).map(ResolvedValue::literal)
}
