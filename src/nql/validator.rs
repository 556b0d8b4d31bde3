//! Plan Validator
//!
//! Two passes over a [`QueryPlan`]:
//!
//! 1. Semantic pass: every metric, dimension and ordering target must
//!    resolve against the semantic registry. All offenders are collected
//!    and reported together.
//! 2. Shape pass: the plan's fields must be consistent with each other
//!    (one v0.2 shape at a time, compare needs a single window, bucket
//!    parameters are well formed, ...).
//!
//! A [`ValidatedPlan`] can only be obtained by passing both. The compiler
//! accepts nothing else.

use crate::error::{NqlError, Result, UnknownField};
use crate::nql::model::*;
use crate::semantic::{Aggregation, SemanticRegistry};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// Grouping key after panel/trend normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKey {
    Dimension(String),
    /// Implicit time bucket added to trend plans.
    Period,
}

impl GroupKey {
    pub const PERIOD: &'static str = "period";

    pub fn name(&self) -> &str {
        match self {
            GroupKey::Dimension(name) => name,
            GroupKey::Period => Self::PERIOD,
        }
    }
}

/// Statement family the compiler emits for a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanShape {
    Aggregate,
    Compare,
    TopKWithinGroup,
    Bucket,
    AggregateV2,
}

impl PlanShape {
    pub fn of(plan: &QueryPlan) -> Self {
        if plan.compare.is_some() {
            PlanShape::Compare
        } else if plan.top_k_within_group.is_some() {
            PlanShape::TopKWithinGroup
        } else if plan.bucket.is_some() {
            PlanShape::Bucket
        } else if plan.aggregate_v2.is_some() {
            PlanShape::AggregateV2
        } else {
            PlanShape::Aggregate
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanShape::Aggregate => "aggregate",
            PlanShape::Compare => "compare",
            PlanShape::TopKWithinGroup => "top_k_within_group",
            PlanShape::Bucket => "bucket",
            PlanShape::AggregateV2 => "aggregate_v2",
        }
    }
}

/// Column names used by the compiler for shape-specific outputs.
pub mod columns {
    pub const CURRENT: &str = "current";
    pub const BASELINE: &str = "baseline";
    pub const BUCKET: &str = "bucket";
    pub const RANK: &str = "rank_in_group";

    pub fn median_of(name: &str) -> String {
        format!("median_{}", name)
    }

    pub fn distinct_of(name: &str) -> String {
        format!("distinct_{}", name)
    }
}

/// Outcome of the semantic pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub unknown_fields: Vec<UnknownField>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn into_result(self) -> Result<()> {
        if self.is_valid {
            Ok(())
        } else {
            Err(NqlError::UnknownField { fields: self.unknown_fields })
        }
    }
}

/// A plan that passed both validation passes. Immutable.
#[derive(Debug, Clone)]
pub struct ValidatedPlan {
    plan: QueryPlan,
    version: PlanVersion,
    shape: PlanShape,
    keys: Vec<GroupKey>,
    notes: BTreeSet<String>,
}

impl ValidatedPlan {
    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    pub fn version(&self) -> PlanVersion {
        self.version
    }

    pub fn shape(&self) -> PlanShape {
        self.shape
    }

    /// Grouping keys in output order (panel first, then trend period, then `group_by`).
    pub fn keys(&self) -> &[GroupKey] {
        &self.keys
    }

    /// Normalization notes recorded during validation.
    pub fn notes(&self) -> &BTreeSet<String> {
        &self.notes
    }

    pub fn output_columns(&self) -> Vec<String> {
        output_columns(&self.plan, self.shape, &self.keys)
    }
}

pub struct PlanValidator<'a> {
    registry: &'a dyn SemanticRegistry,
    v2_enabled: bool,
}

impl<'a> PlanValidator<'a> {
    pub fn new(registry: &'a dyn SemanticRegistry) -> Self {
        Self { registry, v2_enabled: true }
    }

    pub fn with_v2_enabled(mut self, enabled: bool) -> Self {
        self.v2_enabled = enabled;
        self
    }

    /// Run both passes and freeze the plan.
    pub fn validate(&self, plan: QueryPlan) -> Result<ValidatedPlan> {
        self.check_fields(&plan).into_result()?;

        let version = plan.effective_version();
        let shape = PlanShape::of(&plan);
        let mut notes = BTreeSet::new();
        self.check_version(&plan, version)?;
        self.check_metrics(&plan)?;
        self.check_filters(&plan, &mut notes)?;
        self.check_time(&plan, &mut notes)?;
        self.check_shape(&plan, shape)?;

        let keys = grouping_keys(&plan, self.registry, shape);
        if keys.contains(&GroupKey::Period) {
            notes.insert("trend_grouping".to_string());
        }

        debug!(shape = shape.as_str(), version = version.as_str(), "Plan validated");
        Ok(ValidatedPlan { plan, version, shape, keys, notes })
    }

    /// Semantic pass: resolve every referenced name, collecting all misses.
    pub fn check_fields(&self, plan: &QueryPlan) -> ValidationResult {
        let mut unknown = Vec::new();
        let mut warnings = Vec::new();
        let mut miss = |field: &str, location: String| {
            unknown.push(UnknownField { field: field.to_string(), plan_location: location });
        };

        if let Some(dataset) = &plan.dataset {
            if dataset != self.registry.dataset() {
                miss(dataset, "dataset".to_string());
            }
        }
        for (i, metric) in plan.metrics.iter().enumerate() {
            if self.registry.metric(&metric.name).is_none() {
                miss(&metric.name, format!("metrics[{}].name", i));
            }
        }
        for (i, name) in plan.group_by.iter().enumerate() {
            if self.registry.dimension(name).is_none() {
                miss(name, format!("group_by[{}]", i));
            }
        }
        for (i, filter) in plan.filters.iter().enumerate() {
            if self.registry.dimension(&filter.field).is_none() {
                miss(&filter.field, format!("filters[{}].field", i));
            }
        }
        if let Some(panel) = &plan.panel_by {
            if self.registry.dimension(panel).is_none() {
                miss(panel, "panel_by".to_string());
            }
        }
        if let Some(bucket) = &plan.bucket {
            if self.registry.dimension(&bucket.field).is_none() {
                miss(&bucket.field, "bucket.field".to_string());
            }
        }
        if let Some(agg) = &plan.aggregate_v2 {
            if let Some(name) = &agg.median_of {
                if self.registry.metric(name).is_none() && self.registry.dimension(name).is_none() {
                    miss(name, "aggregate_v2.median_of".to_string());
                }
            }
            if let Some(name) = &agg.distinct_of {
                if self.registry.dimension(name).is_none() {
                    miss(name, "aggregate_v2.distinct_of".to_string());
                }
            }
        }
        if let Some(top_k) = &plan.top_k_within_group {
            if !plan.metrics.iter().any(|m| m.output_name() == top_k.by) {
                miss(&top_k.by, "top_k_within_group.by".to_string());
            }
        }

        let shape = PlanShape::of(plan);
        let keys = grouping_keys(plan, self.registry, shape);
        let targets: HashSet<String> = output_columns(plan, shape, &keys).into_iter().collect();
        for (i, order) in plan.order_by.iter().enumerate() {
            if !targets.contains(&order.field) {
                miss(&order.field, format!("order_by[{}].field", i));
            }
        }

        if plan.intent == Intent::Trend && plan.time.is_none() {
            warnings.push("trend plan without a time window covers all history".to_string());
        }

        ValidationResult { is_valid: unknown.is_empty(), unknown_fields: unknown, warnings }
    }

    fn check_version(&self, plan: &QueryPlan, version: PlanVersion) -> Result<()> {
        let v2_fields = plan.v2_fields();
        if v2_fields.is_empty() {
            return Ok(());
        }
        if !self.v2_enabled {
            return Err(NqlError::shape(format!(
                "v0.2 plan features are disabled: {}",
                v2_fields.join(", ")
            )));
        }
        if version == PlanVersion::V1 {
            return Err(NqlError::shape(format!(
                "{} require nql_version 0.2",
                v2_fields.join(", ")
            )));
        }
        Ok(())
    }

    fn check_metrics(&self, plan: &QueryPlan) -> Result<()> {
        if plan.metrics.is_empty() {
            return Err(NqlError::shape("metrics must contain at least one entry"));
        }
        let mut seen = HashSet::new();
        for metric in &plan.metrics {
            if !seen.insert(metric.output_name()) {
                return Err(NqlError::shape(format!(
                    "metric output '{}' appears more than once",
                    metric.output_name()
                )));
            }
            let Some(definition) = self.registry.metric(&metric.name) else {
                continue;
            };
            let aggregation = metric.aggregation.unwrap_or(definition.aggregation);
            if definition.aggregate_sql(aggregation).is_none() {
                return Err(NqlError::shape(format!(
                    "metric '{}' has no source column for {}",
                    metric.name, aggregation
                )));
            }
        }
        Ok(())
    }

    fn check_filters(&self, plan: &QueryPlan, notes: &mut BTreeSet<String>) -> Result<()> {
        for (i, filter) in plan.filters.iter().enumerate() {
            let location = format!("filters[{}]", i);
            let value = &filter.value;
            match filter.operator {
                FilterOperator::Eq => {
                    if !is_scalar(value) {
                        return Err(NqlError::shape(format!("{}: eq needs a scalar value", location)));
                    }
                }
                FilterOperator::In => match value.as_array() {
                    Some(items) if !items.is_empty() && items.iter().all(is_scalar) => {}
                    _ => {
                        return Err(NqlError::shape(format!(
                            "{}: in needs a non-empty list of scalars",
                            location
                        )))
                    }
                },
                FilterOperator::Between => match value.as_array() {
                    Some(items) if items.len() == 2 && items.iter().all(is_scalar) => {}
                    _ => {
                        return Err(NqlError::shape(format!(
                            "{}: between needs exactly two scalar bounds",
                            location
                        )))
                    }
                },
                FilterOperator::LikeAny => {
                    let patterns = match value {
                        serde_json::Value::String(s) => vec![s.as_str()],
                        serde_json::Value::Array(items) => {
                            items.iter().filter_map(|v| v.as_str()).collect()
                        }
                        _ => Vec::new(),
                    };
                    let expected = value.as_array().map_or(1, Vec::len);
                    if patterns.is_empty() || patterns.len() != expected {
                        return Err(NqlError::shape(format!(
                            "{}: like_any needs one or more string patterns",
                            location
                        )));
                    }
                    notes.insert("like_passthrough".to_string());
                }
            }
            if contains_wildcard(value) {
                notes.insert("like_passthrough".to_string());
            }
        }
        Ok(())
    }

    fn check_time(&self, plan: &QueryPlan, notes: &mut BTreeSet<String>) -> Result<()> {
        let Some(time) = &plan.time else {
            return Ok(());
        };
        match &time.window {
            TimeWindow::Quarter(start) => {
                if !crate::time_range::is_quarter_start(*start) {
                    return Err(NqlError::InvalidRange(format!(
                        "quarter window must start on a quarter boundary, got {}",
                        start
                    )));
                }
                notes.insert("quarter_exclusive_end".to_string());
            }
            TimeWindow::Absolute { start, end } if start >= end => {
                return Err(NqlError::InvalidRange(format!(
                    "absolute window start {} must be before end {}",
                    start, end
                )));
            }
            TimeWindow::RelativeMonths(n) if *n < 1 => {
                return Err(NqlError::InvalidRange(format!("relative_months must be >= 1, got {}", n)));
            }
            TimeWindow::TrailingMonths(n) if *n < 0 => {
                return Err(NqlError::InvalidRange(format!("trailing_months must be >= 0, got {}", n)));
            }
            _ => {}
        }
        Ok(())
    }

    fn check_shape(&self, plan: &QueryPlan, shape: PlanShape) -> Result<()> {
        let shapes = [
            plan.compare.is_some(),
            plan.bucket.is_some(),
            plan.top_k_within_group.is_some(),
            plan.aggregate_v2.is_some(),
        ];
        if shapes.iter().filter(|set| **set).count() > 1 {
            return Err(NqlError::shape(
                "compare, bucket, top_k_within_group and aggregate_v2 are mutually exclusive",
            ));
        }

        match shape {
            PlanShape::Compare => self.check_compare(plan),
            PlanShape::TopKWithinGroup => self.check_top_k(plan),
            PlanShape::Bucket => self.check_bucket(plan),
            PlanShape::AggregateV2 => self.check_aggregate_v2(plan),
            PlanShape::Aggregate => Ok(()),
        }
    }

    fn check_compare(&self, plan: &QueryPlan) -> Result<()> {
        let Some(compare) = &plan.compare else {
            return Ok(());
        };
        match &plan.time {
            Some(time) if time.window.is_single_window() => {}
            _ => {
                return Err(NqlError::shape(
                    "compare requires a single_month or relative_months time window",
                ))
            }
        }
        if plan.metrics.len() != 1 {
            return Err(NqlError::shape("compare works on exactly one metric"));
        }
        match (compare.baseline, compare.start, compare.end) {
            (CompareBaseline::Absolute, Some(start), Some(end)) => {
                if start >= end {
                    return Err(NqlError::InvalidRange(format!(
                        "compare baseline start {} must be before end {}",
                        start, end
                    )));
                }
            }
            (CompareBaseline::Absolute, _, _) => {
                return Err(NqlError::shape("compare.baseline = absolute requires start and end"));
            }
            (_, None, None) => {}
            (_, _, _) => {
                return Err(NqlError::shape("compare.start/end only apply to an absolute baseline"));
            }
        }
        let keyed_on_time = plan
            .group_by
            .iter()
            .chain(plan.panel_by.iter())
            .any(|name| self.registry.dimension(name).is_some_and(|d| d.is_time()));
        if keyed_on_time {
            return Err(NqlError::shape("compare cannot group by a time dimension"));
        }
        Ok(())
    }

    fn check_top_k(&self, plan: &QueryPlan) -> Result<()> {
        let Some(top_k) = &plan.top_k_within_group else {
            return Ok(());
        };
        if top_k.k < 1 {
            return Err(NqlError::shape(format!("top_k_within_group.k must be >= 1, got {}", top_k.k)));
        }
        if plan.group_by.is_empty() && plan.panel_by.is_none() {
            return Err(NqlError::shape("top_k_within_group needs at least one grouping key"));
        }
        Ok(())
    }

    fn check_bucket(&self, plan: &QueryPlan) -> Result<()> {
        let Some(bucket) = &plan.bucket else {
            return Ok(());
        };
        match self.registry.dimension(&bucket.field) {
            Some(dim) if dim.is_numeric() => {}
            _ => {
                return Err(NqlError::shape(format!(
                    "bucket field '{}' must be a numeric dimension",
                    bucket.field
                )))
            }
        }
        if plan.group_by.contains(&bucket.field) || plan.panel_by.as_ref() == Some(&bucket.field) {
            return Err(NqlError::shape("bucket field cannot also be a grouping key"));
        }
        match bucket.method {
            BucketMethod::Quantile => {
                if !bucket.params.edges.is_empty() {
                    return Err(NqlError::shape("quantile buckets take params.q, not params.edges"));
                }
                let q = &bucket.params.q;
                if !q.is_empty()
                    && (q.len() < 2 || !q.iter().all(|v| (0.0..=1.0).contains(v)) || !strictly_ascending(q))
                {
                    return Err(NqlError::shape(
                        "params.q needs two or more ascending fractions within [0, 1]",
                    ));
                }
            }
            BucketMethod::Custom => {
                if !bucket.params.q.is_empty() {
                    return Err(NqlError::shape("custom buckets take params.edges, not params.q"));
                }
                let edges = &bucket.params.edges;
                if edges.len() < 2 || !edges.iter().all(|v| v.is_finite()) || !strictly_ascending(edges) {
                    return Err(NqlError::shape("params.edges needs two or more ascending finite values"));
                }
            }
        }
        for metric in &plan.metrics {
            let aggregation = effective_aggregation(self.registry, metric);
            if aggregation.is_some_and(|a| !a.is_decomposable()) {
                return Err(NqlError::shape(format!(
                    "metric '{}' cannot be merged by small-group suppression",
                    metric.output_name()
                )));
            }
        }
        Ok(())
    }

    fn check_aggregate_v2(&self, plan: &QueryPlan) -> Result<()> {
        let Some(agg) = &plan.aggregate_v2 else {
            return Ok(());
        };
        if agg.median_of.is_none() && agg.distinct_of.is_none() {
            return Err(NqlError::shape("aggregate_v2 needs median_of or distinct_of"));
        }
        if let Some(name) = &agg.median_of {
            let is_metric = self.registry.metric(name).is_some();
            if is_metric && agg.distinct_of.is_some() {
                return Err(NqlError::shape(
                    "median of a metric cannot be combined with distinct_of",
                ));
            }
            if !is_metric && !self.registry.dimension(name).is_some_and(|d| d.is_numeric()) {
                return Err(NqlError::shape(format!("median_of '{}' must be numeric", name)));
            }
        }
        Ok(())
    }
}

/// Shorthand for the semantic pass with default options.
pub fn validate(plan: &QueryPlan, registry: &dyn SemanticRegistry) -> ValidationResult {
    PlanValidator::new(registry).check_fields(plan)
}

fn grouping_keys(plan: &QueryPlan, registry: &dyn SemanticRegistry, shape: PlanShape) -> Vec<GroupKey> {
    let mut keys = Vec::new();
    if let Some(panel) = &plan.panel_by {
        keys.push(GroupKey::Dimension(panel.clone()));
    }
    let has_time_key = plan
        .group_by
        .iter()
        .chain(plan.panel_by.iter())
        .any(|name| registry.dimension(name).is_some_and(|d| d.is_time()));
    if plan.intent == Intent::Trend && shape == PlanShape::Aggregate && !has_time_key {
        keys.push(GroupKey::Period);
    }
    for name in &plan.group_by {
        if plan.panel_by.as_ref() != Some(name) && !keys.iter().any(|k| k.name() == name) {
            keys.push(GroupKey::Dimension(name.clone()));
        }
    }
    keys
}

/// Column names a plan of `shape` produces, in order.
pub(crate) fn output_columns(plan: &QueryPlan, shape: PlanShape, keys: &[GroupKey]) -> Vec<String> {
    let mut cols: Vec<String> = keys.iter().map(|k| k.name().to_string()).collect();
    let metric_names = plan.metrics.iter().map(|m| m.output_name().to_string());
    match shape {
        PlanShape::Aggregate => cols.extend(metric_names),
        PlanShape::Compare => {
            let method = plan.compare.as_ref().map(|c| c.method).unwrap_or_default();
            cols.push(columns::CURRENT.to_string());
            cols.push(columns::BASELINE.to_string());
            cols.push(method.as_str().to_string());
        }
        PlanShape::TopKWithinGroup => {
            cols.extend(metric_names);
            cols.push(columns::RANK.to_string());
        }
        PlanShape::Bucket => {
            cols.push(columns::BUCKET.to_string());
            cols.extend(metric_names);
        }
        PlanShape::AggregateV2 => {
            if let Some(agg) = &plan.aggregate_v2 {
                if let Some(name) = &agg.median_of {
                    cols.push(columns::median_of(name));
                }
                if let Some(name) = &agg.distinct_of {
                    cols.push(columns::distinct_of(name));
                }
            }
        }
    }
    cols
}

fn is_scalar(value: &serde_json::Value) -> bool {
    matches!(
        value,
        serde_json::Value::String(_) | serde_json::Value::Number(_) | serde_json::Value::Bool(_)
    )
}

fn contains_wildcard(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::String(s) => s.contains('%'),
        serde_json::Value::Array(items) => items.iter().any(contains_wildcard),
        _ => false,
    }
}

fn strictly_ascending(values: &[f64]) -> bool {
    values.windows(2).all(|pair| pair[0] < pair[1])
}

fn effective_aggregation(registry: &dyn SemanticRegistry, metric: &MetricSpec) -> Option<Aggregation> {
    metric.aggregation.or_else(|| registry.metric(&metric.name).map(|m| m.aggregation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::{load_from_json, SemanticModel};
    use std::sync::Arc;

    fn model() -> Arc<SemanticModel> {
        load_from_json(include_str!("../../demos/semantic.json")).unwrap()
    }

    fn check(json: &str) -> Result<ValidatedPlan> {
        let model = model();
        PlanValidator::new(model.as_ref()).validate(QueryPlan::from_json(json).unwrap())
    }

    #[test]
    fn every_unknown_field_is_reported_at_once() {
        let err = check(
            r#"{"metrics": [{"name": "crimes"}], "group_by": ["area", "aera"],
                "filters": [{"field": "wepon", "operator": "eq", "value": "x"}],
                "order_by": [{"field": "nope"}]}"#,
        )
        .unwrap_err();
        let fields = match err {
            NqlError::UnknownField { fields } => fields,
            other => panic!("expected UnknownField, got {:?}", other),
        };
        let locations: Vec<&str> = fields.iter().map(|f| f.plan_location.as_str()).collect();
        assert_eq!(
            locations,
            vec!["metrics[0].name", "group_by[1]", "filters[0].field", "order_by[0].field"]
        );
    }

    #[test]
    fn free_function_reports_without_failing() {
        let model = model();
        let plan = QueryPlan::from_json(r#"{"metrics": [{"name": "incidents"}], "panel_by": "zone"}"#).unwrap();
        let result = validate(&plan, model.as_ref());
        assert!(!result.is_valid);
        assert_eq!(result.unknown_fields[0].plan_location, "panel_by");
    }

    #[test]
    fn order_by_accepts_shape_output_columns() {
        let plan = check(
            r#"{"metrics": [{"name": "incidents"}],
                "time": {"window": {"single_month": "2023-12-01"}},
                "compare": {"baseline": "previous_period"},
                "order_by": [{"field": "diff_pct", "direction": "desc"}]}"#,
        )
        .unwrap();
        assert_eq!(plan.shape(), PlanShape::Compare);
        assert_eq!(plan.output_columns(), vec!["current", "baseline", "diff_pct"]);
    }

    #[test]
    fn absolute_baseline_without_bounds_is_rejected() {
        let err = check(
            r#"{"metrics": [{"name": "incidents"}],
                "time": {"window": {"single_month": "2023-12-01"}},
                "compare": {"baseline": "absolute", "method": "diff_abs"}}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnsupportedPlanShape);
    }

    #[test]
    fn compare_needs_a_single_window() {
        let err = check(
            r#"{"metrics": [{"name": "incidents"}], "time": {"window": "ytd"},
                "compare": {"baseline": "previous_period"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, NqlError::UnsupportedPlanShape(_)));
    }

    #[test]
    fn v2_fields_are_gated() {
        let model = model();
        let plan = QueryPlan::from_json(r#"{"metrics": [{"name": "incidents"}], "panel_by": "area"}"#).unwrap();
        let err = PlanValidator::new(model.as_ref())
            .with_v2_enabled(false)
            .validate(plan.clone())
            .unwrap_err();
        assert!(err.to_string().contains("panel_by"));

        let mut legacy = plan;
        legacy.version = Some(PlanVersion::V1);
        assert!(PlanValidator::new(model.as_ref()).validate(legacy).is_err());
    }

    #[test]
    fn shapes_are_mutually_exclusive() {
        let err = check(
            r#"{"metrics": [{"name": "incidents"}], "group_by": ["area"],
                "top_k_within_group": {"k": 2, "by": "incidents"},
                "aggregate_v2": {"distinct_of": "premise"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, NqlError::UnsupportedPlanShape(_)));
    }

    #[test]
    fn quarter_must_start_on_boundary() {
        let err = check(
            r#"{"metrics": [{"name": "incidents"}], "time": {"window": {"quarter": "2024-02-01"}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, NqlError::InvalidRange(_)));

        let plan = check(
            r#"{"metrics": [{"name": "incidents"}], "time": {"window": {"quarter": "2024-04-01"}}}"#,
        )
        .unwrap();
        assert!(plan.notes().contains("quarter_exclusive_end"));
    }

    #[test]
    fn bucket_rules() {
        let text_field = check(
            r#"{"metrics": [{"name": "incidents"}],
                "bucket": {"field": "area", "method": "quantile"}}"#,
        );
        assert!(text_field.is_err());

        let unsorted = check(
            r#"{"metrics": [{"name": "incidents"}],
                "bucket": {"field": "vict_age", "method": "custom", "params": {"edges": [30, 10]}}}"#,
        );
        assert!(unsorted.is_err());

        let distinct_metric = check(
            r#"{"metrics": [{"name": "premises"}],
                "bucket": {"field": "vict_age", "method": "custom", "params": {"edges": [0, 10]}}}"#,
        );
        assert!(distinct_metric.is_err());

        let ok = check(
            r#"{"metrics": [{"name": "incidents"}], "group_by": ["area"],
                "bucket": {"field": "vict_age", "method": "quantile", "params": {"q": [0, 0.5, 1]}}}"#,
        )
        .unwrap();
        assert_eq!(ok.output_columns(), vec!["area", "bucket", "incidents"]);
    }

    #[test]
    fn filter_value_shapes() {
        assert!(check(
            r#"{"metrics": [{"name": "incidents"}],
                "filters": [{"field": "vict_age", "operator": "between", "value": [1]}]}"#
        )
        .is_err());
        assert!(check(
            r#"{"metrics": [{"name": "incidents"}],
                "filters": [{"field": "area", "operator": "in", "value": []}]}"#
        )
        .is_err());
        let plan = check(
            r#"{"metrics": [{"name": "incidents"}],
                "filters": [{"field": "weapon", "operator": "like_any", "value": ["gun", "knife"]}]}"#,
        )
        .unwrap();
        assert!(plan.notes().contains("like_passthrough"));
    }

    #[test]
    fn trend_gets_an_implicit_period_key() {
        let plan = check(
            r#"{"intent": "trend", "metrics": [{"name": "incidents"}], "group_by": ["area"],
                "time": {"window": {"relative_months": 6}}}"#,
        )
        .unwrap();
        assert_eq!(plan.keys(), &[GroupKey::Period, GroupKey::Dimension("area".to_string())]);

        let explicit = check(
            r#"{"intent": "trend", "metrics": [{"name": "incidents"}], "group_by": ["month"],
                "time": {"window": {"relative_months": 6}}}"#,
        )
        .unwrap();
        assert_eq!(explicit.keys(), &[GroupKey::Dimension("month".to_string())]);
    }

    #[test]
    fn dataset_must_match_the_model() {
        let err = check(r#"{"dataset": "nyc_taxi", "metrics": [{"name": "incidents"}]}"#).unwrap_err();
        assert!(err.to_string().contains("'nyc_taxi' at dataset"));
    }
}
