//! Query Plan types
//!
//! The plan is the only input the compiler accepts. It is deserialized
//! from JSON, checked by the validator, and never mutated afterwards.

use crate::semantic::Aggregation;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlanVersion {
    #[serde(rename = "0.1")]
    V1,
    #[serde(rename = "0.2")]
    V2,
}

impl PlanVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanVersion::V1 => "0.1",
            PlanVersion::V2 => "0.2",
        }
    }

    /// Inclusive `[min, max]` range `limit` is clamped to.
    pub fn limit_bounds(&self) -> (i64, i64) {
        match self {
            PlanVersion::V1 => (1, 2000),
            PlanVersion::V2 => (5, 100),
        }
    }
}

impl fmt::Display for PlanVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    #[default]
    Aggregate,
    Detail,
    Trend,
    Compare,
    Rank,
    Distribution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricSpec {
    pub name: String,
    /// Overrides the metric's default aggregation.
    #[serde(default, alias = "agg", skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<Aggregation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl MetricSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), aggregation: None, alias: None }
    }

    /// Column name this metric appears under in the result.
    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    #[serde(alias = "=")]
    Eq,
    In,
    Between,
    LikeAny,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "eq",
            FilterOperator::In => "in",
            FilterOperator::Between => "between",
            FilterOperator::LikeAny => "like_any",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterSpec {
    pub field: String,
    #[serde(alias = "op")]
    pub operator: FilterOperator,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGrain {
    Day,
    Week,
    #[default]
    Month,
    Quarter,
    Year,
}

impl TimeGrain {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeGrain::Day => "day",
            TimeGrain::Week => "week",
            TimeGrain::Month => "month",
            TimeGrain::Quarter => "quarter",
            TimeGrain::Year => "year",
        }
    }
}

/// Time window, externally tagged on the wire:
/// `{"single_month": "2023-12-01"}`, `{"relative_months": 6}`, `"ytd"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindow {
    SingleMonth(NaiveDate),
    /// First day of a calendar quarter.
    Quarter(NaiveDate),
    Absolute { start: NaiveDate, end: NaiveDate },
    /// The `n` complete months before today's month.
    RelativeMonths(i64),
    /// `n` months back through the current month.
    TrailingMonths(i64),
    Ytd,
    LastYear,
}

impl TimeWindow {
    pub fn kind(&self) -> &'static str {
        match self {
            TimeWindow::SingleMonth(_) => "single_month",
            TimeWindow::Quarter(_) => "quarter",
            TimeWindow::Absolute { .. } => "absolute",
            TimeWindow::RelativeMonths(_) => "relative_months",
            TimeWindow::TrailingMonths(_) => "trailing_months",
            TimeWindow::Ytd => "ytd",
            TimeWindow::LastYear => "last_year",
        }
    }

    /// Windows a comparison can be anchored on.
    pub fn is_single_window(&self) -> bool {
        matches!(self, TimeWindow::SingleMonth(_) | TimeWindow::RelativeMonths(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeSpec {
    #[serde(default)]
    pub grain: TimeGrain,
    pub window: TimeWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    #[serde(alias = "ASC")]
    Asc,
    #[serde(alias = "DESC")]
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrderSpec {
    #[serde(alias = "by")]
    pub field: String,
    #[serde(default, alias = "dir")]
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareBaseline {
    PreviousPeriod,
    SamePeriodLastYear,
    Absolute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareMethod {
    #[default]
    DiffPct,
    DiffAbs,
}

impl CompareMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareMethod::DiffPct => "diff_pct",
            CompareMethod::DiffAbs => "diff_abs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompareSpec {
    pub baseline: CompareBaseline,
    #[serde(default)]
    pub method: CompareMethod,
    /// Baseline bounds, only for `baseline = absolute` (`end` exclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketMethod {
    Quantile,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BucketParams {
    /// Quantile fractions; quartiles when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub q: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BucketSpec {
    pub field: String,
    pub method: BucketMethod,
    #[serde(default)]
    pub params: BucketParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Estimator {
    #[default]
    Exact,
    Approx,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateV2 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub median_of: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distinct_of: Option<String>,
    #[serde(default)]
    pub estimator: Estimator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopKWithinGroup {
    pub k: i64,
    /// Metric (by output name) that ranks rows inside each partition.
    pub by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryPlan {
    /// Absent means "0.2" when any v0.2 field is present, else "0.1".
    #[serde(default, alias = "nql_version", skip_serializing_if = "Option::is_none")]
    pub version: Option<PlanVersion>,
    #[serde(default)]
    pub intent: Intent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    pub metrics: Vec<MetricSpec>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<TimeSpec>,
    #[serde(default, alias = "sort")]
    pub order_by: Vec<OrderSpec>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compare: Option<CompareSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<BucketSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_v2: Option<AggregateV2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k_within_group: Option<TopKWithinGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panel_by: Option<String>,
}

fn default_limit() -> i64 {
    100
}

impl QueryPlan {
    pub fn new(metrics: Vec<MetricSpec>) -> Self {
        Self {
            version: None,
            intent: Intent::default(),
            dataset: None,
            metrics,
            group_by: Vec::new(),
            filters: Vec::new(),
            time: None,
            order_by: Vec::new(),
            limit: default_limit(),
            compare: None,
            bucket: None,
            aggregate_v2: None,
            top_k_within_group: None,
            panel_by: None,
        }
    }

    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Names of the v0.2-only fields this plan sets.
    pub fn v2_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.compare.is_some() {
            fields.push("compare");
        }
        if self.bucket.is_some() {
            fields.push("bucket");
        }
        if self.aggregate_v2.is_some() {
            fields.push("aggregate_v2");
        }
        if self.top_k_within_group.is_some() {
            fields.push("top_k_within_group");
        }
        if self.panel_by.is_some() {
            fields.push("panel_by");
        }
        fields
    }

    pub fn effective_version(&self) -> PlanVersion {
        match self.version {
            Some(version) => version,
            None if self.v2_fields().is_empty() => PlanVersion::V1,
            None => PlanVersion::V2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_aliases_are_accepted() {
        let plan = QueryPlan::from_json(
            r#"{
                "nql_version": "0.2",
                "metrics": [{"name": "incidents", "agg": "count", "alias": "n"}],
                "filters": [{"field": "area", "op": "=", "value": "Hollywood"}],
                "time": {"grain": "month", "window": {"single_month": "2023-12-01"}},
                "sort": [{"by": "n", "dir": "desc"}]
            }"#,
        )
        .unwrap();
        assert_eq!(plan.version, Some(PlanVersion::V2));
        assert_eq!(plan.metrics[0].aggregation, Some(Aggregation::Count));
        assert_eq!(plan.metrics[0].output_name(), "n");
        assert_eq!(plan.filters[0].operator, FilterOperator::Eq);
        assert_eq!(plan.order_by[0].direction, SortDirection::Desc);
        assert_eq!(plan.limit, 100);
        assert_eq!(
            plan.time.unwrap().window,
            TimeWindow::SingleMonth(NaiveDate::from_ymd_opt(2023, 12, 1).unwrap())
        );
    }

    #[test]
    fn unit_windows_are_plain_strings() {
        let spec: TimeSpec = serde_json::from_str(r#"{"window": "ytd"}"#).unwrap();
        assert_eq!(spec.window, TimeWindow::Ytd);
        assert_eq!(spec.grain, TimeGrain::Month);
        let spec: TimeSpec =
            serde_json::from_str(r#"{"grain": "day", "window": {"absolute": {"start": "2024-01-01", "end": "2024-02-01"}}}"#)
                .unwrap();
        assert_eq!(spec.window.kind(), "absolute");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = QueryPlan::from_json(r#"{"metrics": [], "flavour": "spicy"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn version_is_inferred_from_v2_fields() {
        let mut plan = QueryPlan::new(vec![MetricSpec::new("incidents")]);
        assert_eq!(plan.effective_version(), PlanVersion::V1);
        plan.panel_by = Some("area".to_string());
        assert_eq!(plan.effective_version(), PlanVersion::V2);
        plan.version = Some(PlanVersion::V1);
        assert_eq!(plan.effective_version(), PlanVersion::V1);
    }
}
