//! Plan Compiler
//!
//! Turns a [`ValidatedPlan`] plus its resolved filter values into one
//! parameterized SELECT statement. Each plan shape has its own emitter:
//!
//! - aggregate: a single grouped SELECT
//! - compare: `current_period` and `baseline_period` stages, outer-joined
//!   on the grouping keys
//! - top_k_within_group: aggregate, rank with `ROW_NUMBER()`, keep `rank <= k`
//! - bucket: label rows, aggregate, fold groups under the small-n floor
//!   into one `Other (<5)` bucket, re-aggregate
//! - aggregate_v2: median / distinct count, exact or approximate
//!
//! Compilation is all-or-nothing: any inconsistency is an error before a
//! statement exists.

use crate::canonical::resolver::{ResolvedFilters, ResolvedPlanFilter, ResolvedValue};
use crate::canonical::store::WILDCARD;
use crate::error::{NqlError, Result};
use crate::nql::lineage::{CanonicalizedValue, Lineage};
use crate::nql::model::*;
use crate::nql::sql::{number_literal, quote_ident, quote_literal, BindValue, Predicate, Query, Select};
use crate::nql::validator::{columns, GroupKey, PlanShape, ValidatedPlan};
use crate::observability;
use crate::semantic::{Aggregation, SemanticModel, SemanticRegistry};
use crate::time_range::{resolve_window, window_span_months, TimeRange};
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use tracing::debug;

/// Groups with fewer rows than this are folded into one bucket.
pub const SMALL_N_THRESHOLD: i64 = 5;

const CURRENT_CTE: &str = "current_period";
const BASELINE_CTE: &str = "baseline_period";
const VALUE: &str = "value";
const ROW_COUNT: &str = "row_count";

pub fn suppressed_label() -> String {
    format!("Other (<{})", SMALL_N_THRESHOLD)
}

#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Anchor for relative windows.
    pub today: NaiveDate,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self { today: Utc::now().date_naive() }
    }
}

impl CompileOptions {
    pub fn anchored(today: NaiveDate) -> Self {
        Self { today }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub sql: String,
    /// Values for the `?` markers in `sql`, in order.
    pub params: Vec<BindValue>,
    pub lineage: Lineage,
}

pub struct PlanCompiler {
    model: Arc<SemanticModel>,
}

impl PlanCompiler {
    pub fn new(model: Arc<SemanticModel>) -> Self {
        Self { model }
    }

    pub fn compile(
        &self,
        plan: &ValidatedPlan,
        filters: &ResolvedFilters,
        options: &CompileOptions,
    ) -> Result<CompiledQuery> {
        compile(plan, filters, &self.model, options)
    }
}

/// Compile `plan` against `model`.
pub fn compile(
    plan: &ValidatedPlan,
    filters: &ResolvedFilters,
    model: &SemanticModel,
    options: &CompileOptions,
) -> Result<CompiledQuery> {
    let result = Emitter::new(plan, filters, model, options).and_then(Emitter::emit);
    match &result {
        Ok(compiled) => {
            observability::record_compile(&compiled.lineage);
        }
        Err(err) => {
            observability::record_error("compile", err);
        }
    }
    result
}

struct KeyColumn {
    name: String,
    expr: String,
    is_time: bool,
}

struct MetricColumn {
    name: String,
    sql: String,
    aggregation: Aggregation,
    column: Option<String>,
}

struct Emitter<'a> {
    validated: &'a ValidatedPlan,
    plan: &'a QueryPlan,
    model: &'a SemanticModel,
    keys: Vec<KeyColumn>,
    predicates: Vec<Predicate>,
    window: Option<TimeRange>,
    limit: i64,
    lineage: Lineage,
}

impl<'a> Emitter<'a> {
    fn new(
        validated: &'a ValidatedPlan,
        filters: &ResolvedFilters,
        model: &'a SemanticModel,
        options: &CompileOptions,
    ) -> Result<Self> {
        let plan = validated.plan();
        let mut lineage = Lineage::for_plan(validated)?;

        let (min, max) = validated.version().limit_bounds();
        let limit = plan.limit.clamp(min, max);
        if limit != plan.limit {
            lineage.note("limit_clamp");
        }
        lineage.limit_applied = limit;

        let window = plan
            .time
            .as_ref()
            .map(|time| resolve_window(&time.window, options.today))
            .transpose()?;
        lineage.time_window = window;

        let predicates = filter_predicates(plan, filters, model)?;
        lineage.canonicalized = filters
            .iter()
            .flat_map(|filter| {
                filter.canonicalized().map(|resolved| CanonicalizedValue {
                    field: filter.field.clone(),
                    original: resolved.original.clone(),
                    value: resolved.value.clone(),
                })
            })
            .collect();

        Ok(Self {
            validated,
            plan,
            model,
            keys: key_columns(validated, model)?,
            predicates,
            window,
            limit,
            lineage,
        })
    }

    fn emit(mut self) -> Result<CompiledQuery> {
        let query = match self.validated.shape() {
            PlanShape::Aggregate => self.aggregate()?,
            PlanShape::Compare => self.compare()?,
            PlanShape::TopKWithinGroup => self.top_k()?,
            PlanShape::Bucket => self.bucket()?,
            PlanShape::AggregateV2 => self.aggregate_v2()?,
        };
        let (sql, params) = query.render();
        debug!(shape = self.validated.shape().as_str(), params = params.len(), "Compiled plan");
        Ok(CompiledQuery { sql, params, lineage: self.lineage })
    }

    fn time_column(&self) -> String {
        quote_ident(&self.model.time_column)
    }

    /// Fact table restricted by the plan filters and `window`.
    fn scoped(&self, window: Option<TimeRange>) -> Select {
        let select = Select::from_table(&self.model.table).filters(self.predicates.iter().cloned());
        match window {
            Some(range) => select.filter(time_predicate(&self.time_column(), range)),
            None => select,
        }
    }

    fn key_select(&self) -> Vec<String> {
        self.keys
            .iter()
            .map(|k| format!("{} AS {}", k.expr, quote_ident(&k.name)))
            .collect()
    }

    fn key_exprs(&self) -> Vec<String> {
        self.keys.iter().map(|k| k.expr.clone()).collect()
    }

    fn key_names(&self) -> Vec<String> {
        self.keys.iter().map(|k| quote_ident(&k.name)).collect()
    }

    fn metric_columns(&self) -> Result<Vec<MetricColumn>> {
        self.plan.metrics.iter().map(|spec| self.metric_column(spec)).collect()
    }

    fn metric_column(&self, spec: &MetricSpec) -> Result<MetricColumn> {
        let definition = self
            .model
            .metric(&spec.name)
            .ok_or_else(|| NqlError::shape(format!("metric '{}' is not defined", spec.name)))?;
        let aggregation = spec.aggregation.unwrap_or(definition.aggregation);
        let sql = definition.aggregate_sql(aggregation).ok_or_else(|| {
            NqlError::shape(format!("metric '{}' has no source column for {}", spec.name, aggregation))
        })?;
        Ok(MetricColumn {
            name: spec.output_name().to_string(),
            sql,
            aggregation,
            column: definition.column_sql(),
        })
    }

    /// Panel first, then time keys, all ascending.
    fn default_ordering(&self) -> Vec<String> {
        let panel = self.plan.panel_by.as_deref();
        let mut order: Vec<String> = panel.iter().map(|p| format!("{} ASC", quote_ident(p))).collect();
        order.extend(
            self.keys
                .iter()
                .filter(|k| k.is_time && Some(k.name.as_str()) != panel)
                .map(|k| format!("{} ASC", quote_ident(&k.name))),
        );
        order
    }

    fn ordering(&self, default: Vec<String>) -> Vec<String> {
        if self.plan.order_by.is_empty() {
            return default;
        }
        self.plan
            .order_by
            .iter()
            .map(|o| format!("{} {}", quote_ident(&o.field), o.direction.as_sql()))
            .collect()
    }

    fn aggregate(&mut self) -> Result<Query> {
        let metrics = self.metric_columns()?;
        let body = self
            .scoped(self.window)
            .columns(self.key_select())
            .columns(metrics.iter().map(|m| format!("{} AS {}", m.sql, quote_ident(&m.name))))
            .group_by(self.key_exprs())
            .order_by(self.ordering(self.default_ordering()))
            .limit(self.limit);
        Ok(Query::new(body))
    }

    fn compare(&mut self) -> Result<Query> {
        let compare = self
            .plan
            .compare
            .as_ref()
            .ok_or_else(|| NqlError::shape("compare shape without a compare block"))?;
        let current = self
            .window
            .ok_or_else(|| NqlError::shape("compare requires a time window"))?;
        let baseline = self.baseline_window(compare, current)?;
        let metric = self
            .metric_columns()?
            .into_iter()
            .next()
            .ok_or_else(|| NqlError::shape("compare works on exactly one metric"))?;

        let stage = |range: TimeRange| {
            self.scoped(Some(range))
                .columns(self.key_select())
                .column_as(&metric.sql, VALUE)
                .group_by(self.key_exprs())
        };
        let current_stage = stage(current);
        let baseline_stage = stage(baseline);

        let names = self.key_names();
        let on = if names.is_empty() {
            "1 = 1".to_string()
        } else {
            names
                .iter()
                .map(|k| format!("c.{k} IS NOT DISTINCT FROM b.{k}", k = k))
                .collect::<Vec<_>>()
                .join(" AND ")
        };
        let value = quote_ident(VALUE);
        let diff = match compare.method {
            CompareMethod::DiffPct => format!(
                "CASE WHEN b.{v} IS NULL OR b.{v} = 0 THEN NULL ELSE (c.{v} - b.{v}) * 1.0 / b.{v} END",
                v = value
            ),
            CompareMethod::DiffAbs => format!("c.{v} - b.{v}", v = value),
        };
        let body = Select::from_cte(CURRENT_CTE)
            .alias("c")
            .left_join(BASELINE_CTE, "b", on)
            .columns(names.iter().map(|k| format!("c.{k} AS {k}", k = k)))
            .column_as(format!("c.{}", value), columns::CURRENT)
            .column_as(format!("b.{}", value), columns::BASELINE)
            .column_as(diff, compare.method.as_str())
            .order_by(self.ordering(self.default_ordering()))
            .limit(self.limit);

        self.lineage.baseline_window = Some(baseline);
        Ok(Query::with_stages(
            vec![(CURRENT_CTE, current_stage), (BASELINE_CTE, baseline_stage)],
            body,
        ))
    }

    fn baseline_window(&self, compare: &CompareSpec, current: TimeRange) -> Result<TimeRange> {
        match compare.baseline {
            CompareBaseline::PreviousPeriod => {
                let span = self
                    .plan
                    .time
                    .as_ref()
                    .and_then(|time| window_span_months(&time.window))
                    .ok_or_else(|| NqlError::shape("previous_period needs a fixed-length window"))?;
                current.shift_months(-span)
            }
            CompareBaseline::SamePeriodLastYear => current.shift_months(-12),
            CompareBaseline::Absolute => match (compare.start, compare.end) {
                (Some(start), Some(end)) => TimeRange::new(start, end),
                _ => Err(NqlError::shape("compare.baseline = absolute requires start and end")),
            },
        }
    }

    fn top_k(&mut self) -> Result<Query> {
        let top_k = self
            .plan
            .top_k_within_group
            .as_ref()
            .ok_or_else(|| NqlError::shape("top_k_within_group shape without its block"))?;
        let metrics = self.metric_columns()?;
        let names = self.key_names();
        let Some((last, partition)) = names.split_last() else {
            return Err(NqlError::shape("top_k_within_group needs at least one grouping key"));
        };

        let aggregated = self
            .scoped(self.window)
            .columns(self.key_select())
            .columns(metrics.iter().map(|m| format!("{} AS {}", m.sql, quote_ident(&m.name))))
            .group_by(self.key_exprs());

        let partition_clause = if partition.is_empty() {
            String::new()
        } else {
            format!("PARTITION BY {} ", partition.join(", "))
        };
        let rank = format!(
            "ROW_NUMBER() OVER ({}ORDER BY {} DESC, {} ASC)",
            partition_clause,
            quote_ident(&top_k.by),
            last
        );
        let ranked = Select::from_cte("aggregated").column("*").column_as(rank, columns::RANK);

        let rank_col = quote_ident(columns::RANK);
        let default: Vec<String> = partition
            .iter()
            .map(|k| format!("{} ASC", k))
            .chain(std::iter::once(format!("{} ASC", rank_col)))
            .collect();
        let body = Select::from_cte("ranked")
            .columns(names.iter().cloned())
            .columns(metrics.iter().map(|m| quote_ident(&m.name)))
            .column(rank_col.clone())
            .filter(Predicate::raw(format!("{} <= {}", rank_col, top_k.k)))
            .order_by(self.ordering(default))
            .limit(self.limit);

        Ok(Query::with_stages(vec![("aggregated", aggregated), ("ranked", ranked)], body))
    }

    fn bucket(&mut self) -> Result<Query> {
        let bucket = self
            .plan
            .bucket
            .as_ref()
            .ok_or_else(|| NqlError::shape("bucket shape without a bucket block"))?;
        let field = self
            .model
            .dimension(&bucket.field)
            .ok_or_else(|| NqlError::shape(format!("bucket field '{}' is not defined", bucket.field)))?
            .expression();
        let metrics = self.metric_columns()?;

        let mut stages = Vec::new();
        let (edges, labels) = match bucket.method {
            BucketMethod::Custom => {
                let edges: Vec<String> = bucket.params.edges.iter().map(|e| number_literal(*e)).collect();
                let labels = range_labels(&bucket.params.edges);
                (edges, labels)
            }
            BucketMethod::Quantile => {
                let q = if bucket.params.q.is_empty() {
                    vec![0.0, 0.25, 0.5, 0.75, 1.0]
                } else {
                    bucket.params.q.clone()
                };
                let edge_stage = self
                    .scoped(self.window)
                    .columns(q.iter().enumerate().map(|(i, fraction)| {
                        format!(
                            "PERCENTILE_DISC({}) WITHIN GROUP (ORDER BY {}) AS {}",
                            number_literal(*fraction),
                            field,
                            quote_ident(&format!("e_{}", i))
                        )
                    }))
                    .filter(Predicate::raw(format!("{} IS NOT NULL", field)));
                stages.push(("bucket_edges", edge_stage));
                let edges = (0..q.len()).map(|i| quote_ident(&format!("e_{}", i))).collect();
                let labels = (1..q.len()).map(|i| format!("Q{}", i)).collect();
                (edges, labels)
            }
        };
        let assign = bucket_case(&field, &edges, &labels);
        let in_range = match (edges.first(), edges.last()) {
            (Some(low), Some(high)) => format!("{f} >= {} AND {f} <= {}", low, high, f = field),
            _ => return Err(NqlError::shape("bucket needs at least two edges")),
        };

        let mut partial_columns = Vec::new();
        let mut merged = Vec::new();
        for (i, metric) in metrics.iter().enumerate() {
            let (partials, combined) = decompose(i, metric)?;
            partial_columns.extend(partials);
            merged.push(format!("{} AS {}", combined, quote_ident(&metric.name)));
        }
        let partial_names: Vec<String> = partial_columns.iter().map(|(name, _)| quote_ident(name)).collect();

        let mut aggregated = self.scoped(self.window);
        if bucket.method == BucketMethod::Quantile {
            aggregated = aggregated.cross_join("bucket_edges");
        }
        let aggregated = aggregated
            .columns(self.key_select())
            .column_as(&assign, columns::BUCKET)
            .column_as("COUNT(*)", ROW_COUNT)
            .columns(partial_columns.iter().map(|(name, sql)| format!("{} AS {}", sql, quote_ident(name))))
            .filter(Predicate::raw(in_range))
            .group_by(self.key_exprs().into_iter().chain(std::iter::once(assign.clone())));

        let names = self.key_names();
        let bucket_col = quote_ident(columns::BUCKET);
        let suppressed = Select::from_cte("aggregated")
            .columns(names.iter().cloned())
            .column_as(
                format!(
                    "CASE WHEN {} < {} THEN {} ELSE {} END",
                    quote_ident(ROW_COUNT),
                    SMALL_N_THRESHOLD,
                    quote_literal(&suppressed_label()),
                    bucket_col
                ),
                columns::BUCKET,
            )
            .column(quote_ident(ROW_COUNT))
            .columns(partial_names);

        let body = Select::from_cte("suppressed")
            .columns(names.iter().cloned())
            .column(bucket_col.clone())
            .columns(merged)
            .group_by(names.iter().cloned().chain(std::iter::once(bucket_col)))
            .order_by(self.ordering(self.default_ordering()))
            .limit(self.limit);

        stages.push(("aggregated", aggregated));
        stages.push(("suppressed", suppressed));
        self.lineage.small_n_suppressed = true;
        Ok(Query::with_stages(stages, body))
    }

    fn aggregate_v2(&mut self) -> Result<Query> {
        let agg = self
            .plan
            .aggregate_v2
            .as_ref()
            .ok_or_else(|| NqlError::shape("aggregate_v2 shape without its block"))?;
        let approximate = agg.estimator == Estimator::Approx;
        self.lineage.approximate = approximate;

        if let Some(name) = &agg.median_of {
            if self.model.metric(name).is_some() {
                return self.median_of_metric(name, approximate);
            }
        }

        let mut body = self.scoped(self.window).columns(self.key_select());
        if let Some(name) = &agg.median_of {
            let dim = self
                .model
                .dimension(name)
                .ok_or_else(|| NqlError::shape(format!("median_of '{}' is not defined", name)))?;
            body = body.column_as(median(&dim.expression(), approximate), &columns::median_of(name));
        }
        if let Some(name) = &agg.distinct_of {
            let dim = self
                .model
                .dimension(name)
                .ok_or_else(|| NqlError::shape(format!("distinct_of '{}' is not defined", name)))?;
            body = body.column_as(distinct(&dim.expression(), approximate), &columns::distinct_of(name));
        }
        let body = body
            .group_by(self.key_exprs())
            .order_by(self.ordering(self.default_ordering()))
            .limit(self.limit);
        Ok(Query::new(body))
    }

    /// Median over per-day values of a metric.
    fn median_of_metric(&self, name: &str, approximate: bool) -> Result<Query> {
        let spec = self
            .plan
            .metrics
            .iter()
            .find(|m| m.name == name)
            .cloned()
            .unwrap_or_else(|| MetricSpec::new(name));
        let metric = self.metric_column(&spec)?;
        let day = truncate(TimeGrain::Day, &self.time_column());

        let daily = self
            .scoped(self.window)
            .columns(self.key_select())
            .column_as(&day, "day")
            .column_as(&metric.sql, VALUE)
            .group_by(self.key_exprs().into_iter().chain(std::iter::once(day.clone())));

        let names = self.key_names();
        let body = Select::from_cte("daily")
            .columns(names.iter().cloned())
            .column_as(median(&quote_ident(VALUE), approximate), &columns::median_of(name))
            .group_by(names)
            .order_by(self.ordering(self.default_ordering()))
            .limit(self.limit);
        Ok(Query::with_stages(vec![("daily", daily)], body))
    }
}

fn key_columns(validated: &ValidatedPlan, model: &SemanticModel) -> Result<Vec<KeyColumn>> {
    let grain = validated.plan().time.as_ref().map(|t| t.grain).unwrap_or_default();
    validated
        .keys()
        .iter()
        .map(|key| match key {
            GroupKey::Period => Ok(KeyColumn {
                name: GroupKey::PERIOD.to_string(),
                expr: truncate(grain, &quote_ident(&model.time_column)),
                is_time: true,
            }),
            GroupKey::Dimension(name) => {
                let dim = model
                    .dimension(name)
                    .ok_or_else(|| NqlError::shape(format!("dimension '{}' is not defined", name)))?;
                let expr = if dim.is_time() {
                    truncate(grain, &dim.expression())
                } else {
                    dim.expression()
                };
                Ok(KeyColumn { name: name.clone(), expr, is_time: dim.is_time() })
            }
        })
        .collect()
}

fn truncate(grain: TimeGrain, expr: &str) -> String {
    format!("DATE_TRUNC('{}', {})", grain.as_str(), expr)
}

fn time_predicate(column: &str, range: TimeRange) -> Predicate {
    Predicate::new(
        format!("{c} >= ? AND {c} < ?", c = column),
        vec![BindValue::Date(range.start), BindValue::Date(range.end)],
    )
}

fn filter_predicates(
    plan: &QueryPlan,
    filters: &ResolvedFilters,
    model: &SemanticModel,
) -> Result<Vec<Predicate>> {
    if filters.len() != plan.filters.len() {
        return Err(NqlError::shape(format!(
            "{} resolved filter(s) for {} plan filter(s)",
            filters.len(),
            plan.filters.len()
        )));
    }
    plan.filters
        .iter()
        .zip(filters.iter())
        .map(|(spec, resolved)| {
            if spec.field != resolved.field || spec.operator != resolved.operator {
                return Err(NqlError::shape(format!(
                    "resolved filter '{}' does not match plan filter '{}'",
                    resolved.field, spec.field
                )));
            }
            let dim = model
                .dimension(&spec.field)
                .ok_or_else(|| NqlError::shape(format!("dimension '{}' is not defined", spec.field)))?;
            filter_predicate(&dim.expression(), dim.is_time(), resolved)
        })
        .collect()
}

fn filter_predicate(expr: &str, is_time: bool, filter: &ResolvedPlanFilter) -> Result<Predicate> {
    let values = &filter.values;
    if values.is_empty() {
        return Err(NqlError::shape(format!("filter on '{}' has no values", filter.field)));
    }
    match filter.operator {
        FilterOperator::Eq => Ok(match_value(expr, &values[0])),
        FilterOperator::In => {
            let (patterns, exact): (Vec<&ResolvedValue>, Vec<&ResolvedValue>) =
                values.iter().partition(|v| v.is_pattern());
            let mut parts = Vec::new();
            if !exact.is_empty() {
                parts.push(Predicate::new(
                    format!("{} IN ({})", expr, vec!["?"; exact.len()].join(", ")),
                    exact.iter().map(|v| v.bind()).collect(),
                ));
            }
            parts.extend(patterns.into_iter().map(|v| like(expr, v.bind())));
            Ok(Predicate::any(parts))
        }
        FilterOperator::Between => {
            let [low, high] = values.as_slice() else {
                return Err(NqlError::shape(format!(
                    "between on '{}' needs exactly two bounds",
                    filter.field
                )));
            };
            let sql = if is_time {
                format!("{e} >= ? AND {e} < ?", e = expr)
            } else {
                format!("{} BETWEEN ? AND ?", expr)
            };
            Ok(Predicate::new(sql, vec![low.bind(), high.bind()]))
        }
        FilterOperator::LikeAny => Ok(Predicate::any(
            values
                .iter()
                .map(|v| {
                    let pattern = match v.bind() {
                        BindValue::Text(s) if s.contains(WILDCARD) => s,
                        other => format!("%{}%", other),
                    };
                    like(expr, BindValue::Text(pattern))
                })
                .collect(),
        )),
    }
}

fn match_value(expr: &str, value: &ResolvedValue) -> Predicate {
    if value.is_pattern() {
        like(expr, value.bind())
    } else {
        Predicate::new(format!("{} = ?", expr), vec![value.bind()])
    }
}

fn like(expr: &str, pattern: BindValue) -> Predicate {
    Predicate::new(format!("LOWER({}) LIKE LOWER(?)", expr), vec![pattern])
}

/// `CASE` assigning each row to `[edge_i, edge_i+1)`; the last bucket keeps its top edge.
fn bucket_case(field: &str, edges: &[String], labels: &[String]) -> String {
    let last = labels.len().saturating_sub(1);
    let arms: Vec<String> = labels
        .iter()
        .enumerate()
        .map(|(i, label)| {
            let upper = if i == last { "<=" } else { "<" };
            format!(
                "WHEN {f} >= {} AND {f} {} {} THEN {}",
                edges[i],
                upper,
                edges[i + 1],
                quote_literal(label),
                f = field
            )
        })
        .collect();
    format!("CASE {} END", arms.join(" "))
}

fn range_labels(edges: &[f64]) -> Vec<String> {
    let last = edges.len().saturating_sub(2);
    edges
        .windows(2)
        .enumerate()
        .map(|(i, pair)| {
            let close = if i == last { "]" } else { ")" };
            format!("[{}, {}{}", label_number(pair[0]), label_number(pair[1]), close)
        })
        .collect()
}

fn label_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Partial aggregates for one metric and the expression that merges them.
fn decompose(index: usize, metric: &MetricColumn) -> Result<(Vec<(String, String)>, String)> {
    let partial = format!("p_{}", index);
    let merged = |func: &str| format!("{}({})", func, quote_ident(&partial));
    match metric.aggregation {
        Aggregation::Count => Ok((vec![(partial.clone(), metric.sql.clone())], merged("SUM"))),
        Aggregation::Sum => Ok((vec![(partial.clone(), metric.sql.clone())], merged("SUM"))),
        Aggregation::Min => Ok((vec![(partial.clone(), metric.sql.clone())], merged("MIN"))),
        Aggregation::Max => Ok((vec![(partial.clone(), metric.sql.clone())], merged("MAX"))),
        Aggregation::Avg => {
            let column = metric.column.as_ref().ok_or_else(|| {
                NqlError::shape(format!("metric '{}' has no source column for avg", metric.name))
            })?;
            let (sum, count) = (format!("s_{}", index), format!("n_{}", index));
            let combined = format!(
                "SUM({}) * 1.0 / NULLIF(SUM({}), 0)",
                quote_ident(&sum),
                quote_ident(&count)
            );
            Ok((
                vec![(sum, format!("SUM({})", column)), (count, format!("COUNT({})", column))],
                combined,
            ))
        }
        Aggregation::DistinctCount => Err(NqlError::shape(format!(
            "metric '{}' cannot be merged by small-group suppression",
            metric.name
        ))),
    }
}

fn median(expr: &str, approximate: bool) -> String {
    if approximate {
        format!("APPROX_QUANTILE({}, 0.5)", expr)
    } else {
        format!("PERCENTILE_CONT(0.5) WITHIN GROUP (ORDER BY {})", expr)
    }
}

fn distinct(expr: &str, approximate: bool) -> String {
    if approximate {
        format!("APPROX_COUNT_DISTINCT({})", expr)
    } else {
        format!("COUNT(DISTINCT {})", expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nql::validator::PlanValidator;
    use crate::semantic::load_from_json;

    fn model() -> Arc<SemanticModel> {
        load_from_json(include_str!("../../demos/semantic.json")).unwrap()
    }

    fn compile_json(json: &str) -> CompiledQuery {
        let model = model();
        let plan = PlanValidator::new(model.as_ref())
            .validate(QueryPlan::from_json(json).unwrap())
            .unwrap();
        let filters = ResolvedFilters::passthrough(&plan, &model);
        let today = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        compile(&plan, &filters, &model, &CompileOptions::anchored(today)).unwrap()
    }

    fn date(s: &str) -> BindValue {
        BindValue::Date(NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap())
    }

    #[test]
    fn aggregate_binds_filters_then_time() {
        let compiled = compile_json(
            r#"{"metrics": [{"name": "incidents"}], "group_by": ["area"],
                "filters": [{"field": "weapon", "operator": "eq", "value": "%gun%"}],
                "time": {"window": {"single_month": "2023-12-01"}}}"#,
        );
        assert!(compiled.sql.starts_with("SELECT \"AREA NAME\" AS \"area\", COUNT(*) AS \"incidents\""));
        assert!(compiled.sql.contains("LOWER(\"Weapon Desc\") LIKE LOWER(?)"));
        assert!(compiled.sql.contains("\"DATE OCC\" >= ? AND \"DATE OCC\" < ?"));
        assert!(compiled.sql.contains("GROUP BY \"AREA NAME\""));
        assert_eq!(
            compiled.params,
            vec![BindValue::Text("%gun%".into()), date("2023-12-01"), date("2024-01-01")]
        );
        assert!(compiled.lineage.notes.contains("like_passthrough"));
    }

    #[test]
    fn limit_is_clamped_per_version() {
        let v2 = compile_json(r#"{"nql_version": "0.2", "metrics": [{"name": "incidents"}], "limit": 500}"#);
        assert!(v2.sql.ends_with("LIMIT 100"));
        assert_eq!(v2.lineage.limit_requested, 500);
        assert_eq!(v2.lineage.limit_applied, 100);
        assert!(v2.lineage.notes.contains("limit_clamp"));

        let v1 = compile_json(r#"{"nql_version": "0.1", "metrics": [{"name": "incidents"}], "limit": 0}"#);
        assert!(v1.sql.ends_with("LIMIT 1"));
    }

    #[test]
    fn compare_shifts_previous_period_and_outer_joins() {
        let compiled = compile_json(
            r#"{"metrics": [{"name": "incidents", "aggregation": "count"}], "group_by": ["area"],
                "time": {"window": {"single_month": "2023-12-01"}},
                "compare": {"baseline": "previous_period", "method": "diff_pct"}}"#,
        );
        assert!(compiled.sql.starts_with("WITH current_period AS ("));
        assert!(compiled.sql.contains(", baseline_period AS ("));
        assert!(compiled.sql.contains("LEFT JOIN baseline_period AS b ON c.\"area\" IS NOT DISTINCT FROM b.\"area\""));
        assert!(compiled.sql.contains("AS \"diff_pct\""));
        assert_eq!(
            compiled.params,
            vec![date("2023-12-01"), date("2024-01-01"), date("2023-11-01"), date("2023-12-01")]
        );
        let baseline = compiled.lineage.baseline_window.unwrap();
        assert_eq!(baseline.to_string(), "[2023-11-01, 2023-12-01)");
    }

    #[test]
    fn compare_same_period_last_year_over_relative_months() {
        let compiled = compile_json(
            r#"{"metrics": [{"name": "incidents"}],
                "time": {"window": {"relative_months": 3}},
                "compare": {"baseline": "same_period_last_year", "method": "diff_abs"}}"#,
        );
        assert_eq!(
            compiled.params,
            vec![date("2023-12-01"), date("2024-03-01"), date("2022-12-01"), date("2023-03-01")]
        );
        assert!(compiled.sql.contains("ON 1 = 1"));
        assert!(compiled.sql.contains("c.\"value\" - b.\"value\" AS \"diff_abs\""));
    }

    #[test]
    fn top_k_partitions_on_all_but_last_key() {
        let compiled = compile_json(
            r#"{"metrics": [{"name": "incidents"}], "group_by": ["area", "crime_type"],
                "top_k_within_group": {"k": 3, "by": "incidents"}}"#,
        );
        assert!(compiled.sql.contains(
            "ROW_NUMBER() OVER (PARTITION BY \"area\" ORDER BY \"incidents\" DESC, \"crime_type\" ASC) AS \"rank_in_group\""
        ));
        assert!(compiled.sql.contains("WHERE \"rank_in_group\" <= 3"));
        assert!(compiled.sql.contains("ORDER BY \"area\" ASC, \"rank_in_group\" ASC"));
    }

    #[test]
    fn custom_buckets_label_ranges_and_suppress_small_groups() {
        let compiled = compile_json(
            r#"{"metrics": [{"name": "incidents"}, {"name": "victim_age"}],
                "bucket": {"field": "vict_age", "method": "custom", "params": {"edges": [0, 18, 65, 120]}}}"#,
        );
        assert!(compiled.sql.contains("THEN '[0, 18)'"));
        assert!(compiled.sql.contains("\"Vict Age\" <= 120.0 THEN '[65, 120]'"));
        assert!(compiled.sql.contains("CASE WHEN \"row_count\" < 5 THEN 'Other (<5)' ELSE \"bucket\" END"));
        assert!(compiled.sql.contains("SUM(\"s_1\") * 1.0 / NULLIF(SUM(\"n_1\"), 0) AS \"victim_age\""));
        assert!(compiled.lineage.small_n_suppressed);
    }

    #[test]
    fn quantile_buckets_compute_edges_first() {
        let compiled = compile_json(
            r#"{"metrics": [{"name": "incidents"}],
                "bucket": {"field": "vict_age", "method": "quantile"}}"#,
        );
        assert!(compiled.sql.starts_with("WITH bucket_edges AS ("));
        assert!(compiled.sql.contains("PERCENTILE_DISC(0.25) WITHIN GROUP (ORDER BY \"Vict Age\") AS \"e_1\""));
        assert!(compiled.sql.contains("CROSS JOIN bucket_edges"));
        assert!(compiled.sql.contains("THEN 'Q4'"));
    }

    #[test]
    fn aggregate_v2_exact_and_approximate() {
        let exact = compile_json(
            r#"{"metrics": [{"name": "incidents"}], "group_by": ["area"],
                "aggregate_v2": {"median_of": "vict_age", "distinct_of": "premise"}}"#,
        );
        assert!(exact.sql.contains("PERCENTILE_CONT(0.5) WITHIN GROUP (ORDER BY \"Vict Age\") AS \"median_vict_age\""));
        assert!(exact.sql.contains("COUNT(DISTINCT \"Premis Desc\") AS \"distinct_premise\""));
        assert!(!exact.lineage.approximate);

        let approx = compile_json(
            r#"{"metrics": [{"name": "incidents"}],
                "aggregate_v2": {"distinct_of": "premise", "estimator": "approx"}}"#,
        );
        assert!(approx.sql.contains("APPROX_COUNT_DISTINCT(\"Premis Desc\")"));
        assert!(approx.lineage.approximate);
    }

    #[test]
    fn median_of_metric_uses_daily_stage() {
        let compiled = compile_json(
            r#"{"metrics": [{"name": "incidents"}], "aggregate_v2": {"median_of": "incidents"}}"#,
        );
        assert!(compiled.sql.starts_with("WITH daily AS ("));
        assert!(compiled.sql.contains("DATE_TRUNC('day', \"DATE OCC\") AS \"day\""));
        assert!(compiled.sql.contains("PERCENTILE_CONT(0.5) WITHIN GROUP (ORDER BY \"value\") AS \"median_incidents\""));
    }

    #[test]
    fn trend_adds_period_key_and_orders_by_it() {
        let compiled = compile_json(
            r#"{"intent": "trend", "metrics": [{"name": "incidents"}],
                "time": {"grain": "month", "window": "ytd"}}"#,
        );
        assert!(compiled.sql.contains("DATE_TRUNC('month', \"DATE OCC\") AS \"period\""));
        assert!(compiled.sql.contains("ORDER BY \"period\" ASC"));
        assert_eq!(compiled.params, vec![date("2024-01-01"), date("2024-04-01")]);
        assert!(compiled.lineage.notes.contains("trend_grouping"));
    }

    #[test]
    fn panel_leads_keys_and_ordering() {
        let compiled = compile_json(
            r#"{"metrics": [{"name": "incidents"}], "group_by": ["crime_type"], "panel_by": "area"}"#,
        );
        assert!(compiled.sql.starts_with("SELECT \"AREA NAME\" AS \"area\", \"Crm Cd Desc\" AS \"crime_type\""));
        assert!(compiled.sql.contains("ORDER BY \"area\" ASC"));
    }

    #[test]
    fn filter_operators_render_with_binds() {
        let compiled = compile_json(
            r#"{"metrics": [{"name": "incidents"}], "filters": [
                {"field": "area", "operator": "in", "value": ["Hollywood", "Harbor", "%wood"]},
                {"field": "vict_age", "operator": "between", "value": [18, 30]},
                {"field": "crime_type", "operator": "like_any", "value": ["burglary", "%theft%"]},
                {"field": "month", "operator": "between", "value": ["2023-01-01", "2023-07-01"]}
            ]}"#,
        );
        assert!(compiled.sql.contains(
            "(\"AREA NAME\" IN (?, ?) OR LOWER(\"AREA NAME\") LIKE LOWER(?))"
        ));
        assert!(compiled.sql.contains("\"Vict Age\" BETWEEN ? AND ?"));
        assert!(compiled.sql.contains("\"DATE OCC\" >= ? AND \"DATE OCC\" < ?"));
        assert_eq!(compiled.params[5], BindValue::Text("%burglary%".into()));
        assert_eq!(compiled.params[7], date("2023-01-01"));
        assert_eq!(compiled.sql.matches('?').count(), compiled.params.len());
    }
}
