//! Lineage metadata attached to every compiled statement.
//!
//! Serialization goes through `serde_json::Value`, whose object map keeps
//! keys sorted, so the same plan always produces byte-identical lineage.

use crate::error::Result;
use crate::nql::model::PlanVersion;
use crate::nql::validator::{PlanShape, ValidatedPlan};
use crate::time_range::TimeRange;
use serde::Serialize;
use std::collections::BTreeSet;

/// A filter value the canonical store rewrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalizedValue {
    pub field: String,
    pub original: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lineage {
    /// The validated plan, echoed back.
    pub plan: serde_json::Value,
    pub version: PlanVersion,
    pub shape: PlanShape,
    pub time_window: Option<TimeRange>,
    pub baseline_window: Option<TimeRange>,
    pub limit_requested: i64,
    pub limit_applied: i64,
    pub canonicalized: Vec<CanonicalizedValue>,
    pub small_n_suppressed: bool,
    pub approximate: bool,
    pub notes: BTreeSet<String>,
}

impl Lineage {
    pub fn for_plan(plan: &ValidatedPlan) -> Result<Self> {
        Ok(Self {
            plan: serde_json::to_value(plan.plan())?,
            version: plan.version(),
            shape: plan.shape(),
            time_window: None,
            baseline_window: None,
            limit_requested: plan.plan().limit,
            limit_applied: plan.plan().limit,
            canonicalized: Vec::new(),
            small_n_suppressed: false,
            approximate: false,
            notes: plan.notes().clone(),
        })
    }

    pub fn note(&mut self, note: &str) {
        self.notes.insert(note.to_string());
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_value()?)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_value()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nql::model::{MetricSpec, QueryPlan};
    use crate::nql::validator::PlanValidator;
    use crate::semantic::load_from_json;

    #[test]
    fn keys_are_sorted_at_every_level() {
        let model = load_from_json(include_str!("../../demos/semantic.json")).unwrap();
        let mut plan = QueryPlan::new(vec![MetricSpec::new("incidents")]);
        plan.group_by = vec!["area".to_string()];
        let validated = PlanValidator::new(model.as_ref()).validate(plan).unwrap();
        let lineage = Lineage::for_plan(&validated).unwrap();

        let json = lineage.to_json().unwrap();
        let approximate = json.find("\"approximate\"").unwrap();
        let version = json.find("\"version\"").unwrap();
        assert!(approximate < version);

        let echo = json.find("\"plan\"").unwrap();
        let group_by = json[echo..].find("\"group_by\"").unwrap();
        let metrics = json[echo..].find("\"metrics\"").unwrap();
        assert!(group_by < metrics);
        assert_eq!(json, lineage.to_json().unwrap());
    }
}
