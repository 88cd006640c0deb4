//! Conversion of `EXPLAIN (FORMAT JSON)` output into normalized plan trees.

use std::fmt;

use serde::Deserialize;

use super::output::{ExplainPlanNode, ExplainPlanNodeDetails, JoinAlgorithm};
use crate::collector::sql::redact;

/// Plan JSON could not be turned into a tree.
#[derive(Debug)]
pub enum PlanError {
    Json(serde_json::Error),
    /// The top-level array held no plan.
    Empty,
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::Json(e) => write!(f, "failed to parse explain plan json: {}", e),
            PlanError::Empty => write!(f, "explain plan json contains no plan"),
        }
    }
}

impl std::error::Error for PlanError {}

#[derive(Debug, Deserialize)]
struct ExplainDocument {
    #[serde(rename = "Plan")]
    plan: PlanNode,
}

/// Native plan node. Fields the normalizer does not use are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PlanNode {
    #[serde(rename = "Node Type")]
    node_type: String,
    #[serde(rename = "Alias")]
    alias: String,
    #[serde(rename = "Partial Mode")]
    partial_mode: String,
    #[serde(rename = "Strategy")]
    strategy: String,
    #[serde(rename = "Parallel Aware")]
    parallel_aware: bool,
    #[serde(rename = "Join Type")]
    join_type: String,
    #[serde(rename = "Filter")]
    filter: String,
    #[serde(rename = "Total Cost")]
    total_cost: f64,
    #[serde(rename = "Plan Rows")]
    plan_rows: i64,
    #[serde(rename = "Group Key")]
    group_key: Vec<String>,
    #[serde(rename = "Sort Key")]
    sort_key: Vec<String>,
    #[serde(rename = "Index Name")]
    index_name: String,
    #[serde(rename = "Plans")]
    plans: Vec<PlanNode>,
}

/// Parses the JSON array returned by `EXPLAIN (FORMAT JSON)` and normalizes its plan.
///
/// Nesting deeper than `serde_json`'s recursion limit is rejected as a parse error.
pub fn normalize_plan(explain_json: &str) -> Result<ExplainPlanNode, PlanError> {
    let documents: Vec<ExplainDocument> =
        serde_json::from_str(explain_json).map_err(PlanError::Json)?;
    let document = documents.into_iter().next().ok_or(PlanError::Empty)?;
    Ok(document.plan.normalize())
}

/// Re-serializes native plan JSON with every string value passed through `redact`.
///
/// Object keys, numbers and booleans are kept, so costs and row estimates survive
/// while literals inside filters, index conditions and outputs do not.
pub fn redact_native_plan(explain_json: &str) -> Result<String, PlanError> {
    let mut value: serde_json::Value =
        serde_json::from_str(explain_json).map_err(PlanError::Json)?;
    redact_strings(&mut value);
    serde_json::to_string(&value).map_err(PlanError::Json)
}

fn redact_strings(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => *s = redact(s),
        serde_json::Value::Array(items) => items.iter_mut().for_each(redact_strings),
        serde_json::Value::Object(fields) => fields.values_mut().for_each(redact_strings),
        _ => {}
    }
}

impl PlanNode {
    fn normalize(&self) -> ExplainPlanNode {
        let details = ExplainPlanNodeDetails {
            estimated_rows: self.plan_rows,
            estimated_cost: self.exclusive_cost(),
            alias: non_blank(&self.alias),
            key_used: non_blank(&self.index_name),
            join_type: non_blank(&self.join_type),
            join_algorithm: self
                .node_type
                .eq_ignore_ascii_case("Hash Join")
                .then_some(JoinAlgorithm::Hash),
            condition: non_blank(&self.filter).map(|f| redact(&f)),
            group_by_keys: self.group_key.clone(),
            sort_keys: self.sort_key.clone(),
        };

        ExplainPlanNode {
            operation: self.operation(),
            details,
            children: self.plans.iter().map(PlanNode::normalize).collect(),
        }
    }

    /// `[Partial Mode] [Strategy] [Parallel] Node Type`
    fn operation(&self) -> String {
        let mut op = String::new();
        if !self.partial_mode.is_empty() {
            op.push_str(&self.partial_mode);
            op.push(' ');
        }
        match self.strategy.as_str() {
            "" | "Plain" => {}
            "Sorted" => op.push_str("Group "),
            other => {
                op.push_str(other);
                op.push(' ');
            }
        }
        if self.parallel_aware {
            op.push_str("Parallel ");
        }
        op.push_str(&self.node_type);
        op
    }

    /// Total cost minus the total cost of direct children, rounded to cents.
    fn exclusive_cost(&self) -> f64 {
        let children: f64 = self.plans.iter().map(|p| p.total_cost).sum();
        let cost = ((self.total_cost - children) * 100.0).round() / 100.0;
        // Also folds -0.0 into 0.0.
        if cost <= 0.0 { 0.0 } else { cost }
    }
}

fn non_blank(s: &str) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
