//! Explain plan output record and its log line encoding.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::sink::{EntrySink, LogEntry};

/// Log operation label of every emitted record.
pub const OP_EXPLAIN_PLAN_OUTPUT: &str = "explain_plan_output";

/// Engine name reported in every record.
pub const DATABASE_ENGINE: &str = "PostgreSQL";

/// Outcome of one capture attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingResult {
    Success,
    Skipped,
    Error,
}

/// Join implementation recognized in a plan node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinAlgorithm {
    Hash,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainPlanNodeDetails {
    pub estimated_rows: i64,
    /// Cost of this node alone, excluding its children. Never negative.
    pub estimated_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Index used by the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_algorithm: Option<JoinAlgorithm>,
    /// Filter expression with literals redacted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort_keys: Vec<String>,
}

/// Normalized plan tree node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExplainPlanNode {
    pub operation: String,
    pub details: ExplainPlanNodeDetails,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ExplainPlanNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainPlanMetadata {
    pub database_engine: String,
    pub database_version: String,
    pub query_identifier: String,
    /// RFC 3339 timestamp of the fetch cycle.
    pub generated_at: String,
    pub processing_result: ProcessingResult,
    pub processing_result_reason: String,
}

/// One record per capture attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainPlanOutput {
    pub metadata: ExplainPlanMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<ExplainPlanNode>,
}

impl ExplainPlanOutput {
    /// Encodes the record as the single log line emitted for it:
    /// `schema="<db>" digest="<query id>" explain_plan_output="<base64 json>"`.
    pub fn to_log_line(&self, schema: &str) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(format!(
            r#"schema="{}" digest="{}" explain_plan_output="{}""#,
            schema,
            self.metadata.query_identifier,
            STANDARD.encode(json)
        ))
    }

    /// Decodes the `explain_plan_output` field of an emitted log line.
    pub fn from_log_line(line: &str) -> Result<Self, String> {
        const KEY: &str = "explain_plan_output=\"";
        let start = line
            .find(KEY)
            .map(|pos| pos + KEY.len())
            .ok_or_else(|| "explain_plan_output field not found".to_string())?;
        let end = line[start..]
            .find('"')
            .map(|pos| start + pos)
            .ok_or_else(|| "unterminated explain_plan_output field".to_string())?;

        let decoded = STANDARD
            .decode(&line[start..end])
            .map_err(|e| format!("failed to decode base64 explain plan output: {}", e))?;
        serde_json::from_slice(&decoded)
            .map_err(|e| format!("failed to unmarshal explain plan output: {}", e))
    }
}

/// Builds and emits the output record of one capture attempt.
pub(crate) struct OutcomeRouter<'a> {
    pub database_version: &'a str,
    pub generated_at: &'a str,
    pub sink: &'a dyn EntrySink,
}

impl OutcomeRouter<'_> {
    pub fn emit(
        &self,
        datname: &str,
        query_id: &str,
        result: ProcessingResult,
        reason: &str,
        plan: Option<ExplainPlanNode>,
    ) -> Result<(), serde_json::Error> {
        let output = ExplainPlanOutput {
            metadata: ExplainPlanMetadata {
                database_engine: DATABASE_ENGINE.to_string(),
                database_version: self.database_version.to_string(),
                query_identifier: query_id.to_string(),
                generated_at: self.generated_at.to_string(),
                processing_result: result,
                processing_result_reason: reason.to_string(),
            },
            plan,
        };

        let line = output.to_log_line(datname)?;
        self.sink
            .emit(LogEntry::info(OP_EXPLAIN_PLAN_OUTPUT, line));
        Ok(())
    }
}
