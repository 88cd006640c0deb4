//! Per-candidate PREPARE / EXPLAIN / DEALLOCATE protocol.
//!
//! Each candidate gets its own connection to the database the query ran in.
//! The prepared statement is deallocated and the connection closed on every
//! exit path, including errors.

use std::fmt;

use tracing::{debug, error};

use super::cache::QueryCandidate;
use super::plan::PlanError;
use super::queries::{build_explain_statement, count_parameters, prepared_statement_name};
use crate::collector::pg::{ConnectionFactory, PgClient, PgCollectError, replace_dbname};

/// Error texts after which a query is never attempted again.
const UNRECOVERABLE_ERRORS: &[&str] = &[
    "permission denied",
    "pg_hba.conf rejects connection for host",
    "syntax error",
];

/// Failure of one capture attempt.
#[derive(Debug)]
pub enum AttemptError {
    Dsn(PgCollectError),
    Connect(PgCollectError),
    Prepare(PgCollectError),
    SearchPath(PgCollectError),
    PlanCacheMode(PgCollectError),
    Explain(PgCollectError),
    EmptyPlan,
    Plan(PlanError),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Dsn(e) => write!(f, "failed to replace database name in DSN: {}", e),
            AttemptError::Connect(e) => write!(f, "failed to get connection: {}", e),
            AttemptError::Prepare(e) => write!(f, "failed to prepare explain plan: {}", e),
            AttemptError::SearchPath(e) => write!(f, "failed to set search path: {}", e),
            AttemptError::PlanCacheMode(e) => write!(f, "failed to set plan cache mode: {}", e),
            AttemptError::Explain(e) => write!(f, "failed to run explain plan: {}", e),
            AttemptError::EmptyPlan => write!(f, "explain plan json is empty"),
            AttemptError::Plan(e) => write!(f, "failed to create explain plan output: {}", e),
        }
    }
}

impl std::error::Error for AttemptError {}

impl AttemptError {
    /// Recoverable failures leave the query eligible once its `calls` move.
    pub fn is_recoverable(&self) -> bool {
        match self {
            AttemptError::EmptyPlan | AttemptError::Plan(_) => false,
            other => {
                let msg = other.to_string();
                !UNRECOVERABLE_ERRORS.iter().any(|code| msg.contains(code))
            }
        }
    }
}

/// A prepared statement that is deallocated when dropped.
struct PreparedStatement<'a> {
    conn: &'a mut Box<dyn PgClient>,
    name: String,
}

impl<'a> PreparedStatement<'a> {
    fn prepare(
        conn: &'a mut Box<dyn PgClient>,
        name: String,
        query_text: &str,
    ) -> Result<Self, PgCollectError> {
        conn.execute(&format!("PREPARE {} AS {}", name, query_text))?;
        Ok(Self { conn, name })
    }
}

impl Drop for PreparedStatement<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.conn.execute(&format!("DEALLOCATE {}", self.name)) {
            error!(statement = %self.name, error = %e, "failed to deallocate explain plan");
        }
    }
}

/// Runs the explain protocol for `candidate` and returns the raw plan JSON.
pub(crate) fn fetch_explain_plan_json(
    factory: &dyn ConnectionFactory,
    base_connection_string: &str,
    candidate: &QueryCandidate,
) -> Result<String, AttemptError> {
    let connection_string =
        replace_dbname(base_connection_string, &candidate.datname).map_err(AttemptError::Dsn)?;
    let mut conn = factory
        .connect(&connection_string)
        .map_err(AttemptError::Connect)?;

    let name = prepared_statement_name(&candidate.queryid);
    debug!(
        query_id = %candidate.queryid,
        datname = %candidate.datname,
        statement = %name,
        "preparing explain plan"
    );
    let statement = PreparedStatement::prepare(&mut conn, name, &candidate.query_text)
        .map_err(AttemptError::Prepare)?;

    statement
        .conn
        .execute(&format!("SET search_path TO {}, public", candidate.datname))
        .map_err(AttemptError::SearchPath)?;

    statement
        .conn
        .execute("SET plan_cache_mode = force_generic_plan")
        .map_err(AttemptError::PlanCacheMode)?;

    let explain = build_explain_statement(
        &statement.name,
        count_parameters(&candidate.query_text),
    );
    let json = statement
        .conn
        .query_text(&explain)
        .map_err(AttemptError::Explain)?;

    match json {
        Some(json) if !json.trim().is_empty() => Ok(json),
        _ => Err(AttemptError::EmptyPlan),
    }
}
