//! In-memory mock database for testing the explain engine without a server.
//!
//! `MockPg` is a [`ConnectionFactory`]; every connection it hands out shares
//! one scripted state, so a test keeps a clone of the factory to script
//! answers and inspect what the engine did.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::collector::pg::{ConnectionFactory, PgClient, PgCollectError, StatementRow};

/// Plan returned for every `EXPLAIN` unless a test overrides it.
pub const DEFAULT_PLAN_JSON: &str = r#"[
  {
    "Plan": {
      "Node Type": "Seq Scan",
      "Parallel Aware": false,
      "Relation Name": "some_table",
      "Alias": "some_table",
      "Startup Cost": 0.0,
      "Total Cost": 41.88,
      "Plan Rows": 11,
      "Plan Width": 36,
      "Filter": "(id = 42)"
    }
  }
]"#;

#[derive(Debug)]
struct MockState {
    statements: Vec<String>,
    connections: Vec<String>,
    closed: usize,
    rows: Vec<StatementRow>,
    stats_reset: i64,
    server_version: String,
    plan_json: Option<String>,
    connect_error: Option<String>,
    /// `(statement prefix, error message)`
    failures: Vec<(String, String)>,
    panic_prefix: Option<String>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            statements: Vec::new(),
            connections: Vec::new(),
            closed: 0,
            rows: Vec::new(),
            stats_reset: 0,
            server_version: "16.10 (Debian 16.10-1.pgdg13+1)".to_string(),
            plan_json: Some(DEFAULT_PLAN_JSON.to_string()),
            connect_error: None,
            failures: Vec::new(),
            panic_prefix: None,
        }
    }
}

/// Scripted PostgreSQL server.
#[derive(Debug, Clone, Default)]
pub struct MockPg {
    state: Arc<Mutex<MockState>>,
}

impl MockPg {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rows served for the candidate catalog query.
    pub fn set_rows(&self, rows: Vec<StatementRow>) {
        self.lock().rows = rows;
    }

    /// Global statistics reset, in epoch seconds.
    pub fn set_stats_reset(&self, epoch: i64) {
        self.lock().stats_reset = epoch;
    }

    pub fn set_server_version(&self, version: &str) {
        self.lock().server_version = version.to_string();
    }

    /// Result of `EXPLAIN`; `None` returns no row.
    pub fn set_plan_json(&self, json: Option<&str>) {
        self.lock().plan_json = json.map(str::to_string);
    }

    /// Makes every new connection fail with `message`; `None` restores it.
    pub fn set_connect_error(&self, message: Option<&str>) {
        self.lock().connect_error = message.map(str::to_string);
    }

    /// Fails every statement starting with `prefix`, ignoring leading whitespace.
    pub fn fail_on(&self, prefix: &str, message: &str) {
        self.lock()
            .failures
            .push((prefix.to_string(), message.to_string()));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Panics inside the client on every statement starting with `prefix`.
    pub fn panic_on(&self, prefix: &str) {
        self.lock().panic_prefix = Some(prefix.to_string());
    }

    /// Every statement run on any connection, in order.
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    /// Statements starting with `prefix`.
    pub fn statements_starting_with(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .statements
            .iter()
            .filter(|s| s.trim_start().starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear_statements(&self) {
        self.lock().statements.clear();
    }

    /// Connection strings of every successfully opened connection.
    pub fn connections(&self) -> Vec<String> {
        self.lock().connections.clone()
    }

    pub fn closed_connections(&self) -> usize {
        self.lock().closed
    }

    pub fn open_connections(&self) -> usize {
        let state = self.lock();
        state.connections.len() - state.closed
    }
}

impl ConnectionFactory for MockPg {
    fn connect(&self, connection_string: &str) -> Result<Box<dyn PgClient>, PgCollectError> {
        let mut state = self.lock();
        if let Some(message) = &state.connect_error {
            return Err(PgCollectError::ConnectionError(message.clone()));
        }
        state.connections.push(connection_string.to_string());
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

/// One open mock connection.
struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    /// Records `sql` and applies scripted failures.
    fn run(&self, sql: &str) -> Result<MutexGuard<'_, MockState>, PgCollectError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.statements.push(sql.to_string());

        let panics = state
            .panic_prefix
            .as_deref()
            .is_some_and(|prefix| sql.starts_with(prefix));
        if panics {
            drop(state);
            panic!("mock connection panicked on: {}", sql);
        }

        if let Some((_, message)) = state
            .failures
            .iter()
            .find(|(prefix, _)| sql.trim_start().starts_with(prefix.as_str()))
        {
            return Err(PgCollectError::QueryError(message.clone()));
        }
        Ok(state)
    }
}

impl PgClient for MockConnection {
    fn execute(&mut self, sql: &str) -> Result<(), PgCollectError> {
        self.run(sql).map(|_| ())
    }

    fn query_text(&mut self, sql: &str) -> Result<Option<String>, PgCollectError> {
        let state = self.run(sql)?;
        if sql.starts_with("EXPLAIN") {
            Ok(state.plan_json.clone())
        } else if sql.eq_ignore_ascii_case("SHOW server_version") {
            Ok(Some(state.server_version.clone()))
        } else {
            Ok(None)
        }
    }

    fn query_epoch(&mut self, sql: &str) -> Result<i64, PgCollectError> {
        Ok(self.run(sql)?.stats_reset)
    }

    fn query_statements(&mut self, sql: &str) -> Result<Vec<StatementRow>, PgCollectError> {
        Ok(self.run(sql)?.rows.clone())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed += 1;
    }
}

/// Catalog row with `stats_since` left at zero.
pub fn statement_row(datname: &str, queryid: &str, query: &str, calls: i64) -> StatementRow {
    StatementRow {
        datname: datname.to_string(),
        queryid: queryid.to_string(),
        query: query.to_string(),
        calls,
        stats_since: 0,
    }
}
