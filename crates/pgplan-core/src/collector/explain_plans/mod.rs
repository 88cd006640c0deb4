//! Adaptive EXPLAIN plan sampling.
//!
//! Each tick the collector drains a batch of candidate queries taken from
//! `pg_stat_statements`, captures a generic plan for each one on a dedicated
//! connection, and emits one `explain_plan_output` record per attempt.
//!
//! # Cycle
//!
//! ```text
//! tick ─┬─ active set empty? ── refresh from catalog (denylisted → "query denylisted")
//!       │
//!       └─ up to batch_size candidates:
//!            validate ─► PREPARE / SET / EXPLAIN / DEALLOCATE ─► normalize ─► emit
//!                                                                    │
//!                                              finished set ◄── classify ──► denylist
//! ```
//!
//! A finished query is attempted again only once its `calls` counter moves,
//! so transient failures are not retried on the very next tick.

mod cache;
mod executor;
mod output;
mod plan;
mod queries;
mod validate;

pub use cache::{CacheState, Disposition, QueryCache, QueryCandidate, QueryKey};
pub use executor::AttemptError;
pub use output::{
    DATABASE_ENGINE, ExplainPlanMetadata, ExplainPlanNode, ExplainPlanNodeDetails,
    ExplainPlanOutput, JoinAlgorithm, OP_EXPLAIN_PLAN_OUTPUT, ProcessingResult,
};
pub use plan::{PlanError, normalize_plan, redact_native_plan};

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{SecondsFormat, Utc};
use tracing::{Level, debug, error, info, warn};

use crate::collector::pg::{ConnectionFactory, PgClient, PgCollectError, StatementRow};
use crate::collector::version::{ServerVersion, VersionError};
use crate::sink::EntrySink;
use cache::RefreshAction;
use executor::fetch_explain_plan_json;
use output::OutcomeRouter;
use queries::{SELECT_STATS_RESET, build_explain_candidates_query};
use validate::{Validation, validate_query};

pub const COLLECTOR_NAME: &str = "explain_plans";

const DEFAULT_SCRAPE_INTERVAL: Duration = Duration::from_secs(60);

/// Explain collector settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ExplainPlansConfig {
    pub scrape_interval: Duration,
    /// Share of the active set processed per tick, `0.0..=1.0`.
    pub per_scrape_ratio: f64,
    pub exclude_databases: Vec<String>,
    /// Base libpq connection string; the database name is replaced per query.
    pub connection_string: String,
    /// Server version as reported by `SHOW server_version`.
    pub db_version: String,
}

impl Default for ExplainPlansConfig {
    fn default() -> Self {
        Self {
            scrape_interval: DEFAULT_SCRAPE_INTERVAL,
            per_scrape_ratio: 1.0,
            exclude_databases: Vec::new(),
            connection_string: String::new(),
            db_version: String::new(),
        }
    }
}

impl ExplainPlansConfig {
    pub fn new(connection_string: impl Into<String>, db_version: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            db_version: db_version.into(),
            ..Self::default()
        }
    }

    pub fn with_scrape_interval(mut self, interval: Duration) -> Self {
        self.scrape_interval = interval;
        self
    }

    pub fn with_per_scrape_ratio(mut self, ratio: f64) -> Self {
        self.per_scrape_ratio = ratio;
        self
    }

    pub fn with_exclude_databases(mut self, databases: Vec<String>) -> Self {
        self.exclude_databases = databases;
        self
    }

    fn validate(&self) -> Result<(), ExplainPlansError> {
        if !(0.0..=1.0).contains(&self.per_scrape_ratio) {
            return Err(ExplainPlansError::InvalidConfig(format!(
                "per_scrape_ratio must be within [0, 1], got {}",
                self.per_scrape_ratio
            )));
        }
        if self.scrape_interval.is_zero() {
            return Err(ExplainPlansError::InvalidConfig(
                "scrape_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Error type for the explain collector.
#[derive(Debug)]
pub enum ExplainPlansError {
    /// Server version string has no `major.minor` prefix.
    InvalidVersion(VersionError),
    InvalidConfig(String),
    /// Candidate catalog could not be read; retried next tick.
    Catalog(PgCollectError),
}

impl fmt::Display for ExplainPlansError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExplainPlansError::InvalidVersion(e) => write!(f, "{}", e),
            ExplainPlansError::InvalidConfig(msg) => {
                write!(f, "invalid explain plans config: {}", msg)
            }
            ExplainPlansError::Catalog(e) => {
                write!(f, "failed to fetch explain plan candidates: {}", e)
            }
        }
    }
}

impl std::error::Error for ExplainPlansError {}

/// Result of one capture attempt, before it is emitted.
#[derive(Debug)]
pub(crate) enum AttemptOutcome {
    Explained(ExplainPlanNode),
    Skipped(&'static str),
    /// The keyword check itself failed.
    Rejected(String),
    Failed(AttemptError),
    Panicked(String),
}

/// Cache transition for an attempt outcome.
pub(crate) fn classify(outcome: &AttemptOutcome) -> Disposition {
    match outcome {
        AttemptOutcome::Failed(e) if !e.is_recoverable() => Disposition::Denylisted,
        AttemptOutcome::Panicked(_) => Disposition::Denylisted,
        _ => Disposition::Finished,
    }
}

fn batch_size(active: usize, ratio: f64) -> usize {
    (active as f64 * ratio).ceil() as usize
}

/// Adaptive explain plan collector.
///
/// All cache state is owned by the collector and touched by one thread only.
pub struct ExplainPlansCollector {
    config: ExplainPlansConfig,
    version: ServerVersion,
    database_version: String,
    factory: Box<dyn ConnectionFactory>,
    /// Catalog connection; reconnected lazily after a failure.
    main_conn: Option<Box<dyn PgClient>>,
    cache: QueryCache,
    batch_size: usize,
}

impl ExplainPlansCollector {
    pub fn new(
        config: ExplainPlansConfig,
        factory: Box<dyn ConnectionFactory>,
    ) -> Result<Self, ExplainPlansError> {
        let version =
            ServerVersion::parse(&config.db_version).map_err(ExplainPlansError::InvalidVersion)?;
        config.validate()?;

        Ok(Self {
            database_version: version.to_string(),
            version,
            config,
            factory,
            main_conn: None,
            cache: QueryCache::new(),
            batch_size: 0,
        })
    }

    pub fn name(&self) -> &'static str {
        COLLECTOR_NAME
    }

    pub fn config(&self) -> &ExplainPlansConfig {
        &self.config
    }

    /// Normalized version reported in output records, e.g. `16.10.0`.
    pub fn database_version(&self) -> &str {
        &self.database_version
    }

    /// Candidates processed per tick, as computed by the last refresh.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Runs one tick: refreshes the active set if it is empty, then processes
    /// up to `batch_size` candidates.
    ///
    /// `running` is checked between candidates; an in-flight attempt is never
    /// interrupted.
    pub fn fetch_explain_plans(
        &mut self,
        sink: &dyn EntrySink,
        running: &AtomicBool,
    ) -> Result<(), ExplainPlansError> {
        let generated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let database_version = self.database_version.clone();
        let router = OutcomeRouter {
            database_version: &database_version,
            generated_at: &generated_at,
            sink,
        };

        if self.cache.active_len() == 0 {
            self.populate_query_cache(&router)?;
        }

        let mut processed = 0;
        while processed < self.batch_size {
            if !running.load(Ordering::SeqCst) {
                debug!(processed, "explain cycle interrupted");
                break;
            }
            let Some(candidate) = self.cache.pop_active() else {
                break;
            };
            processed += 1;

            let outcome = self.attempt(&candidate);
            let disposition = route(&router, &candidate, outcome);
            self.cache.settle(candidate, disposition);
        }

        debug!(
            processed,
            active = self.cache.active_len(),
            finished = self.cache.finished_len(),
            denylisted = self.cache.denylisted_len(),
            "explain cycle complete"
        );
        Ok(())
    }

    /// Refills the active set from `pg_stat_statements`.
    fn populate_query_cache(&mut self, router: &OutcomeRouter<'_>) -> Result<(), ExplainPlansError> {
        let (rows, global_reset) = match self.fetch_candidates() {
            Ok(fetched) => fetched,
            Err(e) => {
                self.main_conn = None;
                return Err(ExplainPlansError::Catalog(e));
            }
        };

        for row in rows {
            let candidate = QueryCandidate {
                stats_reset: global_reset.unwrap_or(row.stats_since),
                datname: row.datname,
                queryid: row.queryid,
                query_text: row.query,
                calls: row.calls,
                failure_count: 0,
            };

            match self.cache.refresh_action(&candidate) {
                RefreshAction::Enqueue => {
                    self.cache.enqueue(candidate);
                }
                RefreshAction::ReportDenylisted => {
                    if let Err(e) = router.emit(
                        &candidate.datname,
                        &candidate.queryid,
                        ProcessingResult::Skipped,
                        "query denylisted",
                        None,
                    ) {
                        warn!(query_id = %candidate.queryid, error = %e, "failed to emit explain plan output");
                    }
                }
                RefreshAction::Ignore => {}
            }
        }

        self.batch_size = batch_size(self.cache.active_len(), self.config.per_scrape_ratio);
        debug!(
            active = self.cache.active_len(),
            batch_size = self.batch_size,
            "explain candidates refreshed"
        );
        Ok(())
    }

    /// Catalog rows plus the global stats reset on servers without `stats_since`.
    fn fetch_candidates(&mut self) -> Result<(Vec<StatementRow>, Option<i64>), PgCollectError> {
        let conn = match self.main_conn.take() {
            Some(conn) => conn,
            None => self.factory.connect(&self.config.connection_string)?,
        };
        let conn = self.main_conn.insert(conn);

        let global_reset = if self.version.has_stats_since() {
            None
        } else {
            Some(conn.query_epoch(SELECT_STATS_RESET)?)
        };
        let query = build_explain_candidates_query(self.version, &self.config.exclude_databases);
        let rows = conn.query_statements(&query)?;
        Ok((rows, global_reset))
    }

    /// Runs one attempt, turning a panic into an outcome.
    fn attempt(&self, candidate: &QueryCandidate) -> AttemptOutcome {
        catch_unwind(AssertUnwindSafe(|| self.explain(candidate)))
            .unwrap_or_else(|payload| AttemptOutcome::Panicked(panic_message(payload.as_ref())))
    }

    fn explain(&self, candidate: &QueryCandidate) -> AttemptOutcome {
        match validate_query(&candidate.query_text) {
            Validation::Explainable => {}
            Validation::Skip(reason) => return AttemptOutcome::Skipped(reason),
            Validation::Error(reason) => return AttemptOutcome::Rejected(reason),
        }

        let json = match fetch_explain_plan_json(
            self.factory.as_ref(),
            &self.config.connection_string,
            candidate,
        ) {
            Ok(json) => json,
            Err(e) => return AttemptOutcome::Failed(e),
        };

        if tracing::enabled!(Level::DEBUG)
            && let Ok(native) = redact_native_plan(&json)
        {
            debug!(
                query_id = %candidate.queryid,
                datname = %candidate.datname,
                db_native_explain_plan = %STANDARD.encode(native),
                "captured explain plan"
            );
        }

        match normalize_plan(&json) {
            Ok(plan) => AttemptOutcome::Explained(plan),
            Err(e) => AttemptOutcome::Failed(AttemptError::Plan(e)),
        }
    }

    /// Runs the collector on its own thread, one tick per `scrape_interval`.
    pub fn start(self, sink: Box<dyn EntrySink>) -> CollectorHandle {
        let running = Arc::new(AtomicBool::new(true));
        let stopped = Arc::new(AtomicBool::new(false));

        let thread = {
            let running = Arc::clone(&running);
            let stopped = Arc::clone(&stopped);
            std::thread::spawn(move || self.run(sink.as_ref(), &running, stopped))
        };

        CollectorHandle {
            running,
            stopped,
            thread,
        }
    }

    fn run(mut self, sink: &dyn EntrySink, running: &AtomicBool, stopped: Arc<AtomicBool>) {
        let _exit = MarkStopped(stopped);
        info!(
            collector = COLLECTOR_NAME,
            interval_secs = self.config.scrape_interval.as_secs(),
            ratio = self.config.per_scrape_ratio,
            "collector started"
        );

        while running.load(Ordering::SeqCst) {
            if let Err(e) = self.fetch_explain_plans(sink, running) {
                error!(collector = COLLECTOR_NAME, error = %e, "explain cycle failed");
            }

            // Sleep with periodic checks for shutdown signal
            let sleep_interval = Duration::from_millis(100);
            let mut remaining = self.config.scrape_interval;
            while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
                let sleep_time = remaining.min(sleep_interval);
                std::thread::sleep(sleep_time);
                remaining = remaining.saturating_sub(sleep_time);
            }
        }

        info!(collector = COLLECTOR_NAME, "collector stopped");
    }
}

/// Emits the record for `outcome` and returns the cache transition.
fn route(
    router: &OutcomeRouter<'_>,
    candidate: &QueryCandidate,
    outcome: AttemptOutcome,
) -> Disposition {
    let disposition = classify(&outcome);
    let (datname, query_id) = (candidate.datname.as_str(), candidate.queryid.as_str());

    let emitted = match outcome {
        AttemptOutcome::Explained(plan) => {
            router.emit(datname, query_id, ProcessingResult::Success, "", Some(plan))
        }
        AttemptOutcome::Skipped(reason) => {
            debug!(query_id, datname, reason, "explain plan skipped");
            router.emit(datname, query_id, ProcessingResult::Skipped, reason, None)
        }
        AttemptOutcome::Rejected(reason) => {
            warn!(query_id, datname, error = %reason, "explain plan validation failed");
            router.emit(datname, query_id, ProcessingResult::Error, &reason, None)
        }
        AttemptOutcome::Failed(e) => {
            warn!(
                query_id,
                datname,
                recoverable = e.is_recoverable(),
                error = %e,
                "explain plan failed"
            );
            router.emit(datname, query_id, ProcessingResult::Error, &e.to_string(), None)
        }
        AttemptOutcome::Panicked(msg) => {
            error!(query_id, datname, panic = %msg, "explain plan attempt panicked");
            let reason = format!("panic while explaining query: {}", msg);
            router.emit(datname, query_id, ProcessingResult::Error, &reason, None)
        }
    };

    match emitted {
        Ok(()) => disposition,
        Err(e) => {
            error!(query_id, datname, error = %e, "failed to encode explain plan output");
            Disposition::Denylisted
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Sets the flag when the collector thread exits, however it exits.
struct MarkStopped(Arc<AtomicBool>);

impl Drop for MarkStopped {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Control handle of a started collector.
pub struct CollectorHandle {
    running: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl CollectorHandle {
    /// Asks the collector to stop after the current candidate. Safe to call
    /// any number of times.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// True once the collector loop has exited.
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Flag the collector polls; storing `false` stops it.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Waits for the collector thread to exit.
    pub fn join(self) {
        if self.thread.join().is_err() {
            error!(collector = COLLECTOR_NAME, "collector thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::{MockPg, statement_row};
    use crate::sink::LogEntry;
    use std::sync::mpsc::{Receiver, sync_channel};

    const BASE_CONN: &str = "host=localhost user=app dbname=postgres";
    const PG16: &str = "16.10 (Debian 16.10-1.pgdg13+1)";
    const PG17: &str = "17.7 - Percona Server for PostgreSQL 17.7.1";

    fn collector(mock: &MockPg, config: ExplainPlansConfig) -> ExplainPlansCollector {
        ExplainPlansCollector::new(config, Box::new(mock.clone())).unwrap()
    }

    fn tick(collector: &mut ExplainPlansCollector, tx: &dyn EntrySink) {
        let running = AtomicBool::new(true);
        collector.fetch_explain_plans(tx, &running).unwrap();
    }

    fn drain(rx: &Receiver<LogEntry>) -> Vec<ExplainPlanOutput> {
        rx.try_iter()
            .map(|entry| {
                assert_eq!(entry.op, OP_EXPLAIN_PLAN_OUTPUT);
                ExplainPlanOutput::from_log_line(&entry.line).unwrap()
            })
            .collect()
    }

    #[test]
    fn end_to_end_success() {
        let mock = MockPg::new();
        mock.set_rows(vec![statement_row(
            "testdb",
            "123456",
            "select * from some_table where id = 42",
            5,
        )]);
        let (tx, rx) = sync_channel(64);
        let mut c = collector(&mock, ExplainPlansConfig::new(BASE_CONN, PG16));

        tick(&mut c, &tx);

        let entries: Vec<LogEntry> = rx.try_iter().collect();
        assert_eq!(entries.len(), 1);
        assert!(
            entries[0]
                .line
                .starts_with(r#"schema="testdb" digest="123456" explain_plan_output=""#)
        );

        let output = ExplainPlanOutput::from_log_line(&entries[0].line).unwrap();
        assert_eq!(output.metadata.database_engine, "PostgreSQL");
        assert_eq!(output.metadata.database_version, "16.10.0");
        assert_eq!(output.metadata.query_identifier, "123456");
        assert_eq!(output.metadata.processing_result, ProcessingResult::Success);
        assert_eq!(output.metadata.processing_result_reason, "");
        assert!(chrono::DateTime::parse_from_rfc3339(&output.metadata.generated_at).is_ok());

        let plan = output.plan.unwrap();
        assert_eq!(plan.operation, "Seq Scan");
        assert_eq!(plan.details.estimated_rows, 11);
        assert_eq!(plan.details.estimated_cost, 41.88);
        assert_eq!(plan.details.condition.as_deref(), Some("(id = ?)"));

        let protocol: Vec<String> = mock
            .statements()
            .into_iter()
            .filter(|s| {
                ["PREPARE", "SET", "EXPLAIN", "DEALLOCATE"]
                    .iter()
                    .any(|p| s.starts_with(p))
            })
            .collect();
        assert_eq!(
            protocol,
            vec![
                "PREPARE explain_plan_123456 AS select * from some_table where id = 42",
                "SET search_path TO testdb, public",
                "SET plan_cache_mode = force_generic_plan",
                "EXPLAIN (FORMAT JSON) EXECUTE explain_plan_123456",
                "DEALLOCATE explain_plan_123456",
            ]
        );

        assert_eq!(
            mock.connections(),
            vec![
                BASE_CONN.to_string(),
                "host=localhost user=app dbname=testdb".to_string()
            ]
        );
        // Main connection stays open, the dedicated one is closed.
        assert_eq!(mock.open_connections(), 1);
        assert_eq!(mock.closed_connections(), 1);
        assert_eq!(
            c.cache().state(&QueryKey {
                datname: "testdb".to_string(),
                queryid: "123456".to_string()
            }),
            Some(CacheState::Finished)
        );
    }

    #[test]
    fn pre_17_reads_global_stats_reset() {
        let mock = MockPg::new();
        let (tx, _rx) = sync_channel(64);
        let mut c = collector(&mock, ExplainPlansConfig::new(BASE_CONN, PG16));
        tick(&mut c, &tx);

        let statements = mock.statements();
        assert_eq!(statements[0], SELECT_STATS_RESET);
        assert!(statements[1].contains("0::bigint as stats_since"));
    }

    #[test]
    fn pg_17_uses_stats_since_column() {
        let mock = MockPg::new();
        let (tx, _rx) = sync_channel(64);
        let mut c = collector(&mock, ExplainPlansConfig::new(BASE_CONN, PG17));
        assert_eq!(c.database_version(), "17.7.0");
        tick(&mut c, &tx);

        let statements = mock.statements();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].contains("s.stats_since"));
    }

    #[test]
    fn excluded_databases_reach_catalog_query() {
        let mock = MockPg::new();
        let (tx, _rx) = sync_channel(64);
        let config = ExplainPlansConfig::new(BASE_CONN, PG17)
            .with_exclude_databases(vec!["excluded_db".to_string()]);
        let mut c = collector(&mock, config);
        tick(&mut c, &tx);

        let catalog = &mock.statements()[0];
        assert!(catalog.contains("'excluded_db'"));
        assert!(catalog.contains("'rdsadmin'"));
    }

    #[test]
    fn unchanged_calls_are_not_requeued() {
        let mock = MockPg::new();
        mock.set_rows(vec![statement_row("testdb", "1", "select 1", 10)]);
        let (tx, rx) = sync_channel(64);
        let mut c = collector(&mock, ExplainPlansConfig::new(BASE_CONN, PG16));

        tick(&mut c, &tx);
        assert_eq!(drain(&rx).len(), 1);

        mock.clear_statements();
        tick(&mut c, &tx);
        assert!(drain(&rx).is_empty());
        assert!(mock.statements_starting_with("PREPARE").is_empty());
        assert_eq!(c.cache().finished_len(), 1);
        assert_eq!(c.batch_size(), 0);
    }

    #[test]
    fn increased_calls_are_requeued() {
        let mock = MockPg::new();
        mock.set_rows(vec![statement_row("testdb", "1", "select 1", 10)]);
        let (tx, rx) = sync_channel(64);
        let mut c = collector(&mock, ExplainPlansConfig::new(BASE_CONN, PG16));
        tick(&mut c, &tx);
        drain(&rx);

        mock.set_rows(vec![statement_row("testdb", "1", "select 1", 11)]);
        tick(&mut c, &tx);
        let outputs = drain(&rx);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].metadata.processing_result, ProcessingResult::Success);
    }

    #[test]
    fn decreased_calls_need_newer_reset() {
        let mock = MockPg::new();
        mock.set_stats_reset(1_000);
        mock.set_rows(vec![statement_row("testdb", "1", "select 1", 10)]);
        let (tx, rx) = sync_channel(64);
        let mut c = collector(&mock, ExplainPlansConfig::new(BASE_CONN, PG16));
        tick(&mut c, &tx);
        drain(&rx);

        // Same reset time: treated as not yet reset.
        mock.set_rows(vec![statement_row("testdb", "1", "select 1", 3)]);
        mock.clear_statements();
        tick(&mut c, &tx);
        assert!(drain(&rx).is_empty());
        assert!(mock.statements_starting_with("PREPARE").is_empty());

        mock.set_stats_reset(2_000);
        tick(&mut c, &tx);
        assert_eq!(drain(&rx).len(), 1);
        assert_eq!(mock.statements_starting_with("PREPARE").len(), 1);
    }

    #[test]
    fn decreased_calls_use_per_statement_stats_since_on_17() {
        let mock = MockPg::new();
        let mut row = statement_row("testdb", "1", "select 1", 10);
        row.stats_since = 500;
        mock.set_rows(vec![row.clone()]);
        let (tx, rx) = sync_channel(64);
        let mut c = collector(&mock, ExplainPlansConfig::new(BASE_CONN, PG17));
        tick(&mut c, &tx);
        drain(&rx);

        row.calls = 2;
        mock.set_rows(vec![row.clone()]);
        tick(&mut c, &tx);
        assert!(drain(&rx).is_empty());

        row.stats_since = 501;
        mock.set_rows(vec![row]);
        tick(&mut c, &tx);
        assert_eq!(drain(&rx).len(), 1);
    }

    #[test]
    fn batch_size_limits_each_tick() {
        let mock = MockPg::new();
        mock.set_rows(
            (1..=5)
                .map(|i| statement_row("testdb", &i.to_string(), "select 1", 1))
                .collect(),
        );
        let (tx, rx) = sync_channel(64);
        let config = ExplainPlansConfig::new(BASE_CONN, PG16).with_per_scrape_ratio(0.5);
        let mut c = collector(&mock, config);

        tick(&mut c, &tx);
        assert_eq!(c.batch_size(), 3);
        assert_eq!(drain(&rx).len(), 3);
        assert_eq!(c.cache().active_len(), 2);

        // Remaining candidates are drained without touching the catalog.
        mock.clear_statements();
        tick(&mut c, &tx);
        assert_eq!(drain(&rx).len(), 2);
        assert!(
            mock.statements()
                .iter()
                .all(|s| !s.contains("pg_stat_statements"))
        );
        assert_eq!(c.cache().active_len(), 0);
        assert_eq!(c.cache().finished_len(), 5);
    }

    #[test]
    fn batch_size_rounds_up() {
        assert_eq!(batch_size(3, 0.34), 2);
        assert_eq!(batch_size(10, 1.0), 10);
        assert_eq!(batch_size(10, 0.0), 0);
        assert_eq!(batch_size(0, 0.5), 0);
        assert_eq!(batch_size(1, 0.01), 1);
    }

    #[test]
    fn duplicate_rows_are_explained_once() {
        let mock = MockPg::new();
        mock.set_rows(vec![
            statement_row("testdb", "1", "select 1", 3),
            statement_row("testdb", "1", "select 1", 7),
        ]);
        let (tx, rx) = sync_channel(64);
        let mut c = collector(&mock, ExplainPlansConfig::new(BASE_CONN, PG16));

        tick(&mut c, &tx);
        assert_eq!(drain(&rx).len(), 1);

        // The last row observed wins.
        mock.set_rows(vec![statement_row("testdb", "1", "select 1", 7)]);
        tick(&mut c, &tx);
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn denylisted_query_is_never_explained_again() {
        let mock = MockPg::new();
        mock.set_rows(vec![statement_row("testdb", "1", "select * from secrets", 1)]);
        mock.fail_on("PREPARE", "ERROR: permission denied for table secrets");
        let (tx, rx) = sync_channel(64);
        let mut c = collector(&mock, ExplainPlansConfig::new(BASE_CONN, PG16));

        tick(&mut c, &tx);
        let outputs = drain(&rx);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].metadata.processing_result, ProcessingResult::Error);
        assert!(
            outputs[0]
                .metadata
                .processing_result_reason
                .contains("permission denied")
        );
        assert!(outputs[0].plan.is_none());
        assert_eq!(c.cache().denylisted_len(), 1);

        mock.clear_failures();
        for calls in [2, 3] {
            mock.clear_statements();
            mock.set_rows(vec![statement_row("testdb", "1", "select * from secrets", calls)]);
            tick(&mut c, &tx);

            let outputs = drain(&rx);
            assert_eq!(outputs.len(), 1);
            assert_eq!(outputs[0].metadata.processing_result, ProcessingResult::Skipped);
            assert_eq!(outputs[0].metadata.processing_result_reason, "query denylisted");
            assert!(mock.statements_starting_with("PREPARE").is_empty());
            assert_eq!(c.cache().active_len(), 0);
        }
    }

    #[test]
    fn recoverable_error_waits_for_calls_to_move() {
        let mock = MockPg::new();
        mock.set_rows(vec![statement_row("testdb", "1", "select pg_sleep(100)", 1)]);
        mock.fail_on("EXPLAIN", "ERROR: canceling statement due to statement timeout");
        let (tx, rx) = sync_channel(64);
        let mut c = collector(&mock, ExplainPlansConfig::new(BASE_CONN, PG16));

        tick(&mut c, &tx);
        let outputs = drain(&rx);
        assert_eq!(outputs[0].metadata.processing_result, ProcessingResult::Error);
        assert_eq!(
            outputs[0].metadata.processing_result_reason,
            "failed to run explain plan: PostgreSQL query error: \
             ERROR: canceling statement due to statement timeout"
        );
        assert_eq!(c.cache().finished_len(), 1);
        assert_eq!(
            mock.statements().last().map(String::as_str),
            Some("DEALLOCATE explain_plan_1")
        );

        // Not retried while calls stay put.
        mock.clear_failures();
        tick(&mut c, &tx);
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn truncated_query_needs_no_connection() {
        let mock = MockPg::new();
        mock.set_rows(vec![statement_row(
            "testdb",
            "1",
            "select * from some_table where name in ($1, $2, ...",
            1,
        )]);
        let (tx, rx) = sync_channel(64);
        let mut c = collector(&mock, ExplainPlansConfig::new(BASE_CONN, PG16));

        tick(&mut c, &tx);
        let outputs = drain(&rx);
        assert_eq!(outputs[0].metadata.processing_result, ProcessingResult::Skipped);
        assert_eq!(outputs[0].metadata.processing_result_reason, "query is truncated");
        assert_eq!(mock.connections(), vec![BASE_CONN.to_string()]);
        assert!(mock.statements_starting_with("PREPARE").is_empty());
        assert_eq!(c.cache().finished_len(), 1);
    }

    #[test]
    fn write_query_is_skipped() {
        let mock = MockPg::new();
        mock.set_rows(vec![statement_row(
            "testdb",
            "1",
            "update accounts set balance = $1 where id = $2",
            1,
        )]);
        let (tx, rx) = sync_channel(64);
        let mut c = collector(&mock, ExplainPlansConfig::new(BASE_CONN, PG16));

        tick(&mut c, &tx);
        let outputs = drain(&rx);
        assert_eq!(
            outputs[0].metadata.processing_result_reason,
            "query contains reserved word"
        );
        assert!(mock.statements_starting_with("PREPARE").is_empty());
    }

    #[test]
    fn catalog_failure_is_propagated_and_reconnects() {
        let mock = MockPg::new();
        mock.fail_on("SELECT", "FATAL: terminating connection due to administrator command");
        let (tx, _rx) = sync_channel(64);
        let mut c = collector(&mock, ExplainPlansConfig::new(BASE_CONN, PG16));
        let running = AtomicBool::new(true);

        let err = c.fetch_explain_plans(&tx, &running).unwrap_err();
        assert!(matches!(err, ExplainPlansError::Catalog(_)));
        assert!(err.to_string().contains("administrator command"));
        assert_eq!(mock.closed_connections(), 1);

        mock.clear_failures();
        c.fetch_explain_plans(&tx, &running).unwrap();
        assert_eq!(mock.connections().len(), 2);
    }

    #[test]
    fn rejected_connection_denylists_query() {
        let mock = MockPg::new();
        let (tx, rx) = sync_channel(64);
        let mut c = collector(&mock, ExplainPlansConfig::new(BASE_CONN, PG16));
        // Opens the main connection.
        tick(&mut c, &tx);

        mock.set_rows(vec![statement_row("restricted", "1", "select 1", 1)]);
        mock.set_connect_error(Some(
            "FATAL: pg_hba.conf rejects connection for host \"10.0.0.1\"",
        ));
        tick(&mut c, &tx);

        let outputs = drain(&rx);
        assert_eq!(outputs.len(), 1);
        assert!(
            outputs[0]
                .metadata
                .processing_result_reason
                .starts_with("failed to get connection: ")
        );
        assert_eq!(c.cache().denylisted_len(), 1);
    }

    #[test]
    fn deallocate_failure_is_not_fatal() {
        let mock = MockPg::new();
        mock.set_rows(vec![statement_row("testdb", "1", "select 1", 1)]);
        mock.fail_on("DEALLOCATE", "ERROR: prepared statement \"explain_plan_1\" does not exist");
        let (tx, rx) = sync_channel(64);
        let mut c = collector(&mock, ExplainPlansConfig::new(BASE_CONN, PG16));

        tick(&mut c, &tx);
        let outputs = drain(&rx);
        assert_eq!(outputs[0].metadata.processing_result, ProcessingResult::Success);
        assert_eq!(c.cache().finished_len(), 1);
        assert_eq!(mock.open_connections(), 1);
    }

    #[test]
    fn unparsable_or_empty_plan_is_denylisted() {
        let mock = MockPg::new();
        mock.set_rows(vec![statement_row("testdb", "1", "select 1", 1)]);
        mock.set_plan_json(Some("{not json"));
        let (tx, rx) = sync_channel(64);
        let mut c = collector(&mock, ExplainPlansConfig::new(BASE_CONN, PG16));

        tick(&mut c, &tx);
        let outputs = drain(&rx);
        assert!(
            outputs[0]
                .metadata
                .processing_result_reason
                .starts_with("failed to create explain plan output: failed to parse explain plan json")
        );
        assert_eq!(c.cache().denylisted_len(), 1);

        mock.set_rows(vec![
            statement_row("testdb", "1", "select 1", 2),
            statement_row("testdb", "2", "select 2", 1),
        ]);
        mock.set_plan_json(None);
        tick(&mut c, &tx);
        let outputs = drain(&rx);
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].metadata.processing_result_reason, "query denylisted");
        assert_eq!(outputs[1].metadata.processing_result_reason, "explain plan json is empty");
        assert_eq!(c.cache().denylisted_len(), 2);
    }

    #[test]
    fn panicking_attempt_still_settles() {
        let mock = MockPg::new();
        mock.set_rows(vec![
            statement_row("testdb", "1", "select 1", 1),
            statement_row("testdb", "2", "select 2", 1),
        ]);
        mock.panic_on("EXPLAIN");
        let (tx, rx) = sync_channel(64);
        let mut c = collector(&mock, ExplainPlansConfig::new(BASE_CONN, PG16));

        tick(&mut c, &tx);
        let outputs = drain(&rx);
        assert_eq!(outputs.len(), 2);
        for output in &outputs {
            assert_eq!(output.metadata.processing_result, ProcessingResult::Error);
            assert!(
                output
                    .metadata
                    .processing_result_reason
                    .starts_with("panic while explaining query: ")
            );
        }
        assert_eq!(c.cache().active_len(), 0);
        assert_eq!(c.cache().denylisted_len(), 2);
        // Statements were deallocated and connections closed while unwinding.
        assert_eq!(mock.statements_starting_with("DEALLOCATE").len(), 2);
        assert_eq!(mock.open_connections(), 1);
    }

    #[test]
    fn cycle_shares_generated_at() {
        let mock = MockPg::new();
        mock.set_rows(
            (1..=3)
                .map(|i| statement_row("testdb", &i.to_string(), "select 1", 1))
                .collect(),
        );
        let (tx, rx) = sync_channel(64);
        let mut c = collector(&mock, ExplainPlansConfig::new(BASE_CONN, PG16));
        tick(&mut c, &tx);

        let outputs = drain(&rx);
        assert_eq!(outputs.len(), 3);
        assert!(
            outputs
                .iter()
                .all(|o| o.metadata.generated_at == outputs[0].metadata.generated_at)
        );
    }

    #[test]
    fn stopped_flag_halts_cycle_between_candidates() {
        let mock = MockPg::new();
        mock.set_rows(vec![statement_row("testdb", "1", "select 1", 1)]);
        let (tx, rx) = sync_channel(64);
        let mut c = collector(&mock, ExplainPlansConfig::new(BASE_CONN, PG16));

        let running = AtomicBool::new(false);
        c.fetch_explain_plans(&tx, &running).unwrap();
        assert!(drain(&rx).is_empty());
        assert_eq!(c.cache().active_len(), 1);
    }

    #[test]
    fn classify_maps_outcomes() {
        let denied = AttemptError::Prepare(PgCollectError::QueryError(
            "ERROR: permission denied for table t".to_string(),
        ));
        let timeout = AttemptError::Explain(PgCollectError::QueryError(
            "ERROR: canceling statement due to statement timeout".to_string(),
        ));

        assert_eq!(
            classify(&AttemptOutcome::Explained(ExplainPlanNode::default())),
            Disposition::Finished
        );
        assert_eq!(
            classify(&AttemptOutcome::Skipped("query is truncated")),
            Disposition::Finished
        );
        assert_eq!(
            classify(&AttemptOutcome::Rejected("lexer".to_string())),
            Disposition::Finished
        );
        assert_eq!(classify(&AttemptOutcome::Failed(timeout)), Disposition::Finished);
        assert_eq!(classify(&AttemptOutcome::Failed(denied)), Disposition::Denylisted);
        assert_eq!(
            classify(&AttemptOutcome::Failed(AttemptError::EmptyPlan)),
            Disposition::Denylisted
        );
        assert_eq!(
            classify(&AttemptOutcome::Panicked("boom".to_string())),
            Disposition::Denylisted
        );
    }

    #[test]
    fn construction_validates_version_and_config() {
        let mock = MockPg::new();
        let err = ExplainPlansCollector::new(
            ExplainPlansConfig::new(BASE_CONN, "devel"),
            Box::new(mock.clone()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ExplainPlansError::InvalidVersion(_)));

        let err = ExplainPlansCollector::new(
            ExplainPlansConfig::new(BASE_CONN, PG16).with_per_scrape_ratio(1.5),
            Box::new(mock.clone()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ExplainPlansError::InvalidConfig(_)));

        let err = ExplainPlansCollector::new(
            ExplainPlansConfig::new(BASE_CONN, PG16).with_scrape_interval(Duration::ZERO),
            Box::new(mock.clone()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ExplainPlansError::InvalidConfig(_)));

        let c = collector(&mock, ExplainPlansConfig::new(BASE_CONN, PG16));
        assert_eq!(c.name(), "explain_plans");
        assert_eq!(c.config().scrape_interval, Duration::from_secs(60));
        assert!(mock.connections().is_empty());
    }

    #[test]
    fn started_collector_emits_and_stops() {
        let mock = MockPg::new();
        mock.set_rows(vec![statement_row("testdb", "1", "select 1", 1)]);
        let (tx, rx) = sync_channel(64);
        let c = collector(&mock, ExplainPlansConfig::new(BASE_CONN, PG16));

        let handle = c.start(Box::new(tx));
        let entry = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(entry.line.contains(r#"digest="1""#));

        handle.stop();
        handle.stop();
        assert!(!handle.shutdown_signal().load(Ordering::SeqCst));
        let stopped = handle.stopped.clone();
        handle.join();
        assert!(stopped.load(Ordering::SeqCst));
    }
}
