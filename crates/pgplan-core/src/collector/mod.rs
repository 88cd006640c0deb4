//! PostgreSQL collectors.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ExplainPlansCollector                     │
//! │  ┌─────────────────────┐   ┌─────────────────────────────┐  │
//! │  │  QueryCache         │   │  explain protocol           │  │
//! │  │  - active queue     │   │  - PREPARE / SET / EXPLAIN  │  │
//! │  │  - finished         │   │  - DEALLOCATE on drop       │  │
//! │  │  - denylist         │   └──────────────┬──────────────┘  │
//! │  └─────────────────────┘                  │                 │
//! │                               ┌───────────▼───────────┐     │
//! │                               │  ConnectionFactory    │     │
//! │                               └───────────┬───────────┘     │
//! └───────────────────────────────────────────┼─────────────────┘
//!                                             │
//!                              ┌──────────────┴──────────────┐
//!                              │                             │
//!                     ┌────────▼──────────┐        ┌─────────▼───────┐
//!                     │ PostgresConnector │        │     MockPg      │
//!                     │ (postgres crate)  │        │    (Testing)    │
//!                     └───────────────────┘        └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use std::sync::atomic::AtomicBool;
//! use std::sync::mpsc::sync_channel;
//!
//! use pgplan_core::collector::mock::{MockPg, statement_row};
//! use pgplan_core::collector::{ExplainPlanOutput, ExplainPlansCollector, ExplainPlansConfig};
//!
//! let mock = MockPg::new();
//! mock.set_rows(vec![statement_row("shop", "42", "select * from orders where id = $1", 3)]);
//!
//! let config = ExplainPlansConfig::new("host=localhost dbname=postgres", "16.4");
//! let mut collector = ExplainPlansCollector::new(config, Box::new(mock.clone())).unwrap();
//!
//! let (tx, rx) = sync_channel(16);
//! collector.fetch_explain_plans(&tx, &AtomicBool::new(true)).unwrap();
//!
//! let entry = rx.try_recv().unwrap();
//! let output = ExplainPlanOutput::from_log_line(&entry.line).unwrap();
//! assert_eq!(output.plan.unwrap().operation, "Seq Scan");
//! ```

pub mod explain_plans;
pub mod mock;
pub mod pg;
pub mod sql;
mod version;

pub use explain_plans::{
    AttemptError, CollectorHandle, ExplainPlanNode, ExplainPlanOutput, ExplainPlansCollector,
    ExplainPlansConfig, ExplainPlansError, ProcessingResult,
};
pub use mock::MockPg;
pub use pg::{
    ConnectionFactory, PgClient, PgCollectError, PostgresClient, PostgresConnector,
    connection_string_from_env,
};
pub use version::{ServerVersion, VersionError};
