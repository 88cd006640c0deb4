//! pgplan-core: adaptive EXPLAIN plan sampling for PostgreSQL.
//!
//! Provides:
//! - `collector`: the explain plans collector, database client abstraction,
//!   SQL lexing helpers and a mock database for tests
//! - `sink`: log entries emitted by collectors and their destination

pub mod collector;
pub mod sink;
