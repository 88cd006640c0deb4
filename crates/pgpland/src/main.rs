//! pgpland - PostgreSQL EXPLAIN plan sampling daemon.
//!
//! Samples expensive queries from pg_stat_statements, captures a generic plan
//! for each one and writes one log line per capture attempt to stdout.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::io::{self, Write};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, sync_channel};
use std::time::Duration;

use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use pgplan_core::collector::{
    ConnectionFactory, ExplainPlansCollector, ExplainPlansConfig, PgCollectError,
    PostgresConnector, connection_string_from_env,
};
use pgplan_core::sink::LogEntry;

/// PostgreSQL EXPLAIN plan sampling daemon.
#[derive(Parser)]
#[command(name = "pgpland", about = "PostgreSQL EXPLAIN plan sampling daemon", version)]
struct Args {
    /// Scrape interval in seconds.
    #[arg(short, long, default_value = "60")]
    interval: u64,

    /// Share of candidate queries explained per scrape (0.0 to 1.0).
    #[arg(long, default_value = "1.0")]
    per_scrape_ratio: f64,

    /// Database never explained. May be repeated.
    #[arg(long = "exclude-database", value_name = "NAME")]
    exclude_databases: Vec<String>,

    /// Base connection string (libpq key=value or postgres:// URL).
    /// Built from PGHOST, PGPORT, PGUSER, PGPASSWORD and PGDATABASE if omitted.
    #[arg(long, value_name = "DSN")]
    connection_string: Option<String>,

    /// Server version string. Read with SHOW server_version if omitted.
    #[arg(long, value_name = "VERSION")]
    db_version: Option<String>,

    /// Capacity of the log entry channel. A full channel blocks the collector.
    #[arg(long, default_value = "1000")]
    sink_capacity: usize,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = log_level(verbose, quiet);

    let mut filter = EnvFilter::from_default_env();
    for target in ["pgpland", "pgplan_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn log_level(verbose: u8, quiet: bool) -> Level {
    if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

/// Uses the explicit version or asks the server.
fn resolve_db_version(
    explicit: Option<&str>,
    factory: &dyn ConnectionFactory,
    connection_string: &str,
) -> Result<String, PgCollectError> {
    if let Some(version) = explicit {
        return Ok(version.to_string());
    }
    let mut client = factory.connect(connection_string)?;
    client
        .query_text("SHOW server_version")?
        .ok_or_else(|| PgCollectError::QueryError("server_version returned no rows".to_string()))
}

fn build_config(args: &Args, connection_string: String, db_version: String) -> ExplainPlansConfig {
    ExplainPlansConfig::new(connection_string, db_version)
        .with_scrape_interval(Duration::from_secs(args.interval))
        .with_per_scrape_ratio(args.per_scrape_ratio)
        .with_exclude_databases(args.exclude_databases.clone())
}

/// Writes every entry to `out` until all senders are gone.
fn forward_entries<W: Write>(rx: Receiver<LogEntry>, out: &mut W) -> io::Result<u64> {
    let mut written = 0;
    for entry in rx {
        writeln!(out, "{}", entry)?;
        out.flush()?;
        written += 1;
    }
    Ok(written)
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    info!("pgpland {} starting", env!("CARGO_PKG_VERSION"));

    let connection_string = match args.connection_string.clone() {
        Some(conn) => conn,
        None => match connection_string_from_env() {
            Ok(conn) => conn,
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        },
    };

    let db_version = match resolve_db_version(
        args.db_version.as_deref(),
        &PostgresConnector,
        &connection_string,
    ) {
        Ok(version) => version,
        Err(e) => {
            error!("Failed to read server version: {}", e);
            std::process::exit(1);
        }
    };

    let config = build_config(&args, connection_string, db_version);
    let collector = match ExplainPlansCollector::new(config, Box::new(PostgresConnector)) {
        Ok(collector) => collector,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Config: interval={}s, per_scrape_ratio={}, version={}, excluded={:?}",
        args.interval,
        args.per_scrape_ratio,
        collector.database_version(),
        args.exclude_databases
    );

    let (tx, rx) = sync_channel(args.sink_capacity);
    let writer = std::thread::spawn(move || {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        match forward_entries(rx, &mut out) {
            Ok(written) => debug!("Log writer finished after {} entries", written),
            Err(e) => error!("Failed to write log entries: {}", e),
        }
    });

    let handle = collector.start(Box::new(tx));

    // Setup graceful shutdown
    let signal = handle.shutdown_signal();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        signal.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    handle.join();

    // The collector owned the only sender, so the writer drains and exits.
    if writer.join().is_err() {
        error!("Log writer thread panicked");
    }

    info!("Shutdown complete");
}
