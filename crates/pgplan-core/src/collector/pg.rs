//! PostgreSQL client abstraction.
//!
//! The `PgClient` trait lets the explain engine work against a real server
//! through `postgres::Client` or against [`MockPg`](super::mock::MockPg) in tests.
//! `ConnectionFactory` hands out connections for a given connection string; the
//! engine uses it for its main catalog connection and for one dedicated
//! connection per explained query.

use postgres::{Client, NoTls, SimpleQueryMessage};

/// Failure talking to the server, or building the connection string for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgCollectError {
    /// No role could be derived from the environment.
    EnvNotSet(String),
    /// The server could not be reached or refused the session.
    ConnectionError(String),
    /// A statement was sent but the server returned an error.
    QueryError(String),
}

impl std::fmt::Display for PgCollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PgCollectError::EnvNotSet(var) => {
                write!(f, "cannot build connection string: {} not set", var)
            }
            PgCollectError::ConnectionError(msg) => {
                write!(f, "PostgreSQL connection failed: {}", msg)
            }
            PgCollectError::QueryError(msg) => write!(f, "PostgreSQL query error: {}", msg),
        }
    }
}

impl std::error::Error for PgCollectError {}

/// One row of the explain candidate catalog query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementRow {
    pub datname: String,
    pub queryid: String,
    pub query: String,
    pub calls: i64,
    /// Epoch seconds of `stats_since` (PG 17+); unused on older servers.
    pub stats_since: i64,
}

/// Database operations needed by the explain engine.
pub trait PgClient: Send {
    /// Runs a statement through the simple query protocol, discarding results.
    fn execute(&mut self, sql: &str) -> Result<(), PgCollectError>;

    /// Runs a query and returns the first column of the first row as text.
    ///
    /// Returns `Ok(None)` if the query produced no rows or a NULL value.
    fn query_text(&mut self, sql: &str) -> Result<Option<String>, PgCollectError>;

    /// Runs a query returning a single epoch-seconds `bigint`.
    fn query_epoch(&mut self, sql: &str) -> Result<i64, PgCollectError>;

    /// Runs the candidate catalog query.
    fn query_statements(&mut self, sql: &str) -> Result<Vec<StatementRow>, PgCollectError>;
}

/// Opens connections for a libpq connection string.
pub trait ConnectionFactory: Send {
    fn connect(&self, connection_string: &str) -> Result<Box<dyn PgClient>, PgCollectError>;
}

/// `PgClient` backed by a real `postgres::Client`.
///
/// The connection is closed when the value is dropped.
pub struct PostgresClient {
    client: Client,
}

impl PostgresClient {
    pub fn connect(connection_string: &str) -> Result<Self, PgCollectError> {
        Client::connect(connection_string, NoTls)
            .map(|client| Self { client })
            .map_err(|e| PgCollectError::ConnectionError(format_postgres_error(&e)))
    }
}

impl PgClient for PostgresClient {
    fn execute(&mut self, sql: &str) -> Result<(), PgCollectError> {
        self.client
            .batch_execute(sql)
            .map_err(|e| PgCollectError::QueryError(format_postgres_error(&e)))
    }

    fn query_text(&mut self, sql: &str) -> Result<Option<String>, PgCollectError> {
        let messages = self
            .client
            .simple_query(sql)
            .map_err(|e| PgCollectError::QueryError(format_postgres_error(&e)))?;

        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                return Ok(row.get(0).map(str::to_string));
            }
        }
        Ok(None)
    }

    fn query_epoch(&mut self, sql: &str) -> Result<i64, PgCollectError> {
        let row = self
            .client
            .query_one(sql, &[])
            .map_err(|e| PgCollectError::QueryError(format_postgres_error(&e)))?;
        row.try_get::<_, i64>(0)
            .map_err(|e| PgCollectError::QueryError(e.to_string()))
    }

    fn query_statements(&mut self, sql: &str) -> Result<Vec<StatementRow>, PgCollectError> {
        let rows = self
            .client
            .query(sql, &[])
            .map_err(|e| PgCollectError::QueryError(format_postgres_error(&e)))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let queryid: i64 = row
                .try_get("queryid")
                .map_err(|e| PgCollectError::QueryError(e.to_string()))?;
            out.push(StatementRow {
                datname: row
                    .try_get("datname")
                    .map_err(|e| PgCollectError::QueryError(e.to_string()))?,
                queryid: queryid.to_string(),
                query: row
                    .try_get("query")
                    .map_err(|e| PgCollectError::QueryError(e.to_string()))?,
                calls: row
                    .try_get("calls")
                    .map_err(|e| PgCollectError::QueryError(e.to_string()))?,
                stats_since: row
                    .try_get("stats_since")
                    .map_err(|e| PgCollectError::QueryError(e.to_string()))?,
            });
        }
        Ok(out)
    }
}

/// Connects with `postgres::Client` and no TLS.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresConnector;

impl ConnectionFactory for PostgresConnector {
    fn connect(&self, connection_string: &str) -> Result<Box<dyn PgClient>, PgCollectError> {
        Ok(Box::new(PostgresClient::connect(connection_string)?))
    }
}

/// Connection string for the daemon when none is given on the command line.
///
/// Reads the libpq variables `PGHOST`, `PGPORT`, `PGUSER`, `PGPASSWORD` and
/// `PGDATABASE`. The role falls back to `USER` and the database to the role.
pub fn connection_string_from_env() -> Result<String, PgCollectError> {
    connection_string_from_vars(|name| std::env::var(name).ok())
}

fn connection_string_from_vars(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, PgCollectError> {
    let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

    let role = var("PGUSER")
        .or_else(|| var("USER"))
        .ok_or_else(|| PgCollectError::EnvNotSet("PGUSER or USER".to_string()))?;

    let mut pairs = vec![
        ("host", var("PGHOST").unwrap_or_else(|| "localhost".to_string())),
        ("port", var("PGPORT").unwrap_or_else(|| "5432".to_string())),
        ("user", role.clone()),
    ];
    if let Some(password) = var("PGPASSWORD") {
        pairs.push(("password", password));
    }
    pairs.push(("dbname", var("PGDATABASE").unwrap_or(role)));

    Ok(pairs
        .iter()
        .map(|(key, value)| format!("{}={}", key, keyword_value(value)))
        .collect::<Vec<_>>()
        .join(" "))
}

/// Points a connection string at another database.
///
/// Accepts libpq `key=value` strings and `postgres://` / `postgresql://` URLs.
pub fn replace_dbname(connection_string: &str, new_db: &str) -> Result<String, PgCollectError> {
    let trimmed = connection_string.trim();
    if trimmed.starts_with("postgres://") || trimmed.starts_with("postgresql://") {
        replace_url_dbname(trimmed, new_db)
    } else {
        Ok(replace_keyword_dbname(trimmed, new_db))
    }
}

/// Renders a keyword value so libpq reads it back unchanged.
///
/// Plain values stay bare. Empty values and values holding whitespace, `'` or
/// `\` are single-quoted with `'` and `\` backslash-escaped.
fn keyword_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if !needs_quotes {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Splits a keyword string into `key=value` pairs. Whitespace inside a quoted
/// value does not split.
fn keyword_pairs(connection_string: &str) -> Vec<&str> {
    let mut pairs = Vec::new();
    let mut start = None;
    let mut quoted = false;
    let mut escaped = false;

    for (i, c) in connection_string.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if quoted => escaped = true,
            '\'' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if let Some(s) = start.take() {
                    pairs.push(&connection_string[s..i]);
                }
                continue;
            }
            _ => {}
        }
        start.get_or_insert(i);
    }
    if let Some(s) = start {
        pairs.push(&connection_string[s..]);
    }
    pairs
}

fn replace_keyword_dbname(connection_string: &str, new_db: &str) -> String {
    let dbname = format!("dbname={}", keyword_value(new_db));
    let mut replaced = false;
    let mut pairs: Vec<&str> = keyword_pairs(connection_string)
        .into_iter()
        .map(|pair| {
            if pair.starts_with("dbname=") {
                replaced = true;
                dbname.as_str()
            } else {
                pair
            }
        })
        .collect();
    if !replaced {
        pairs.push(&dbname);
    }
    pairs.join(" ")
}

/// `scheme://[userinfo@]host[:port][/dbname][?params]`
fn replace_url_dbname(url: &str, new_db: &str) -> Result<String, PgCollectError> {
    let invalid =
        || PgCollectError::ConnectionError("cannot locate host in connection URL".to_string());

    let rest_start = url.find("://").ok_or_else(invalid)? + 3;
    let rest = &url[rest_start..];

    let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
    if authority_end == 0 {
        return Err(invalid());
    }
    let params = rest[authority_end..]
        .find('?')
        .map_or("", |pos| &rest[authority_end + pos..]);

    Ok(format!(
        "{}{}/{}{}",
        &url[..rest_start],
        &rest[..authority_end],
        encode_path_segment(new_db),
        params
    ))
}

/// Percent-encodes everything outside the URL unreserved set.
fn encode_path_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for b in segment.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Text of a driver error as carried in error records and logs.
///
/// Server errors read `SEVERITY: message`, which keeps phrases such as
/// `permission denied` visible to recoverability checks.
pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => format!("{}: {}", db.severity(), db.message()),
        None => strip_fatal_prefix(&e.to_string()).to_string(),
    }
}

/// Keeps only what follows the last `FATAL:` marker of a startup failure.
fn strip_fatal_prefix(text: &str) -> &str {
    match text.rsplit_once("FATAL:") {
        Some((_, tail)) => tail.trim(),
        None => text,
    }
}
