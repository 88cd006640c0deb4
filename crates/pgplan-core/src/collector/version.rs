//! Server version parsing.
//!
//! `server_version` strings carry vendor suffixes (`16.10 (Debian 16.10-1.pgdg13+1)`,
//! `17.7 - Percona Server for PostgreSQL 17.7.1`). Only the leading numeric
//! `major.minor[.patch]` part is used for dialect decisions.

use std::fmt;

/// Error returned when a version string has no leading `major.minor` pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionError(pub String);

impl fmt::Display for VersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse database engine version: {}", self.0)
    }
}

impl std::error::Error for VersionError {}

/// Comparable PostgreSQL server version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl ServerVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses the leading `v?<major>.<minor>[.<patch>]` of a free-text version string.
    ///
    /// ```
    /// use pgplan_core::collector::ServerVersion;
    ///
    /// let v = ServerVersion::parse("16.10 (Debian 16.10-1.pgdg13+1)").unwrap();
    /// assert_eq!(v, ServerVersion::new(16, 10, 0));
    /// ```
    pub fn parse(raw: &str) -> Result<Self, VersionError> {
        let s = raw.trim_start();
        let s = s.strip_prefix('v').unwrap_or(s);

        let (major, rest) = take_number(s).ok_or_else(|| VersionError(raw.to_string()))?;
        let rest = rest
            .strip_prefix('.')
            .ok_or_else(|| VersionError(raw.to_string()))?;
        let (minor, rest) = take_number(rest).ok_or_else(|| VersionError(raw.to_string()))?;

        let patch = rest
            .strip_prefix('.')
            .and_then(take_number)
            .map(|(patch, _)| patch)
            .unwrap_or(0);

        Ok(Self::new(major, minor, patch))
    }

    /// PostgreSQL 17 added `pg_stat_statements.stats_since`.
    pub fn has_stats_since(&self) -> bool {
        *self >= Self::new(17, 0, 0)
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Splits a leading run of ASCII digits off `s` and parses it.
fn take_number(s: &str) -> Option<(u64, &str)> {
    let end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    let value = s[..end].parse().ok()?;
    Some((value, &s[end..]))
}
