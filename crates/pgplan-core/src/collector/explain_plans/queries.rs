//! SQL builders for the explain engine.

use crate::collector::ServerVersion;
use crate::collector::sql::count_positional_parameters;

/// Databases managed by cloud providers; never explained.
pub(super) const PROVIDER_EXCLUDED_DATABASES: &[&str] = &[
    "alloydbadmin",
    "alloydbmetadata",
    "azure_maintenance",
    "azure_sys",
    "cloudsqladmin",
    "rdsadmin",
];

pub(super) const SELECT_STATS_RESET: &str =
    "SELECT COALESCE(EXTRACT(EPOCH FROM stats_reset)::bigint, 0) FROM pg_stat_statements_info";

/// Builds `('a', 'b', ...)` from the provider list and the configured exclusions.
pub(super) fn build_excluded_databases_clause(exclude: &[String]) -> String {
    let names: Vec<String> = PROVIDER_EXCLUDED_DATABASES
        .iter()
        .copied()
        .chain(exclude.iter().map(String::as_str))
        .map(|name| format!("'{}'", name.replace('\'', "''")))
        .collect();
    format!("({})", names.join(", "))
}

/// Builds version-aware candidate query over pg_stat_statements.
///
/// PG 17+ reports a per-statement `stats_since`; older servers only have the
/// global reset time, which is queried separately.
pub(super) fn build_explain_candidates_query(version: ServerVersion, exclude: &[String]) -> String {
    let stats_since_expr = if version.has_stats_since() {
        "COALESCE(EXTRACT(EPOCH FROM s.stats_since)::bigint, 0) as stats_since"
    } else {
        "0::bigint as stats_since"
    };
    let excluded = build_excluded_databases_clause(exclude);

    format!(
        r#"
            SELECT
                d.datname::text as datname,
                s.queryid,
                s.query,
                s.calls,
                {stats_since_expr}
            FROM pg_stat_statements s
                JOIN pg_database d ON s.dbid = d.oid AND NOT d.datistemplate AND d.datallowconn
            WHERE s.queryid IS NOT NULL AND s.query IS NOT NULL
                AND d.datname NOT IN {excluded}
        "#
    )
}

pub(super) fn prepared_statement_name(queryid: &str) -> String {
    let normalized: String = queryid
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("explain_plan_{}", normalized)
}

/// Number of `$n` markers in the query text; `EXECUTE` gets one `null` per marker.
pub(super) fn count_parameters(query: &str) -> usize {
    count_positional_parameters(query)
}

pub(super) fn build_explain_statement(name: &str, param_count: usize) -> String {
    if param_count == 0 {
        format!("EXPLAIN (FORMAT JSON) EXECUTE {}", name)
    } else {
        let nulls = vec!["null"; param_count].join(",");
        format!("EXPLAIN (FORMAT JSON) EXECUTE {}({})", name, nulls)
    }
}
