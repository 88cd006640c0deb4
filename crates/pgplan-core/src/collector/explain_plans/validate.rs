//! Cheap checks that run before any explain round trip.

use crate::collector::sql::{EXPLAIN_RESERVED_WORD_DENY_LIST, contains_reserved_keywords};

/// pg_stat_statements truncates long query texts with this suffix.
const TRUNCATION_MARKER: &str = "...";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Validation {
    Explainable,
    Skip(&'static str),
    Error(String),
}

pub(crate) fn validate_query(query_text: &str) -> Validation {
    if query_text.ends_with(TRUNCATION_MARKER) {
        return Validation::Skip("query is truncated");
    }

    match contains_reserved_keywords(query_text, EXPLAIN_RESERVED_WORD_DENY_LIST) {
        Ok(true) => Validation::Skip("query contains reserved word"),
        Ok(false) => Validation::Explainable,
        Err(e) => Validation::Error(format!("failed to check for reserved keywords: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_query_is_skipped() {
        assert_eq!(
            validate_query("select * from some_table where id = $1 and name = ..."),
            Validation::Skip("query is truncated")
        );
    }

    #[test]
    fn write_query_is_skipped() {
        assert_eq!(
            validate_query("insert into some_table (id) values ($1)"),
            Validation::Skip("query contains reserved word")
        );
    }

    #[test]
    fn select_and_cte_are_explainable() {
        assert_eq!(
            validate_query("select * from some_table where id = $1"),
            Validation::Explainable
        );
        assert_eq!(
            validate_query("with cte as (select * from some_table where id = $1) select * from cte"),
            Validation::Explainable
        );
    }

    #[test]
    fn lexer_failure_is_an_error() {
        let Validation::Error(reason) = validate_query("select 'unterminated from t") else {
            panic!("expected error");
        };
        assert!(reason.starts_with("failed to check for reserved keywords: "));
    }
}
