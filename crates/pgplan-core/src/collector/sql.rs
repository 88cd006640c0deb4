//! SQL text helpers: literal redaction and reserved keyword detection.
//!
//! Both work on the token stream produced by `sqlparser`'s PostgreSQL
//! tokenizer, so words inside string literals, comments and quoted
//! identifiers are never mistaken for keywords or redacted as identifiers.

use std::fmt;

use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Token, Tokenizer};

/// Placeholder written in place of every literal.
const REDACTED: &str = "?";

/// A keyword that marks a statement as unsafe to explain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedWord {
    /// Uppercase keyword.
    pub word: &'static str,
    /// Words that exempt the keyword when they immediately precede it,
    /// nearest first (`FOR` exempts `UPDATE` in `SELECT ... FOR UPDATE`).
    pub exemption_prefixes: &'static [&'static str],
}

const fn word(word: &'static str) -> ReservedWord {
    ReservedWord {
        word,
        exemption_prefixes: &[],
    }
}

/// Keywords indicating writes, schema changes, transaction or session control.
pub const EXPLAIN_RESERVED_WORD_DENY_LIST: &[ReservedWord] = &[
    // DML
    word("INSERT"),
    ReservedWord {
        word: "UPDATE",
        exemption_prefixes: &["FOR"],
    },
    word("DELETE"),
    word("REPLACE"),
    word("MERGE"),
    word("UPSERT"),
    // DDL
    word("CREATE"),
    word("ALTER"),
    word("DROP"),
    word("RENAME"),
    word("TRUNCATE"),
    // transaction control
    word("BEGIN"),
    word("COMMIT"),
    word("ROLLBACK"),
    word("SAVEPOINT"),
    word("TRANSACTION"),
    // database/schema management
    word("USE"),
    word("DATABASE"),
    word("SCHEMA"),
    // maintenance
    word("REINDEX"),
    word("ANALYZE"),
    word("OPTIMIZE"),
    // permissions
    word("GRANT"),
    word("REVOKE"),
    // MySQL write modifiers
    word("LOAD"),
    word("DELAYED"),
    word("IGNORE"),
    word("LOW_PRIORITY"),
    word("HIGH_PRIORITY"),
    word("QUICK"),
    // PostgreSQL session and utility commands
    word("COPY"),
    word("VACUUM"),
    word("CLUSTER"),
    word("LISTEN"),
    word("NOTIFY"),
    word("DISCARD"),
    word("PREPARE"),
    word("EXECUTE"),
    word("DEALLOCATE"),
    word("RESET"),
    word("SET"),
    word("UNLISTEN"),
    word("DECLARE"),
    word("CLOSE"),
    word("EXPLAIN"),
];

/// Tokenizer failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError(pub String);

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to tokenize SQL: {}", self.0)
    }
}

impl std::error::Error for LexError {}

fn tokenize(sql: &str) -> Result<Vec<Token>, LexError> {
    let dialect = PostgreSqlDialect {};
    Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| LexError(e.to_string()))
}

fn is_literal(token: &Token) -> bool {
    matches!(
        token,
        Token::Number(_, _)
            | Token::SingleQuotedString(_)
            | Token::DollarQuotedString(_)
            | Token::NationalStringLiteral(_)
            | Token::EscapedStringLiteral(_)
            | Token::HexStringLiteral(_)
            | Token::SingleQuotedByteStringLiteral(_)
            | Token::DoubleQuotedByteStringLiteral(_)
            | Token::RawStringLiteral(_)
    )
}

/// Replaces literal values in `sql` with `?`.
///
/// Identifiers, comments, casts and positional parameters (`$1`) are kept.
///
/// ```
/// use pgplan_core::collector::sql::redact;
///
/// assert_eq!(
///     redact("SELECT * FROM users WHERE id = 123 AND name = 'john'"),
///     "SELECT * FROM users WHERE id = ? AND name = ?"
/// );
/// ```
pub fn redact(sql: &str) -> String {
    match tokenize(sql) {
        Ok(tokens) => {
            let mut out = String::with_capacity(sql.len());
            for token in &tokens {
                if is_literal(token) {
                    out.push_str(REDACTED);
                } else {
                    out.push_str(&token.to_string());
                }
            }
            out
        }
        Err(_) => redact_chars(sql),
    }
}

/// Character-level fallback for text the tokenizer rejects.
///
/// Quoted strings (closed or not) and digit runs outside identifiers become `?`.
fn redact_chars(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut prev_ident = false;

    while let Some(c) = chars.next() {
        if c == '\'' {
            for c2 in chars.by_ref() {
                if c2 == '\'' {
                    break;
                }
            }
            out.push_str(REDACTED);
            prev_ident = false;
        } else if c.is_ascii_digit() && !prev_ident {
            while chars
                .peek()
                .is_some_and(|n| n.is_ascii_digit() || *n == '.')
            {
                chars.next();
            }
            out.push_str(REDACTED);
            prev_ident = false;
        } else {
            prev_ident = c.is_alphanumeric() || c == '_' || c == '$';
            out.push(c);
        }
    }

    out
}

/// Counts `$n` positional markers outside comments and literals.
///
/// Falls back to a plain text scan when tokenizing fails. Either way the
/// count never exceeds the length of `sql`.
pub fn count_positional_parameters(sql: &str) -> usize {
    match tokenize(sql) {
        Ok(tokens) => tokens
            .iter()
            .filter(|t| matches!(t, Token::Placeholder(p) if is_positional(p)))
            .count(),
        Err(_) => sql
            .as_bytes()
            .windows(2)
            .filter(|w| w[0] == b'$' && w[1].is_ascii_digit())
            .count(),
    }
}

fn is_positional(placeholder: &str) -> bool {
    placeholder
        .strip_prefix('$')
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Returns true if `sql` contains any unexempted keyword from `deny_list`.
///
/// Only bare words are considered; matches are case-insensitive.
pub fn contains_reserved_keywords(sql: &str, deny_list: &[ReservedWord]) -> Result<bool, LexError> {
    let tokens = tokenize(sql)?;
    let significant: Vec<&Token> = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(_)))
        .collect();

    for (idx, token) in significant.iter().enumerate() {
        let Token::Word(w) = token else {
            continue;
        };
        if w.quote_style.is_some() {
            continue;
        }
        let upper = w.value.to_ascii_uppercase();
        let Some(reserved) = deny_list.iter().find(|r| r.word == upper) else {
            continue;
        };
        if !is_exempt(&significant[..idx], reserved.exemption_prefixes) {
            return Ok(true);
        }
    }

    Ok(false)
}

/// `preceding` ends right before the keyword; prefixes are nearest first.
fn is_exempt(preceding: &[&Token], prefixes: &[&str]) -> bool {
    if prefixes.is_empty() || preceding.len() < prefixes.len() {
        return false;
    }
    preceding
        .iter()
        .rev()
        .zip(prefixes)
        .all(|(token, prefix)| match token {
            Token::Word(w) => w.quote_style.is_none() && w.value.eq_ignore_ascii_case(prefix),
            _ => false,
        })
}
