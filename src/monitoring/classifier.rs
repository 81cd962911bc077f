//! Best-effort categorisation of SQL text and driver error messages.
//!
//! Both functions are total: anything unrecognised degrades to
//! `OperationKind::Other` / `ErrorKind::Unknown` rather than failing.

use super::{ErrorKind, OperationKind, QuerySignature};
use regex::Regex;
use std::sync::OnceLock;

const IDENT: &str = r#"(?:"[^"]+"|`[^`]+`|\[[^\]]+\]|[A-Za-z_][A-Za-z0-9_$]*)"#;

struct QueryPatterns {
    leading: Regex,
    select_target: Regex,
    insert_target: Regex,
    update_target: Regex,
    delete_target: Regex,
}

struct ErrorPatterns {
    pool: Regex,
    timeout: Regex,
    connection: Regex,
}

fn query_patterns() -> &'static QueryPatterns {
    static PATTERNS: OnceLock<QueryPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let target = format!(r"({IDENT}(?:\s*\.\s*{IDENT})*)");
        QueryPatterns {
            leading: Regex::new(r"(?is)^\s*(?:(?:--[^\n]*(?:\n|$)|/\*.*?\*/)\s*)*([a-z]+)\b")
                .expect("Invalid regex for leading keyword"),
            select_target: Regex::new(&format!(r"(?is)\bfrom\s+(?:only\s+)?{target}"))
                .expect("Invalid regex for select target"),
            insert_target: Regex::new(&format!(r"(?is)\binsert\s+into\s+{target}"))
                .expect("Invalid regex for insert target"),
            update_target: Regex::new(&format!(r"(?is)\bupdate\s+(?:only\s+)?{target}"))
                .expect("Invalid regex for update target"),
            delete_target: Regex::new(&format!(r"(?is)\bdelete\s+from\s+(?:only\s+)?{target}"))
                .expect("Invalid regex for delete target"),
        }
    })
}

fn error_patterns() -> &'static ErrorPatterns {
    static PATTERNS: OnceLock<ErrorPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| ErrorPatterns {
        pool: Regex::new(
            r"(?i)pool\b.*\b(timed out|timeout|exhausted|closed)|too many (clients|connections)|remaining connection slots|queuepool limit",
        )
        .expect("Invalid regex for pool errors"),
        timeout: Regex::new(r"(?i)timed out|timeout|canceling statement due to")
            .expect("Invalid regex for timeout errors"),
        connection: Regex::new(
            r"(?i)connection (refused|reset|closed|lost|failed)|could not connect|broken pipe|server closed the connection|error communicating with database|network is unreachable|no route to host|terminating connection",
        )
        .expect("Invalid regex for connection errors"),
    })
}

/// Map raw operation text to its `(operation_kind, target_name)` signature.
pub fn classify_query(sql: &str) -> QuerySignature {
    let patterns = query_patterns();

    let Some(keyword) = patterns
        .leading
        .captures(sql)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
    else {
        return QuerySignature::other();
    };

    let (kind, target_pattern) = match keyword.as_str() {
        "select" => (OperationKind::Select, &patterns.select_target),
        "insert" => (OperationKind::Insert, &patterns.insert_target),
        "update" => (OperationKind::Update, &patterns.update_target),
        "delete" => (OperationKind::Delete, &patterns.delete_target),
        _ => return QuerySignature::other(),
    };

    let target = target_pattern
        .captures(&top_level(sql))
        .and_then(|caps| caps.get(1))
        .map(|m| normalize_identifier(m.as_str()));

    QuerySignature::new(kind, target)
}

/// Blank out comments, string literals and everything inside parentheses
/// so target patterns only see the outermost statement.
fn top_level(sql: &str) -> String {
    let mut masked = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut depth = 0usize;

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                masked.push(' ');
                // a doubled quote closes and reopens the literal
                for inner in chars.by_ref() {
                    masked.push(' ');
                    if inner == '\'' {
                        break;
                    }
                }
            }
            '"' | '`' => {
                let keep = depth == 0;
                masked.push(if keep { c } else { ' ' });
                for inner in chars.by_ref() {
                    masked.push(if keep { inner } else { ' ' });
                    if inner == c {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        break;
                    }
                }
                masked.push('\n');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for inner in chars.by_ref() {
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
                masked.push(' ');
            }
            '(' => {
                depth += 1;
                masked.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                masked.push(c);
            }
            _ if depth > 0 => masked.push(' '),
            _ => masked.push(c),
        }
    }
    masked
}

fn normalize_identifier(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '"' | '`' | '[' | ']') && !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

/// Infer an `ErrorKind` from a driver or pool error message.
pub fn classify_error(message: &str) -> ErrorKind {
    let lowered = message.to_lowercase();
    let patterns = error_patterns();

    if lowered.contains("deadlock") {
        ErrorKind::Deadlock
    } else if patterns.pool.is_match(&lowered) {
        ErrorKind::PoolExhaustion
    } else if patterns.timeout.is_match(&lowered) {
        ErrorKind::Timeout
    } else if patterns.connection.is_match(&lowered) {
        ErrorKind::ConnectionFailure
    } else if lowered.contains("cancelled") || lowered.contains("canceled") {
        ErrorKind::Cancelled
    } else if lowered.contains("slow query") {
        ErrorKind::SlowQuery
    } else {
        ErrorKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(kind: OperationKind, target: &str) -> QuerySignature {
        QuerySignature::new(kind, Some(target.to_string()))
    }

    #[test]
    fn test_classifies_basic_statements() {
        assert_eq!(
            classify_query("SELECT id, name FROM users WHERE id = $1"),
            sig(OperationKind::Select, "users")
        );
        assert_eq!(
            classify_query("insert into dishes(name, price) values ($1, $2)"),
            sig(OperationKind::Insert, "dishes")
        );
        assert_eq!(
            classify_query("UPDATE recipes SET title = $1"),
            sig(OperationKind::Update, "recipes")
        );
        assert_eq!(
            classify_query("DELETE FROM posts WHERE id = $1"),
            sig(OperationKind::Delete, "posts")
        );
    }

    #[test]
    fn test_handles_whitespace_comments_and_quoting() {
        assert_eq!(
            classify_query("\n  -- fetch profile\n  select * from \"Public\".\"Users\""),
            sig(OperationKind::Select, "public.users")
        );
        assert_eq!(
            classify_query("/* batch */ DELETE FROM ONLY `audit_log`"),
            sig(OperationKind::Delete, "audit_log")
        );
    }

    #[test]
    fn test_from_inside_expressions_is_ignored() {
        assert_eq!(
            classify_query("SELECT extract(year FROM created_at) AS year FROM orders"),
            sig(OperationKind::Select, "orders")
        );
        assert_eq!(
            classify_query("SELECT 'copied from legacy' AS source, id FROM accounts"),
            sig(OperationKind::Select, "accounts")
        );
        assert_eq!(
            classify_query("SELECT (SELECT max(id) FROM audit) AS latest, name FROM customers"),
            sig(OperationKind::Select, "customers")
        );
        assert_eq!(
            classify_query("-- the user's view\nSELECT * FROM profiles"),
            sig(OperationKind::Select, "profiles")
        );
        assert_eq!(
            classify_query("SELECT 'it''s from here' FROM notes"),
            sig(OperationKind::Select, "notes")
        );
        assert_eq!(
            classify_query("DELETE FROM sessions WHERE id IN (SELECT id FROM expired)"),
            sig(OperationKind::Delete, "sessions")
        );
    }

    #[test]
    fn test_derived_table_has_no_target() {
        let signature = classify_query("SELECT * FROM (SELECT id FROM users) AS recent");
        assert_eq!(signature.kind, OperationKind::Select);
        assert_eq!(signature.target, None);
    }

    #[test]
    fn test_select_without_from_has_no_target() {
        let signature = classify_query("SELECT 1");
        assert_eq!(signature.kind, OperationKind::Select);
        assert_eq!(signature.target, None);
    }

    #[test]
    fn test_unrecognised_text_is_other() {
        assert_eq!(classify_query(""), QuerySignature::other());
        assert_eq!(classify_query("BEGIN"), QuerySignature::other());
        assert_eq!(classify_query("CREATE TABLE x (id int)"), QuerySignature::other());
        assert_eq!(classify_query("!!! not sql"), QuerySignature::other());
        assert_eq!(classify_query("selection of things"), QuerySignature::other());
    }

    #[test]
    fn test_classifies_error_messages() {
        assert_eq!(classify_error("ERROR: deadlock detected"), ErrorKind::Deadlock);
        assert_eq!(
            classify_error("pool timed out while waiting for an open connection"),
            ErrorKind::PoolExhaustion
        );
        assert_eq!(
            classify_error("FATAL: sorry, too many clients already"),
            ErrorKind::PoolExhaustion
        );
        assert_eq!(
            classify_error("canceling statement due to statement timeout"),
            ErrorKind::Timeout
        );
        assert_eq!(
            classify_error("error communicating with database: Connection refused (os error 111)"),
            ErrorKind::ConnectionFailure
        );
        assert_eq!(classify_error("operation cancelled"), ErrorKind::Cancelled);
        assert_eq!(classify_error("unique constraint violated"), ErrorKind::Unknown);
    }
}
