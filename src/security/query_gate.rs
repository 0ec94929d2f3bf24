//! Query Gate
//!
//! Static read-only check run on every generated query before execution.
//! There is no bypass: the orchestrator only holds an executable query in
//! the form of an [`ApprovedQuery`], and the only constructor for that type
//! is [`SecurityGate::approve`].

use crate::error::{ChatBiError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use tracing::{debug, warn};

/// Leading verbs a statement may start with.
const ALLOWED_VERBS: &[&str] = &["SELECT", "WITH", "SHOW", "DESCRIBE", "DESC", "EXPLAIN"];

/// Verbs rejected anywhere in the text: mutation, DDL and administration.
const DISALLOWED_VERBS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "UPSERT", "DROP", "CREATE", "ALTER", "TRUNCATE",
    "RENAME", "GRANT", "REVOKE", "COMMIT", "ROLLBACK", "SAVEPOINT", "BEGIN", "LOCK", "UNLOCK",
    "CALL", "EXEC", "EXECUTE", "COPY", "LOAD", "ATTACH", "DETACH", "VACUUM", "REINDEX", "SET",
    "RESET", "SHUTDOWN", "KILL", "PREPARE", "DEALLOCATE",
    "HANDLER", "IMPORT", "INSTALL", "UNINSTALL", "PRAGMA",
];

/// Built-in functions that read files, sleep, or reach other servers.
const DANGEROUS_FUNCTIONS: &[&str] = &[
    "pg_sleep",
    "pg_read_file",
    "pg_read_binary_file",
    "pg_ls_dir",
    "pg_stat_file",
    "pg_terminate_backend",
    "pg_cancel_backend",
    "pg_reload_conf",
    "lo_import",
    "lo_export",
    "dblink",
    "dblink_exec",
    "set_config",
    "sleep",
    "benchmark",
    "load_file",
    "sys_exec",
    "sys_eval",
    "xp_cmdshell",
    "xp_regread",
    "sp_oacreate",
    "openrowset",
    "opendatasource",
    "read_csv",
    "read_csv_auto",
    "read_parquet",
    "read_json",
];

lazy_static! {
    static ref DISALLOWED_RE: Regex = Regex::new(&format!(
        r"(?i)\b({})\b",
        DISALLOWED_VERBS.join("|")
    ))
    .expect("disallowed verb pattern");
    static ref DANGEROUS_FN_RE: Regex = Regex::new(&format!(
        r"(?i)\b({})\s*\(",
        DANGEROUS_FUNCTIONS.join("|")
    ))
    .expect("dangerous function pattern");
    static ref INTO_RE: Regex = Regex::new(r"(?i)\bINTO\b").expect("into pattern");
    static ref LINE_COMMENT_RE: Regex = Regex::new(r"--[^\n]*").expect("line comment pattern");
    static ref BLOCK_COMMENT_RE: Regex = Regex::new(r"(?s)/\*.*?\*/").expect("block comment pattern");
}

/// Result of a gate check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub is_safe: bool,
    pub violation_reason: Option<String>,
}

impl GateVerdict {
    fn safe() -> Self {
        Self {
            is_safe: true,
            violation_reason: None,
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            is_safe: false,
            violation_reason: Some(reason.into()),
        }
    }
}

/// A query that passed the gate. Only [`SecurityGate::approve`] builds one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovedQuery {
    sql: String,
}

impl ApprovedQuery {
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// Read-only SQL validator.
#[derive(Debug, Clone, Default)]
pub struct SecurityGate;

impl SecurityGate {
    pub fn new() -> Self {
        Self
    }

    /// Check a candidate query. Never rewrites it.
    pub fn validate(&self, sql: &str) -> GateVerdict {
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return GateVerdict::reject("Empty query");
        }

        // Disallowed verbs are searched in the raw text, comments included.
        if let Some(m) = DISALLOWED_RE.find(trimmed) {
            let verb = m.as_str().to_uppercase();
            warn!("Security gate rejected statement containing {}", verb);
            return GateVerdict::reject(format!(
                "Disallowed keyword {} detected; only read-only queries are permitted",
                verb
            ));
        }

        if let Some(caps) = DANGEROUS_FN_RE.captures(trimmed) {
            let func = caps[1].to_lowercase();
            warn!("Security gate rejected dangerous function {}", func);
            return GateVerdict::reject(format!("Dangerous function {} is not permitted", func));
        }

        if INTO_RE.is_match(trimmed) {
            return GateVerdict::reject(
                "SELECT ... INTO writes data and is not permitted".to_string(),
            );
        }

        let without_comments = strip_comments(trimmed);
        let statements = split_statements(&without_comments);
        if statements.is_empty() {
            return GateVerdict::reject("Query contains only comments");
        }
        for statement in &statements {
            let verb = leading_verb(statement);
            if !ALLOWED_VERBS.contains(&verb.as_str()) {
                return GateVerdict::reject(format!(
                    "Statement must begin with one of {}; found '{}'",
                    ALLOWED_VERBS.join(", "),
                    verb
                ));
            }
        }

        if let Some(reason) = structural_violation(&without_comments) {
            return GateVerdict::reject(reason);
        }

        GateVerdict::safe()
    }

    /// Validate and, on success, hand back the only executable form.
    pub fn approve(&self, sql: &str) -> Result<ApprovedQuery> {
        let verdict = self.validate(sql);
        if verdict.is_safe {
            Ok(ApprovedQuery {
                sql: sql.trim().to_string(),
            })
        } else {
            Err(ChatBiError::Security(
                verdict
                    .violation_reason
                    .unwrap_or_else(|| "Query rejected".to_string()),
            ))
        }
    }
}

/// Second layer: if the generic parser understands the text, every
/// statement must be a query, an explain of a query, or introspection.
/// Text the parser cannot read is left to the keyword policy above, since
/// engine-specific syntax is common and syntax errors belong to the repair
/// loop.
fn structural_violation(sql: &str) -> Option<String> {
    let statements = match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(statements) => statements,
        Err(e) => {
            debug!("Structural check skipped, parser rejected query: {}", e);
            return None;
        }
    };
    statements.iter().find_map(|s| {
        if is_read_only(s) {
            None
        } else {
            Some(format!("Statement kind is not read-only: {}", statement_label(s)))
        }
    })
}

fn is_read_only(statement: &Statement) -> bool {
    match statement {
        Statement::Query(_) => true,
        Statement::Explain { statement, .. } => is_read_only(statement),
        Statement::ExplainTable { .. } => true,
        Statement::ShowTables { .. } | Statement::ShowColumns { .. } => true,
        _ => false,
    }
}

fn statement_label(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .take(2)
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_comments(sql: &str) -> String {
    let without_block = BLOCK_COMMENT_RE.replace_all(sql, " ");
    LINE_COMMENT_RE.replace_all(&without_block, " ").into_owned()
}

/// Split on `;` outside of quoted literals and identifiers.
fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in sql.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    current.push(c);
                }
                ';' => {
                    if !current.trim().is_empty() {
                        statements.push(current.trim().to_string());
                    }
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }
    if !current.trim().is_empty() {
        statements.push(current.trim().to_string());
    }
    statements
}

fn leading_verb(statement: &str) -> String {
    statement
        .trim_start_matches(|c: char| c == '(' || c.is_whitespace())
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or("")
        .to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(sql: &str) -> String {
        let verdict = SecurityGate::new().validate(sql);
        assert!(!verdict.is_safe, "expected rejection for {}", sql);
        verdict.violation_reason.unwrap()
    }

    #[test]
    fn test_accepts_read_only_statements() {
        let gate = SecurityGate::new();
        for sql in [
            "SELECT COUNT(*) FROM employees WHERE department = '销售部'",
            "  select id, updated_at from orders order by created_at desc limit 10",
            "WITH t AS (SELECT 1 AS x) SELECT x FROM t",
            "EXPLAIN SELECT * FROM orders",
            "SHOW TABLES",
            "DESCRIBE orders",
            "-- top customers\nSELECT name FROM customers",
            "(SELECT 1) UNION (SELECT 2)",
            "SELECT last_update, offset_days FROM t",
        ] {
            let verdict = gate.validate(sql);
            assert!(verdict.is_safe, "{} rejected: {:?}", sql, verdict.violation_reason);
        }
    }

    #[test]
    fn test_rejects_mutation_and_names_the_verb() {
        let r = reason("DELETE FROM users");
        assert!(r.contains("DELETE"), "{}", r);
        assert!(reason("update orders set total = 0").contains("UPDATE"));
        assert!(reason("DROP TABLE t").contains("DROP"));
    }

    #[test]
    fn test_rejects_statement_stacking() {
        assert!(reason("SELECT * FROM t; DROP TABLE t").contains("DROP"));
        assert!(reason("SELECT 1; /* hidden */ TRUNCATE t").contains("TRUNCATE"));
    }

    #[test]
    fn test_rejects_disallowed_verb_hidden_in_comment() {
        assert!(reason("SELECT 1 -- ; DELETE FROM users").contains("DELETE"));
    }

    #[test]
    fn test_rejects_dangerous_functions_and_into() {
        assert!(reason("SELECT pg_sleep(10)").contains("pg_sleep"));
        assert!(reason("SELECT LOAD_FILE('/etc/passwd')").contains("load_file"));
        assert!(reason("SELECT * INTO backup FROM orders").contains("INTO"));
    }

    #[test]
    fn test_rejects_unknown_leading_verb() {
        assert!(reason("VALUES (1)").contains("must begin"));
        assert!(reason("").contains("Empty"));
    }

    #[test]
    fn test_approve_returns_typed_query() {
        let gate = SecurityGate::new();
        let approved = gate.approve(" SELECT 1 ").unwrap();
        assert_eq!(approved.sql(), "SELECT 1");
        assert!(matches!(
            gate.approve("DELETE FROM users"),
            Err(ChatBiError::Security(_))
        ));
    }
}
