//! Error Classifier
//!
//! Classifies engine error text into the closed failure taxonomy and pulls
//! out the failing identifier and any correction hint the engine offered.

use crate::config::DATA_ACCESS_SENTINEL;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed failure taxonomy for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    SqlSyntax,
    ColumnNotFound,
    TableNotFound,
    AmbiguousQuery,
    DataAccessFailed,
    SecurityViolation,
    ToolFailure,
    ModelApiError,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::SqlSyntax => "SQL_SYNTAX",
            ErrorCategory::ColumnNotFound => "COLUMN_NOT_FOUND",
            ErrorCategory::TableNotFound => "TABLE_NOT_FOUND",
            ErrorCategory::AmbiguousQuery => "AMBIGUOUS_QUERY",
            ErrorCategory::DataAccessFailed => "DATA_ACCESS_FAILED",
            ErrorCategory::SecurityViolation => "SECURITY_VIOLATION",
            ErrorCategory::ToolFailure => "TOOL_FAILURE",
            ErrorCategory::ModelApiError => "MODEL_API_ERROR",
        }
    }

    /// Recoverable by regenerating the query.
    pub fn is_repairable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::SqlSyntax | ErrorCategory::ColumnNotFound | ErrorCategory::TableNotFound
        )
    }

    /// Ends the turn at once and is shown to the user verbatim.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorCategory::SecurityViolation | ErrorCategory::DataAccessFailed)
    }

    /// Infrastructure fault: generic user message, one retry with backoff.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, ErrorCategory::ToolFailure | ErrorCategory::ModelApiError)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

lazy_static! {
    static ref ACCESS_DENIED_RE: Regex = Regex::new(
        r"(?i)permission denied|access denied|not authori[sz]ed|insufficient privilege|must be owner"
    )
    .expect("access denied pattern");
    static ref AMBIGUOUS_RE: Regex = Regex::new(r"(?i)\bambiguous\b").expect("ambiguous pattern");
    static ref MISSING_COLUMN_RE: Regex = Regex::new(
        r#"(?ix)
        column \s+ ["'`]? (?P<a>[\w.]+) ["'`]? \s+ (?:does \s+ not \s+ exist|not \s+ found|could \s+ not \s+ be \s+ resolved)
        | unknown \s+ column \s+ ["'`]? (?P<b>[\w.]+) ["'`]?
        | no \s+ such \s+ column: \s* ["'`]? (?P<c>[\w.]+)
        | referenced \s+ column \s+ ["'`]? (?P<d>[\w.]+) ["'`]? \s+ not \s+ found
        | invalid \s+ column \s+ name \s+ ["'`]? (?P<e>[\w.]+)
        "#
    )
    .expect("missing column pattern");
    static ref MISSING_TABLE_RE: Regex = Regex::new(
        r#"(?ix)
        (?:table|relation) \s+ (?:with \s+ name \s+)? ["'`]? (?P<a>[\w.]+) ["'`]? \s+ (?:does \s+ not \s+ exist|not \s+ found)
        | no \s+ such \s+ table: \s* ["'`]? (?P<b>[\w.]+)
        | unknown \s+ table \s+ ["'`]? (?P<c>[\w.]+)
        | invalid \s+ object \s+ name \s+ ["'`]? (?P<d>[\w.]+)
        "#
    )
    .expect("missing table pattern");
    static ref SYNTAX_RE: Regex = Regex::new(
        r"(?i)syntax error|parse error|parser error|mismatched input|unexpected token|near .* syntax"
    )
    .expect("syntax pattern");
    static ref HINT_RE: Regex = Regex::new(
        r#"(?ix)
        hint: \s* (?:perhaps \s+ you \s+ meant \s+ to \s+ reference \s+ the \s+ (?:column|table) \s+)? ["'`]? (?P<a>[\w.]+)
        | did \s+ you \s+ mean \s+ ["'`]? (?P<b>[\w.]+)
        | maybe \s+ you \s+ meant \s+ ["'`]? (?P<c>[\w.]+)
        | candidate \s+ bindings: \s* ["'`]? (?P<d>[\w.]+)
        "#
    )
    .expect("hint pattern");
    static ref ERROR_PREFIX_RE: Regex =
        Regex::new(r"(?i)^\s*(?:error|exception|binder error|catalog error|parser error)\s*:\s*")
            .expect("error prefix pattern");
}

/// Structured view of a raw engine error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedEngineError {
    /// First line, with generic `ERROR:` style prefixes removed.
    pub primary: String,
    /// Identifier the engine complained about.
    pub failing_identifier: Option<String>,
    /// Identifier the engine suggested instead.
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify raw engine text. Unrecognized engine messages count as a
    /// query error (the engine answered, the query was wrong); transport
    /// failures never reach this function.
    pub fn classify(&self, raw_error: &str) -> ErrorCategory {
        let text = raw_error.trim();
        if text.starts_with(DATA_ACCESS_SENTINEL) || ACCESS_DENIED_RE.is_match(text) {
            return ErrorCategory::DataAccessFailed;
        }
        if MISSING_COLUMN_RE.is_match(text) {
            return ErrorCategory::ColumnNotFound;
        }
        if MISSING_TABLE_RE.is_match(text) {
            return ErrorCategory::TableNotFound;
        }
        if AMBIGUOUS_RE.is_match(text) {
            return ErrorCategory::AmbiguousQuery;
        }
        if SYNTAX_RE.is_match(text) {
            return ErrorCategory::SqlSyntax;
        }
        ErrorCategory::SqlSyntax
    }

    pub fn parse(&self, raw_error: &str) -> ParsedEngineError {
        let first_line = raw_error.trim().lines().next().unwrap_or("").trim();
        let primary = ERROR_PREFIX_RE.replace(first_line, "").trim().to_string();

        let failing_identifier = MISSING_COLUMN_RE
            .captures(raw_error)
            .or_else(|| MISSING_TABLE_RE.captures(raw_error))
            .and_then(|caps| first_named(&caps, &["a", "b", "c", "d", "e"]));
        let hint = HINT_RE
            .captures(raw_error)
            .and_then(|caps| first_named(&caps, &["a", "b", "c", "d"]));

        ParsedEngineError {
            primary,
            failing_identifier,
            hint,
        }
    }
}

fn first_named(caps: &regex::Captures, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|n| caps.name(n))
        .map(|m| m.as_str().trim_end_matches('.').to_string())
        .filter(|s| !s.is_empty())
}
