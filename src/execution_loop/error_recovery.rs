//! Error Recovery
//!
//! Turns a failed execution into a [`ReflectionResult`] and, from that, a
//! repair: either a direct substitution of the engine's hint (when the hint
//! names something in the pruned schema) or an instruction for the model to
//! regenerate the query.

use crate::execution_loop::error_classifier::{ErrorCategory, ErrorClassifier};
use crate::semantic::pruning::PrunedSchema;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectionResult {
    pub error_category: ErrorCategory,
    pub diagnosis: String,
    pub fix_suggestion: String,
    pub should_retry: bool,
    pub failing_identifier: Option<String>,
    /// Engine hint, kept only when it names something in the pruned schema.
    pub fix_target: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Reflector {
    classifier: ErrorClassifier,
}

impl Reflector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reflect(&self, failing_sql: &str, raw_error: &str, pruned: &PrunedSchema) -> ReflectionResult {
        let error_category = self.classifier.classify(raw_error);
        let parsed = self.classifier.parse(raw_error);

        let fix_target = parsed
            .hint
            .as_deref()
            .filter(|hint| pruned.contains_identifier(hint))
            .map(str::to_string);
        if parsed.hint.is_some() && fix_target.is_none() {
            debug!("Ignoring engine hint {:?}: not in pruned schema", parsed.hint);
        }

        let fix_suggestion = match (&fix_target, &parsed.failing_identifier) {
            (Some(target), Some(failing)) => format!("Replace `{}` with `{}`", failing, target),
            (Some(target), None) => format!("Use `{}` as suggested by the engine", target),
            _ => generic_suggestion(error_category).to_string(),
        };

        ReflectionResult {
            error_category,
            diagnosis: if parsed.primary.is_empty() {
                format!("{} while running: {}", error_category, failing_sql)
            } else {
                parsed.primary
            },
            fix_suggestion,
            should_retry: error_category.is_repairable(),
            failing_identifier: parsed.failing_identifier,
            fix_target,
        }
    }

    /// Apply the engine's hint directly. Only identifiers outside string
    /// literals are replaced, matched on whole words.
    pub fn apply_hint(&self, failing_sql: &str, reflection: &ReflectionResult) -> Option<String> {
        let target = reflection.fix_target.as_deref()?;
        let failing = reflection.failing_identifier.as_deref()?;
        let from = last_segment(failing);
        let to = last_segment(target);
        if from.eq_ignore_ascii_case(to) {
            return None;
        }
        let pattern = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(from))).ok()?;
        let repaired = replace_outside_literals(failing_sql, &pattern, to);
        (repaired != failing_sql).then_some(repaired)
    }

    /// Instruction appended to the generation prompt for the next attempt.
    pub fn repair_instruction(
        &self,
        reflection: &ReflectionResult,
        failing_sql: &str,
        forbidden_identifiers: &[String],
        attempt: u8,
    ) -> String {
        let mut parts = vec![
            format!("Repair attempt {}: the previous query failed.", attempt),
            format!("Failed query: {}", failing_sql),
            format!("Error ({}): {}", reflection.error_category, reflection.diagnosis),
            format!("Fix: {}", reflection.fix_suggestion),
        ];
        if !forbidden_identifiers.is_empty() {
            parts.push(format!(
                "Do not use these identifiers again: {}",
                forbidden_identifiers.join(", ")
            ));
        }
        parts.push(
            "Use only tables and columns from the schema above. The new query must be a single \
             read-only statement (SELECT/WITH) and will be checked by the security gate again."
                .to_string(),
        );
        parts.join("\n")
    }
}

fn generic_suggestion(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::ColumnNotFound => "Use only column names listed in the schema",
        ErrorCategory::TableNotFound => "Use only tables listed in the schema",
        ErrorCategory::SqlSyntax => "Rewrite the query with valid SQL syntax",
        ErrorCategory::AmbiguousQuery => "Ask the user which interpretation they meant",
        ErrorCategory::DataAccessFailed => "Report that the data could not be accessed",
        ErrorCategory::SecurityViolation => "Only read-only queries are permitted",
        ErrorCategory::ToolFailure | ErrorCategory::ModelApiError => "Try again later",
    }
}

fn last_segment(identifier: &str) -> &str {
    identifier.rsplit('.').next().unwrap_or(identifier)
}

fn replace_outside_literals(sql: &str, pattern: &Regex, replacement: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut plain = String::new();
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\'' {
            out.push_str(&pattern.replace_all(&plain, regex::NoExpand(replacement)));
            plain.clear();
            out.push(c);
            // Copy the literal verbatim, honouring '' escapes.
            while let Some(inner) = chars.next() {
                out.push(inner);
                if inner == '\'' {
                    if chars.peek() == Some(&'\'') {
                        if let Some(escaped) = chars.next() {
                            out.push(escaped);
                        }
                    } else {
                        break;
                    }
                }
            }
        } else {
            plain.push(c);
        }
    }
    out.push_str(&pattern.replace_all(&plain, regex::NoExpand(replacement)));
    out
}
