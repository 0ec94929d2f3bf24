//! Repair Loop Bookkeeping
//!
//! The budget is a plain counter owned by the turn. Nothing else decides
//! whether another attempt may run.

use crate::execution_loop::error_classifier::ErrorCategory;
use crate::execution_loop::error_recovery::ReflectionResult;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Additional generation attempts allowed after the first failed
/// execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairBudget {
    max: u8,
    used: u8,
}

impl RepairBudget {
    pub fn new(max: u8) -> Self {
        Self { max, used: 0 }
    }

    /// Take one attempt. Returns `false` once the ceiling is reached.
    pub fn try_consume(&mut self) -> bool {
        if self.used >= self.max {
            warn!("Repair budget exhausted after {} attempts", self.used);
            return false;
        }
        self.used += 1;
        info!("Repair attempt {} of {}", self.used, self.max);
        true
    }

    pub fn used(&self) -> u8 {
        self.used
    }

    pub fn remaining(&self) -> u8 {
        self.max - self.used
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.max
    }
}

/// One executed query that failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub sql: String,
    pub raw_error: String,
    pub category: ErrorCategory,
    pub diagnosis: String,
}

/// Failed attempts of one turn, for the audit trail and for the list of
/// identifiers the next attempt must avoid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairHistory {
    attempts: Vec<FailedAttempt>,
    forbidden: Vec<String>,
}

impl RepairHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sql: &str, raw_error: &str, reflection: &ReflectionResult) {
        if let Some(identifier) = &reflection.failing_identifier {
            if !self.forbidden.iter().any(|f| f.eq_ignore_ascii_case(identifier)) {
                self.forbidden.push(identifier.clone());
            }
        }
        self.attempts.push(FailedAttempt {
            sql: sql.to_string(),
            raw_error: raw_error.to_string(),
            category: reflection.error_category,
            diagnosis: reflection.diagnosis.clone(),
        });
    }

    pub fn forbidden_identifiers(&self) -> &[String] {
        &self.forbidden
    }

    pub fn attempts(&self) -> &[FailedAttempt] {
        &self.attempts
    }

    /// Only the last failure is ever shown to the user.
    pub fn last(&self) -> Option<&FailedAttempt> {
        self.attempts.last()
    }

    pub fn is_repeat(&self, sql: &str) -> bool {
        let normalized = normalize(sql);
        self.attempts.iter().any(|a| normalize(&a.sql) == normalized)
    }
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace()
        .join(" ")
        .trim_end_matches(';')
        .to_lowercase()
}
