//! Turn request and report types.

use crate::agent::clarification::{ClarificationAnswer, ClarificationQuestion};
use crate::agent::planner::ExecutionPlan;
use crate::agent::state::TurnState;
use crate::agent::tools::{QueryResult, ToolCall};
use crate::execution_loop::ErrorCategory;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnRequest {
    pub question: String,
    /// Answers to clarifications from an earlier turn, merged into the
    /// question before planning.
    #[serde(default)]
    pub clarifications: Vec<ClarificationAnswer>,
}

impl TurnRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            clarifications: Vec::new(),
        }
    }

    pub fn with_clarification(mut self, answer: ClarificationAnswer) -> Self {
        self.clarifications.push(answer);
        self
    }
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Answered,
    SecurityViolation,
    DataAccessFailed,
    RepairExhausted,
    /// The engine error was not something a new query can fix.
    QueryFailed,
    ClarificationUnanswered,
    SemanticError,
    /// Tenant precondition failed.
    Rejected,
    InfrastructureFailure,
    Cancelled,
    TimedOut,
}

impl TurnOutcome {
    pub fn terminal_state(&self) -> TurnState {
        match self {
            TurnOutcome::Answered => TurnState::Done,
            _ => TurnState::Abandoned,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TurnOutcome::Answered => "answered",
            TurnOutcome::SecurityViolation => "security_violation",
            TurnOutcome::DataAccessFailed => "data_access_failed",
            TurnOutcome::RepairExhausted => "repair_exhausted",
            TurnOutcome::QueryFailed => "query_failed",
            TurnOutcome::ClarificationUnanswered => "clarification_unanswered",
            TurnOutcome::SemanticError => "semantic_error",
            TurnOutcome::Rejected => "rejected",
            TurnOutcome::InfrastructureFailure => "infrastructure_failure",
            TurnOutcome::Cancelled => "cancelled",
            TurnOutcome::TimedOut => "timed_out",
        }
    }
}

/// The single failure message a user sees for a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
    pub message: String,
    /// Last attempted query, when one was generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnReport {
    pub turn_id: String,
    pub tenant_id: String,
    pub session_id: String,
    pub outcome: TurnOutcome,
    pub final_state: TurnState,
    pub state_history: Vec<TurnState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<ExecutionPlan>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clarifications: Vec<ClarificationQuestion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<QueryResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
    pub executions: usize,
    pub repair_attempts: u8,
    pub tool_calls: Vec<ToolCall>,
}

impl TurnReport {
    pub fn is_answered(&self) -> bool {
        self.outcome == TurnOutcome::Answered
    }
}
