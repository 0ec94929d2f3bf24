//! Reasoning agent: planning, clarification, tool use and the turn loop.

pub mod clarification;
pub mod contracts;
pub mod planner;
pub mod prompts;
pub mod runtime;
pub mod state;
pub mod tools;
pub mod visualization;

pub use clarification::{
    ClarificationAnswer, ClarificationBroker, ClarificationOption, ClarificationQuestion,
    ClarificationType,
};
pub use contracts::{FailureReport, TurnOutcome, TurnReport, TurnRequest};
pub use planner::{ExecutionPlan, PlanParser, PlanStep, Planner, StepKind, StepStatus};
pub use runtime::ReasoningOrchestrator;
pub use state::{TurnState, TurnStateMachine};
pub use tools::{AuditTrail, HttpQueryExecutor, QueryExecutor, QueryResult, ToolCall, ToolOutcome};
