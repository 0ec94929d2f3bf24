//! Turn State Machine
//!
//! `PLANNING → (CLARIFYING) → GENERATING → VALIDATING → EXECUTING →
//! (REFLECTING → GENERATING …) → RESPONDING → DONE`, with `ABANDONED`
//! reachable from every non-terminal state. The table below is the only
//! place transitions are decided.

use crate::error::{ChatBiError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnState {
    Planning,
    Clarifying,
    Generating,
    Validating,
    Executing,
    Reflecting,
    Responding,
    Done,
    Abandoned,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnState::Done | TurnState::Abandoned)
    }

    /// Transition table.
    pub fn can_transition_to(&self, next: TurnState) -> bool {
        use TurnState::*;
        if next == Abandoned {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Planning, Clarifying)
                | (Planning, Generating)
                | (Clarifying, Planning)
                | (Generating, Validating)
                | (Validating, Executing)
                | (Executing, Reflecting)
                | (Executing, Responding)
                | (Reflecting, Generating)
                // An engine hint applied directly still goes through the gate.
                | (Reflecting, Validating)
                | (Reflecting, Clarifying)
                | (Reflecting, Responding)
                | (Responding, Done)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Planning => "PLANNING",
            TurnState::Clarifying => "CLARIFYING",
            TurnState::Generating => "GENERATING",
            TurnState::Validating => "VALIDATING",
            TurnState::Executing => "EXECUTING",
            TurnState::Reflecting => "REFLECTING",
            TurnState::Responding => "RESPONDING",
            TurnState::Done => "DONE",
            TurnState::Abandoned => "ABANDONED",
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state plus the path taken to reach it.
#[derive(Debug, Clone)]
pub struct TurnStateMachine {
    state: TurnState,
    history: Vec<TurnState>,
}

impl Default for TurnStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnStateMachine {
    pub fn new() -> Self {
        Self {
            state: TurnState::Planning,
            history: vec![TurnState::Planning],
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn history(&self) -> &[TurnState] {
        &self.history
    }

    pub fn transition(&mut self, next: TurnState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ChatBiError::InvalidTransition(format!(
                "{} -> {}",
                self.state, next
            )));
        }
        debug!("Turn state {} -> {}", self.state, next);
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Move to ABANDONED unless the turn already ended.
    pub fn abandon(&mut self) {
        if !self.state.is_terminal() {
            self.state = TurnState::Abandoned;
            self.history.push(TurnState::Abandoned);
        }
    }

    /// How many times the turn entered `state`.
    pub fn visits(&self, state: TurnState) -> usize {
        self.history.iter().filter(|s| **s == state).count()
    }
}
