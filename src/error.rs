use crate::execution_loop::error_classifier::ErrorCategory;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatBiError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tenant error: {0}")]
    Tenant(String),

    #[error("Tenant mismatch: context belongs to '{expected}', operation targets '{actual}'")]
    TenantMismatch { expected: String, actual: String },

    #[error("Security violation: {0}")]
    Security(String),

    #[error("Semantic model error: {0}")]
    Semantic(String),

    #[error("No join path connects '{from}' and '{to}'")]
    JoinPathNotFound { from: String, to: String },

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Tool failure: {0}")]
    Tool(String),

    #[error("Data access failed: {0}")]
    DataAccess(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("State machine error: {0}")]
    InvalidTransition(String),

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Turn exceeded its time budget of {0} seconds")]
    TurnTimeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ChatBiError {
    /// Map onto the closed failure taxonomy used by the turn report.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            ChatBiError::Security(_) => Some(ErrorCategory::SecurityViolation),
            ChatBiError::DataAccess(_) => Some(ErrorCategory::DataAccessFailed),
            ChatBiError::Llm(_) => Some(ErrorCategory::ModelApiError),
            ChatBiError::Tool(_) => Some(ErrorCategory::ToolFailure),
            _ => None,
        }
    }

    /// Infrastructure faults get one retry with backoff; nothing else does.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChatBiError::Llm(_) | ChatBiError::Tool(_))
    }
}

pub type Result<T> = std::result::Result<T, ChatBiError>;
