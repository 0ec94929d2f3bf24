//! Error classification and the bounded repair loop.

pub mod error_classifier;
pub mod error_recovery;
pub mod r#loop;

pub use error_classifier::{ErrorCategory, ErrorClassifier, ParsedEngineError};
pub use error_recovery::{ReflectionResult, Reflector};
pub use r#loop::{FailedAttempt, RepairBudget, RepairHistory};
