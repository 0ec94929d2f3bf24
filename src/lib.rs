pub mod agent;
pub mod config;
pub mod error;
pub mod execution_loop;
pub mod llm;
pub mod security;
pub mod semantic;
pub mod stream;
pub mod tenant;

pub use agent::{ReasoningOrchestrator, TurnOutcome, TurnReport, TurnRequest};
pub use config::{AppConfig, OrchestratorConfig};
pub use error::{ChatBiError, Result};
pub use tenant::{TenantContext, TenantGuard};
