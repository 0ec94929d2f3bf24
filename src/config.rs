//! Configuration
//!
//! Runtime settings loaded from the environment (after `.env` is read by the
//! binaries). Every knob has a default so tests can build configs directly.

use crate::error::{ChatBiError, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Plan confidence below which the orchestrator asks the user first.
pub const DEFAULT_CLARIFY_THRESHOLD: f64 = 0.6;

/// Additional generation attempts after the first failed execution.
pub const DEFAULT_MAX_REPAIR_ATTEMPTS: u8 = 2;

/// Marker a tool returns instead of raising when it cannot reach data.
pub const DATA_ACCESS_SENTINEL: &str = "SYSTEM ERROR:";

/// Knobs for one reasoning turn.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub clarify_threshold: f64,
    pub max_repair_attempts: u8,
    pub max_clarification_rounds: u8,
    /// Counts against `turn_timeout`. Zero ends the turn right after the
    /// questions are sent; the client re-issues it with the answers.
    pub clarification_wait: Duration,
    pub turn_timeout: Duration,
    pub infra_retry: RetryPolicy,
    pub event_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            clarify_threshold: DEFAULT_CLARIFY_THRESHOLD,
            max_repair_attempts: DEFAULT_MAX_REPAIR_ATTEMPTS,
            max_clarification_rounds: 2,
            clarification_wait: Duration::from_secs(60),
            turn_timeout: Duration::from_secs(120),
            infra_retry: RetryPolicy::default(),
            event_buffer: 64,
        }
    }
}

/// Retry policy for infrastructure faults (model API, tool transport).
///
/// Kept apart from the query repair budget: a flaky network call never
/// consumes a repair attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Exponential backoff, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let delay_ms =
            (self.initial_delay.as_millis() as f64) * self.backoff_multiplier.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Schema pruning limits.
#[derive(Debug, Clone)]
pub struct PruningConfig {
    pub min_similarity: f32,
    pub max_measures: usize,
    pub max_dimensions: usize,
    pub max_cubes: usize,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            min_similarity: 0.35,
            max_measures: 12,
            max_dimensions: 20,
            max_cubes: 6,
        }
    }
}

/// Process-level configuration for the binaries.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub llm_model: String,
    pub embedding_model: String,
    pub executor_url: String,
    /// Per-tenant metadata lives under `<metadata_root>/<tenant_id>/`.
    pub metadata_root: PathBuf,
    pub bind_addr: String,
    pub glossary_poll_interval: Duration,
    pub orchestrator: OrchestratorConfig,
    pub pruning: PruningConfig,
}

impl AppConfig {
    /// Read settings from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut orchestrator = OrchestratorConfig::default();
        if let Some(threshold) = env_parse::<f64>("CHATBI_CLARIFY_THRESHOLD")? {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ChatBiError::Config(format!(
                    "CHATBI_CLARIFY_THRESHOLD must be within [0, 1], got {}",
                    threshold
                )));
            }
            orchestrator.clarify_threshold = threshold;
        }
        if let Some(attempts) = env_parse::<u8>("CHATBI_MAX_REPAIR_ATTEMPTS")? {
            orchestrator.max_repair_attempts = attempts;
        }
        if let Some(secs) = env_parse::<u64>("CHATBI_TURN_TIMEOUT_SECS")? {
            orchestrator.turn_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("CHATBI_CLARIFY_WAIT_SECS")? {
            orchestrator.clarification_wait = Duration::from_secs(secs);
        }

        let mut pruning = PruningConfig::default();
        if let Some(min) = env_parse::<f32>("CHATBI_PRUNE_MIN_SIMILARITY")? {
            pruning.min_similarity = min;
        }

        Ok(Self {
            openai_api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            openai_base_url: env_or("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            llm_model: env_or("LLM_MODEL", "gpt-4o-mini"),
            embedding_model: env_or("EMBEDDING_MODEL", "text-embedding-3-small"),
            executor_url: env_or("CHATBI_EXECUTOR_URL", "http://localhost:8090/query"),
            metadata_root: PathBuf::from(env_or("CHATBI_METADATA_DIR", "metadata")),
            bind_addr: env_or("CHATBI_BIND_ADDR", "0.0.0.0:8080"),
            glossary_poll_interval: Duration::from_secs(
                env_parse::<u64>("CHATBI_GLOSSARY_POLL_SECS")?.unwrap_or(10),
            ),
            orchestrator,
            pruning,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ChatBiError::Config(format!("{} has invalid value '{}': {}", key, raw, e))),
        _ => Ok(None),
    }
}
