//! Tool boundary: query execution and the audit trail.
//!
//! Executors return a typed [`ToolOutcome`]. Tools that can only answer
//! with text go through [`ToolOutcome::from_raw`], which recognizes the
//! data-access sentinel.

use crate::config::DATA_ACCESS_SENTINEL;
use crate::error::{ChatBiError, Result};
use crate::security::ApprovedQuery;
use crate::tenant::TenantContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Shape only, no values. Safe for audit records.
    pub fn summary(&self) -> String {
        format!(
            "{} rows x {} columns ({})",
            self.rows.len(),
            self.columns.len(),
            self.columns.join(", ")
        )
    }

    /// First `limit` rows as a markdown table.
    pub fn to_markdown(&self, limit: usize) -> String {
        let mut out = format!("| {} |\n", self.columns.join(" | "));
        out.push_str(&format!("|{}\n", "---|".repeat(self.columns.len())));
        for row in self.rows.iter().take(limit) {
            out.push_str(&format!("| {} |\n", row.iter().map(cell_text).join(" | ")));
        }
        if self.rows.len() > limit {
            out.push_str(&format!("... {} more rows\n", self.rows.len() - limit));
        }
        out
    }
}

pub fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}

/// What a query execution produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(QueryResult),
    /// The engine ran and rejected the query; candidate for repair.
    EngineError(String),
    /// The data could not be reached. Stops the turn.
    DataAccessFailed(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawToolReply {
    Rows(QueryResult),
    Error { error: String },
}

impl ToolOutcome {
    /// Interpret a text reply from a tool that cannot return typed results.
    pub fn from_raw(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.starts_with(DATA_ACCESS_SENTINEL) {
            return ToolOutcome::DataAccessFailed(trimmed.to_string());
        }
        match serde_json::from_str::<RawToolReply>(trimmed) {
            Ok(RawToolReply::Rows(result)) => ToolOutcome::Success(result),
            Ok(RawToolReply::Error { error }) if error.trim().starts_with(DATA_ACCESS_SENTINEL) => {
                ToolOutcome::DataAccessFailed(error.trim().to_string())
            }
            Ok(RawToolReply::Error { error }) => ToolOutcome::EngineError(error),
            Err(_) => ToolOutcome::EngineError(trimmed.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success(_))
    }
}

/// External data collaborator. Only an [`ApprovedQuery`] can be executed.
///
/// `Err` means the call itself failed (transport, timeout); the engine's
/// own verdict comes back as a [`ToolOutcome`].
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(
        &self,
        ctx: &TenantContext,
        query: &ApprovedQuery,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome>;
}

/// Executes queries through an HTTP data service.
pub struct HttpQueryExecutor {
    client: reqwest::Client,
    url: String,
}

impl HttpQueryExecutor {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatBiError::Tool(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl QueryExecutor for HttpQueryExecutor {
    async fn execute(
        &self,
        ctx: &TenantContext,
        query: &ApprovedQuery,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome> {
        let send = self
            .client
            .post(&self.url)
            .header("X-Tenant-Id", ctx.tenant_id())
            .header("X-User-Id", ctx.user_id())
            .header("X-Session-Id", ctx.session_id())
            .json(&serde_json::json!({"sql": query.sql(), "tenant_id": ctx.tenant_id()}))
            .send();

        let reply = async {
            let response = send
                .await
                .map_err(|e| ChatBiError::Tool(format!("Query service call failed: {}", e)))?;
            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| ChatBiError::Tool(format!("Failed to read query service response: {}", e)))?;
            Ok::<_, ChatBiError>((status, body))
        };

        let (status, body) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatBiError::Cancelled),
            reply = reply => reply?,
        };
        debug!(status = %status, bytes = body.len(), "Query service replied");

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Ok(ToolOutcome::DataAccessFailed(format!(
                "{} access denied ({})",
                DATA_ACCESS_SENTINEL, status
            )));
        }
        if status.is_server_error() {
            warn!("Query service error ({}): {}", status, body);
            return Err(ChatBiError::Tool(format!("Query service error ({})", status)));
        }
        Ok(ToolOutcome::from_raw(&body))
    }
}

/// Append-only record of one external tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
    pub result_summary: String,
    pub timestamp: DateTime<Utc>,
}

/// Tool calls of one turn, in order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditTrail {
    calls: Vec<ToolCall>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: &str, arguments: Value, result_summary: impl Into<String>) {
        self.calls.push(ToolCall {
            name: name.to_string(),
            arguments,
            result_summary: result_summary.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn calls(&self) -> &[ToolCall] {
        &self.calls
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls.iter().filter(|c| c.name == name).count()
    }

    pub fn into_calls(self) -> Vec<ToolCall> {
        self.calls
    }
}
