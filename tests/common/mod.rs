//! Shared fixtures: a metadata directory on disk, a scripted model and a
//! scripted executor.

#![allow(dead_code)]

use async_trait::async_trait;
use chatbi_reasoner::agent::{prompts, QueryExecutor, QueryResult, ToolOutcome, TurnReport, TurnRequest};
use chatbi_reasoner::config::{OrchestratorConfig, PruningConfig, RetryPolicy};
use chatbi_reasoner::error::{ChatBiError, Result};
use chatbi_reasoner::llm::{CompletionRequest, LanguageModel, TokenStream};
use chatbi_reasoner::security::ApprovedQuery;
use chatbi_reasoner::semantic::{HashingEmbedder, SemanticCatalog};
use chatbi_reasoner::stream::StreamEvent;
use chatbi_reasoner::tenant::{MetadataTenantDirectory, RawRequest, TenantContext, TenantGuard};
use chatbi_reasoner::ReasoningOrchestrator;
use chrono::NaiveDate;
use serde_json::json;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const ORDERS_YAML: &str = r#"
name: Orders
sql_table: orders
description: One row per customer order
measures:
  - name: total_revenue
    sql: SUM(total_amount)
    title: Total revenue
  - name: order_count
    sql: COUNT(*)
dimensions:
  - name: region
    sql: region
  - name: order_date
    sql: order_date
    type: time
"#;

const EMPLOYEES_YAML: &str = r#"
name: Employees
sql_table: employees
measures:
  - name: headcount
    sql: COUNT(*)
dimensions:
  - name: department
    sql: department
  - name: employee_name
    sql: name
"#;

const GLOSSARY_JSON: &str = r#"{
  "entries": [
    {"id": "g1", "term": "总收入", "aliases": ["营收"], "mapping_type": "measure",
     "target_value": "Orders.total_revenue"},
    {"id": "g2", "term": "销售部", "mapping_type": "dimension_value", "target_value": "销售部",
     "metadata": {"cube": "Employees", "dimension": "department"}}
  ]
}"#;

pub const TODAY: (i32, u32, u32) = (2024, 5, 15);

pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(TODAY.0, TODAY.1, TODAY.2).unwrap()
}

/// Metadata root with one active tenant `acme` and one suspended tenant.
pub fn metadata_root() -> TempDir {
    let root = tempfile::tempdir().unwrap();
    write_tenant(root.path(), "acme");
    std::fs::create_dir_all(root.path().join("dormant")).unwrap();
    std::fs::write(root.path().join("dormant").join("tenant.yaml"), "status: suspended\n").unwrap();
    root
}

pub fn write_tenant(root: &Path, tenant: &str) {
    let schema = root.join(tenant).join("schema");
    std::fs::create_dir_all(&schema).unwrap();
    std::fs::write(schema.join("orders.yaml"), ORDERS_YAML).unwrap();
    std::fs::write(schema.join("employees.yaml"), EMPLOYEES_YAML).unwrap();
    std::fs::write(root.join(tenant).join("glossary.json"), GLOSSARY_JSON).unwrap();
}

pub async fn attach(root: &Path, tenant: &str, session: &str) -> Result<TenantContext> {
    TenantGuard::new(Arc::new(MetadataTenantDirectory::new(root)))
        .attach(&RawRequest {
            tenant_id: Some(tenant.to_string()),
            user_id: Some("analyst".to_string()),
            session_id: Some(session.to_string()),
        })
        .await
}

pub fn plan_json(confidence: f64) -> String {
    json!({
        "steps": [
            {"kind": "UNDERSTAND", "description": "Read the question"},
            {"kind": "GENERATE", "description": "Write the query"},
            {"kind": "EXECUTE"}
        ],
        "confidence": confidence,
        "reasoning": "scripted"
    })
    .to_string()
}

/// Model double routed on the system prompt of each request.
#[derive(Default)]
pub struct ScriptedModel {
    plans: Mutex<VecDeque<String>>,
    queries: Mutex<VecDeque<String>>,
    answer: Mutex<Option<String>>,
    generation_requests: Mutex<Vec<String>>,
    stall: Option<Duration>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(self, reply: impl Into<String>) -> Self {
        self.plans.lock().unwrap().push_back(reply.into());
        self
    }

    pub fn query(self, sql: impl Into<String>) -> Self {
        self.queries.lock().unwrap().push_back(sql.into());
        self
    }

    pub fn answer(self, text: impl Into<String>) -> Self {
        *self.answer.lock().unwrap() = Some(text.into());
        self
    }

    /// Delay every reply by `delay`.
    pub fn stall(mut self, delay: Duration) -> Self {
        self.stall = Some(delay);
        self
    }

    /// User messages of every generation request, in order.
    pub fn generation_requests(&self) -> Vec<String> {
        self.generation_requests.lock().unwrap().clone()
    }

    /// Pop the next scripted reply; the last one repeats.
    fn next(queue: &Mutex<VecDeque<String>>) -> Option<String> {
        let mut queue = queue.lock().unwrap();
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }

    fn reply_for(&self, request: &CompletionRequest) -> Result<String> {
        let system = request.messages.first().map(|m| m.content.as_str()).unwrap_or_default();
        if system == prompts::PLANNER_SYSTEM_PROMPT {
            Ok(Self::next(&self.plans).unwrap_or_else(|| plan_json(0.9)))
        } else if system == prompts::GENERATOR_SYSTEM_PROMPT {
            self.generation_requests
                .lock()
                .unwrap()
                .push(request.last_user_message().unwrap_or_default().to_string());
            Self::next(&self.queries)
                .map(|sql| format!("```sql\n{}\n```", sql))
                .ok_or_else(|| ChatBiError::Semantic("no scripted query".to_string()))
        } else if system == prompts::ANSWER_SYSTEM_PROMPT {
            Ok(self
                .answer
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| "The result is shown above.".to_string()))
        } else {
            Err(ChatBiError::Semantic(format!("unexpected prompt: {}", system)))
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        _cancel: &CancellationToken,
    ) -> Result<TokenStream> {
        if let Some(delay) = self.stall {
            tokio::time::sleep(delay).await;
        }
        let reply = self.reply_for(request)?;
        let tokens: Vec<Result<String>> = reply
            .split_inclusive(' ')
            .map(|t| Ok(t.to_string()))
            .collect();
        Ok(Box::pin(futures_util::stream::iter(tokens)))
    }
}

/// Executor double returning queued outcomes; the last one repeats.
#[derive(Default)]
pub struct ScriptedExecutor {
    outcomes: Mutex<VecDeque<ToolOutcome>>,
    executed: Mutex<Vec<(String, String)>>,
    transient_failures: Mutex<usize>,
}

impl ScriptedExecutor {
    pub fn new(outcomes: Vec<ToolOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            executed: Mutex::new(Vec::new()),
            transient_failures: Mutex::new(0),
        }
    }

    /// Fail the first `count` calls with a transport error.
    pub fn failing_first(self, count: usize) -> Self {
        *self.transient_failures.lock().unwrap() = count;
        self
    }

    /// `(tenant_id, sql)` for every execution.
    pub fn executed(&self) -> Vec<(String, String)> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueryExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        ctx: &TenantContext,
        query: &ApprovedQuery,
        _cancel: &CancellationToken,
    ) -> Result<ToolOutcome> {
        self.executed
            .lock()
            .unwrap()
            .push((ctx.tenant_id().to_string(), query.sql().to_string()));
        {
            let mut failures = self.transient_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ChatBiError::Tool("connection reset by data service".to_string()));
            }
        }
        let mut outcomes = self.outcomes.lock().unwrap();
        let outcome = if outcomes.len() > 1 {
            outcomes.pop_front()
        } else {
            outcomes.front().cloned()
        };
        outcome.ok_or_else(|| ChatBiError::Tool("no scripted outcome".to_string()))
    }
}

pub fn rows(columns: &[&str], rows: Vec<Vec<serde_json::Value>>) -> ToolOutcome {
    ToolOutcome::Success(QueryResult {
        columns: columns.iter().map(|c| c.to_string()).collect(),
        rows,
    })
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        clarification_wait: Duration::ZERO,
        turn_timeout: Duration::from_secs(10),
        infra_retry: RetryPolicy::none(),
        event_buffer: 256,
        ..OrchestratorConfig::default()
    }
}

pub fn retrying_config() -> OrchestratorConfig {
    OrchestratorConfig {
        infra_retry: RetryPolicy {
            max_retries: 1,
            initial_delay: Duration::from_millis(10),
            ..RetryPolicy::default()
        },
        ..test_config()
    }
}

pub struct Harness {
    pub root: TempDir,
    pub model: Arc<ScriptedModel>,
    pub executor: Arc<ScriptedExecutor>,
    pub orchestrator: Arc<ReasoningOrchestrator>,
}

impl Harness {
    pub fn new(model: ScriptedModel, executor: ScriptedExecutor) -> Self {
        Self::with_config(model, executor, test_config())
    }

    pub fn with_config(model: ScriptedModel, executor: ScriptedExecutor, config: OrchestratorConfig) -> Self {
        let root = metadata_root();
        let model = Arc::new(model);
        let executor = Arc::new(executor);
        let catalog = SemanticCatalog::new(Arc::new(HashingEmbedder::default()), PruningConfig::default())
            .with_metadata_root(root.path());
        let orchestrator = ReasoningOrchestrator::new(
            Arc::clone(&model) as Arc<dyn LanguageModel>,
            Arc::clone(&executor) as Arc<dyn QueryExecutor>,
            Arc::new(catalog),
            config,
        )
        .with_today(today());
        Self {
            root,
            model,
            executor,
            orchestrator: Arc::new(orchestrator),
        }
    }

    pub async fn ctx(&self) -> TenantContext {
        attach(self.root.path(), "acme", "session-1").await.unwrap()
    }

    /// Run a turn to completion and collect every event it emitted.
    pub async fn ask(&self, question: &str) -> (TurnReport, Vec<StreamEvent>) {
        self.run(TurnRequest::new(question)).await
    }

    pub async fn run(&self, request: TurnRequest) -> (TurnReport, Vec<StreamEvent>) {
        let ctx = self.ctx().await;
        let (tx, mut rx) = mpsc::channel(256);
        let report = self
            .orchestrator
            .run_turn(&ctx, request, tx, CancellationToken::new())
            .await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (report, events)
    }
}

pub fn errors(events: &[StreamEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Error { message } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

pub fn content(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Content { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect()
}
