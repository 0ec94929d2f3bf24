//! Reasoning Orchestrator
//!
//! Drives one turn through the state machine in [`crate::agent::state`]:
//! resolve, plan, clarify when unsure, generate, gate, execute, repair, and
//! respond. Every candidate query, including hint-repaired ones, passes
//! [`SecurityGate::approve`]; the executor only accepts the
//! [`ApprovedQuery`] it returns.

use crate::agent::clarification::{
    build_questions, merge_into_question, ClarificationBroker, ClarificationQuestion,
    ClarificationType,
};
use crate::agent::contracts::{FailureReport, TurnOutcome, TurnReport, TurnRequest};
use crate::agent::planner::{ExecutionPlan, Planner, StepKind, StepStatus};
use crate::agent::prompts;
use crate::agent::state::{TurnState, TurnStateMachine};
use crate::agent::tools::{AuditTrail, QueryExecutor, QueryResult, ToolOutcome};
use crate::agent::visualization::build_chart;
use crate::config::OrchestratorConfig;
use crate::error::{ChatBiError, Result};
use crate::execution_loop::{ErrorCategory, Reflector, RepairBudget, RepairHistory};
use crate::llm::{CompletionRequest, LanguageModel};
use crate::security::{ApprovedQuery, SecurityGate};
use crate::semantic::{SemanticCatalog, SemanticContext};
use crate::stream::StreamEvent;
use crate::tenant::TenantContext;
use chrono::NaiveDate;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

const GENERIC_FAILURE_MESSAGE: &str =
    "The service is temporarily unavailable. Please try again in a moment.";
const PREVIEW_ROWS: usize = 20;

/// Mutable state of one turn. Owned by `run_turn`, never shared.
struct Turn<'a> {
    ctx: &'a TenantContext,
    events: &'a mpsc::Sender<StreamEvent>,
    cancel: &'a CancellationToken,
    machine: TurnStateMachine,
    audit: AuditTrail,
    plan: Option<ExecutionPlan>,
    clarifications: Vec<ClarificationQuestion>,
    answer: Option<String>,
    sql: Option<String>,
    result: Option<QueryResult>,
    chart: Option<Value>,
    failure: Option<FailureReport>,
    outcome: Option<TurnOutcome>,
    executions: usize,
    repair_attempts: u8,
}

impl<'a> Turn<'a> {
    fn new(
        ctx: &'a TenantContext,
        events: &'a mpsc::Sender<StreamEvent>,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            ctx,
            events,
            cancel,
            machine: TurnStateMachine::new(),
            audit: AuditTrail::new(),
            plan: None,
            clarifications: Vec::new(),
            answer: None,
            sql: None,
            result: None,
            chart: None,
            failure: None,
            outcome: None,
            executions: 0,
            repair_attempts: 0,
        }
    }

    /// A closed receiver means the client went away.
    async fn emit(&self, event: StreamEvent) -> Result<()> {
        self.events.send(event).await.map_err(|_| {
            debug!("Event receiver closed");
            ChatBiError::Cancelled
        })
    }

    fn transition(&mut self, next: TurnState) -> Result<()> {
        self.machine.transition(next)
    }

    async fn step(&mut self, kind: StepKind) -> Result<()> {
        if let Some(plan) = self.plan.as_mut() {
            plan.mark_running_as(StepStatus::Completed);
            plan.mark(kind, StepStatus::Running);
        }
        self.emit(StreamEvent::step(kind.label())).await
    }

    /// End the turn with one user-visible failure message.
    async fn abandon(
        &mut self,
        outcome: TurnOutcome,
        category: Option<ErrorCategory>,
        message: String,
    ) -> Result<()> {
        warn!(outcome = outcome.as_str(), "Turn abandoned: {}", message);
        self.machine.abandon();
        if let Some(plan) = self.plan.as_mut() {
            plan.mark_running_as(StepStatus::Failed);
        }
        self.outcome = Some(outcome);
        self.failure = Some(FailureReport {
            category,
            message: message.clone(),
            sql: self.sql.clone(),
        });
        self.emit(StreamEvent::error(message)).await
    }

    fn into_report(self, turn_id: String) -> TurnReport {
        let outcome = self.outcome.unwrap_or(TurnOutcome::InfrastructureFailure);
        TurnReport {
            turn_id,
            tenant_id: self.ctx.tenant_id().to_string(),
            session_id: self.ctx.session_id().to_string(),
            outcome,
            final_state: self.machine.state(),
            state_history: self.machine.history().to_vec(),
            plan: self.plan,
            clarifications: self.clarifications,
            answer: self.answer,
            sql: self.sql,
            result: self.result,
            chart: self.chart,
            failure: self.failure,
            executions: self.executions,
            repair_attempts: self.repair_attempts,
            tool_calls: self.audit.into_calls(),
        }
    }
}

pub struct ReasoningOrchestrator {
    llm: Arc<dyn LanguageModel>,
    executor: Arc<dyn QueryExecutor>,
    catalog: Arc<SemanticCatalog>,
    clarifications: ClarificationBroker,
    planner: Planner,
    gate: SecurityGate,
    reflector: Reflector,
    config: OrchestratorConfig,
    today: Option<NaiveDate>,
}

impl ReasoningOrchestrator {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        executor: Arc<dyn QueryExecutor>,
        catalog: Arc<SemanticCatalog>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            llm,
            executor,
            catalog,
            clarifications: ClarificationBroker::new(),
            planner: Planner::new(),
            gate: SecurityGate::new(),
            reflector: Reflector::new(),
            config,
            today: None,
        }
    }

    /// Fix the date relative time expressions resolve against.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    /// Where clients deliver clarification answers.
    pub fn clarifications(&self) -> &ClarificationBroker {
        &self.clarifications
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn today(&self) -> NaiveDate {
        self.today
            .unwrap_or_else(|| chrono::Local::now().date_naive())
    }

    /// Run one turn to completion. Events go to `events` in order and the
    /// last one is always `done`; the report carries the audit trail.
    pub async fn run_turn(
        &self,
        ctx: &TenantContext,
        request: TurnRequest,
        events: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> TurnReport {
        let turn_id = Uuid::new_v4().to_string();
        let span = info_span!(
            "turn",
            tenant_id = %ctx.tenant_id(),
            session_id = %ctx.session_id(),
            turn_id = %turn_id
        );

        async move {
            info!("Turn started");
            let mut turn = Turn::new(ctx, &events, &cancel);
            let budget = self.config.turn_timeout;

            let driven = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ChatBiError::Cancelled),
                result = tokio::time::timeout(budget, self.drive(&mut turn, &request)) => {
                    result.unwrap_or(Err(ChatBiError::TurnTimeout(budget.as_secs())))
                }
            };

            if let Err(e) = driven {
                self.settle_error(&mut turn, e).await;
            }

            let outcome = turn.outcome.unwrap_or(TurnOutcome::InfrastructureFailure);
            // Best effort: the client may already be gone.
            let _ = events.send(StreamEvent::done(outcome.as_str())).await;
            let report = turn.into_report(turn_id);
            info!(
                outcome = outcome.as_str(),
                state = %report.final_state,
                executions = report.executions,
                repairs = report.repair_attempts,
                "Turn finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    /// Map an error that escaped the pipeline onto a turn outcome.
    async fn settle_error(&self, turn: &mut Turn<'_>, e: ChatBiError) {
        let (outcome, category, message) = match &e {
            ChatBiError::Cancelled => (TurnOutcome::Cancelled, None, "The request was cancelled.".to_string()),
            ChatBiError::TurnTimeout(_) => (TurnOutcome::TimedOut, None, e.to_string()),
            ChatBiError::Semantic(_) | ChatBiError::JoinPathNotFound { .. } | ChatBiError::Yaml(_) => {
                (TurnOutcome::SemanticError, None, e.to_string())
            }
            ChatBiError::Tenant(_) | ChatBiError::TenantMismatch { .. } => {
                (TurnOutcome::Rejected, None, e.to_string())
            }
            _ => {
                error!("Turn failed: {}", e);
                (
                    TurnOutcome::InfrastructureFailure,
                    e.category(),
                    GENERIC_FAILURE_MESSAGE.to_string(),
                )
            }
        };
        if turn.outcome.is_some() {
            // Already settled; the error came from emitting its report.
            turn.machine.abandon();
            return;
        }
        if let Err(emit_error) = turn.abandon(outcome, category, message).await {
            debug!("Failure report not delivered: {}", emit_error);
        }
    }

    /// Retry infrastructure faults per the retry policy. Nothing else is
    /// retried here.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = &self.config.infra_retry;
        let mut attempt = 0usize;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < policy.max_retries => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!("{} failed ({}), retrying in {:?}", operation, e, delay);
                    attempt += 1;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ChatBiError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn drive(&self, turn: &mut Turn<'_>, request: &TurnRequest) -> Result<()> {
        let ctx = turn.ctx;
        let cancel = turn.cancel;
        turn.emit(StreamEvent::ConnectionInit {
            session_id: Some(ctx.session_id().to_string()),
        })
        .await?;

        // One snapshot for the whole turn.
        let snapshot = self.catalog.snapshot(ctx).await?.into_inner(ctx)?;
        let resolver = snapshot.resolver.as_ref();
        let glossary = snapshot.glossary.as_ref();

        let mut answers: Vec<String> = request.clarifications.iter().map(|a| a.resolve(&[])).collect();
        let mut budget = RepairBudget::new(self.config.max_repair_attempts);
        let mut history = RepairHistory::new();
        let mut clarification_rounds = 0u8;

        'turn: loop {
            let question = merge_into_question(&request.question, &answers);

            turn.step(StepKind::Semantic).await?;
            let today = self.today();
            let q = question.as_str();
            let semantic = match self
                .with_retry("semantic resolution", cancel, move || resolver.resolve(glossary, q, today))
                .await
            {
                Ok(semantic) => semantic,
                Err(e @ (ChatBiError::JoinPathNotFound { .. } | ChatBiError::Semantic(_))) => {
                    return turn.abandon(TurnOutcome::SemanticError, None, e.to_string()).await;
                }
                Err(e) => return Err(e),
            };
            turn.audit.record(
                "semantic_resolve",
                json!({"question": question}),
                format!(
                    "{} measures, {} filters, {} cubes in scope",
                    semantic.measures.len(),
                    semantic.filters.len(),
                    semantic.pruned.cubes.len()
                ),
            );

            let llm = self.llm.as_ref();
            let planner = &self.planner;
            let sem = &semantic;
            let plan = self
                .with_retry("planning", cancel, move || planner.plan(llm, q, sem, cancel))
                .await?;
            turn.emit(StreamEvent::thinking(plan.summary())).await?;
            let needs_clarification = plan.needs_clarification(self.config.clarify_threshold);
            turn.plan = Some(plan.clone());

            if needs_clarification {
                info!(confidence = plan.confidence, "Plan needs clarification");
                turn.transition(TurnState::Clarifying)?;
                match self
                    .clarify(turn, &semantic, &plan, None, &mut clarification_rounds)
                    .await?
                {
                    Some(answer) => {
                        answers.push(answer);
                        turn.transition(TurnState::Planning)?;
                        continue 'turn;
                    }
                    None => {
                        return turn
                            .abandon(
                                TurnOutcome::ClarificationUnanswered,
                                None,
                                "The question needs clarification before it can be answered.".to_string(),
                            )
                            .await;
                    }
                }
            }

            turn.transition(TurnState::Generating)?;
            let mut repair_instruction: Option<String> = None;
            let mut hinted: Option<String> = None;

            loop {
                let sql = match hinted.take() {
                    Some(sql) => sql,
                    None => {
                        turn.step(StepKind::Generate).await?;
                        let sql = self
                            .generate(&question, &plan, &semantic, repair_instruction.as_deref(), cancel)
                            .await?;
                        turn.transition(TurnState::Validating)?;
                        sql
                    }
                };
                turn.sql = Some(sql.clone());

                turn.step(StepKind::Validate).await?;
                let approved = match self.gate.approve(&sql) {
                    Ok(approved) => approved,
                    Err(ChatBiError::Security(reason)) => {
                        return turn
                            .abandon(
                                TurnOutcome::SecurityViolation,
                                Some(ErrorCategory::SecurityViolation),
                                format!("Security violation: {}", reason),
                            )
                            .await;
                    }
                    Err(e) => return Err(e),
                };

                turn.transition(TurnState::Executing)?;
                turn.step(StepKind::Execute).await?;
                let outcome = self.execute(ctx, &approved, cancel).await?;
                turn.executions += 1;

                let raw_error = match outcome {
                    ToolOutcome::Success(result) => {
                        turn.audit
                            .record("execute_sql", json!({"sql": approved.sql()}), result.summary());
                        turn.transition(TurnState::Responding)?;
                        return self.respond(turn, &question, &approved, result).await;
                    }
                    ToolOutcome::DataAccessFailed(message) => {
                        turn.audit
                            .record("execute_sql", json!({"sql": approved.sql()}), "data access failed");
                        turn.transition(TurnState::Responding)?;
                        return turn
                            .abandon(
                                TurnOutcome::DataAccessFailed,
                                Some(ErrorCategory::DataAccessFailed),
                                message,
                            )
                            .await;
                    }
                    ToolOutcome::EngineError(raw) => raw,
                };

                turn.audit.record(
                    "execute_sql",
                    json!({"sql": approved.sql()}),
                    "engine rejected the query",
                );
                turn.transition(TurnState::Reflecting)?;
                let reflection = self.reflector.reflect(&sql, &raw_error, &semantic.pruned);
                history.record(&sql, &raw_error, &reflection);
                info!(category = %reflection.error_category, "Execution failed");

                match reflection.error_category {
                    ErrorCategory::DataAccessFailed => {
                        turn.transition(TurnState::Responding)?;
                        return turn
                            .abandon(
                                TurnOutcome::DataAccessFailed,
                                Some(ErrorCategory::DataAccessFailed),
                                raw_error.trim().to_string(),
                            )
                            .await;
                    }
                    ErrorCategory::AmbiguousQuery => {
                        turn.transition(TurnState::Clarifying)?;
                        let lead = ClarificationQuestion {
                            question_type: ClarificationType::Entity,
                            prompt: format!("The question is ambiguous ({}). Which one did you mean?", reflection.diagnosis),
                            options: Vec::new(),
                        };
                        match self
                            .clarify(turn, &semantic, &plan, Some(lead), &mut clarification_rounds)
                            .await?
                        {
                            Some(answer) => {
                                answers.push(answer);
                                turn.transition(TurnState::Planning)?;
                                continue 'turn;
                            }
                            None => {
                                return turn
                                    .abandon(
                                        TurnOutcome::ClarificationUnanswered,
                                        Some(ErrorCategory::AmbiguousQuery),
                                        reflection.diagnosis.clone(),
                                    )
                                    .await;
                            }
                        }
                    }
                    _ if !reflection.should_retry => {
                        turn.transition(TurnState::Responding)?;
                        return turn
                            .abandon(
                                TurnOutcome::QueryFailed,
                                Some(reflection.error_category),
                                format!("The query failed: {}", reflection.diagnosis),
                            )
                            .await;
                    }
                    _ => {}
                }

                if !budget.try_consume() {
                    turn.transition(TurnState::Responding)?;
                    return turn
                        .abandon(
                            TurnOutcome::RepairExhausted,
                            Some(reflection.error_category),
                            format!(
                                "The query still failed after {} repair attempts: {}",
                                budget.used(),
                                reflection.diagnosis
                            ),
                        )
                        .await;
                }
                turn.repair_attempts = budget.used();
                turn.emit(StreamEvent::step(format!(
                    "Repairing query (attempt {} of {})",
                    budget.used(),
                    self.config.max_repair_attempts
                )))
                .await?;

                let direct = self
                    .reflector
                    .apply_hint(&sql, &reflection)
                    .filter(|fixed| !history.is_repeat(fixed));
                match direct {
                    Some(fixed) => {
                        debug!("Applying engine hint");
                        turn.audit.record(
                            "apply_engine_hint",
                            json!({"sql": sql, "hint": reflection.fix_target}),
                            fixed.clone(),
                        );
                        turn.transition(TurnState::Validating)?;
                        hinted = Some(fixed);
                    }
                    None => {
                        repair_instruction = Some(self.reflector.repair_instruction(
                            &reflection,
                            &sql,
                            history.forbidden_identifiers(),
                            budget.used(),
                        ));
                        turn.transition(TurnState::Generating)?;
                    }
                }
            }
        }
    }

    async fn clarify(
        &self,
        turn: &mut Turn<'_>,
        semantic: &SemanticContext,
        plan: &ExecutionPlan,
        lead: Option<ClarificationQuestion>,
        rounds: &mut u8,
    ) -> Result<Option<String>> {
        if *rounds >= self.config.max_clarification_rounds {
            info!("Clarification rounds exhausted");
            return Ok(None);
        }
        *rounds += 1;

        let mut questions: Vec<ClarificationQuestion> = lead.into_iter().collect();
        for q in build_questions(semantic, plan) {
            if !questions.iter().any(|e| e.question_type == q.question_type) {
                questions.push(q);
            }
        }

        let pending = self.clarifications.register(turn.ctx);
        turn.emit(StreamEvent::ToolResult {
            tool_name: "ask_clarification".to_string(),
            result: json!({"questions": questions}),
        })
        .await?;
        turn.audit.record(
            "ask_clarification",
            json!({"round": *rounds}),
            format!("{} questions", questions.len()),
        );
        turn.clarifications.extend(questions.iter().cloned());

        let answer = self
            .clarifications
            .wait(pending, self.config.clarification_wait, turn.cancel)
            .await?;
        Ok(answer.map(|a| a.resolve(&questions)))
    }

    async fn generate(
        &self,
        question: &str,
        plan: &ExecutionPlan,
        semantic: &SemanticContext,
        repair_instruction: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let request = CompletionRequest::new(prompts::generation_messages(
            question,
            plan,
            semantic,
            repair_instruction,
        ));
        let llm = self.llm.as_ref();
        let req = &request;
        self.with_retry("query generation", cancel, move || async move {
            let reply = llm.complete(req, cancel).await?;
            let sql = prompts::extract_sql(&reply);
            if sql.is_empty() {
                return Err(ChatBiError::Llm("The model returned no query".to_string()));
            }
            Ok(sql)
        })
        .await
    }

    async fn execute(
        &self,
        ctx: &TenantContext,
        approved: &ApprovedQuery,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome> {
        let executor = self.executor.as_ref();
        self.with_retry("query execution", cancel, move || executor.execute(ctx, approved, cancel))
            .await
    }

    async fn respond(
        &self,
        turn: &mut Turn<'_>,
        question: &str,
        approved: &ApprovedQuery,
        result: QueryResult,
    ) -> Result<()> {
        let preview: Vec<&Vec<Value>> = result.rows.iter().take(PREVIEW_ROWS).collect();
        turn.emit(StreamEvent::ToolInput {
            tool_name: "execute_sql".to_string(),
            args: json!({"sql": approved.sql()}),
        })
        .await?;
        turn.emit(StreamEvent::ToolResult {
            tool_name: "execute_sql".to_string(),
            result: json!({
                "columns": result.columns,
                "rows": preview,
                "row_count": result.row_count(),
            }),
        })
        .await?;

        turn.step(StepKind::Analyze).await?;
        let answer = self.stream_answer(turn, question, approved.sql(), &result).await?;

        if let Some(chart) = build_chart(&result, question) {
            turn.step(StepKind::Visualize).await?;
            turn.emit(StreamEvent::chart(chart.clone())).await?;
            turn.audit
                .record("generate_chart", json!({"rows": result.row_count()}), "echarts option");
            turn.chart = Some(chart);
        }

        if let Some(plan) = turn.plan.as_mut() {
            plan.mark_running_as(StepStatus::Completed);
        }
        turn.answer = Some(answer);
        turn.result = Some(result);
        turn.outcome = Some(TurnOutcome::Answered);
        turn.transition(TurnState::Done)
    }

    /// Stream the answer as content deltas. If the model is unavailable the
    /// result table itself is the answer.
    async fn stream_answer(
        &self,
        turn: &mut Turn<'_>,
        question: &str,
        sql: &str,
        result: &QueryResult,
    ) -> Result<String> {
        let cancel = turn.cancel;
        let request = CompletionRequest::new(prompts::answer_messages(question, sql, result));
        let llm = self.llm.as_ref();
        let req = &request;
        let opened = self
            .with_retry("answer", cancel, move || llm.stream_completion(req, cancel))
            .await;

        let mut answer = String::new();
        match opened {
            Ok(mut tokens) => {
                while let Some(token) = tokens.next().await {
                    match token {
                        Ok(delta) => {
                            answer.push_str(&delta);
                            turn.emit(StreamEvent::content(delta)).await?;
                        }
                        Err(e) => {
                            warn!("Answer stream failed: {}", e);
                            break;
                        }
                    }
                }
                if cancel.is_cancelled() {
                    return Err(ChatBiError::Cancelled);
                }
            }
            Err(e) if e.is_transient() => warn!("Answer model unavailable: {}", e),
            Err(e) => return Err(e),
        }

        if answer.trim().is_empty() {
            answer = format!("{}\n\n{}", result.summary(), result.to_markdown(PREVIEW_ROWS));
            turn.emit(StreamEvent::content(answer.clone())).await?;
        }
        Ok(answer)
    }
}
