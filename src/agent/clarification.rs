//! Clarification
//!
//! Builds the follow-up questions for a low-confidence plan and holds the
//! turn until the user answers (or the wait runs out). Pending questions
//! are keyed by tenant and session, so an answer can only reach a turn of
//! the same tenant.

use crate::agent::planner::ExecutionPlan;
use crate::error::{ChatBiError, Result};
use crate::semantic::time::RelativeTime;
use crate::semantic::SemanticContext;
use crate::tenant::TenantContext;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClarificationType {
    TimeRange,
    Entity,
    Metric,
    Comparison,
    Aggregation,
}

impl FromStr for ClarificationType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace(['-', ' '], "_").as_str() {
            "TIME_RANGE" | "TIME" => Ok(ClarificationType::TimeRange),
            "ENTITY" => Ok(ClarificationType::Entity),
            "METRIC" | "MEASURE" => Ok(ClarificationType::Metric),
            "COMPARISON" => Ok(ClarificationType::Comparison),
            "AGGREGATION" => Ok(ClarificationType::Aggregation),
            other => Err(format!("unknown clarification type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationOption {
    pub id: String,
    pub label: String,
    /// Text merged into the question when this option is chosen.
    pub value: String,
}

impl ClarificationOption {
    fn new(id: impl Into<String>, label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationQuestion {
    #[serde(rename = "type")]
    pub question_type: ClarificationType,
    pub prompt: String,
    pub options: Vec<ClarificationOption>,
}

/// The user's reply: a chosen option, free text, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationAnswer {
    #[serde(default)]
    pub option_id: Option<String>,
    #[serde(default)]
    pub text: String,
}

impl ClarificationAnswer {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            option_id: None,
            text: text.into(),
        }
    }

    /// What gets appended to the question for the next planning round.
    pub fn resolve(&self, questions: &[ClarificationQuestion]) -> String {
        let chosen = self.option_id.as_deref().and_then(|id| {
            questions
                .iter()
                .flat_map(|q| q.options.iter())
                .find(|o| o.id == id)
        });
        match (chosen, self.text.trim()) {
            (Some(option), "") => option.value.clone(),
            (Some(option), text) => format!("{}; {}", option.value, text),
            // Option of a question this turn did not ask; the id is all we have.
            (None, "") => self.option_id.clone().unwrap_or_default(),
            (None, text) => text.to_string(),
        }
    }
}

/// Merge clarification answers into the question text.
pub fn merge_into_question(question: &str, answers: &[String]) -> String {
    let answers: Vec<&str> = answers
        .iter()
        .map(|a| a.trim())
        .filter(|a| !a.is_empty())
        .collect();
    if answers.is_empty() {
        question.to_string()
    } else {
        format!("{} ({})", question.trim(), answers.join("; "))
    }
}

const MAX_OPTIONS: usize = 5;

/// Questions for a plan that is not confident enough. Never empty.
pub fn build_questions(context: &SemanticContext, plan: &ExecutionPlan) -> Vec<ClarificationQuestion> {
    let mut questions = Vec::new();
    let mut push = |q: Option<ClarificationQuestion>| {
        if let Some(q) = q {
            if !questions.iter().any(|e: &ClarificationQuestion| e.question_type == q.question_type) {
                questions.push(q);
            }
        }
    };

    if let Some(kind) = plan.ambiguity {
        push(question_for(kind, context));
    }
    if context.measures.is_empty() {
        push(metric_question(context));
    }
    if ambiguous_entities(context) {
        push(entity_question(context));
    }
    if context.time.is_none() && mentions_time_series(&context.question) {
        push(Some(time_question()));
    }
    if mentions_comparison(&context.question) && context.group_by.is_empty() {
        push(comparison_question(context));
    }

    if questions.is_empty() {
        questions.push(ClarificationQuestion {
            question_type: ClarificationType::Entity,
            prompt: "Could you describe in more detail what you would like to know?".to_string(),
            options: Vec::new(),
        });
    }
    questions
}

fn question_for(kind: ClarificationType, context: &SemanticContext) -> Option<ClarificationQuestion> {
    match kind {
        ClarificationType::TimeRange => Some(time_question()),
        ClarificationType::Metric => metric_question(context),
        ClarificationType::Entity => entity_question(context),
        ClarificationType::Comparison => comparison_question(context),
        ClarificationType::Aggregation => Some(ClarificationQuestion {
            question_type: ClarificationType::Aggregation,
            prompt: "How should the values be aggregated?".to_string(),
            options: vec![
                ClarificationOption::new("sum", "Total", "use the total (SUM)"),
                ClarificationOption::new("avg", "Average", "use the average (AVG)"),
                ClarificationOption::new("count", "Count", "count the records (COUNT)"),
                ClarificationOption::new("max", "Maximum", "use the maximum (MAX)"),
            ],
        }),
    }
}

fn time_question() -> ClarificationQuestion {
    let options = [
        (RelativeTime::LastNDays(7), "Last 7 days"),
        (RelativeTime::ThisMonth, "This month"),
        (RelativeTime::LastMonth, "Last month"),
        (RelativeTime::ThisYear, "This year"),
    ]
    .into_iter()
    .map(|(range, label)| ClarificationOption::new(range.canonical(), label, label.to_lowercase()))
    .collect();
    ClarificationQuestion {
        question_type: ClarificationType::TimeRange,
        prompt: "Which time range should be used?".to_string(),
        options,
    }
}

fn metric_question(context: &SemanticContext) -> Option<ClarificationQuestion> {
    let options: Vec<ClarificationOption> = context
        .pruned
        .cubes
        .iter()
        .flat_map(|cube| {
            cube.measures.iter().map(move |m| {
                let label = m.title.clone().unwrap_or_else(|| m.name.clone());
                ClarificationOption::new(
                    format!("{}.{}", cube.name, m.name),
                    label.clone(),
                    format!("metric: {} ({}.{})", label, cube.name, m.name),
                )
            })
        })
        .take(MAX_OPTIONS)
        .collect();
    Some(ClarificationQuestion {
        question_type: ClarificationType::Metric,
        prompt: "Which metric do you mean?".to_string(),
        options,
    })
}

/// Several vector-linked values for the same text, close in score.
fn ambiguous_entities(context: &SemanticContext) -> bool {
    let inferred: Vec<_> = context.entity_links.iter().filter(|l| l.span.is_none()).collect();
    match (inferred.first(), inferred.get(1)) {
        (Some(a), Some(b)) => (a.score - b.score).abs() < 0.05 && (a.target(), &a.value) != (b.target(), &b.value),
        _ => false,
    }
}

fn entity_question(context: &SemanticContext) -> Option<ClarificationQuestion> {
    let options: Vec<ClarificationOption> = context
        .entity_links
        .iter()
        .filter(|l| l.span.is_none())
        .take(MAX_OPTIONS)
        .map(|l| {
            ClarificationOption::new(
                format!("{}={}", l.target(), l.value),
                format!("{} ({}.{})", l.value, l.cube, l.dimension),
                format!("{} = '{}'", l.dimension, l.value),
            )
        })
        .collect();
    if options.is_empty() {
        return None;
    }
    Some(ClarificationQuestion {
        question_type: ClarificationType::Entity,
        prompt: "Which of these did you mean?".to_string(),
        options,
    })
}

fn comparison_question(context: &SemanticContext) -> Option<ClarificationQuestion> {
    let options: Vec<ClarificationOption> = context
        .pruned
        .cubes
        .iter()
        .flat_map(|cube| {
            cube.dimensions.iter().map(move |d| {
                let label = d.title.clone().unwrap_or_else(|| d.name.clone());
                ClarificationOption::new(
                    format!("{}.{}", cube.name, d.name),
                    label.clone(),
                    format!("compare by {}", label),
                )
            })
        })
        .take(MAX_OPTIONS)
        .collect();
    Some(ClarificationQuestion {
        question_type: ClarificationType::Comparison,
        prompt: "What should be compared against what?".to_string(),
        options,
    })
}

fn mentions_time_series(question: &str) -> bool {
    let q = question.to_lowercase();
    ["趋势", "变化", "每天", "每月", "trend", "over time", "daily", "monthly"]
        .iter()
        .any(|k| q.contains(k))
}

fn mentions_comparison(question: &str) -> bool {
    let q = question.to_lowercase();
    ["对比", "比较", "相比", "compare", " vs", "versus"]
        .iter()
        .any(|k| q.contains(k))
}

type PendingMap = DashMap<String, (Uuid, oneshot::Sender<ClarificationAnswer>)>;

/// Pending clarifications, one per tenant session.
#[derive(Clone, Default)]
pub struct ClarificationBroker {
    pending: Arc<PendingMap>,
}

/// A registered wait. Dropping it withdraws the question.
pub struct PendingClarification {
    key: String,
    id: Uuid,
    receiver: oneshot::Receiver<ClarificationAnswer>,
    pending: Arc<PendingMap>,
}

impl Drop for PendingClarification {
    fn drop(&mut self) {
        self.pending.remove_if(&self.key, |_, (id, _)| *id == self.id);
    }
}

impl ClarificationBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(ctx: &TenantContext) -> String {
        ctx.scoped_key(&format!("clarify:{}", ctx.session_id()))
    }

    /// Register before the question is sent, so an immediate answer is not
    /// lost. Replaces any older pending question of the same session.
    pub fn register(&self, ctx: &TenantContext) -> PendingClarification {
        let key = Self::key(ctx);
        let id = Uuid::new_v4();
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(key.clone(), (id, sender));
        PendingClarification {
            key,
            id,
            receiver,
            pending: Arc::clone(&self.pending),
        }
    }

    pub fn is_pending(&self, ctx: &TenantContext) -> bool {
        self.pending.contains_key(&Self::key(ctx))
    }

    /// Deliver an answer to the session's waiting turn.
    pub fn answer(&self, ctx: &TenantContext, answer: ClarificationAnswer) -> Result<()> {
        let (_, (_, sender)) = self.pending.remove(&Self::key(ctx)).ok_or_else(|| {
            ChatBiError::Tenant(format!(
                "No clarification pending for session '{}'",
                ctx.session_id()
            ))
        })?;
        sender.send(answer).map_err(|_| {
            ChatBiError::Tenant("The turn waiting for this clarification has ended".to_string())
        })?;
        info!(tenant_id = %ctx.tenant_id(), "Clarification answered");
        Ok(())
    }

    /// Wait for the answer. `Ok(None)` when the wait runs out.
    pub async fn wait(
        &self,
        mut pending: PendingClarification,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<ClarificationAnswer>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ChatBiError::Cancelled),
            received = tokio::time::timeout(timeout, &mut pending.receiver) => match received {
                Ok(Ok(answer)) => Ok(Some(answer)),
                Ok(Err(_)) => {
                    debug!("Clarification superseded");
                    Ok(None)
                }
                Err(_) => {
                    debug!("Clarification wait of {:?} elapsed", timeout);
                    Ok(None)
                }
            },
        }
    }
}
