//! Execution planning.
//!
//! The model proposes a plan as JSON; [`PlanParser`] maps it onto the known
//! step kinds. Anything it cannot map produces an unrecognized plan, which
//! always routes the turn to clarification.

use crate::agent::clarification::ClarificationType;
use crate::agent::prompts;
use crate::error::Result;
use crate::llm::{CompletionRequest, LanguageModel};
use crate::semantic::SemanticContext;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    Understand,
    Context,
    Semantic,
    Generate,
    Validate,
    Execute,
    Analyze,
    Visualize,
}

impl StepKind {
    pub const ALL: [StepKind; 8] = [
        StepKind::Understand,
        StepKind::Context,
        StepKind::Semantic,
        StepKind::Generate,
        StepKind::Validate,
        StepKind::Execute,
        StepKind::Analyze,
        StepKind::Visualize,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            StepKind::Understand => "Understanding the question",
            StepKind::Context => "Loading context",
            StepKind::Semantic => "Resolving business terms",
            StepKind::Generate => "Generating query",
            StepKind::Validate => "Validating query",
            StepKind::Execute => "Executing query",
            StepKind::Analyze => "Analyzing results",
            StepKind::Visualize => "Building chart",
        }
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UNDERSTAND" => Ok(StepKind::Understand),
            "CONTEXT" => Ok(StepKind::Context),
            "SEMANTIC" => Ok(StepKind::Semantic),
            "GENERATE" => Ok(StepKind::Generate),
            "VALIDATE" => Ok(StepKind::Validate),
            "EXECUTE" => Ok(StepKind::Execute),
            "ANALYZE" | "ANALYSE" => Ok(StepKind::Analyze),
            "VISUALIZE" | "VISUALISE" => Ok(StepKind::Visualize),
            other => Err(format!("unknown step kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub kind: StepKind,
    pub description: String,
    pub status: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub steps: Vec<PlanStep>,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// What the model thinks is unclear, if anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ambiguity: Option<ClarificationType>,
    /// The model's output could not be mapped onto known steps.
    #[serde(default)]
    pub unrecognized: bool,
}

impl ExecutionPlan {
    /// Plan used when the model gave nothing usable.
    pub fn unrecognized(confidence: f64) -> Self {
        let mut plan = Self {
            steps: Vec::new(),
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: None,
            ambiguity: None,
            unrecognized: true,
        };
        plan.ensure_mandatory_steps();
        plan
    }

    pub fn needs_clarification(&self, threshold: f64) -> bool {
        self.unrecognized || self.confidence < threshold
    }

    pub fn step(&self, kind: StepKind) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.kind == kind)
    }

    pub fn mark(&mut self, kind: StepKind, status: StepStatus) {
        for step in self.steps.iter_mut().filter(|s| s.kind == kind) {
            step.status = status;
        }
    }

    pub fn mark_running_as(&mut self, status: StepStatus) {
        for step in self.steps.iter_mut().filter(|s| s.status == StepStatus::Running) {
            step.status = status;
        }
    }

    /// Generation, validation and execution always run, in that order,
    /// whatever the model proposed.
    fn ensure_mandatory_steps(&mut self) {
        for kind in [StepKind::Generate, StepKind::Validate, StepKind::Execute] {
            if self.step(kind).is_none() {
                self.steps.push(PlanStep {
                    kind,
                    description: kind.label().to_string(),
                    status: StepStatus::Pending,
                });
            }
        }
        self.steps.sort_by_key(|s| StepKind::ALL.iter().position(|k| *k == s.kind));
    }

    /// Short text for the thinking stream.
    pub fn summary(&self) -> String {
        let steps: Vec<&str> = self.steps.iter().map(|s| s.description.as_str()).collect();
        format!("Plan (confidence {:.2}): {}", self.confidence, steps.join(" → "))
    }
}

#[derive(Deserialize)]
struct RawPlan {
    #[serde(default)]
    steps: Vec<RawStep>,
    confidence: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default, alias = "clarification")]
    ambiguity: Option<String>,
}

#[derive(Deserialize)]
struct RawStep {
    #[serde(alias = "type", alias = "step")]
    kind: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Clone, Default)]
pub struct PlanParser;

impl PlanParser {
    /// Parse model output. `fallback_confidence` is used when the model
    /// does not report one.
    pub fn parse(&self, text: &str, fallback_confidence: f64) -> ExecutionPlan {
        let Some(json) = extract_json_object(text) else {
            warn!("Planner output contained no JSON object");
            return ExecutionPlan::unrecognized(fallback_confidence);
        };
        let raw: RawPlan = match serde_json::from_str(json) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Planner output is not a plan: {}", e);
                return ExecutionPlan::unrecognized(fallback_confidence);
            }
        };

        let mut unrecognized = raw.steps.is_empty();
        let mut steps = Vec::with_capacity(raw.steps.len());
        for step in raw.steps {
            match step.kind.parse::<StepKind>() {
                Ok(kind) => steps.push(PlanStep {
                    kind,
                    description: if step.description.trim().is_empty() {
                        kind.label().to_string()
                    } else {
                        step.description
                    },
                    status: StepStatus::Pending,
                }),
                Err(e) => {
                    debug!("Unrecognized plan step: {}", e);
                    unrecognized = true;
                }
            }
        }

        let confidence = match raw.confidence {
            Some(c) if c.is_finite() => c.clamp(0.0, 1.0),
            Some(_) => {
                unrecognized = true;
                0.0
            }
            None => fallback_confidence.clamp(0.0, 1.0),
        };

        let ambiguity = raw
            .ambiguity
            .as_deref()
            .and_then(|a| a.parse::<ClarificationType>().ok());

        let mut plan = ExecutionPlan {
            steps,
            confidence,
            reasoning: raw.reasoning,
            ambiguity,
            unrecognized,
        };
        plan.ensure_mandatory_steps();
        plan
    }
}

/// Outermost `{...}` of a model reply, ignoring code fences and prose.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Asks the model for a plan over the resolved context.
#[derive(Debug, Clone, Default)]
pub struct Planner {
    parser: PlanParser,
}

impl Planner {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn plan(
        &self,
        llm: &dyn LanguageModel,
        question: &str,
        context: &SemanticContext,
        cancel: &CancellationToken,
    ) -> Result<ExecutionPlan> {
        let request = CompletionRequest::new(prompts::planning_messages(question, context)).json();
        let reply = llm.complete(&request, cancel).await?;
        let plan = self.parser.parse(&reply, context.coverage());
        debug!(
            confidence = plan.confidence,
            unrecognized = plan.unrecognized,
            "Plan parsed"
        );
        Ok(plan)
    }
}
