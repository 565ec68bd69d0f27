//! The pipeline state record and its stage enum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::recovery::RecoveredRecord;
use crate::tasks::{TaskRequest, TaskResult};

/// Current position of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Intake,
    Reasoning,
    Execution,
    Synthesis,
    Complete,
    Error,
    AwaitingReview,
}

impl Stage {
    /// Stages that run a handler, in pipeline order.
    pub const HANDLED: [Stage; 4] = [
        Stage::Intake,
        Stage::Reasoning,
        Stage::Execution,
        Stage::Synthesis,
    ];

    /// `Complete` and `Error` accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete | Stage::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Intake => "intake",
            Stage::Reasoning => "reasoning",
            Stage::Execution => "execution",
            Stage::Synthesis => "synthesis",
            Stage::Complete => "complete",
            Stage::Error => "error",
            Stage::AwaitingReview => "awaiting_review",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "init" => Ok(Stage::Init),
            "intake" => Ok(Stage::Intake),
            "reasoning" => Ok(Stage::Reasoning),
            "execution" => Ok(Stage::Execution),
            "synthesis" => Ok(Stage::Synthesis),
            "complete" => Ok(Stage::Complete),
            "error" => Ok(Stage::Error),
            "awaiting_review" => Ok(Stage::AwaitingReview),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}

/// A candidate explanation proposed by the reasoning stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    /// Generator-estimated likelihood in `[0, 1]`, when given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub likelihood: Option<f64>,
}

impl Hypothesis {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rationale: None,
            likelihood: None,
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    pub fn with_likelihood(mut self, likelihood: f64) -> Self {
        self.likelihood = Some(likelihood.clamp(0.0, 1.0));
        self
    }
}

/// The record threaded through every stage of one pipeline run.
///
/// `iteration` and `max_iterations` are owned by the orchestrator; stage
/// handlers see them but changes they make are discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub id: Uuid,
    pub stage: Stage,
    pub iteration: u32,
    max_iterations: u32,
    /// Stages after which the pipeline pauses for review.
    #[serde(default)]
    pub checkpoint_after: Vec<Stage>,

    /// Raw intake payload.
    pub case_input: Value,
    #[serde(default)]
    pub normalized_case: Option<Map<String, Value>>,
    #[serde(default)]
    pub hypotheses: Vec<Hypothesis>,
    #[serde(default)]
    pub task_plan: Vec<TaskRequest>,
    /// Append-only across iterations.
    #[serde(default)]
    pub task_results: Vec<TaskResult>,
    #[serde(default)]
    pub final_report: Option<RecoveredRecord>,
    #[serde(default)]
    pub needs_more_tasks: bool,

    /// Set by a failing stage; never cleared.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub awaiting_review: bool,
    #[serde(default)]
    pub review_stage: Option<Stage>,
    #[serde(default)]
    pub checkpoint_id: Option<Uuid>,
    /// Recovery and planning warnings accumulated across stages.
    #[serde(default)]
    pub warnings: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    /// A fresh state at `Init` with every artifact empty.
    pub fn new(case_input: Value, max_iterations: u32, checkpoint_after: Vec<Stage>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            stage: Stage::Init,
            iteration: 0,
            max_iterations,
            checkpoint_after,
            case_input,
            normalized_case: None,
            hypotheses: Vec::new(),
            task_plan: Vec::new(),
            task_results: Vec::new(),
            final_report: None,
            needs_more_tasks: false,
            error: None,
            awaiting_review: false,
            review_stage: None,
            checkpoint_id: None,
            warnings: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn is_paused(&self) -> bool {
        self.awaiting_review
    }

    /// Whether another `advance` call would do anything.
    pub fn can_advance(&self) -> bool {
        !self.is_terminal() && !self.is_paused()
    }

    pub fn pauses_after(&self, stage: Stage) -> bool {
        self.checkpoint_after.contains(&stage)
    }

    /// Whether the orchestrator may enter another execution cycle.
    pub fn has_iterations_left(&self) -> bool {
        self.iteration < self.max_iterations
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Take the handler-owned artifacts from `other`, keeping this state's
    /// identity, position, loop counters and checkpoint flags.
    pub(crate) fn take_artifacts(&mut self, other: PipelineState) {
        self.normalized_case = other.normalized_case;
        self.hypotheses = other.hypotheses;
        self.task_plan = other.task_plan;
        self.task_results = other.task_results;
        self.final_report = other.final_report;
        self.needs_more_tasks = other.needs_more_tasks;
        self.warnings = other.warnings;
    }
}
