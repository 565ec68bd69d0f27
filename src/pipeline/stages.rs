//! Stage handlers.
//!
//! A handler owns write access to its artifact fields for the duration of
//! one call. The orchestrator runs it on a copy of the state and discards
//! the copy if the handler fails.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::PipelineConfig;
use super::state::{Hypothesis, PipelineState, Stage};
use crate::error::StageError;
use crate::llm::TextGenerator;
use crate::prompts::{
    build_reasoning_prompt, build_synthesis_prompt, TaskCatalogEntry, REASONING_EXPECTED_KEYS,
    SYNTHESIS_EXPECTED_KEYS,
};
use crate::recovery::recover;
use crate::tasks::{BatchScheduler, CapabilityRegistry, Priority, TaskRequest};

/// One pipeline stage.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn run(&self, state: &mut PipelineState) -> Result<(), StageError>;
}

/// The handler for each handled stage.
#[derive(Clone)]
pub struct StageHandlers {
    pub intake: Arc<dyn StageHandler>,
    pub reasoning: Arc<dyn StageHandler>,
    pub execution: Arc<dyn StageHandler>,
    pub synthesis: Arc<dyn StageHandler>,
}

impl std::fmt::Debug for StageHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageHandlers").finish_non_exhaustive()
    }
}

impl StageHandlers {
    pub fn new(
        intake: Arc<dyn StageHandler>,
        reasoning: Arc<dyn StageHandler>,
        execution: Arc<dyn StageHandler>,
        synthesis: Arc<dyn StageHandler>,
    ) -> Self {
        Self {
            intake,
            reasoning,
            execution,
            synthesis,
        }
    }

    /// The bundled handlers: generator-backed reasoning and synthesis, and
    /// execution through `scheduler`.
    pub fn standard(
        generator: Arc<dyn TextGenerator>,
        scheduler: BatchScheduler,
        cancel: CancellationToken,
        config: &PipelineConfig,
    ) -> Self {
        let registry = Arc::clone(scheduler.runner().registry());
        Self {
            intake: Arc::new(IntakeStage),
            reasoning: Arc::new(
                ReasoningStage::new(Arc::clone(&generator), registry)
                    .with_default_timeout(config.task_timeout),
            ),
            execution: Arc::new(ExecutionStage::new(scheduler).with_cancellation(cancel)),
            synthesis: Arc::new(SynthesisStage::new(generator)),
        }
    }

    pub fn with_intake(mut self, handler: Arc<dyn StageHandler>) -> Self {
        self.intake = handler;
        self
    }

    pub fn with_reasoning(mut self, handler: Arc<dyn StageHandler>) -> Self {
        self.reasoning = handler;
        self
    }

    pub fn with_execution(mut self, handler: Arc<dyn StageHandler>) -> Self {
        self.execution = handler;
        self
    }

    pub fn with_synthesis(mut self, handler: Arc<dyn StageHandler>) -> Self {
        self.synthesis = handler;
        self
    }

    /// The handler for `stage`, or `None` for stages that dispatch nothing.
    pub fn get(&self, stage: Stage) -> Option<&Arc<dyn StageHandler>> {
        match stage {
            Stage::Intake => Some(&self.intake),
            Stage::Reasoning => Some(&self.reasoning),
            Stage::Execution => Some(&self.execution),
            Stage::Synthesis => Some(&self.synthesis),
            _ => None,
        }
    }
}

/// Normalizes the raw case input into `normalized_case`.
///
/// Object keys are trimmed, lowercased and snake_cased; string values are
/// trimmed; null and empty values are dropped. A bare string becomes
/// `{"description": ...}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntakeStage;

impl IntakeStage {
    fn normalize_key(key: &str) -> String {
        key.trim()
            .to_lowercase()
            .split(|c: char| c.is_whitespace() || c == '-')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("_")
    }

    fn normalize_value(value: &Value) -> Option<Value> {
        match value {
            Value::Null => None,
            Value::String(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| Value::String(trimmed.to_string()))
            }
            Value::Array(items) => {
                let items: Vec<Value> = items.iter().filter_map(Self::normalize_value).collect();
                (!items.is_empty()).then_some(Value::Array(items))
            }
            Value::Object(map) => {
                let map = Self::normalize_object(map);
                (!map.is_empty()).then_some(Value::Object(map))
            }
            other => Some(other.clone()),
        }
    }

    fn normalize_object(map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .filter_map(|(key, value)| {
                let key = Self::normalize_key(key);
                if key.is_empty() {
                    return None;
                }
                Self::normalize_value(value).map(|value| (key, value))
            })
            .collect()
    }
}

#[async_trait]
impl StageHandler for IntakeStage {
    async fn run(&self, state: &mut PipelineState) -> Result<(), StageError> {
        let normalized = match state.case_input {
            Value::Object(ref map) => Self::normalize_object(map),
            Value::String(ref text) => {
                let mut map = Map::new();
                if !text.trim().is_empty() {
                    map.insert("description".to_string(), json!(text.trim()));
                }
                map
            }
            ref other => {
                return Err(StageError::InvalidInput(format!(
                    "case input must be an object or a string, got {}",
                    kind(other)
                )))
            }
        };

        if normalized.is_empty() {
            return Err(StageError::InvalidInput("case input is empty".to_string()));
        }

        debug!(pipeline = %state.id, fields = normalized.len(), "Case normalized");
        state.normalized_case = Some(normalized);
        Ok(())
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Asks the generator for hypotheses and a task plan.
///
/// Plan entries naming unregistered tasks are dropped with a warning so a
/// single hallucinated task name cannot reject the whole batch.
pub struct ReasoningStage {
    generator: Arc<dyn TextGenerator>,
    registry: Arc<CapabilityRegistry>,
    default_timeout: Duration,
}

impl ReasoningStage {
    pub fn new(generator: Arc<dyn TextGenerator>, registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            generator,
            registry,
            default_timeout: crate::tasks::DEFAULT_TASK_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn catalog(&self) -> Vec<TaskCatalogEntry> {
        self.registry
            .names()
            .into_iter()
            .map(|name| {
                let description = self
                    .registry
                    .resolve(&name)
                    .and_then(|task| task.description.clone());
                TaskCatalogEntry { name, description }
            })
            .collect()
    }

    /// Parse one plan entry. Accepts a bare task name or an object.
    fn parse_plan_entry(&self, entry: &Value, warnings: &mut Vec<String>) -> Option<TaskRequest> {
        let fields = match entry {
            Value::String(name) => {
                let mut map = Map::new();
                map.insert("name".to_string(), json!(name));
                map
            }
            Value::Object(map) => map.clone(),
            other => {
                warnings.push(format!("Ignored task plan entry of type {}", kind(other)));
                return None;
            }
        };

        let name = fields
            .get("name")
            .or_else(|| fields.get("task"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if name.is_empty() {
            warnings.push("Ignored task plan entry without a name".to_string());
            return None;
        }
        if !self.registry.contains(name) {
            warnings.push(format!("Dropped unregistered task '{}' from plan", name));
            return None;
        }

        let mut request = TaskRequest::new(name).with_timeout(self.default_timeout);

        if let Some(priority) = fields.get("priority").and_then(Value::as_str) {
            match priority.parse::<Priority>() {
                Ok(p) => request = request.with_priority(p),
                Err(_) => warnings.push(format!(
                    "Task '{}' has unknown priority '{}', using MEDIUM",
                    name, priority
                )),
            }
        }

        let items = fields
            .get("target_items")
            .or_else(|| fields.get("items"));
        match items {
            Some(Value::Array(values)) => {
                request = request.with_items(values.iter().filter_map(item_key));
            }
            Some(single) => {
                if let Some(item) = item_key(single) {
                    request = request.with_item(item);
                }
            }
            None => {}
        }

        if let Some(ms) = fields.get("timeout_ms").and_then(Value::as_u64) {
            if ms > 0 {
                request = request.with_timeout(Duration::from_millis(ms));
            }
        }

        if let Some(Value::Object(parameters)) = fields.get("parameters") {
            request.parameters = parameters.clone();
        }

        Some(request)
    }
}

fn item_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_hypothesis(value: &Value) -> Option<Hypothesis> {
    match value {
        Value::String(name) if !name.trim().is_empty() => Some(Hypothesis::new(name.trim())),
        Value::Object(fields) => {
            let name = fields
                .get("name")
                .or_else(|| fields.get("hypothesis"))
                .and_then(Value::as_str)?
                .trim();
            if name.is_empty() {
                return None;
            }
            let mut hypothesis = Hypothesis::new(name);
            if let Some(rationale) = fields.get("rationale").and_then(Value::as_str) {
                hypothesis = hypothesis.with_rationale(rationale);
            }
            if let Some(likelihood) = fields.get("likelihood").and_then(Value::as_f64) {
                hypothesis = hypothesis.with_likelihood(likelihood);
            }
            Some(hypothesis)
        }
        _ => None,
    }
}

#[async_trait]
impl StageHandler for ReasoningStage {
    async fn run(&self, state: &mut PipelineState) -> Result<(), StageError> {
        let prompt = build_reasoning_prompt(
            state.normalized_case.as_ref(),
            &state.hypotheses,
            &state.task_results,
            &self.catalog(),
            state.iteration,
            state.max_iterations(),
        );

        let raw = self.generator.generate(&prompt.render()).await?;
        let record = recover(&raw, &REASONING_EXPECTED_KEYS, Map::new());

        let mut warnings: Vec<String> = record
            .warnings
            .iter()
            .map(|w| format!("reasoning: {}", w))
            .collect();

        if let Some(values) = record.get_array("hypotheses") {
            state.hypotheses = values.iter().filter_map(parse_hypothesis).collect();
        }

        let plan: Vec<TaskRequest> = match record.get("task_plan") {
            Some(Value::Array(entries)) => {
                let mut plan_warnings = Vec::new();
                let plan = entries
                    .iter()
                    .filter_map(|entry| self.parse_plan_entry(entry, &mut plan_warnings))
                    .collect();
                warnings.extend(plan_warnings.into_iter().map(|w| format!("reasoning: {}", w)));
                plan
            }
            Some(_) => {
                warnings.push("reasoning: task_plan is not a list, ignoring it".to_string());
                Vec::new()
            }
            None => Vec::new(),
        };

        let previous_round_empty = state.iteration > 0 && state.task_plan.is_empty();
        state.needs_more_tasks = record.get_bool("needs_more_tasks").unwrap_or(!plan.is_empty());
        state.task_plan = plan;

        // An empty round followed by another request can loop until the
        // iteration bound ends it.
        if previous_round_empty && state.needs_more_tasks {
            warn!(
                pipeline = %state.id,
                iteration = state.iteration,
                "More tasks requested after a round that produced no evidence"
            );
        }

        if record.is_fallback() {
            warn!(pipeline = %state.id, "Reasoning output could not be parsed");
        }
        info!(
            pipeline = %state.id,
            iteration = state.iteration,
            hypotheses = state.hypotheses.len(),
            planned_tasks = state.task_plan.len(),
            needs_more_tasks = state.needs_more_tasks,
            confidence = record.confidence,
            "Reasoning finished"
        );

        state.warnings.extend(warnings);
        Ok(())
    }
}

/// Runs the current task plan and appends its results.
pub struct ExecutionStage {
    scheduler: BatchScheduler,
    cancel: CancellationToken,
}

impl ExecutionStage {
    pub fn new(scheduler: BatchScheduler) -> Self {
        Self {
            scheduler,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop dispatching new tasks once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[async_trait]
impl StageHandler for ExecutionStage {
    async fn run(&self, state: &mut PipelineState) -> Result<(), StageError> {
        if state.task_plan.is_empty() {
            debug!(pipeline = %state.id, "Empty task plan, nothing to execute");
            return Ok(());
        }

        let batch = self
            .scheduler
            .run_batch_cancellable(&state.task_plan, &self.cancel)
            .await?;

        info!(
            pipeline = %state.id,
            iteration = state.iteration,
            completed = batch.completed_count,
            failed = batch.failed_count,
            cache_hits = batch.cache_hits(),
            "Execution finished"
        );
        state.task_results.extend(batch.results);
        Ok(())
    }
}

/// Asks the generator for the final report.
pub struct SynthesisStage {
    generator: Arc<dyn TextGenerator>,
}

impl SynthesisStage {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    fn fallback(state: &PipelineState) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert(
            "summary".to_string(),
            json!("Report could not be generated; see task results."),
        );
        fields.insert(
            "ranked_hypotheses".to_string(),
            Value::Array(state.hypotheses.iter().map(|h| json!({"name": h.name})).collect()),
        );
        fields.insert("recommendations".to_string(), Value::Array(Vec::new()));
        fields
    }
}

#[async_trait]
impl StageHandler for SynthesisStage {
    async fn run(&self, state: &mut PipelineState) -> Result<(), StageError> {
        let prompt = build_synthesis_prompt(
            state.normalized_case.as_ref(),
            &state.hypotheses,
            &state.task_results,
        );

        let raw = self.generator.generate(&prompt.render()).await?;
        let record = recover(&raw, &SYNTHESIS_EXPECTED_KEYS, Self::fallback(state));

        info!(
            pipeline = %state.id,
            strategy = %record.strategy,
            confidence = record.confidence,
            "Synthesis finished"
        );

        state
            .warnings
            .extend(record.warnings.iter().map(|w| format!("synthesis: {}", w)));
        state.final_report = Some(record);
        Ok(())
    }
}
