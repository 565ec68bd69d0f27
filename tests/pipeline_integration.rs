//! Integration tests for the pipeline orchestrator.
//!
//! Runs complete pipelines with the standard stage handlers against a
//! scripted text generator and in-process capabilities.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dx_forge::error::{CapabilityError, GeneratorError, PipelineError, StageError};
use dx_forge::llm::TextGenerator;
use dx_forge::pipeline::{
    CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, Orchestrator, PipelineConfig,
    PipelineState, ReviewDecision, Stage, StageHandler, StageHandlers,
};
use dx_forge::recovery::RecoveryStrategy;
use dx_forge::tasks::{Capability, CapabilityRegistry, RegisteredTask, TaskStatus};

const REPORT: &str = r#"{"summary": "Findings consistent with Marfan syndrome.",
 "ranked_hypotheses": [{"name": "Marfan syndrome", "likelihood": 0.8}],
 "recommendations": ["Echocardiogram"]}"#;

/// Answers reasoning prompts from a script and synthesis prompts with a
/// fixed report. Records every prompt it sees.
struct ScriptedGenerator {
    reasoning: Mutex<Vec<String>>,
    repeat_last: bool,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    fn new(reasoning: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            reasoning: Mutex::new(reasoning.into_iter().rev().map(String::from).collect()),
            repeat_last: false,
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn repeating(response: &str) -> Arc<Self> {
        Arc::new(Self {
            reasoning: Mutex::new(vec![response.to_string()]),
            repeat_last: true,
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn reasoning_calls(&self) -> usize {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.contains("AVAILABLE TASKS"))
            .count()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GeneratorError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if prompt.contains("final report") {
            return Ok(format!("Here is the report:\n```json\n{}\n```", REPORT));
        }
        let mut script = self.reasoning.lock().unwrap();
        if self.repeat_last && script.len() == 1 {
            return Ok(script[0].clone());
        }
        script.pop().ok_or(GeneratorError::EmptyResponse)
    }
}

/// Echoes items back and counts invocations.
#[derive(Default)]
struct GeneLookup {
    calls: AtomicUsize,
}

#[async_trait]
impl Capability for GeneLookup {
    async fn invoke(
        &self,
        items: &[String],
        _parameters: &Map<String, Value>,
        _timeout: Duration,
    ) -> Result<Map<String, Value>, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(items
            .iter()
            .map(|item| (item.clone(), json!({"associated": true})))
            .collect())
    }
}

fn registry(lookup: Arc<GeneLookup>) -> CapabilityRegistry {
    CapabilityRegistry::new().with_task(
        "gene_lookup",
        RegisteredTask::new(lookup).with_description("Gene-disease associations"),
    )
}

fn case() -> Value {
    json!({"Age": 17, "Findings": "tall stature, lens dislocation", "Notes": ""})
}

fn plan_response(needs_more: bool) -> String {
    format!(
        r#"{{"hypotheses": [{{"name": "Marfan syndrome", "likelihood": 0.7}}],
  "task_plan": [{{"name": "gene_lookup", "priority": "HIGH", "target_items": ["FBN1"]}}],
  "needs_more_tasks": {}}}"#,
        needs_more
    )
}

fn orchestrator(
    generator: Arc<dyn TextGenerator>,
    lookup: Arc<GeneLookup>,
    store: Arc<dyn CheckpointStore>,
    config: PipelineConfig,
) -> Orchestrator {
    Orchestrator::standard(generator, registry(lookup), store, config)
}

#[tokio::test]
async fn test_full_pipeline_completes() {
    let done = plan_response(false).replace(
        r#"[{"name": "gene_lookup", "priority": "HIGH", "target_items": ["FBN1"]}]"#,
        "[]",
    );
    let generator = ScriptedGenerator::new(vec![plan_response(true).as_str(), done.as_str()]);
    let lookup = Arc::new(GeneLookup::default());
    let orch = orchestrator(
        generator.clone(),
        lookup.clone(),
        Arc::new(InMemoryCheckpointStore::new()),
        PipelineConfig::default(),
    );

    let state = orch.run(case()).await;

    assert_eq!(state.stage, Stage::Complete, "error: {:?}", state.error);
    assert_eq!(state.iteration, 1);
    assert!(state.error.is_none());
    let normalized = state.normalized_case.as_ref().unwrap();
    assert_eq!(normalized["age"], json!(17));
    assert!(!normalized.contains_key("notes"));
    assert_eq!(state.hypotheses[0].name, "Marfan syndrome");
    assert_eq!(state.task_results.len(), 1);
    assert_eq!(state.task_results[0].status, TaskStatus::Completed);
    assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);

    let report = state.final_report.as_ref().unwrap();
    assert_eq!(report.strategy, RecoveryStrategy::FencedBlock);
    assert_eq!(report.confidence, 0.95);
    assert_eq!(report.get_str("summary"), Some("Findings consistent with Marfan syndrome."));
    assert_eq!(generator.reasoning_calls(), 2);
}

#[tokio::test]
async fn test_iteration_bound_reaches_synthesis_at_five() {
    let generator = ScriptedGenerator::repeating(&plan_response(true));
    let lookup = Arc::new(GeneLookup::default());
    let orch = orchestrator(
        generator.clone(),
        lookup.clone(),
        Arc::new(InMemoryCheckpointStore::new()),
        PipelineConfig::default(),
    );

    let mut state = orch.start(case(), 5, vec![]);
    let mut executions = 0;
    while state.stage != Stage::Synthesis {
        assert!(state.can_advance(), "stopped early at {}", state.stage);
        if state.stage == Stage::Execution {
            executions += 1;
        }
        state = orch.advance(state).await;
    }

    assert_eq!(state.iteration, 5);
    assert_eq!(executions, 5);
    assert_eq!(generator.reasoning_calls(), 5);
    // Same request every round: one external call, the rest from cache.
    assert_eq!(state.task_results.len(), 5);
    assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.task_results.iter().filter(|r| r.cache_hit).count(), 4);

    let state = orch.advance(state).await;
    assert_eq!(state.stage, Stage::Complete);
    assert_eq!(state.iteration, 5);
}

#[tokio::test]
async fn test_checkpoint_resume_is_at_most_once() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(FileCheckpointStore::new(dir.path()));
    let generator = ScriptedGenerator::new(vec![plan_response(false).as_str()]);
    let lookup = Arc::new(GeneLookup::default());
    let config = PipelineConfig::default()
        .with_max_iterations(1)
        .with_checkpoint_after(vec![Stage::Reasoning]);
    let orch = orchestrator(generator, lookup.clone(), store.clone(), config);

    let paused = orch.run(case()).await;
    assert_eq!(paused.stage, Stage::AwaitingReview);
    assert_eq!(paused.review_stage, Some(Stage::Reasoning));
    let id = paused.checkpoint_id.unwrap();

    let pending = orch.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(
        pending[0].fields_requiring_approval,
        vec!["hypotheses", "task_plan", "needs_more_tasks"]
    );

    // Reviewer asks for the planned verification to run after all.
    let decision = ReviewDecision::approve()
        .with_reviewer("dr-lee")
        .with_correction("needs_more_tasks", json!(true));
    let resumed = orch.resume(id, decision).await.unwrap();
    assert_eq!(resumed.stage, Stage::Execution);
    assert!(!resumed.awaiting_review);

    let path = store.checkpoint_path(&id);
    let before = std::fs::read_to_string(&path).unwrap();

    let err = orch
        .resume(id, ReviewDecision::reject("second opinion"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::CheckpointAlreadyReviewed(got) if got == id));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), before);

    let finished = orch.run_until_pause(resumed).await;
    assert_eq!(finished.stage, Stage::Complete);
    assert_eq!(finished.task_results.len(), 1);
    assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    assert!(orch.list_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_resume_with_corrected_plan() {
    let generator = ScriptedGenerator::new(vec![plan_response(true).as_str(), plan_response(false).as_str()]);
    let lookup = Arc::new(GeneLookup::default());
    let config = PipelineConfig::default().with_checkpoint_after(vec![Stage::Reasoning]);
    let orch = orchestrator(
        generator,
        lookup,
        Arc::new(InMemoryCheckpointStore::new()),
        config,
    );

    let paused = orch.run(case()).await;
    let decision = ReviewDecision::approve().with_correction(
        "task_plan",
        json!([{"name": "gene_lookup", "priority": "LOW", "target_items": ["TGFBR2"], "timeout": 1000}]),
    );
    let resumed = orch.resume(paused.checkpoint_id.unwrap(), decision).await.unwrap();
    assert_eq!(resumed.task_plan[0].target_items, vec!["TGFBR2"]);

    let state = orch.advance(resumed).await;
    assert_eq!(state.task_results[0].items_queried, vec!["TGFBR2"]);
    // The loop continues to reasoning, which pauses again.
    let state = orch.run_until_pause(state).await;
    assert_eq!(state.stage, Stage::AwaitingReview);
    assert_eq!(orch.list_pending().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_generator_failure_routes_to_error() {
    let generator = ScriptedGenerator::new(vec![]);
    let orch = orchestrator(
        generator,
        Arc::new(GeneLookup::default()),
        Arc::new(InMemoryCheckpointStore::new()),
        PipelineConfig::default(),
    );

    let state = orch.run(case()).await;
    assert_eq!(state.stage, Stage::Error);
    assert!(state.normalized_case.is_some());
    assert!(state.error.unwrap().starts_with("reasoning stage failed"));
}

struct Panicking;

#[async_trait]
impl StageHandler for Panicking {
    async fn run(&self, state: &mut PipelineState) -> Result<(), StageError> {
        state.hypotheses.clear();
        panic!("synthesis exploded");
    }
}

#[tokio::test]
async fn test_panicking_stage_keeps_artifacts() {
    let generator = ScriptedGenerator::new(vec![plan_response(true).as_str(), plan_response(false).as_str()]);
    let lookup = Arc::new(GeneLookup::default());
    let orch = orchestrator(
        generator.clone(),
        lookup.clone(),
        Arc::new(InMemoryCheckpointStore::new()),
        PipelineConfig::default(),
    );
    let config = orch.config().clone();
    let handlers = StageHandlers::standard(
        generator,
        orch.scheduler().clone(),
        orch.cancellation_token(),
        &config,
    )
    .with_synthesis(Arc::new(Panicking));
    let orch = Orchestrator::new(
        handlers,
        Arc::new(InMemoryCheckpointStore::new()),
        orch.scheduler().clone(),
        config,
    );

    let state = orch.run(case()).await;
    assert_eq!(state.stage, Stage::Error);
    assert!(state.error.as_deref().unwrap().contains("synthesis exploded"));
    assert_eq!(state.hypotheses.len(), 1);
    assert_eq!(state.task_results.len(), 1);
    assert!(state.final_report.is_none());
}

#[tokio::test]
async fn test_unparseable_report_uses_fallback() {
    struct Mumbling;

    #[async_trait]
    impl TextGenerator for Mumbling {
        async fn generate(&self, _prompt: &str) -> Result<String, GeneratorError> {
            Ok("I could not decide.".to_string())
        }
    }

    let orch = orchestrator(
        Arc::new(Mumbling),
        Arc::new(GeneLookup::default()),
        Arc::new(InMemoryCheckpointStore::new()),
        PipelineConfig::default(),
    );
    let state = orch.run(case()).await;

    assert_eq!(state.stage, Stage::Complete);
    let report = state.final_report.unwrap();
    assert!(report.is_fallback());
    assert_eq!(report.confidence, 0.1);
    assert!(state.warnings.iter().any(|w| w.starts_with("reasoning:")));
}

#[tokio::test]
async fn test_state_survives_json_round_trip_mid_run() {
    let generator = ScriptedGenerator::new(vec![plan_response(true).as_str(), plan_response(false).as_str()]);
    let orch = orchestrator(
        generator,
        Arc::new(GeneLookup::default()),
        Arc::new(InMemoryCheckpointStore::new()),
        PipelineConfig::default(),
    );

    let mut state = orch.start(case(), 3, vec![]);
    for _ in 0..3 {
        state = orch.advance(state).await;
    }
    assert_eq!(state.stage, Stage::Reasoning);

    let text = serde_json::to_string(&state).unwrap();
    let restored: PipelineState = serde_json::from_str(&text).unwrap();
    assert_eq!(restored, state);

    let finished = orch.run_until_pause(restored).await;
    assert_eq!(finished.stage, Stage::Complete);
    assert_eq!(finished.max_iterations(), 3);
}
