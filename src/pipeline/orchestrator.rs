//! Stage orchestrator.
//!
//! Threads a [`PipelineState`] through INTAKE, REASONING, EXECUTION and
//! SYNTHESIS, bounds the REASONING/EXECUTION loop, and pauses for review
//! after configured stages.
//!
//! `advance` never returns an error: handler failures and panics become
//! `state.error` and route the pipeline to ERROR. Only task plan validation
//! and checkpoint protocol violations reach the caller, through `resume` and
//! `run_batch`.

use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::checkpoint::{apply_corrections, Checkpoint, CheckpointStore, ReviewDecision};
use super::config::PipelineConfig;
use super::stages::StageHandlers;
use super::state::{PipelineState, Stage};
use crate::error::{PipelineError, StageError};
use crate::llm::TextGenerator;
use crate::tasks::{BatchResult, BatchScheduler, CapabilityRegistry, TaskRequest};

/// Coordinates stage handlers, routing and checkpoints.
pub struct Orchestrator {
    handlers: StageHandlers,
    store: Arc<dyn CheckpointStore>,
    scheduler: BatchScheduler,
    config: PipelineConfig,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator from explicit parts.
    ///
    /// `scheduler` serves `run_batch` and supplies the registry that
    /// corrected task plans are validated against.
    pub fn new(
        handlers: StageHandlers,
        store: Arc<dyn CheckpointStore>,
        scheduler: BatchScheduler,
        config: PipelineConfig,
    ) -> Self {
        Self {
            handlers,
            store,
            scheduler,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Create an orchestrator with the standard stage handlers.
    pub fn standard(
        generator: Arc<dyn TextGenerator>,
        registry: CapabilityRegistry,
        store: Arc<dyn CheckpointStore>,
        config: PipelineConfig,
    ) -> Self {
        let scheduler = config.build_scheduler(registry);
        let cancel = CancellationToken::new();
        let handlers =
            StageHandlers::standard(generator, scheduler.clone(), cancel.clone(), &config);
        Self {
            handlers,
            store,
            scheduler,
            config,
            cancel,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Token that stops task dispatch in `run_batch` and the standard
    /// execution stage. Once cancelled it stays cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Create a fresh pipeline at INIT.
    pub fn start(
        &self,
        case_input: Value,
        max_iterations: u32,
        checkpoint_after: Vec<Stage>,
    ) -> PipelineState {
        let state = PipelineState::new(case_input, max_iterations, checkpoint_after);
        info!(
            pipeline = %state.id,
            max_iterations,
            checkpoints = ?state.checkpoint_after,
            "Pipeline started"
        );
        state
    }

    /// `start` with the configured iteration bound and checkpoints.
    pub fn start_with_config(&self, case_input: Value) -> PipelineState {
        self.start(
            case_input,
            self.config.max_iterations,
            self.config.checkpoint_after.clone(),
        )
    }

    /// Run one stage handler and apply routing.
    ///
    /// A terminal or paused state is returned unchanged. INIT dispatches the
    /// INTAKE handler.
    pub async fn advance(&self, mut state: PipelineState) -> PipelineState {
        if !state.can_advance() {
            debug!(pipeline = %state.id, stage = %state.stage, "Nothing to advance");
            return state;
        }

        if state.stage == Stage::Init {
            state.stage = Stage::Intake;
        }
        let stage = state.stage;

        let Some(handler) = self.handlers.get(stage) else {
            state.error = Some(format!("no handler for stage '{}'", stage));
            state.stage = Stage::Error;
            state.touch();
            error!(pipeline = %state.id, stage = %stage, "Pipeline in a stage without a handler");
            return state;
        };

        debug!(pipeline = %state.id, stage = %stage, iteration = state.iteration, "Running stage");

        let mut working = state.clone();
        let outcome = AssertUnwindSafe(handler.run(&mut working))
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(())) => {
                if working.task_results.starts_with(&state.task_results) {
                    state.take_artifacts(working);
                    None
                } else {
                    Some(StageError::InvalidInput(
                        "handler removed or rewrote existing task results".to_string(),
                    ))
                }
            }
            Ok(Err(e)) => Some(e),
            Err(payload) => Some(StageError::Panicked(panic_message(payload.as_ref()))),
        };

        if let Some(e) = failure {
            warn!(pipeline = %state.id, stage = %stage, error = %e, "Stage failed");
            state.error = Some(format!("{} stage failed: {}", stage, e));
        }
        state.touch();

        if state.error.is_none() && state.pauses_after(stage) {
            return self.pause(state, stage).await;
        }
        self.route(state, stage)
    }

    /// Advance until the pipeline is terminal or paused.
    pub async fn run_until_pause(&self, mut state: PipelineState) -> PipelineState {
        while state.can_advance() {
            state = self.advance(state).await;
        }
        state
    }

    /// Start a pipeline from the configuration and run it until it
    /// finishes or pauses.
    pub async fn run(&self, case_input: Value) -> PipelineState {
        let state = self.start_with_config(case_input);
        self.run_until_pause(state).await
    }

    /// Resume a paused pipeline with a review decision.
    ///
    /// Corrections are applied to a copy of the snapshot and validated before
    /// the decision is recorded. An approved decision continues with the
    /// routing that the pause skipped; a rejected one ends in ERROR.
    ///
    /// # Errors
    ///
    /// - `CheckpointAlreadyReviewed` if a decision is already recorded
    /// - `CheckpointNotFound` if the store has no such checkpoint
    /// - `Validation` if a correction is malformed; nothing is recorded
    pub async fn resume(
        &self,
        checkpoint_id: Uuid,
        decision: ReviewDecision,
    ) -> Result<PipelineState, PipelineError> {
        let checkpoint = self.store.load(checkpoint_id).await?;
        if checkpoint.is_reviewed() {
            warn!(checkpoint = %checkpoint_id, "Resume called on a reviewed checkpoint");
            return Err(PipelineError::CheckpointAlreadyReviewed(checkpoint_id));
        }

        let mut state = checkpoint.state_snapshot.clone();
        apply_corrections(
            &mut state,
            &decision.corrections,
            self.scheduler.runner().registry(),
        )?;

        self.store.record_review(checkpoint_id, &decision).await?;

        let stage = checkpoint.stage;
        state.awaiting_review = false;
        state.review_stage = None;
        state.checkpoint_id = None;
        state.stage = stage;
        state.touch();

        info!(
            pipeline = %state.id,
            checkpoint = %checkpoint_id,
            stage = %stage,
            approved = decision.approved,
            corrections = decision.corrections.len(),
            "Checkpoint reviewed"
        );

        if !decision.approved {
            let message = match decision.notes {
                Some(ref notes) => format!("Review rejected after {} stage: {}", stage, notes),
                None => format!("Review rejected after {} stage", stage),
            };
            state.error = Some(message);
            state.stage = Stage::Error;
            return Ok(state);
        }

        Ok(self.route(state, stage))
    }

    /// Unreviewed checkpoints, oldest first.
    pub async fn list_pending(&self) -> Result<Vec<Checkpoint>, PipelineError> {
        Ok(self.store.list_pending().await?)
    }

    /// Run a task plan directly, outside any pipeline.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Validation` without running anything if any
    /// request names an unregistered task.
    pub async fn run_batch(&self, plan: &[TaskRequest]) -> Result<BatchResult, PipelineError> {
        Ok(self
            .scheduler
            .run_batch_cancellable(plan, &self.cancel)
            .await?)
    }

    async fn pause(&self, mut state: PipelineState, stage: Stage) -> PipelineState {
        let id = Uuid::new_v4();
        state.awaiting_review = true;
        state.review_stage = Some(stage);
        state.checkpoint_id = Some(id);
        state.stage = Stage::AwaitingReview;

        let checkpoint = Checkpoint::new(id, stage, &state);
        if let Err(e) = self.store.save(&checkpoint).await {
            error!(pipeline = %state.id, stage = %stage, error = %e, "Failed to save checkpoint");
            state.awaiting_review = false;
            state.review_stage = None;
            state.checkpoint_id = None;
            state.error = Some(format!("Failed to save checkpoint after {} stage: {}", stage, e));
            state.stage = Stage::Error;
            return state;
        }

        info!(
            pipeline = %state.id,
            checkpoint = %id,
            stage = %stage,
            fields = ?checkpoint.fields_requiring_approval,
            "Pipeline paused for review"
        );
        state
    }

    /// Pick the next stage after `completed`.
    fn route(&self, mut state: PipelineState, completed: Stage) -> PipelineState {
        let failed = state.error.is_some();
        let next = match completed {
            Stage::Intake if failed => Stage::Error,
            Stage::Intake => Stage::Reasoning,
            Stage::Reasoning if failed => Stage::Error,
            Stage::Reasoning if state.needs_more_tasks && state.has_iterations_left() => {
                Stage::Execution
            }
            Stage::Reasoning => Stage::Synthesis,
            Stage::Execution => {
                state.iteration += 1;
                if failed {
                    Stage::Error
                } else if !state.has_iterations_left() {
                    Stage::Synthesis
                } else if state.needs_more_tasks {
                    Stage::Reasoning
                } else {
                    Stage::Synthesis
                }
            }
            Stage::Synthesis if failed => Stage::Error,
            Stage::Synthesis => Stage::Complete,
            other => {
                if state.error.is_none() {
                    state.error = Some(format!("cannot route from stage '{}'", other));
                }
                Stage::Error
            }
        };

        state.stage = next;
        state.touch();

        match next {
            Stage::Complete => info!(
                pipeline = %state.id,
                iterations = state.iteration,
                task_results = state.task_results.len(),
                "Pipeline complete"
            ),
            Stage::Error => warn!(
                pipeline = %state.id,
                after = %completed,
                error = state.error.as_deref().unwrap_or_default(),
                "Pipeline failed"
            ),
            _ => debug!(pipeline = %state.id, from = %completed, to = %next, "Routed"),
        }
        state
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
