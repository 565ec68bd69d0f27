//! Diagnostic pipeline orchestration.
//!
//! # Architecture
//!
//! - **State**: the [`PipelineState`] record threaded through every stage
//! - **Stages**: handlers for intake, reasoning, execution and synthesis
//! - **Orchestrator**: dispatch, routing, iteration bound, pause and resume
//! - **Checkpoint**: review snapshots and their pluggable stores
//! - **Config**: limits and defaults for all of the above
//!
//! # Pipeline Flow
//!
//! 1. **Intake**: the raw case is normalized
//! 2. **Reasoning**: the generator proposes hypotheses and a task plan
//! 3. **Execution**: the plan runs through the batch scheduler
//! 4. Reasoning and execution repeat while more tasks are needed, at most
//!    `max_iterations` times
//! 5. **Synthesis**: the generator writes the final report
//!
//! Any stage can be configured to pause the pipeline for review. The
//! paused state is stored as a [`Checkpoint`] and continued with
//! [`Orchestrator::resume`].
//!
//! # Example
//!
//! ```rust,ignore
//! use dx_forge::pipeline::{FileCheckpointStore, Orchestrator, PipelineConfig, ReviewDecision, Stage};
//! use std::sync::Arc;
//!
//! let config = PipelineConfig::from_env()?.with_checkpoint_after(vec![Stage::Reasoning]);
//! let store = Arc::new(FileCheckpointStore::new(&config.checkpoint_dir));
//! let orchestrator = Orchestrator::standard(generator, registry, store, config);
//!
//! let state = orchestrator.run(serde_json::json!({"age": 34, "findings": "..."})).await;
//! if let Some(id) = state.checkpoint_id {
//!     let state = orchestrator.resume(id, ReviewDecision::approve()).await?;
//!     let state = orchestrator.run_until_pause(state).await;
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod orchestrator;
pub mod stages;
pub mod state;

pub use checkpoint::{
    apply_corrections, Checkpoint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
    ReviewDecision, CORRECTABLE_FIELDS,
};
pub use config::PipelineConfig;
pub use orchestrator::Orchestrator;
pub use stages::{
    ExecutionStage, IntakeStage, ReasoningStage, StageHandler, StageHandlers, SynthesisStage,
};
pub use state::{Hypothesis, PipelineState, Stage};
