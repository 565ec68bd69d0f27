//! dx-forge: multi-stage diagnostic pipeline orchestration.
//!
//! A case flows through intake, reasoning, verification and synthesis
//! stages. The crate provides:
//!
//! - [`pipeline`]: the stage orchestrator, its state record and review checkpoints
//! - [`tasks`]: the task execution engine (registry, rate limiter, cache, scheduler)
//! - [`recovery`]: tolerant recovery of structured records from free text
//! - [`llm`]: the text generator boundary and an OpenAI-compatible client
//! - [`prompts`]: prompts for the generator-backed stages

pub mod cli;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod prompts;
pub mod recovery;
pub mod tasks;

pub use error::{
    CapabilityError, CheckpointStoreError, ConfigError, GeneratorError, PipelineError, StageError,
    ValidationError,
};
pub use pipeline::{
    Checkpoint, CheckpointStore, Orchestrator, PipelineConfig, PipelineState, ReviewDecision, Stage,
};
pub use recovery::{recover, RecoveredRecord, RecoveryStrategy};
pub use tasks::{BatchResult, BatchScheduler, CapabilityRegistry, Priority, TaskRequest, TaskResult, TaskStatus};
