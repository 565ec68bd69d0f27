//! Error types for dx-forge operations.
//!
//! Defines the error taxonomy shared by the subsystems:
//! - Plan and resume validation (raised before any side effect)
//! - Verification capability failures (recorded on task results, never raised)
//! - Text generator failures
//! - Stage handler faults (converted to pipeline state, never raised)
//! - Checkpoint persistence
//! - The public pipeline API

use thiserror::Error;
use uuid::Uuid;

/// Errors raised when a task plan or a review decision is malformed.
///
/// These indicate a programming or configuration mistake and are always
/// reported before anything executes.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Task '{0}' is not registered")]
    UnknownTask(String),

    #[error("Task request at position {0} has an empty name")]
    EmptyTaskName(usize),

    #[error("Correction targets unknown field '{0}'")]
    UnknownCorrectionField(String),

    #[error("Invalid correction for '{field}': {reason}")]
    InvalidCorrection { field: String, reason: String },

    #[error("Invalid task plan: {0}")]
    InvalidPlan(String),
}

/// Errors returned by an external verification capability.
///
/// The task runner converts these into a `FAILED` task result; they never
/// abort a batch.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CapabilityError {
    #[error("Capability call failed: {0}")]
    Failed(String),

    #[error("Capability unavailable: {0}")]
    Unavailable(String),

    #[error("Capability returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// Errors that can occur while generating text.
#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("Missing API base URL: DXFORGE_LLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse generator response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Generator returned no content")]
    EmptyResponse,
}

/// Errors raised by a stage handler.
///
/// The orchestrator converts every variant into `state.error` and routes the
/// pipeline to the ERROR stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Text generation failed: {0}")]
    Generation(#[from] GeneratorError),

    #[error("Invalid stage input: {0}")]
    InvalidInput(String),

    #[error("Task batch rejected: {0}")]
    Batch(#[from] ValidationError),

    #[error("Stage handler panicked: {0}")]
    Panicked(String),
}

/// Errors from a checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointStoreError {
    #[error("Checkpoint not found: {0}")]
    NotFound(Uuid),

    #[error("Checkpoint {0} has already been reviewed")]
    AlreadyReviewed(Uuid),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid checkpoint data: {0}")]
    InvalidData(String),
}

/// Errors raised to callers of the pipeline API.
///
/// Only plan-level validation and checkpoint-protocol violations surface
/// here; runtime failures are recorded on the pipeline state instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Checkpoint {0} has already been reviewed")]
    CheckpointAlreadyReviewed(Uuid),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(Uuid),

    #[error("Checkpoint store error: {0}")]
    Store(CheckpointStoreError),
}

impl From<CheckpointStoreError> for PipelineError {
    fn from(err: CheckpointStoreError) -> Self {
        match err {
            CheckpointStoreError::AlreadyReviewed(id) => PipelineError::CheckpointAlreadyReviewed(id),
            CheckpointStoreError::NotFound(id) => PipelineError::CheckpointNotFound(id),
            other => PipelineError::Store(other),
        }
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse '{path}': {message}")]
    Parse { path: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_maps_to_pipeline_error() {
        let id = Uuid::new_v4();

        let err: PipelineError = CheckpointStoreError::AlreadyReviewed(id).into();
        assert!(matches!(err, PipelineError::CheckpointAlreadyReviewed(got) if got == id));

        let err: PipelineError = CheckpointStoreError::NotFound(id).into();
        assert!(matches!(err, PipelineError::CheckpointNotFound(got) if got == id));

        let err: PipelineError = CheckpointStoreError::InvalidData("bad".to_string()).into();
        assert!(matches!(err, PipelineError::Store(_)));
    }

    #[test]
    fn test_error_messages() {
        let err = ValidationError::UnknownTask("clinvar".to_string());
        assert!(err.to_string().contains("clinvar"));

        let err = ValidationError::InvalidCorrection {
            field: "hypotheses".to_string(),
            reason: "expected an array".to_string(),
        };
        assert!(err.to_string().contains("hypotheses"));
        assert!(err.to_string().contains("expected an array"));

        let err = GeneratorError::ApiError {
            code: 503,
            message: "overloaded".to_string(),
        };
        assert!(err.to_string().contains("503"));

        let err = StageError::Panicked("boom".to_string());
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_stage_error_from_validation() {
        let err: StageError = ValidationError::UnknownTask("x".to_string()).into();
        assert!(matches!(err, StageError::Batch(ValidationError::UnknownTask(_))));
    }
}
