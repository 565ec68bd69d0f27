//! Review checkpoints and their persistence.
//!
//! A checkpoint is an immutable snapshot of a paused pipeline. It is written
//! once when the pipeline pauses and updated exactly once with a review
//! decision; stores enforce that second write atomically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::state::{Hypothesis, PipelineState, Stage};
use crate::error::{CheckpointStoreError, ValidationError};
use crate::recovery::{RecoveredRecord, RecoveryStrategy};
use crate::tasks::{CapabilityRegistry, TaskRequest};

/// Fields a review decision may correct.
pub const CORRECTABLE_FIELDS: [&str; 5] = [
    "normalized_case",
    "hypotheses",
    "task_plan",
    "needs_more_tasks",
    "final_report",
];

/// An external review of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub approved: bool,
    /// Field name to replacement value.
    #[serde(default)]
    pub corrections: Map<String, Value>,
    #[serde(default)]
    pub reviewer: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default = "Utc::now")]
    pub reviewed_at: DateTime<Utc>,
}

impl ReviewDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            corrections: Map::new(),
            reviewer: None,
            notes: None,
            reviewed_at: Utc::now(),
        }
    }

    pub fn reject(notes: impl Into<String>) -> Self {
        Self {
            approved: false,
            notes: Some(notes.into()),
            ..Self::approve()
        }
    }

    pub fn with_correction(mut self, field: impl Into<String>, value: Value) -> Self {
        self.corrections.insert(field.into(), value);
        self
    }

    pub fn with_reviewer(mut self, reviewer: impl Into<String>) -> Self {
        self.reviewer = Some(reviewer.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Snapshot of a paused pipeline awaiting review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// The stage that just finished when the pipeline paused.
    pub stage: Stage,
    pub state_snapshot: PipelineState,
    pub fields_requiring_approval: Vec<String>,
    #[serde(default)]
    pub review_result: Option<ReviewDecision>,
}

impl Checkpoint {
    /// Snapshot `state` after `stage`. The snapshot is a deep copy.
    pub fn new(id: Uuid, stage: Stage, state: &PipelineState) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            stage,
            state_snapshot: state.clone(),
            fields_requiring_approval: fields_for_stage(stage),
            review_result: None,
        }
    }

    pub fn is_reviewed(&self) -> bool {
        self.review_result.is_some()
    }
}

fn fields_for_stage(stage: Stage) -> Vec<String> {
    let fields: &[&str] = match stage {
        Stage::Intake => &["normalized_case"],
        Stage::Reasoning => &["hypotheses", "task_plan", "needs_more_tasks"],
        Stage::Execution => &["task_results", "needs_more_tasks"],
        Stage::Synthesis => &["final_report"],
        _ => &[],
    };
    fields.iter().map(|f| f.to_string()).collect()
}

/// Apply review corrections to `state`.
///
/// Every correction is checked before any is applied, so a failed call
/// leaves `state` untouched. Corrected task plans must only name tasks in
/// `registry`.
pub fn apply_corrections(
    state: &mut PipelineState,
    corrections: &Map<String, Value>,
    registry: &CapabilityRegistry,
) -> Result<(), ValidationError> {
    let mut corrected = state.clone();

    for (field, value) in corrections {
        match field.as_str() {
            "normalized_case" => match value {
                Value::Object(map) => corrected.normalized_case = Some(map.clone()),
                _ => return Err(invalid(field, "expected an object")),
            },
            "hypotheses" => {
                corrected.hypotheses = serde_json::from_value::<Vec<Hypothesis>>(value.clone())
                    .map_err(|e| invalid(field, &e.to_string()))?;
            }
            "task_plan" => {
                let plan = serde_json::from_value::<Vec<TaskRequest>>(value.clone())
                    .map_err(|e| invalid(field, &e.to_string()))?;
                registry.validate_plan(&plan)?;
                corrected.task_plan = plan;
            }
            "needs_more_tasks" => match value {
                Value::Bool(flag) => corrected.needs_more_tasks = *flag,
                _ => return Err(invalid(field, "expected a boolean")),
            },
            "final_report" => corrected.final_report = Some(corrected_report(field, value)?),
            other => return Err(ValidationError::UnknownCorrectionField(other.to_string())),
        }
    }

    *state = corrected;
    Ok(())
}

/// Accepts either a full recovered record or a bare field object.
fn corrected_report(field: &str, value: &Value) -> Result<RecoveredRecord, ValidationError> {
    if let Ok(record) = serde_json::from_value::<RecoveredRecord>(value.clone()) {
        if !(0.0..=1.0).contains(&record.confidence) {
            return Err(invalid(field, "confidence must be within [0, 1]"));
        }
        return Ok(record);
    }
    match value {
        Value::Object(fields) => Ok(RecoveredRecord {
            fields: fields.clone(),
            confidence: 1.0,
            warnings: vec!["Report fields supplied by reviewer".to_string()],
            strategy: RecoveryStrategy::Direct,
        }),
        _ => Err(invalid(field, "expected an object")),
    }
}

fn invalid(field: &str, reason: &str) -> ValidationError {
    ValidationError::InvalidCorrection {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Pluggable checkpoint persistence.
///
/// Implementations must make `record_review` at-most-once per checkpoint.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a new checkpoint.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointStoreError>;

    async fn load(&self, id: Uuid) -> Result<Checkpoint, CheckpointStoreError>;

    /// Unreviewed checkpoints, oldest first.
    async fn list_pending(&self) -> Result<Vec<Checkpoint>, CheckpointStoreError>;

    /// Attach `decision` to an unreviewed checkpoint and return the updated
    /// checkpoint. Fails with `AlreadyReviewed` and changes nothing if a
    /// decision is already recorded.
    async fn record_review(
        &self,
        id: Uuid,
        decision: &ReviewDecision,
    ) -> Result<Checkpoint, CheckpointStoreError>;
}

/// Process-local checkpoint store.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Mutex<HashMap<Uuid, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.checkpoints.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.checkpoints.lock().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointStoreError> {
        let mut checkpoints = self.checkpoints.lock().await;
        if checkpoints.get(&checkpoint.id).is_some_and(Checkpoint::is_reviewed) {
            return Err(CheckpointStoreError::AlreadyReviewed(checkpoint.id));
        }
        checkpoints.insert(checkpoint.id, checkpoint.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Checkpoint, CheckpointStoreError> {
        self.checkpoints
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(CheckpointStoreError::NotFound(id))
    }

    async fn list_pending(&self) -> Result<Vec<Checkpoint>, CheckpointStoreError> {
        let checkpoints = self.checkpoints.lock().await;
        let mut pending: Vec<Checkpoint> = checkpoints
            .values()
            .filter(|c| !c.is_reviewed())
            .cloned()
            .collect();
        pending.sort_by_key(|c| c.created_at);
        Ok(pending)
    }

    async fn record_review(
        &self,
        id: Uuid,
        decision: &ReviewDecision,
    ) -> Result<Checkpoint, CheckpointStoreError> {
        let mut checkpoints = self.checkpoints.lock().await;
        let checkpoint = checkpoints
            .get_mut(&id)
            .ok_or(CheckpointStoreError::NotFound(id))?;
        if checkpoint.is_reviewed() {
            return Err(CheckpointStoreError::AlreadyReviewed(id));
        }
        checkpoint.review_result = Some(decision.clone());
        Ok(checkpoint.clone())
    }
}

/// Checkpoints stored as one pretty-printed JSON file each.
///
/// Review updates are serialized through an in-process lock and written via
/// a temporary file and rename, so a reader never sees a partial file.
#[derive(Debug)]
pub struct FileCheckpointStore {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// The file path for a checkpoint.
    pub fn checkpoint_path(&self, id: &Uuid) -> PathBuf {
        self.base_path.join(format!("{}.json", id))
    }

    async fn ensure_directory(&self) -> Result<(), CheckpointStoreError> {
        if !fs::try_exists(&self.base_path).await? {
            fs::create_dir_all(&self.base_path).await?;
        }
        Ok(())
    }

    async fn read(&self, id: Uuid) -> Result<Checkpoint, CheckpointStoreError> {
        let path = self.checkpoint_path(&id);
        if !fs::try_exists(&path).await? {
            return Err(CheckpointStoreError::NotFound(id));
        }

        let contents = fs::read_to_string(&path).await?;
        let checkpoint: Checkpoint = serde_json::from_str(&contents)?;
        if checkpoint.id != id {
            return Err(CheckpointStoreError::InvalidData(format!(
                "Checkpoint ID mismatch: expected {}, got {}",
                id, checkpoint.id
            )));
        }
        Ok(checkpoint)
    }

    async fn write(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointStoreError> {
        self.ensure_directory().await?;

        let path = self.checkpoint_path(&checkpoint.id);
        let tmp_path = self.base_path.join(format!(".{}.json.tmp", checkpoint.id));
        let json = serde_json::to_string_pretty(checkpoint)?;

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &path).await?;
        debug!(checkpoint_id = %checkpoint.id, path = %path.display(), "Checkpoint written");
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointStoreError> {
        let _guard = self.write_lock.lock().await;
        match self.read(checkpoint.id).await {
            Ok(existing) if existing.is_reviewed() => {
                return Err(CheckpointStoreError::AlreadyReviewed(checkpoint.id))
            }
            Ok(_) | Err(CheckpointStoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.write(checkpoint).await
    }

    async fn load(&self, id: Uuid) -> Result<Checkpoint, CheckpointStoreError> {
        self.read(id).await
    }

    async fn list_pending(&self) -> Result<Vec<Checkpoint>, CheckpointStoreError> {
        self.ensure_directory().await?;

        let mut pending = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };
            let checkpoint = match self.read(id).await {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint file");
                    continue;
                }
            };
            if !checkpoint.is_reviewed() {
                pending.push(checkpoint);
            }
        }

        pending.sort_by_key(|c| c.created_at);
        Ok(pending)
    }

    async fn record_review(
        &self,
        id: Uuid,
        decision: &ReviewDecision,
    ) -> Result<Checkpoint, CheckpointStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut checkpoint = self.read(id).await?;
        if checkpoint.is_reviewed() {
            return Err(CheckpointStoreError::AlreadyReviewed(id));
        }
        checkpoint.review_result = Some(decision.clone());
        self.write(&checkpoint).await?;
        Ok(checkpoint)
    }
}
