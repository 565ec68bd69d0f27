//! Task, result and batch types for the execution engine.
//!
//! - `TaskRequest`: one named verification call in a plan
//! - `TaskResult`: outcome of one call, finalized exactly once
//! - `BatchResult`: aggregate of a whole plan

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Default per-call timeout (30 seconds).
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// Durations serialize as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

fn default_timeout() -> Duration {
    DEFAULT_TASK_TIMEOUT
}

/// Scheduling priority. Groups run strictly in `High`, `Medium`, `Low` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// All priorities in execution order.
    pub const ORDER: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// A single verification call in a task plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Registered task name.
    pub name: String,
    #[serde(default)]
    pub priority: Priority,
    /// Opaque item keys the task is about (gene symbols, variants, ...).
    #[serde(default)]
    pub target_items: Vec<String>,
    /// Per-call timeout, serialized in milliseconds.
    #[serde(with = "duration_ms", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl TaskRequest {
    /// Creates a medium-priority request with the default timeout.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: Priority::default(),
            target_items: Vec::new(),
            timeout: DEFAULT_TASK_TIMEOUT,
            parameters: Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.target_items.push(item.into());
        self
    }

    pub fn with_items<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_items.extend(items.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Lifecycle of a task result.
///
/// `Pending` and `Running` are transient; every other status is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    RateLimited,
    Skipped,
}

impl TaskStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    /// Statuses counted as failures in a batch summary.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::RateLimited
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Timeout => "TIMEOUT",
            TaskStatus::RateLimited => "RATE_LIMITED",
            TaskStatus::Skipped => "SKIPPED",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one task call.
///
/// Built as `pending -> start -> <final transition>`; the final transition
/// consumes the value, so a result is finalized at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub name: String,
    pub status: TaskStatus,
    pub items_queried: Vec<String>,
    /// Per-item structured output from the capability.
    #[serde(default)]
    pub annotations: Map<String, Value>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// External invocations made to produce this result.
    pub call_count: u32,
    pub cache_hit: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl TaskResult {
    /// A result for `request` that has not been dispatched yet.
    pub fn pending(request: &TaskRequest) -> Self {
        Self {
            name: request.name.clone(),
            status: TaskStatus::Pending,
            items_queried: request.target_items.clone(),
            annotations: Map::new(),
            start_time: None,
            end_time: None,
            call_count: 0,
            cache_hit: false,
            error_message: None,
        }
    }

    pub fn start(mut self) -> Self {
        self.status = TaskStatus::Running;
        self.start_time = Some(Utc::now());
        self
    }

    pub fn complete(self, annotations: Map<String, Value>) -> Self {
        let mut result = self.finish(TaskStatus::Completed);
        result.annotations = annotations;
        result
    }

    pub fn fail(self, message: impl Into<String>) -> Self {
        let mut result = self.finish(TaskStatus::Failed);
        result.error_message = Some(message.into());
        result
    }

    pub fn timed_out(self, timeout: Duration) -> Self {
        let mut result = self.finish(TaskStatus::Timeout);
        result.error_message = Some(format!("Timed out after {}ms", timeout.as_millis()));
        result
    }

    pub fn rate_limited(self, message: impl Into<String>) -> Self {
        let mut result = self.finish(TaskStatus::RateLimited);
        result.error_message = Some(message.into());
        result
    }

    pub fn skipped(self, reason: impl Into<String>) -> Self {
        let mut result = self.finish(TaskStatus::Skipped);
        result.error_message = Some(reason.into());
        result
    }

    /// Record one external invocation.
    pub fn with_call(mut self) -> Self {
        self.call_count += 1;
        self
    }

    /// A copy of a cached result served for a new request.
    pub fn from_cache(request: &TaskRequest, cached: &TaskResult) -> Self {
        let now = Utc::now();
        Self {
            items_queried: request.target_items.clone(),
            start_time: Some(now),
            end_time: Some(now),
            call_count: 0,
            cache_hit: true,
            ..cached.clone()
        }
    }

    fn finish(mut self, status: TaskStatus) -> Self {
        let now = Utc::now();
        if self.start_time.is_none() {
            self.start_time = Some(now);
        }
        self.end_time = Some(now);
        self.status = status;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// Wall time between start and end, if both are recorded.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Aggregate outcome of a task plan.
///
/// Consumers should identify results by `(name, items_queried)`, not by
/// position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub results: Vec<TaskResult>,
    pub completed_count: usize,
    /// `FAILED`, `TIMEOUT` and `RATE_LIMITED` results.
    pub failed_count: usize,
    pub skipped_count: usize,
    /// Serialized in milliseconds.
    #[serde(with = "duration_ms")]
    pub total_duration: Duration,
}

impl BatchResult {
    pub fn from_results(results: Vec<TaskResult>, total_duration: Duration) -> Self {
        let completed_count = results.iter().filter(|r| r.is_success()).count();
        let failed_count = results.iter().filter(|r| r.status.is_failure()).count();
        let skipped_count = results
            .iter()
            .filter(|r| r.status == TaskStatus::Skipped)
            .count();
        Self {
            results,
            completed_count,
            failed_count,
            skipped_count,
            total_duration,
        }
    }

    /// First result for a task name.
    pub fn get(&self, name: &str) -> Option<&TaskResult> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn cache_hits(&self) -> usize {
        self.results.iter().filter(|r| r.cache_hit).count()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Medium < Priority::Low);
        assert_eq!("low".parse::<Priority>().unwrap(), Priority::Low);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_request_builder_and_serde() {
        let request = TaskRequest::new("gene_lookup")
            .with_priority(Priority::High)
            .with_items(["BRCA1", "TP53"])
            .with_timeout(Duration::from_millis(1500))
            .with_parameter("species", "human");

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["priority"], json!("HIGH"));
        assert_eq!(value["timeout"], json!(1500));
        assert_eq!(value["target_items"], json!(["BRCA1", "TP53"]));

        let parsed: TaskRequest = serde_json::from_value(json!({"name": "x"})).unwrap();
        assert_eq!(parsed.priority, Priority::Medium);
        assert_eq!(parsed.timeout, DEFAULT_TASK_TIMEOUT);
    }

    #[test]
    fn test_result_transitions() {
        let request = TaskRequest::new("t").with_item("a");
        let pending = TaskResult::pending(&request);
        assert_eq!(pending.status, TaskStatus::Pending);
        assert!(!pending.status.is_final());

        let running = pending.start();
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.start_time.is_some());

        let mut annotations = Map::new();
        annotations.insert("a".to_string(), json!({"ok": true}));
        let done = running.with_call().complete(annotations);
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.call_count, 1);
        assert!(done.end_time >= done.start_time);
        assert!(done.duration().is_some());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_value(TaskStatus::RateLimited).unwrap(),
            json!("RATE_LIMITED")
        );
        assert!(TaskStatus::Timeout.is_failure());
        assert!(!TaskStatus::Skipped.is_failure());
    }

    #[test]
    fn test_cached_copy() {
        let request = TaskRequest::new("t");
        let original = TaskResult::pending(&request).start().with_call().complete(Map::new());
        let again = TaskRequest::new("t").with_items(["b", "a"]);
        let copy = TaskResult::from_cache(&again, &original);
        assert!(copy.cache_hit);
        assert_eq!(copy.items_queried, vec!["b", "a"]);
        assert_eq!(copy.call_count, 0);
        assert_eq!(copy.annotations, original.annotations);
    }

    #[test]
    fn test_batch_counts() {
        let request = TaskRequest::new("t");
        let results = vec![
            TaskResult::pending(&request).start().complete(Map::new()),
            TaskResult::pending(&request).start().fail("boom"),
            TaskResult::pending(&request).start().timed_out(Duration::from_millis(5)),
            TaskResult::pending(&request).rate_limited("limit"),
            TaskResult::pending(&request).skipped("cancelled"),
        ];
        let batch = BatchResult::from_results(results, Duration::from_millis(42));
        assert_eq!(batch.completed_count, 1);
        assert_eq!(batch.failed_count, 3);
        assert_eq!(batch.skipped_count, 1);

        let value = serde_json::to_value(&batch).unwrap();
        assert_eq!(value["total_duration"], json!(42));
    }
}
