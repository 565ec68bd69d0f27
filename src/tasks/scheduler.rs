//! Priority-grouped batch scheduling.
//!
//! A plan is split into HIGH, MEDIUM and LOW groups which run strictly one
//! after another. Tasks inside a group run concurrently up to the worker
//! budget; results keep submission order within each group.

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::runner::TaskRunner;
use super::types::{BatchResult, Priority, TaskRequest, TaskResult};
use crate::error::ValidationError;

/// Default number of tasks in flight within one priority group.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Runs task plans through a [`TaskRunner`].
#[derive(Debug, Clone)]
pub struct BatchScheduler {
    runner: TaskRunner,
    max_concurrency: usize,
}

impl BatchScheduler {
    pub fn new(runner: TaskRunner) -> Self {
        Self {
            runner,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    /// Tasks allowed in flight within a group. `1` gives strict submission
    /// order.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Run `plan` to completion.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` without running anything if any request
    /// names an unregistered task.
    pub async fn run_batch(&self, plan: &[TaskRequest]) -> Result<BatchResult, ValidationError> {
        self.run_batch_cancellable(plan, &CancellationToken::new()).await
    }

    /// Run `plan`, stopping dispatch once `cancel` fires.
    ///
    /// Calls already in flight finish or time out on their own; requests not
    /// yet dispatched are reported as `SKIPPED`.
    pub async fn run_batch_cancellable(
        &self,
        plan: &[TaskRequest],
        cancel: &CancellationToken,
    ) -> Result<BatchResult, ValidationError> {
        self.runner.registry().validate_plan(plan)?;

        let started = Instant::now();
        let mut results = Vec::with_capacity(plan.len());

        for priority in Priority::ORDER {
            let group: Vec<&TaskRequest> = plan.iter().filter(|r| r.priority == priority).collect();
            if group.is_empty() {
                continue;
            }

            debug!(
                priority = %priority,
                tasks = group.len(),
                "Dispatching priority group"
            );

            let mut dispatches: Vec<BoxFuture<'_, TaskResult>> = Vec::with_capacity(group.len());
            for request in group {
                dispatches.push(self.dispatch(request, cancel).boxed());
            }
            let group_results: Vec<TaskResult> = stream::iter(dispatches)
                .buffered(self.max_concurrency)
                .collect()
                .await;
            results.extend(group_results);
        }

        let batch = BatchResult::from_results(results, started.elapsed());
        info!(
            tasks = batch.results.len(),
            completed = batch.completed_count,
            failed = batch.failed_count,
            skipped = batch.skipped_count,
            duration_ms = batch.total_duration.as_millis() as u64,
            "Batch finished"
        );
        Ok(batch)
    }

    async fn dispatch(&self, request: &TaskRequest, cancel: &CancellationToken) -> TaskResult {
        if cancel.is_cancelled() {
            debug!(task = %request.name, "Batch cancelled, skipping task");
            return TaskResult::pending(request).skipped("Batch cancelled before dispatch");
        }
        self.runner.run(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CapabilityError;
    use crate::tasks::cache::ResultCache;
    use crate::tasks::rate_limit::RateLimiter;
    use crate::tasks::registry::{Capability, CapabilityRegistry, RegisteredTask};
    use crate::tasks::types::TaskStatus;
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct Probe {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Capability for Probe {
        async fn invoke(
            &self,
            _items: &[String],
            _parameters: &Map<String, Value>,
            _timeout: Duration,
        ) -> Result<Map<String, Value>, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Map::new())
        }
    }

    fn scheduler(probe: Arc<Probe>) -> BatchScheduler {
        let registry = CapabilityRegistry::new().with_task("probe", RegisteredTask::new(probe));
        let runner = TaskRunner::new(
            Arc::new(registry),
            Arc::new(RateLimiter::new()),
            Arc::new(ResultCache::default()),
        );
        BatchScheduler::new(runner)
    }

    #[tokio::test]
    async fn test_unknown_task_rejects_whole_batch() {
        let probe = Arc::new(Probe {
            calls: AtomicUsize::new(0),
        });
        let scheduler = scheduler(probe.clone());
        let plan = vec![
            TaskRequest::new("probe").with_item("a"),
            TaskRequest::new("nope").with_priority(Priority::Low),
        ];

        let err = scheduler.run_batch(&plan).await.unwrap_err();
        assert_eq!(err, ValidationError::UnknownTask("nope".to_string()));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_results_grouped_by_priority() {
        let probe = Arc::new(Probe {
            calls: AtomicUsize::new(0),
        });
        let scheduler = scheduler(probe);
        let plan = vec![
            TaskRequest::new("probe").with_item("low").with_priority(Priority::Low),
            TaskRequest::new("probe").with_item("high").with_priority(Priority::High),
            TaskRequest::new("probe").with_item("medium"),
        ];

        let batch = scheduler.run_batch(&plan).await.unwrap();
        let order: Vec<&str> = batch
            .results
            .iter()
            .map(|r| r.items_queried[0].as_str())
            .collect();
        assert_eq!(order, vec!["high", "medium", "low"]);
        assert_eq!(batch.completed_count, 3);
    }

    #[tokio::test]
    async fn test_cancelled_batch_skips_everything() {
        let probe = Arc::new(Probe {
            calls: AtomicUsize::new(0),
        });
        let scheduler = scheduler(probe.clone());
        let plan = vec![
            TaskRequest::new("probe").with_item("a"),
            TaskRequest::new("probe").with_item("b"),
        ];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let batch = scheduler.run_batch_cancellable(&plan, &cancel).await.unwrap();
        assert_eq!(batch.skipped_count, 2);
        assert!(batch.results.iter().all(|r| r.status == TaskStatus::Skipped));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_plan() {
        let probe = Arc::new(Probe {
            calls: AtomicUsize::new(0),
        });
        let batch = scheduler(probe).run_batch(&[]).await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.completed_count, 0);
    }
}
