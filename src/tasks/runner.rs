//! Single-task execution: cache, validation, rate limiting, invocation.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::cache::{CacheKey, ResultCache};
use super::rate_limit::{RateLimit, RateLimiter};
use super::registry::CapabilityRegistry;
use super::types::{TaskRequest, TaskResult, TaskStatus};

/// Runs one task request to a final [`TaskResult`].
///
/// Never returns an error: every failure mode maps onto a result status.
/// The limiter and cache are shared handles so that independent runners
/// (and pipelines) can draw on the same budgets.
#[derive(Debug, Clone)]
pub struct TaskRunner {
    registry: Arc<CapabilityRegistry>,
    limiter: Arc<RateLimiter>,
    cache: Arc<ResultCache>,
    default_rate_limit: RateLimit,
}

impl TaskRunner {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        limiter: Arc<RateLimiter>,
        cache: Arc<ResultCache>,
    ) -> Self {
        Self {
            registry,
            limiter,
            cache,
            default_rate_limit: RateLimit::default(),
        }
    }

    /// Limit used for tasks registered without their own.
    pub fn with_default_rate_limit(mut self, limit: RateLimit) -> Self {
        self.default_rate_limit = limit;
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Execute `request`.
    ///
    /// Order: cache lookup (a hit skips everything else), validation, rate
    /// limiter, invocation under the request timeout, cache store on success.
    pub async fn run(&self, request: &TaskRequest) -> TaskResult {
        let key = CacheKey::new(&request.name, &request.target_items);

        if let Some(cached) = self.cache.get(&key) {
            debug!(task = %request.name, key = %key, "Serving task result from cache");
            return TaskResult::from_cache(request, &cached);
        }

        let result = TaskResult::pending(request);

        let Some(registered) = self.registry.resolve(&request.name) else {
            warn!(task = %request.name, "Task is not registered");
            return result.fail(format!("Task '{}' is not registered", request.name));
        };

        if let Err(message) = registered.validate(request) {
            info!(task = %request.name, reason = %message, "Task failed validation");
            return result.fail(message);
        }

        let limit = registered.rate_limit.unwrap_or(self.default_rate_limit);
        let admission = self.limiter.try_acquire(&request.name, &limit);
        if let Some(reason) = admission.reason(&limit) {
            info!(task = %request.name, "Task rate limited");
            return result.rate_limited(reason);
        }

        let result = result.start().with_call();
        let invocation = AssertUnwindSafe(registered.capability.invoke(
            &request.target_items,
            &request.parameters,
            request.timeout,
        ))
        .catch_unwind();

        let result = match tokio::time::timeout(request.timeout, invocation).await {
            Err(_) => result.timed_out(request.timeout),
            Ok(Err(_)) => result.fail("Capability panicked"),
            Ok(Ok(Err(e))) => result.fail(e.to_string()),
            Ok(Ok(Ok(annotations))) => result.complete(annotations),
        };

        match result.status {
            TaskStatus::Completed => {
                debug!(
                    task = %request.name,
                    key = %key,
                    fingerprint = %key.fingerprint(),
                    "Task completed"
                );
                self.cache.insert(key, result.clone());
            }
            status => {
                warn!(
                    task = %request.name,
                    status = %status,
                    error = result.error_message.as_deref().unwrap_or(""),
                    "Task did not complete"
                );
            }
        }

        result
    }
}
