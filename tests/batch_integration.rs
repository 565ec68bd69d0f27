//! Integration tests for the task execution engine.
//!
//! Exercises priority ordering, plan validation, cache idempotence and the
//! rate limiter bounds through the public API.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dx_forge::error::{CapabilityError, ValidationError};
use dx_forge::tasks::{
    BatchScheduler, Capability, CapabilityRegistry, Priority, RateLimit, RateLimiter,
    RegisteredTask, ResultCache, TaskRequest, TaskRunner, TaskStatus,
};

/// Sleeps for a fixed delay, records its name in a shared log and counts calls.
struct Delayed {
    name: &'static str,
    delay: Duration,
    calls: AtomicUsize,
    log: Arc<Mutex<Vec<String>>>,
}

impl Delayed {
    fn new(name: &'static str, delay: Duration, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            delay,
            calls: AtomicUsize::new(0),
            log,
        })
    }
}

#[async_trait]
impl Capability for Delayed {
    async fn invoke(
        &self,
        items: &[String],
        _parameters: &Map<String, Value>,
        _timeout: Duration,
    ) -> Result<Map<String, Value>, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!("{}:start", self.name));
        tokio::time::sleep(self.delay).await;
        self.log.lock().unwrap().push(format!("{}:end", self.name));
        Ok(items
            .iter()
            .map(|item| (item.clone(), json!({"checked_by": self.name})))
            .collect())
    }
}

fn scheduler(registry: CapabilityRegistry, concurrency: usize) -> BatchScheduler {
    let runner = TaskRunner::new(
        Arc::new(registry),
        Arc::new(RateLimiter::new()),
        Arc::new(ResultCache::new(1_000)),
    );
    BatchScheduler::new(runner).with_max_concurrency(concurrency)
}

#[tokio::test]
async fn test_low_priority_waits_for_high_priority_group() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let slow = Delayed::new("A", Duration::from_millis(500), Arc::clone(&log));
    let fast = Delayed::new("B", Duration::from_millis(10), Arc::clone(&log));
    let registry = CapabilityRegistry::new()
        .with_task("A", RegisteredTask::new(slow.clone()))
        .with_task("B", RegisteredTask::new(fast.clone()));
    let scheduler = scheduler(registry, 4);

    // LOW is submitted first to make sure order comes from priority, not position.
    let plan = vec![
        TaskRequest::new("B").with_priority(Priority::Low).with_item("x"),
        TaskRequest::new("A").with_priority(Priority::High).with_item("x"),
    ];
    let batch = scheduler.run_batch(&plan).await.unwrap();

    assert_eq!(batch.completed_count, 2);
    let a = batch.get("A").unwrap();
    let b = batch.get("B").unwrap();
    assert!(b.start_time.unwrap() >= a.end_time.unwrap());
    assert_eq!(
        *log.lock().unwrap(),
        vec!["A:start", "A:end", "B:start", "B:end"]
    );
}

#[tokio::test]
async fn test_unknown_task_rejects_whole_batch() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let known = Delayed::new("known", Duration::ZERO, log);
    let registry = CapabilityRegistry::new().with_task("known", RegisteredTask::new(known.clone()));
    let scheduler = scheduler(registry, 2);

    let plan = vec![
        TaskRequest::new("known").with_priority(Priority::High).with_item("x"),
        TaskRequest::new("unknown").with_priority(Priority::Low),
    ];
    let err = scheduler.run_batch(&plan).await.unwrap_err();

    assert_eq!(err, ValidationError::UnknownTask("unknown".to_string()));
    assert_eq!(known.calls.load(Ordering::SeqCst), 0);
    assert!(scheduler.runner().cache().is_empty());
}

#[tokio::test]
async fn test_identical_requests_invoke_once() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let capability = Delayed::new("lookup", Duration::ZERO, log);
    let registry =
        CapabilityRegistry::new().with_task("lookup", RegisteredTask::new(capability.clone()));
    let scheduler = scheduler(registry, 1);

    // Item order differs but canonicalizes to the same key.
    let first = scheduler
        .run_batch(&[TaskRequest::new("lookup").with_items(["FBN1", "TGFBR1"])])
        .await
        .unwrap();
    let second = scheduler
        .run_batch(&[TaskRequest::new("lookup").with_items(["TGFBR1", "FBN1"])])
        .await
        .unwrap();

    assert_eq!(capability.calls.load(Ordering::SeqCst), 1);
    let (a, b) = (&first.results[0], &second.results[0]);
    assert!(!a.cache_hit);
    assert!(b.cache_hit);
    assert_eq!(b.call_count, 0);
    assert_eq!(a.annotations, b.annotations);
    assert_eq!(b.items_queried, vec!["TGFBR1", "FBN1"]);
    assert_eq!(second.cache_hits(), 1);
}

#[tokio::test]
async fn test_rate_limited_tasks_make_no_call() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let capability = Delayed::new("freq", Duration::ZERO, log);
    let registry = CapabilityRegistry::new().with_task(
        "freq",
        RegisteredTask::new(capability.clone()).with_rate_limit(RateLimit::new(2, 100)),
    );
    let scheduler = scheduler(registry, 1);

    let plan: Vec<TaskRequest> = (0..4)
        .map(|i| TaskRequest::new("freq").with_item(format!("item-{}", i)))
        .collect();
    let batch = scheduler.run_batch(&plan).await.unwrap();

    let limited = batch
        .results
        .iter()
        .filter(|r| r.status == TaskStatus::RateLimited)
        .count();
    assert_eq!(limited, 2);
    assert_eq!(capability.calls.load(Ordering::SeqCst), 2);
    assert!(batch
        .results
        .iter()
        .filter(|r| r.status == TaskStatus::RateLimited)
        .all(|r| r.call_count == 0));
}

/// Linear congruential generator for reproducible pseudo-random gaps.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

#[test]
fn test_rate_limiter_never_exceeds_bounds() {
    let limits = [RateLimit::new(1, 10), RateLimit::new(3, 20), RateLimit::new(5, 120)];

    for (seed, limit) in limits.iter().enumerate() {
        let limiter = RateLimiter::new();
        let mut rng = Lcg(seed as u64 + 17);
        let t0 = Instant::now();
        let mut offset = Duration::ZERO;
        let mut admitted: Vec<Duration> = Vec::new();

        for _ in 0..2_000 {
            // Gaps between 0 and 400ms, with frequent bursts at the same instant.
            let gap = rng.next() % 400;
            if gap > 150 {
                offset += Duration::from_millis(gap);
            }
            if limiter.check_at("task", limit, t0 + offset).is_admitted() {
                admitted.push(offset);
            }
        }

        assert!(!admitted.is_empty());
        for (i, start) in admitted.iter().enumerate() {
            let in_second = admitted[i..]
                .iter()
                .take_while(|t| **t < *start + Duration::from_secs(1))
                .count();
            let in_minute = admitted[i..]
                .iter()
                .take_while(|t| **t < *start + Duration::from_secs(60))
                .count();
            assert!(
                in_second <= limit.per_second as usize,
                "{} calls within one second of {:?} for {:?}",
                in_second,
                start,
                limit
            );
            assert!(
                in_minute <= limit.per_minute as usize,
                "{} calls within one minute of {:?} for {:?}",
                in_minute,
                start,
                limit
            );
        }
    }
}

#[tokio::test]
async fn test_concurrent_batches_share_limiter() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let capability = Delayed::new("shared", Duration::from_millis(5), log);
    let registry = CapabilityRegistry::new().with_task(
        "shared",
        RegisteredTask::new(capability.clone()).with_rate_limit(RateLimit::new(3, 100)),
    );
    let scheduler = scheduler(registry, 4);

    let plans: Vec<Vec<TaskRequest>> = (0..4)
        .map(|p| {
            (0..3)
                .map(|i| TaskRequest::new("shared").with_item(format!("case{}-{}", p, i)))
                .collect()
        })
        .collect();
    let batches = futures::future::join_all(plans.iter().map(|plan| scheduler.run_batch(plan))).await;

    let completed: usize = batches
        .into_iter()
        .map(|b| b.unwrap().completed_count)
        .sum();
    assert_eq!(completed, capability.calls.load(Ordering::SeqCst));
    assert!(completed <= 3);
}
