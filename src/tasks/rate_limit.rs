//! Sliding-window rate limiter keyed by task name.
//!
//! Each task name owns its own timestamp window behind its own mutex, so
//! checks against different tasks never contend on the same lock.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

/// Call-rate bounds for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub per_second: u32,
    pub per_minute: u32,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            per_second: 5,
            per_minute: 120,
        }
    }
}

impl RateLimit {
    pub fn new(per_second: u32, per_minute: u32) -> Self {
        Self {
            per_second,
            per_minute,
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Rejected by the one-second window.
    PerSecondExceeded,
    /// Rejected by the sixty-second window.
    PerMinuteExceeded,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }

    /// Human-readable rejection reason, `None` when admitted.
    pub fn reason(&self, limit: &RateLimit) -> Option<String> {
        match self {
            Admission::Admitted => None,
            Admission::PerSecondExceeded => {
                Some(format!("Rate limit exceeded: {} calls per second", limit.per_second))
            }
            Admission::PerMinuteExceeded => {
                Some(format!("Rate limit exceeded: {} calls per minute", limit.per_minute))
            }
        }
    }
}

type Window = Arc<Mutex<VecDeque<Instant>>>;

/// Exact sliding-window counter over one-second and one-minute windows.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: RwLock<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and, if admitted, record a call for `task` now.
    pub fn try_acquire(&self, task: &str, limit: &RateLimit) -> Admission {
        self.check_at(task, limit, Instant::now())
    }

    /// Check and, if admitted, record a call for `task` at `now`.
    ///
    /// Callers must supply non-decreasing instants per task.
    pub fn check_at(&self, task: &str, limit: &RateLimit, now: Instant) -> Admission {
        let window = self.window(task);
        let mut calls = window.lock().unwrap_or_else(PoisonError::into_inner);

        while let Some(oldest) = calls.front() {
            if now.saturating_duration_since(*oldest) >= MINUTE {
                calls.pop_front();
            } else {
                break;
            }
        }

        let last_second = calls
            .iter()
            .rev()
            .take_while(|t| now.saturating_duration_since(**t) < SECOND)
            .count();

        let admission = if last_second >= limit.per_second as usize {
            Admission::PerSecondExceeded
        } else if calls.len() >= limit.per_minute as usize {
            Admission::PerMinuteExceeded
        } else {
            calls.push_back(now);
            Admission::Admitted
        };

        if !admission.is_admitted() {
            debug!(
                task = %task,
                last_second,
                last_minute = calls.len(),
                "Rate limiter rejected call"
            );
        }
        admission
    }

    /// Calls recorded for `task` within the last minute of `now`.
    pub fn usage_at(&self, task: &str, now: Instant) -> usize {
        let windows = self.windows.read().unwrap_or_else(PoisonError::into_inner);
        windows.get(task).map_or(0, |window| {
            window
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|t| now.saturating_duration_since(**t) < MINUTE)
                .count()
        })
    }

    /// Forget all recorded calls for `task`.
    pub fn reset(&self, task: &str) {
        let mut windows = self.windows.write().unwrap_or_else(PoisonError::into_inner);
        windows.remove(task);
    }

    fn window(&self, task: &str) -> Window {
        {
            let windows = self.windows.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(window) = windows.get(task) {
                return Arc::clone(window);
            }
        }
        let mut windows = self.windows.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(windows.entry(task.to_string()).or_default())
    }
}
