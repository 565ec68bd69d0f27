//! Task execution engine.
//!
//! Runs batches of named verification calls against external capabilities:
//!
//! - [`registry`]: capability trait, registry and validation contracts
//! - [`rate_limit`]: per-task sliding-window limiter
//! - [`cache`]: bounded, sharded result cache
//! - [`runner`]: one request to one final result
//! - [`scheduler`]: priority groups, concurrency and cancellation
//! - [`http`]: HTTP capabilities and their YAML manifest

pub mod cache;
pub mod http;
pub mod rate_limit;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod types;

pub use cache::{CacheConfig, CacheKey, CacheStats, ResultCache};
pub use http::{CapabilityManifest, HttpCapability, ManifestEntry, RequirementPreset};
pub use rate_limit::{Admission, RateLimit, RateLimiter};
pub use registry::{Capability, CapabilityRegistry, RegisteredTask, TaskRequirement};
pub use runner::TaskRunner;
pub use scheduler::{BatchScheduler, DEFAULT_MAX_CONCURRENCY};
pub use types::{BatchResult, Priority, TaskRequest, TaskResult, TaskStatus, DEFAULT_TASK_TIMEOUT};
