//! Pipeline configuration.
//!
//! Covers the iteration bound, review checkpoints, task execution limits,
//! result cache sizing, checkpoint storage and the generator model.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::state::Stage;
use crate::error::ConfigError;
use crate::tasks::{
    BatchScheduler, CacheConfig, CapabilityRegistry, RateLimit, RateLimiter, ResultCache,
    TaskRunner,
};

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Loop settings
    /// Upper bound on REASONING/EXECUTION cycles.
    pub max_iterations: u32,
    /// Stages after which the pipeline pauses for review.
    pub checkpoint_after: Vec<Stage>,

    // Execution settings
    /// Timeout applied to planned tasks that do not carry their own.
    pub task_timeout: Duration,
    /// Tasks in flight within one priority group.
    pub max_concurrent_tasks: usize,
    /// Limit for tasks registered without their own.
    pub default_rate_limit: RateLimit,

    // Cache settings
    pub cache_max_entries: usize,
    pub cache_ttl: Option<Duration>,

    // Storage settings
    /// Directory for the file checkpoint store.
    pub checkpoint_dir: PathBuf,

    // Generator settings
    pub model: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            checkpoint_after: Vec::new(),

            task_timeout: Duration::from_secs(30),
            max_concurrent_tasks: 4,
            default_rate_limit: RateLimit::default(),

            cache_max_entries: 10_000,
            cache_ttl: None,

            checkpoint_dir: PathBuf::from("./checkpoints"),

            model: "gpt-4o-mini".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DXFORGE_MAX_ITERATIONS`: Iteration bound (default: 3)
    /// - `DXFORGE_CHECKPOINT_AFTER`: Comma-separated stage names (default: none)
    /// - `DXFORGE_TASK_TIMEOUT_MS`: Default task timeout in ms (default: 30000)
    /// - `DXFORGE_MAX_CONCURRENT_TASKS`: Tasks in flight per group (default: 4)
    /// - `DXFORGE_RATE_LIMIT_PER_SECOND`: Default per-second bound (default: 5)
    /// - `DXFORGE_RATE_LIMIT_PER_MINUTE`: Default per-minute bound (default: 120)
    /// - `DXFORGE_CACHE_MAX_ENTRIES`: Result cache bound (default: 10000)
    /// - `DXFORGE_CACHE_TTL_SECS`: Result cache TTL in seconds (default: none)
    /// - `DXFORGE_CHECKPOINT_DIR`: Checkpoint directory (default: ./checkpoints)
    /// - `DXFORGE_LLM_MODEL`: Generator model
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("DXFORGE_MAX_ITERATIONS") {
            config.max_iterations = parse_env_value(&val, "DXFORGE_MAX_ITERATIONS")?;
        }

        if let Ok(val) = std::env::var("DXFORGE_CHECKPOINT_AFTER") {
            config.checkpoint_after = parse_stage_list(&val, "DXFORGE_CHECKPOINT_AFTER")?;
        }

        if let Ok(val) = std::env::var("DXFORGE_TASK_TIMEOUT_MS") {
            let ms: u64 = parse_env_value(&val, "DXFORGE_TASK_TIMEOUT_MS")?;
            config.task_timeout = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("DXFORGE_MAX_CONCURRENT_TASKS") {
            config.max_concurrent_tasks = parse_env_value(&val, "DXFORGE_MAX_CONCURRENT_TASKS")?;
        }

        if let Ok(val) = std::env::var("DXFORGE_RATE_LIMIT_PER_SECOND") {
            config.default_rate_limit.per_second =
                parse_env_value(&val, "DXFORGE_RATE_LIMIT_PER_SECOND")?;
        }

        if let Ok(val) = std::env::var("DXFORGE_RATE_LIMIT_PER_MINUTE") {
            config.default_rate_limit.per_minute =
                parse_env_value(&val, "DXFORGE_RATE_LIMIT_PER_MINUTE")?;
        }

        if let Ok(val) = std::env::var("DXFORGE_CACHE_MAX_ENTRIES") {
            config.cache_max_entries = parse_env_value(&val, "DXFORGE_CACHE_MAX_ENTRIES")?;
        }

        if let Ok(val) = std::env::var("DXFORGE_CACHE_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "DXFORGE_CACHE_TTL_SECS")?;
            config.cache_ttl = Some(Duration::from_secs(secs));
        }

        if let Ok(val) = std::env::var("DXFORGE_CHECKPOINT_DIR") {
            config.checkpoint_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("DXFORGE_LLM_MODEL") {
            config.model = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_tasks must be greater than 0".to_string(),
            ));
        }

        if self.task_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "task_timeout must be greater than 0".to_string(),
            ));
        }

        if self.default_rate_limit.per_second == 0 || self.default_rate_limit.per_minute == 0 {
            return Err(ConfigError::ValidationFailed(
                "default_rate_limit bounds must be greater than 0".to_string(),
            ));
        }

        if self.cache_max_entries == 0 {
            return Err(ConfigError::ValidationFailed(
                "cache_max_entries must be greater than 0".to_string(),
            ));
        }

        if let Some(stage) = self
            .checkpoint_after
            .iter()
            .find(|s| !Stage::HANDLED.contains(s))
        {
            return Err(ConfigError::ValidationFailed(format!(
                "checkpoint_after may only name handled stages, got '{}'",
                stage
            )));
        }

        if self.model.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "model cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the iteration bound.
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Builder method to set the stages that pause for review.
    pub fn with_checkpoint_after(mut self, stages: Vec<Stage>) -> Self {
        self.checkpoint_after = stages;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_default_rate_limit(mut self, limit: RateLimit) -> Self {
        self.default_rate_limit = limit;
        self
    }

    pub fn with_cache_max_entries(mut self, max: usize) -> Self {
        self.cache_max_entries = max;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_checkpoint_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = path.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Result cache configuration derived from these settings.
    pub fn cache_config(&self) -> CacheConfig {
        let config = CacheConfig::new(self.cache_max_entries);
        match self.cache_ttl {
            Some(ttl) => config.with_ttl(ttl),
            None => config,
        }
    }

    /// Build a scheduler over `registry` with a fresh limiter and cache.
    pub fn build_scheduler(&self, registry: CapabilityRegistry) -> BatchScheduler {
        let runner = TaskRunner::new(
            Arc::new(registry),
            Arc::new(RateLimiter::new()),
            Arc::new(ResultCache::with_config(self.cache_config())),
        )
        .with_default_rate_limit(self.default_rate_limit);
        BatchScheduler::new(runner).with_max_concurrency(self.max_concurrent_tasks)
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse a comma-separated list of stage names. Empty entries are ignored.
fn parse_stage_list(value: &str, key: &str) -> Result<Vec<Stage>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Stage>().map_err(|message| ConfigError::InvalidValue {
                key: key.to_string(),
                message,
            })
        })
        .collect()
}
