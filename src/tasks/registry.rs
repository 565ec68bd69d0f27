//! Verification capability registry.
//!
//! A registry is an explicit object handed to the scheduler at construction,
//! so independent pipelines can run against different registries.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::rate_limit::RateLimit;
use super::types::TaskRequest;
use crate::error::{CapabilityError, ValidationError};

/// An external verification service or lookup.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Task-specific validation beyond the declarative requirements.
    fn validate(&self, _request: &TaskRequest) -> Result<(), String> {
        Ok(())
    }

    /// Query the capability for `items`, returning per-item annotations.
    ///
    /// `timeout` is advisory; the runner enforces it independently and drops
    /// the future when it elapses.
    async fn invoke(
        &self,
        items: &[String],
        parameters: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<Map<String, Value>, CapabilityError>;
}

/// A declarative precondition checked before a task is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskRequirement {
    /// At least one target item.
    NonEmptyItems,
    /// A named parameter must be present and non-null.
    Parameter { name: String },
    /// At least one item, and every item matches `pattern`.
    ItemPattern { pattern: String, description: String },
}

impl TaskRequirement {
    /// Items must look like gene symbols (`BRCA1`, `C9orf72`, `HLA-B`).
    pub fn gene_symbol() -> Self {
        TaskRequirement::ItemPattern {
            pattern: r"^[A-Za-z][A-Za-z0-9\-\.]*$".to_string(),
            description: "a gene symbol".to_string(),
        }
    }

    /// Items must be genomic coordinates (`chr17:43044295`, `7:140753336-140753340`).
    pub fn genomic_coordinates() -> Self {
        TaskRequirement::ItemPattern {
            pattern: r"^(?i:chr)?([0-9]{1,2}|X|Y|MT?):[0-9]+([-:][0-9A-Za-z>]+)*$".to_string(),
            description: "genomic coordinates".to_string(),
        }
    }

    /// Items must be missense-style protein changes (`p.Arg175His`, `R175H`).
    pub fn missense_change() -> Self {
        TaskRequirement::ItemPattern {
            pattern: r"^(p\.)?([A-Z][a-z]{2}|[ACDEFGHIKLMNPQRSTVWY])[0-9]+([A-Z][a-z]{2}|[ACDEFGHIKLMNPQRSTVWY])$"
                .to_string(),
            description: "a missense change".to_string(),
        }
    }

    pub fn parameter(name: impl Into<String>) -> Self {
        TaskRequirement::Parameter { name: name.into() }
    }

    /// Check `request` against this requirement.
    pub fn check(&self, request: &TaskRequest) -> Result<(), String> {
        match self {
            TaskRequirement::NonEmptyItems => {
                if request.target_items.is_empty() {
                    Err(format!("Task '{}' requires at least one target item", request.name))
                } else {
                    Ok(())
                }
            }
            TaskRequirement::Parameter { name } => match request.parameters.get(name) {
                Some(value) if !value.is_null() => Ok(()),
                _ => Err(format!("Task '{}' requires parameter '{}'", request.name, name)),
            },
            TaskRequirement::ItemPattern {
                pattern,
                description,
            } => {
                if request.target_items.is_empty() {
                    return Err(format!("Task '{}' requires {}", request.name, description));
                }
                let re = Regex::new(pattern)
                    .map_err(|e| format!("Invalid requirement pattern '{}': {}", pattern, e))?;
                match request.target_items.iter().find(|item| !re.is_match(item.trim())) {
                    Some(item) => Err(format!(
                        "Task '{}' requires {}, got '{}'",
                        request.name, description, item
                    )),
                    None => Ok(()),
                }
            }
        }
    }
}

/// A capability plus its registration metadata.
#[derive(Clone)]
pub struct RegisteredTask {
    pub capability: Arc<dyn Capability>,
    pub requirements: Vec<TaskRequirement>,
    /// Overrides the scheduler's default limit when set.
    pub rate_limit: Option<RateLimit>,
    pub description: Option<String>,
}

impl std::fmt::Debug for RegisteredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTask")
            .field("requirements", &self.requirements)
            .field("rate_limit", &self.rate_limit)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl RegisteredTask {
    pub fn new(capability: Arc<dyn Capability>) -> Self {
        Self {
            capability,
            requirements: Vec::new(),
            rate_limit: None,
            description: None,
        }
    }

    pub fn with_requirement(mut self, requirement: TaskRequirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Run the declarative requirements, then the capability's own check.
    pub fn validate(&self, request: &TaskRequest) -> Result<(), String> {
        for requirement in &self.requirements {
            requirement.check(request)?;
        }
        self.capability.validate(request)
    }
}

/// Name-indexed set of verification capabilities.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    tasks: HashMap<String, RegisteredTask>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a task.
    pub fn register(&mut self, name: impl Into<String>, task: RegisteredTask) {
        self.tasks.insert(name.into(), task);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_task(mut self, name: impl Into<String>, task: RegisteredTask) -> Self {
        self.register(name, task);
        self
    }

    pub fn resolve(&self, name: &str) -> Option<&RegisteredTask> {
        self.tasks.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Check that every request names a registered task. Nothing is invoked.
    pub fn validate_plan(&self, plan: &[TaskRequest]) -> Result<(), ValidationError> {
        for (index, request) in plan.iter().enumerate() {
            if request.name.trim().is_empty() {
                return Err(ValidationError::EmptyTaskName(index));
            }
            if !self.contains(&request.name) {
                return Err(ValidationError::UnknownTask(request.name.clone()));
            }
        }
        Ok(())
    }
}
