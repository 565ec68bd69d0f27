//! HTTP-backed verification capabilities and the YAML manifest that
//! declares them.
//!
//! # Manifest format
//!
//! ```yaml
//! tasks:
//!   - name: gene_lookup
//!     url: http://localhost:8080/genes
//!     presets: [gene_symbol]
//!     rate_limit: { per_second: 2, per_minute: 60 }
//!     timeout_ms: 10000
//!   - name: population_frequency
//!     url: http://localhost:8080/frequency
//!     api_key_env: FREQ_API_KEY
//!     requirements:
//!       - kind: parameter
//!         name: assembly
//! ```

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::rate_limit::RateLimit;
use super::registry::{Capability, CapabilityRegistry, RegisteredTask, TaskRequirement};
use crate::error::{CapabilityError, ConfigError};

/// Capability that POSTs `{"items": [...], "parameters": {...}}` to a URL and
/// expects a JSON object of per-item annotations back.
pub struct HttpCapability {
    url: String,
    api_key: Option<String>,
    http_client: Client,
}

impl HttpCapability {
    pub fn new(url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self, ConfigError> {
        let url = url.into();
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: url.clone(),
                message: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            url,
            api_key,
            http_client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[derive(Debug, Serialize)]
struct InvokeRequest<'a> {
    items: &'a [String],
    parameters: &'a Map<String, Value>,
}

#[async_trait]
impl Capability for HttpCapability {
    async fn invoke(
        &self,
        items: &[String],
        parameters: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<Map<String, Value>, CapabilityError> {
        let mut request = self
            .http_client
            .post(&self.url)
            .timeout(timeout)
            .header("Content-Type", "application/json");

        if let Some(ref api_key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request
            .json(&InvokeRequest { items, parameters })
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    CapabilityError::Unavailable(e.to_string())
                } else {
                    CapabilityError::Failed(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            let message = format!("HTTP {}: {}", status.as_u16(), body);
            return Err(if status.as_u16() == 503 {
                CapabilityError::Unavailable(message)
            } else {
                CapabilityError::Failed(message)
            });
        }

        match response.json::<Value>().await {
            Ok(Value::Object(annotations)) => Ok(annotations),
            Ok(other) => Err(CapabilityError::InvalidResponse(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
            Err(e) => Err(CapabilityError::InvalidResponse(e.to_string())),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Named requirement bundles usable from a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementPreset {
    GeneSymbol,
    GenomicCoordinates,
    MissenseChange,
}

impl RequirementPreset {
    pub fn requirement(&self) -> TaskRequirement {
        match self {
            RequirementPreset::GeneSymbol => TaskRequirement::gene_symbol(),
            RequirementPreset::GenomicCoordinates => TaskRequirement::genomic_coordinates(),
            RequirementPreset::MissenseChange => TaskRequirement::missense_change(),
        }
    }
}

/// One verification task declared in a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub presets: Vec<RequirementPreset>,
    #[serde(default)]
    pub requirements: Vec<TaskRequirement>,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    /// Upper bound for the HTTP client; individual requests may be shorter.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Environment variable holding a bearer token.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

/// Default client timeout for manifest entries without `timeout_ms`.
const DEFAULT_CLIENT_TIMEOUT_MS: u64 = 60_000;

/// A YAML file listing HTTP verification capabilities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityManifest {
    #[serde(default)]
    pub tasks: Vec<ManifestEntry>,
}

impl CapabilityManifest {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let manifest: Self = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let manifest: Self = serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Reject empty or duplicate names and empty URLs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for entry in &self.tasks {
            if entry.name.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "manifest entry has an empty name".to_string(),
                ));
            }
            if entry.url.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "task '{}' has an empty url",
                    entry.name
                )));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "task '{}' is declared more than once",
                    entry.name
                )));
            }
            if let Some(limit) = entry.rate_limit {
                if limit.per_second == 0 || limit.per_minute == 0 {
                    return Err(ConfigError::ValidationFailed(format!(
                        "task '{}' has a zero rate limit",
                        entry.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Build a registry of [`HttpCapability`] tasks.
    pub fn into_registry(self) -> Result<CapabilityRegistry, ConfigError> {
        let mut registry = CapabilityRegistry::new();
        for entry in self.tasks {
            let api_key = match entry.api_key_env {
                Some(ref var) => Some(
                    std::env::var(var).map_err(|_| ConfigError::MissingEnvVar(var.clone()))?,
                ),
                None => None,
            };
            let timeout = Duration::from_millis(entry.timeout_ms.unwrap_or(DEFAULT_CLIENT_TIMEOUT_MS));
            let capability = HttpCapability::new(entry.url, api_key, timeout)?;

            let mut task = RegisteredTask::new(Arc::new(capability));
            for preset in &entry.presets {
                task = task.with_requirement(preset.requirement());
            }
            for requirement in entry.requirements {
                task = task.with_requirement(requirement);
            }
            if let Some(limit) = entry.rate_limit {
                task = task.with_rate_limit(limit);
            }
            if let Some(description) = entry.description {
                task = task.with_description(description);
            }
            registry.register(entry.name, task);
        }
        Ok(registry)
    }
}
