//! OpenAI-compatible chat completions client used as the pipeline's text
//! generator.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::GeneratorError;

/// Produces free text from a prompt.
///
/// Stage handlers call this and hand the output to
/// [`recover`](crate::recovery::recover); a failure here becomes a stage error.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GeneratorError>;
}

/// A message in a chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Text generator backed by an OpenAI-compatible `/chat/completions` API.
pub struct HttpTextGenerator {
    api_base: String,
    api_key: Option<String>,
    model: String,
    system_prompt: Option<String>,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    http_client: Client,
}

impl HttpTextGenerator {
    /// Create a generator with explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns `GeneratorError::RequestFailed` if the HTTP client cannot be built.
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Result<Self, GeneratorError> {
        let http_client = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GeneratorError::RequestFailed(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            http_client,
        })
    }

    /// Create a generator from environment variables.
    ///
    /// Reads:
    /// - `DXFORGE_LLM_API_BASE`: Base URL for the API (required)
    /// - `DXFORGE_LLM_API_KEY`: Bearer token (optional)
    /// - `DXFORGE_LLM_MODEL`: Model name (defaults to "gpt-4o-mini")
    ///
    /// # Errors
    ///
    /// Returns `GeneratorError::MissingApiBase` if `DXFORGE_LLM_API_BASE` is not set.
    pub fn from_env() -> Result<Self, GeneratorError> {
        let api_base = env::var("DXFORGE_LLM_API_BASE").map_err(|_| GeneratorError::MissingApiBase)?;
        let api_key = env::var("DXFORGE_LLM_API_KEY").ok();
        let model = env::var("DXFORGE_LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self::new(api_base, api_key, model)
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn build_request(&self, prompt: &str) -> ApiRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(ref system) = self.system_prompt {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(prompt));

        ApiRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl ApiResponse {
    fn into_content(self) -> Result<String, GeneratorError> {
        self.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(GeneratorError::EmptyResponse)
    }
}

/// Map a non-success status and body to a generator error.
fn classify_error(status_code: u16, body: String) -> GeneratorError {
    let message = match serde_json::from_str::<ApiErrorResponse>(&body) {
        Ok(parsed) => parsed.error.message,
        Err(_) => body,
    };
    if status_code == 429 {
        GeneratorError::RateLimited(message)
    } else {
        GeneratorError::ApiError {
            code: status_code,
            message,
        }
    }
}

#[async_trait]
impl TextGenerator for HttpTextGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GeneratorError> {
        let url = format!("{}/chat/completions", self.api_base);

        let mut http_request = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json");

        if let Some(ref api_key) = self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", api_key));
        }

        tracing::debug!(model = %self.model, prompt_len = prompt.len(), "Requesting completion");

        let http_response = http_request
            .json(&self.build_request(prompt))
            .send()
            .await
            .map_err(|e| GeneratorError::RequestFailed(e.to_string()))?;

        let status = http_response.status();
        if !status.is_success() {
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(classify_error(status.as_u16(), error_text));
        }

        let api_response: ApiResponse = http_response
            .json()
            .await
            .map_err(|e| GeneratorError::ParseError(format!("Failed to parse API response: {}", e)))?;

        api_response.into_content()
    }
}
