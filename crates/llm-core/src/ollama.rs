//! Ollama API client

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Ollama service status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OllamaStatus {
    /// Service is running and ready
    Running,
    /// Service is stopped or unreachable
    Stopped,
}

/// Model information from Ollama API
#[derive(Debug, Clone, Deserialize)]
pub struct Model {
    pub name: String,
    pub size: u64,
    pub digest: String,
    pub modified_at: String,
    #[serde(default)]
    pub details: ModelDetails,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelDetails {
    pub format: Option<String>,
    pub family: Option<String>,
    pub parameter_size: Option<String>,
    pub quantization_level: Option<String>,
}

/// Running model information
#[derive(Debug, Clone, Deserialize)]
pub struct RunningModel {
    pub name: String,
    pub size: u64,
    pub digest: String,
    pub expires_at: String,
    pub size_vram: u64,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<Model>,
}

#[derive(Debug, Deserialize)]
struct PsResponse {
    models: Vec<RunningModel>,
}

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Sampling options forwarded to the model
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    /// JSON schema the reply must conform to
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<&'a ChatOptions>,
}

/// Non-streaming chat response
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub model: String,
    pub message: ChatMessage,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub prompt_eval_count: Option<u64>,
    #[serde(default)]
    pub eval_count: Option<u64>,
    #[serde(default)]
    pub total_duration: u64,
    #[serde(default)]
    pub eval_duration: u64,
}

impl ChatResponse {
    /// Prompt plus completion tokens reported by the server
    pub fn total_tokens(&self) -> u64 {
        self.prompt_eval_count.unwrap_or(0) + self.eval_count.unwrap_or(0)
    }
}

/// Retry policy for chat requests
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (1-based), doubling each time
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Ollama API client
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
    retry: RetryConfig,
}

impl OllamaClient {
    /// Create a new client with the default request timeout
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(300))
    }

    /// Create a client with an explicit request timeout
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.into(),
            client,
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Check if Ollama is running
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/api/tags", self.base_url);

        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    /// Get current status
    pub async fn status(&self) -> OllamaStatus {
        if self.health_check().await.unwrap_or(false) {
            OllamaStatus::Running
        } else {
            OllamaStatus::Stopped
        }
    }

    /// List all available models
    pub async fn list_models(&self) -> Result<Vec<Model>> {
        let url = format!("{}/api/tags", self.base_url);

        let resp: TagsResponse = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to connect to Ollama")?
            .json()
            .await
            .context("Failed to parse models response")?;

        Ok(resp.models)
    }

    /// List currently running/loaded models
    pub async fn list_running(&self) -> Result<Vec<RunningModel>> {
        let url = format!("{}/api/ps", self.base_url);

        let resp: PsResponse = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to connect to Ollama")?
            .json()
            .await
            .context("Failed to parse running models response")?;

        Ok(resp.models)
    }

    /// Single non-streaming chat request
    ///
    /// When `format` is given, Ollama constrains the reply to that JSON schema.
    pub async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        format: Option<&Value>,
        options: Option<&ChatOptions>,
    ) -> Result<ChatResponse> {
        let url = format!("{}/api/chat", self.base_url);

        let req = ChatRequest {
            model,
            messages,
            stream: false,
            format,
            options,
        };

        let response: ChatResponse = self
            .client
            .post(&url)
            .json(&req)
            .send()
            .await
            .context("Failed to connect to Ollama")?
            .error_for_status()
            .context("Chat request failed")?
            .json()
            .await
            .context("Failed to parse chat response")?;

        debug!(
            model = %response.model,
            prompt_tokens = ?response.prompt_eval_count,
            completion_tokens = ?response.eval_count,
            "Chat completed"
        );

        Ok(response)
    }

    /// Chat with the client's retry policy applied
    pub async fn chat_with_retry(
        &self,
        model: &str,
        messages: &[ChatMessage],
        format: Option<&Value>,
        options: Option<&ChatOptions>,
    ) -> Result<ChatResponse> {
        let mut attempt = 1;
        loop {
            match self.chat(model, messages, format, options).await {
                Ok(resp) => return Ok(resp),
                Err(e) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(model, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Chat failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.context(format!("Chat failed after {} attempt(s)", attempt)))
                }
            }
        }
    }
}
