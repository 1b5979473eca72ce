//! Schema-constrained generation on top of the Ollama client
//!
//! Every model-backed collaborator (decision oracle, evaluator, deduplicator,
//! failure analyzer, query rewriter) goes through [`StructuredLlm`] so that
//! token usage lands in the run's [`TokenTracker`].

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use llm_core::{ChatMessage, ChatOptions, Config, OllamaClient, RetryConfig};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::agent::TokenTracker;
use crate::error::{ResearchError, Result};
use crate::tokenizer::count_tokens;

/// Produces one JSON value conforming to `schema` for `prompt`
#[async_trait]
pub trait StructuredLlm: Send + Sync {
    /// `tool` names the caller for usage accounting
    async fn generate(
        &self,
        tool: &str,
        prompt: &str,
        schema: &Value,
        tracker: &TokenTracker,
    ) -> Result<Value>;
}

/// Structured generation through a local Ollama server
#[derive(Debug, Clone)]
pub struct OllamaLlm {
    client: OllamaClient,
    model: String,
    fallback_model: Option<String>,
    options: ChatOptions,
}

impl OllamaLlm {
    pub fn new(client: OllamaClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            fallback_model: None,
            options: ChatOptions::default(),
        }
    }

    /// Build from llm.toml, with an optional model override
    pub fn from_config(config: &Config, model_override: Option<String>) -> anyhow::Result<Self> {
        let retry = RetryConfig {
            max_attempts: config.ollama.max_attempts.max(1),
            ..Default::default()
        };
        let client = OllamaClient::with_timeout(
            config.ollama_url(),
            Duration::from_secs(config.ollama.request_timeout_secs),
        )?
        .with_retry(retry);

        let model = model_override.unwrap_or_else(|| config.models.default.clone());
        let mut llm = Self::new(client, model);
        llm.fallback_model = config.models.fallback.clone();
        llm.options = ChatOptions {
            temperature: config.models.temperature,
            num_ctx: config.models.num_ctx,
            ..Default::default()
        };
        Ok(llm)
    }

    async fn chat_json(&self, model: &str, prompt: &str, schema: &Value) -> anyhow::Result<(Value, u64)> {
        let messages = [ChatMessage::user(prompt)];
        let response = self
            .client
            .chat_with_retry(model, &messages, Some(schema), Some(&self.options))
            .await?;

        let tokens = response.total_tokens();
        let value = extract_json(&response.message.content)
            .with_context(|| format!("Model {} returned no parsable JSON", model))?;
        Ok((value, tokens))
    }
}

#[async_trait]
impl StructuredLlm for OllamaLlm {
    #[instrument(skip(self, prompt, schema, tracker), fields(model = %self.model, prompt_len = prompt.len()))]
    async fn generate(
        &self,
        tool: &str,
        prompt: &str,
        schema: &Value,
        tracker: &TokenTracker,
    ) -> Result<Value> {
        let primary = self.chat_json(&self.model, prompt, schema).await;

        let (value, tokens) = match (primary, &self.fallback_model) {
            (Ok(out), _) => out,
            (Err(e), Some(fallback)) => {
                warn!(model = %self.model, fallback = %fallback, error = %e, "Primary model failed, using fallback");
                self.chat_json(fallback, prompt, schema)
                    .await
                    .map_err(ResearchError::Oracle)?
            }
            (Err(e), None) => return Err(ResearchError::Oracle(e)),
        };

        // Servers that omit eval counts still cost something
        let tokens = if tokens == 0 {
            count_tokens(prompt) + count_tokens(&value.to_string())
        } else {
            tokens
        };
        tracker.record(tool, tokens);
        debug!(tool, tokens, "Structured generation completed");
        Ok(value)
    }
}

/// Pull a JSON object out of model output
///
/// Schema-constrained output is usually bare JSON, but some models still wrap
/// it in a markdown fence or surround it with prose.
pub fn extract_json(content: &str) -> anyhow::Result<Value> {
    let content = content.trim();
    if content.is_empty() {
        return Err(anyhow!("empty response"));
    }

    if let Ok(value) = serde_json::from_str::<Value>(content) {
        return Ok(value);
    }

    if let Some(fenced) = extract_fenced(content) {
        if let Ok(value) = serde_json::from_str::<Value>(fenced) {
            return Ok(value);
        }
    }

    first_json_object(content).ok_or_else(|| anyhow!("no JSON object in response"))
}

fn extract_fenced(content: &str) -> Option<&str> {
    for pattern in ["```json\n", "```JSON\n", "```\n"] {
        if let Some(start) = content.find(pattern) {
            let body_start = start + pattern.len();
            if let Some(end) = content[body_start..].find("```") {
                return Some(content[body_start..body_start + end].trim());
            }
        }
    }
    None
}

/// First balanced `{...}` span that parses as JSON
fn first_json_object(content: &str) -> Option<Value> {
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in content.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        if let Ok(value) = serde_json::from_str::<Value>(&content[s..=i]) {
                            return Some(value);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    None
}
