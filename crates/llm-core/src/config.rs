//! Configuration management for llm.toml

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub ollama: OllamaConfig,
    pub models: ModelsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaConfig {
    pub host: String,
    pub port: u16,
    /// Per-request timeout for chat calls
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Attempts per chat call before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    /// Model used for every structured decision
    pub default: String,
    /// Model tried when the default one fails
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub num_ctx: Option<u32>,
}

fn default_request_timeout() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

impl Config {
    /// Load configuration from llm.toml
    pub fn load() -> Result<Self> {
        Self::load_from(Self::find_config_path()?)
    }

    /// Try to load configuration, returning None if not found
    pub fn try_load() -> Option<Self> {
        Self::load().ok()
    }

    /// Load llm.toml if present, otherwise fall back to a local default
    pub fn load_or_default() -> Self {
        Self::try_load().unwrap_or_else(Self::default_minimal)
    }

    /// Create a minimal default configuration for when llm.toml is missing
    pub fn default_minimal() -> Self {
        Self {
            ollama: OllamaConfig {
                host: "127.0.0.1".to_string(),
                port: 11434,
                request_timeout_secs: default_request_timeout(),
                max_attempts: default_max_attempts(),
            },
            models: ModelsConfig {
                default: "llama3.2".to_string(),
                fallback: None,
                temperature: None,
                num_ctx: None,
            },
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.as_ref().display()))
    }

    /// Find llm.toml by searching current directory and parents
    pub fn find_config_path() -> Result<PathBuf> {
        let mut current = std::env::current_dir()?;

        for _ in 0..10 {
            let candidate = current.join("llm.toml");
            if candidate.exists() {
                return Ok(candidate);
            }
            if !current.pop() {
                break;
            }
        }

        anyhow::bail!("llm.toml not found in current directory or parents")
    }

    /// Get Ollama base URL
    pub fn ollama_url(&self) -> String {
        format!("http://{}:{}", self.ollama.host, self.ollama.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[ollama]
host = "127.0.0.1"
port = 11434
request_timeout_secs = 120

[models]
default = "qwen2.5:14b"
fallback = "llama3.2"
temperature = 0.2
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.ollama.port, 11434);
        assert_eq!(config.ollama.request_timeout_secs, 120);
        assert_eq!(config.ollama.max_attempts, 3);
        assert_eq!(config.models.default, "qwen2.5:14b");
        assert_eq!(config.models.fallback.as_deref(), Some("llama3.2"));
        assert_eq!(config.ollama_url(), "http://127.0.0.1:11434");
    }

    #[test]
    fn test_default_minimal_has_no_fallback() {
        let config = Config::default_minimal();
        assert!(config.models.fallback.is_none());
        assert_eq!(config.ollama_url(), "http://127.0.0.1:11434");
    }
}
