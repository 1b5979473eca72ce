//! User configuration for the research agent
//!
//! Configuration file: ~/.config/deep-research/config.toml (or platform equivalent)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::{LoopConfig, DEFAULT_FRONTIER_LIMIT, DEFAULT_MAX_BAD_ATTEMPTS, DEFAULT_TOKEN_BUDGET};
use crate::tools::WebContext;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResearchConfig {
    #[serde(default)]
    pub agent: AgentSettings,

    #[serde(default)]
    pub search: SearchSettings,

    #[serde(default)]
    pub artifacts: ArtifactSettings,
}

/// Loop limits and pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_token_budget")]
    pub token_budget: u64,

    #[serde(default = "default_max_bad_attempts")]
    pub max_bad_attempts: usize,

    /// Pause between steps in milliseconds
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,

    #[serde(default = "default_frontier_limit")]
    pub frontier_limit: usize,

    /// Ask the model whether questions are duplicates, instead of exact matching
    #[serde(default = "default_true")]
    pub semantic_dedup: bool,
}

/// Search and fetch adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSettings {
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    #[serde(default = "default_max_results")]
    pub max_results: usize,

    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,

    /// Let the model turn search intents into keyword queries
    #[serde(default = "default_true")]
    pub rewrite_queries: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ArtifactSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Defaults to <data_dir>/deep-research/runs
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_token_budget() -> u64 {
    DEFAULT_TOKEN_BUDGET
}

fn default_max_bad_attempts() -> usize {
    DEFAULT_MAX_BAD_ATTEMPTS
}

fn default_step_delay_ms() -> u64 {
    1000
}

fn default_frontier_limit() -> usize {
    DEFAULT_FRONTIER_LIMIT
}

fn default_true() -> bool {
    true
}

fn default_http_timeout() -> u64 {
    30
}

fn default_max_results() -> usize {
    10
}

fn default_max_content_chars() -> usize {
    50_000
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            max_bad_attempts: default_max_bad_attempts(),
            step_delay_ms: default_step_delay_ms(),
            frontier_limit: default_frontier_limit(),
            semantic_dedup: true,
        }
    }
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            http_timeout_secs: default_http_timeout(),
            max_results: default_max_results(),
            max_content_chars: default_max_content_chars(),
            rewrite_queries: true,
        }
    }
}

impl ResearchConfig {
    /// Load user configuration from default location
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

        Ok(config_dir.join("deep-research").join("config.toml"))
    }

    /// Create a default configuration file with comments
    pub fn create_default() -> Result<PathBuf> {
        let path = Self::config_path()?;
        Self::write_default(&path)?;
        Ok(path)
    }

    fn write_default(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists: {}", path.display());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let default_config = r#"# deep-research configuration
# Location: ~/.config/deep-research/config.toml
# Ollama endpoint and models come from llm.toml

[agent]
# Token ceiling for one run, across every model call and fetched page
token_budget = 1000000

# Rejected final answers tolerated before the next answer is taken as is
max_bad_attempts = 3

# Pause between steps (milliseconds)
step_delay_ms = 1000

# Stop searching once this many unvisited URLs are known
frontier_limit = 20

# Use the model to spot duplicate questions and keywords (false: exact match)
semantic_dedup = true

[search]
http_timeout_secs = 30
max_results = 10

# Fetched pages are cut at this many characters
max_content_chars = 50000

# Let the model split search intents into keyword queries
rewrite_queries = true

[artifacts]
# Write prompts and state snapshots after every step
enabled = false
# dir = "/tmp/deep-research"
"#;

        fs::write(path, default_config)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig::default()
            .with_step_delay(Duration::from_millis(self.agent.step_delay_ms))
            .with_frontier_limit(self.agent.frontier_limit)
    }

    pub fn web_context(&self) -> WebContext {
        WebContext::default()
            .with_http_timeout(self.search.http_timeout_secs)
            .with_max_results(self.search.max_results)
            .with_max_content_chars(self.search.max_content_chars)
    }

    /// Artifact directory, if artifacts are enabled
    pub fn artifact_dir(&self) -> Option<PathBuf> {
        if !self.artifacts.enabled {
            return None;
        }
        self.artifacts.dir.clone().or_else(|| {
            dirs::data_dir().map(|d| d.join("deep-research").join("runs"))
        })
    }
}
