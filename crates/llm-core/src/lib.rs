//! llm-core: Ollama access for the research agent
//!
//! Provides:
//! - Configuration loading (llm.toml)
//! - Ollama API client (non-streaming chat with JSON-schema constrained output)
//! - Retry with exponential backoff

pub mod config;
pub mod ollama;

pub use config::Config;
pub use ollama::{
    ChatMessage, ChatOptions, ChatResponse, Model, OllamaClient, OllamaStatus, RetryConfig, Role,
    RunningModel,
};
