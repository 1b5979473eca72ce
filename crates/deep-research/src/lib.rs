//! Iterative research agent
//!
//! Given a question, the agent searches, reads, reflects and answers in a
//! loop driven by a local language model until an answer passes evaluation
//! or the token budget runs out.

pub mod agent;
pub mod analyzer;
pub mod artifacts;
pub mod config;
pub mod dedup;
pub mod error;
pub mod evaluator;
pub mod llm;
pub mod oracle;
pub mod tokenizer;
pub mod tools;

#[cfg(test)]
mod test_support;

pub use agent::{AgentLoop, AgentServices, AgentStatus, LoopConfig, RunOptions, RunOutcome};
pub use config::ResearchConfig;
pub use error::{ResearchError, Result};
