//! Error types for the research agent
//!
//! Non-definitive answers and bad-attempt exhaustion are not errors; they are
//! ordinary branches of the loop.

use crate::agent::ActionKind;

pub type Result<T, E = ResearchError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ResearchError {
    /// Pre-flight check: starting the call would push usage past the budget
    #[error("Token budget exceeded: {used} used + {estimated} estimated > {budget}")]
    BudgetExceeded {
        used: u64,
        estimated: u64,
        budget: u64,
    },

    /// The oracle returned something that does not parse as a decision
    #[error("Invalid decision from oracle: {0}")]
    InvalidDecision(String),

    /// The oracle picked an action outside the permitted set
    #[error("Oracle chose '{action}' which is not permitted this step")]
    ActionNotPermitted { action: ActionKind },

    /// A helper model call returned JSON of the wrong shape
    #[error("Malformed {tool} output: {message}")]
    MalformedOutput { tool: &'static str, message: String },

    #[error("Oracle call failed: {0:#}")]
    Oracle(anyhow::Error),

    #[error("Search for '{keyword}' failed: {error:#}")]
    Search {
        keyword: String,
        error: anyhow::Error,
    },

    #[error("Fetching {url} failed: {error:#}")]
    Fetch { url: String, error: anyhow::Error },

    #[error("Question must not be empty")]
    EmptyQuestion,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ResearchError {
    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, ResearchError::BudgetExceeded { .. })
    }
}
