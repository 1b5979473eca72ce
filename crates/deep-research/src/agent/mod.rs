//! Research agent: decision types, loop state and the loop itself

mod action;
mod agent_loop;
mod prompt;
mod state;
mod tracker;

pub use action::{ActionKind, ActionSet, Decision, Reference, MAX_ITEMS_PER_ACTION};
pub use agent_loop::{AgentLoop, AgentServices, LoopConfig, RunOptions, RunOutcome, READ_TOOL};
pub use prompt::build_prompt;
pub use state::{
    AgentStatus, BadAttempt, KnowledgeItem, KnowledgeKind, ResearchContext,
    DEFAULT_FRONTIER_LIMIT, DEFAULT_MAX_BAD_ATTEMPTS,
};
pub use tracker::{
    ActionTracker, RunContext, RunSnapshot, StepRecord, TokenTracker, TokenUsage,
    DEFAULT_TOKEN_BUDGET,
};
