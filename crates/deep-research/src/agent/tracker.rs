//! Token budget and action transcript tracking
//!
//! Both trackers survive a run so that a later run can resume with the same
//! budget consumption and history.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::action::Decision;
use crate::error::{ResearchError, Result};

/// Default token budget for a run
pub const DEFAULT_TOKEN_BUDGET: u64 = 1_000_000;

/// Cumulative token usage, broken down by the tool that spent it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub total: u64,
    pub calls: u64,
    #[serde(default)]
    pub by_tool: BTreeMap<String, u64>,
}

impl TokenUsage {
    /// One-line summary for display
    pub fn summary(&self) -> String {
        let breakdown = self
            .by_tool
            .iter()
            .map(|(tool, tokens)| format!("{}={}", tool, tokens))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} tokens in {} calls ({})", self.total, self.calls, breakdown)
    }
}

/// Shared, monotonically increasing token counter with a ceiling
#[derive(Debug)]
pub struct TokenTracker {
    budget: u64,
    usage: Mutex<TokenUsage>,
}

impl TokenTracker {
    pub fn new(budget: u64) -> Self {
        Self::with_usage(budget, TokenUsage::default())
    }

    /// Resume from usage recorded by an earlier run
    pub fn with_usage(budget: u64, usage: TokenUsage) -> Self {
        Self {
            budget,
            usage: Mutex::new(usage),
        }
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn total_usage(&self) -> u64 {
        self.usage.lock().total
    }

    pub fn remaining(&self) -> u64 {
        self.budget.saturating_sub(self.total_usage())
    }

    pub fn is_exhausted(&self) -> bool {
        self.total_usage() >= self.budget
    }

    /// Record tokens spent by `tool`
    pub fn record(&self, tool: &str, tokens: u64) {
        let mut usage = self.usage.lock();
        usage.total += tokens;
        usage.calls += 1;
        *usage.by_tool.entry(tool.to_string()).or_insert(0) += tokens;
        debug!(tool, tokens, total = usage.total, budget = self.budget, "Recorded token usage");
    }

    /// Pre-flight check before starting a call estimated to cost `estimated` tokens
    pub fn reserve(&self, estimated: u64) -> Result<()> {
        let used = self.total_usage();
        if used.saturating_add(estimated) > self.budget {
            return Err(ResearchError::BudgetExceeded {
                used,
                estimated,
                budget: self.budget,
            });
        }
        Ok(())
    }

    pub fn snapshot(&self) -> TokenUsage {
        self.usage.lock().clone()
    }
}

/// One oracle decision as it happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub total_step: usize,
    pub question: String,
    pub decision: Decision,
    pub recorded_at: DateTime<Utc>,
}

/// Full, never-reset transcript of decisions (the action context)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionTracker {
    steps: Vec<StepRecord>,
}

impl ActionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, total_step: usize, question: &str, decision: &Decision) {
        self.steps.push(StepRecord {
            total_step,
            question: question.to_string(),
            decision: decision.clone(),
            recorded_at: Utc::now(),
        });
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Budget and history carried across runs
#[derive(Debug, Clone)]
pub struct RunContext {
    pub tokens: Arc<TokenTracker>,
    pub actions: ActionTracker,
}

impl RunContext {
    pub fn new(budget: u64) -> Self {
        Self {
            tokens: Arc::new(TokenTracker::new(budget)),
            actions: ActionTracker::new(),
        }
    }

    /// Same usage and history under a different ceiling
    pub fn with_budget(self, budget: u64) -> Self {
        if budget == self.tokens.budget() {
            return self;
        }
        Self {
            tokens: Arc::new(TokenTracker::with_usage(budget, self.tokens.snapshot())),
            actions: self.actions,
        }
    }

    pub fn to_snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            budget: self.tokens.budget(),
            usage: self.tokens.snapshot(),
            actions: self.actions.clone(),
        }
    }
}

/// Serializable form of a [`RunContext`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub budget: u64,
    pub usage: TokenUsage,
    pub actions: ActionTracker,
}

impl From<RunSnapshot> for RunContext {
    fn from(snapshot: RunSnapshot) -> Self {
        Self {
            tokens: Arc::new(TokenTracker::with_usage(snapshot.budget, snapshot.usage)),
            actions: snapshot.actions,
        }
    }
}
