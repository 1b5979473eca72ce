//! Research loop state
//!
//! Everything the loop mutates lives in [`ResearchContext`], owned by a single
//! run and passed by `&mut` through each step.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::action::{ActionKind, ActionSet};
use crate::tools::SearchResult;

/// Frontier size at which search is switched off
pub const DEFAULT_FRONTIER_LIMIT: usize = 20;

/// Default number of rejected final answers tolerated
pub const DEFAULT_MAX_BAD_ATTEMPTS: usize = 3;

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    /// A definitive answer to the original question was accepted
    Answered,
    /// Bad-attempt ceiling reached without success
    Exhausted,
    /// Forced final answer after the loop gave up
    BeastMode,
    Done,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Running => "running",
            AgentStatus::Answered => "answered",
            AgentStatus::Exhausted => "exhausted",
            AgentStatus::BeastMode => "beast_mode",
            AgentStatus::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeKind {
    Qa,
    Url,
}

/// A resolved sub-question or the extracted content of a visited URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub question: String,
    pub answer: String,
    #[serde(rename = "type")]
    pub kind: KnowledgeKind,
}

impl KnowledgeItem {
    pub fn qa(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            kind: KnowledgeKind::Qa,
        }
    }

    pub fn url(url: &str, content: impl Into<String>) -> Self {
        Self {
            question: format!("What is in {}?", url),
            answer: content.into(),
            kind: KnowledgeKind::Url,
        }
    }
}

/// A rejected final answer to the original question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadAttempt {
    pub question: String,
    pub answer: String,
    pub evaluation: String,
    pub recap: String,
    pub blame: String,
    pub improvement: String,
}

/// All mutable state of one research run
#[derive(Debug, Clone)]
pub struct ResearchContext {
    question: String,
    gaps: VecDeque<String>,
    all_questions: Vec<String>,
    knowledge: Vec<KnowledgeItem>,
    bad_attempts: Vec<BadAttempt>,
    frontier: BTreeMap<String, String>,
    visited: BTreeSet<String>,
    keywords: Vec<String>,
    diary: Vec<String>,
    /// Steps within the current attempt; reset after each bad attempt
    step: usize,
    /// Lifetime step index; never reset
    total_step: usize,
    /// One-step suppressions set by "no new information" outcomes
    next_step: ActionSet,
    frontier_limit: usize,
    status: AgentStatus,
}

impl ResearchContext {
    pub fn new(question: impl Into<String>) -> Self {
        let question = question.into();
        Self {
            all_questions: vec![question.clone()],
            question,
            gaps: VecDeque::new(),
            knowledge: Vec::new(),
            bad_attempts: Vec::new(),
            frontier: BTreeMap::new(),
            visited: BTreeSet::new(),
            keywords: Vec::new(),
            diary: Vec::new(),
            step: 0,
            total_step: 0,
            next_step: ActionSet::all(),
            frontier_limit: DEFAULT_FRONTIER_LIMIT,
            status: AgentStatus::Running,
        }
    }

    pub fn with_frontier_limit(mut self, limit: usize) -> Self {
        self.frontier_limit = limit;
        self
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn gaps(&self) -> &VecDeque<String> {
        &self.gaps
    }

    pub fn all_questions(&self) -> &[String] {
        &self.all_questions
    }

    pub fn knowledge(&self) -> &[KnowledgeItem] {
        &self.knowledge
    }

    pub fn bad_attempts(&self) -> &[BadAttempt] {
        &self.bad_attempts
    }

    pub fn bad_attempt_count(&self) -> usize {
        self.bad_attempts.len()
    }

    pub fn frontier(&self) -> &BTreeMap<String, String> {
        &self.frontier
    }

    pub fn visited(&self) -> &BTreeSet<String> {
        &self.visited
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn diary(&self) -> &[String] {
        &self.diary
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn total_step(&self) -> usize {
        self.total_step
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn set_status(&mut self, status: AgentStatus) {
        self.status = status;
    }

    pub fn is_original(&self, question: &str) -> bool {
        question.trim() == self.question.trim()
    }

    /// Start a new step: bump both counters, pop the next question and
    /// compute what the oracle may do. Suppressions from the previous step
    /// apply to this step only.
    pub fn begin_step(&mut self) -> (String, ActionSet) {
        self.step += 1;
        self.total_step += 1;

        let current = self
            .gaps
            .pop_front()
            .unwrap_or_else(|| self.question.clone());

        let mut permitted = self.next_step;
        permitted.search &= self.frontier.len() < self.frontier_limit;
        permitted.visit &= !self.frontier.is_empty();
        permitted.reflect &= self.gaps.len() <= 1;

        self.next_step = ActionSet::all();
        (current, permitted)
    }

    /// Start the forced final step: it always addresses the original question
    pub fn begin_final_step(&mut self) {
        self.step += 1;
        self.total_step += 1;
        self.status = AgentStatus::BeastMode;
    }

    /// Suppress `kind` for the next step only
    pub fn suppress_next(&mut self, kind: ActionKind) {
        self.next_step.disable(kind);
    }

    pub fn next_step_actions(&self) -> ActionSet {
        self.next_step
    }

    pub fn note(&mut self, entry: impl Into<String>) {
        self.diary.push(entry.into());
    }

    pub fn add_knowledge(&mut self, item: KnowledgeItem) {
        self.knowledge.push(item);
    }

    /// Queue fresh sub-questions, then the original question behind them
    pub fn push_gaps(&mut self, questions: Vec<String>) {
        if questions.is_empty() {
            return;
        }
        self.all_questions.extend(questions.iter().cloned());
        self.gaps.extend(questions);
        self.gaps.push_back(self.question.clone());
    }

    pub fn record_keyword(&mut self, keyword: impl Into<String>) {
        self.keywords.push(keyword.into());
    }

    /// Add search hits to the frontier; returns how many URLs were new.
    /// Already-visited URLs never re-enter the frontier.
    pub fn merge_search_results(&mut self, results: &[SearchResult]) -> usize {
        let mut added = 0;
        for result in results {
            if result.url.is_empty() || self.visited.contains(&result.url) {
                continue;
            }
            if self
                .frontier
                .insert(result.url.clone(), result.title.clone())
                .is_none()
            {
                added += 1;
            }
        }
        added
    }

    pub fn is_visited(&self, url: &str) -> bool {
        self.visited.contains(url)
    }

    /// Move `url` from the frontier to the visited set
    pub fn mark_visited(&mut self, url: &str) {
        self.frontier.remove(url);
        self.visited.insert(url.to_string());
    }

    /// Close a failed attempt: keep the record, wipe the narrative, start the
    /// attempt counter over and keep `answer` off for the next step.
    pub fn record_bad_attempt(&mut self, attempt: BadAttempt) {
        self.bad_attempts.push(attempt);
        self.diary.clear();
        self.step = 0;
        self.suppress_next(ActionKind::Answer);
    }

    /// Whether any URL has ever been discovered
    pub fn has_seen_urls(&self) -> bool {
        !self.frontier.is_empty() || !self.visited.is_empty()
    }
}
