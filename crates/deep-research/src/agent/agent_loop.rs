//! The research loop
//!
//! One oracle decision per step, fully resolved before the next is requested.
//! The loop stops when a definitive answer to the original question is
//! accepted, when the token budget runs out, or when too many final answers
//! were rejected. Without an accepted answer it ends with one forced,
//! answer-only step ("beast mode") whose decision is returned as-is.

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tracing::{debug, info, instrument, warn};

use super::action::{ActionKind, ActionSet, Decision};
use super::prompt::build_prompt;
use super::state::{
    AgentStatus, BadAttempt, KnowledgeItem, ResearchContext, DEFAULT_FRONTIER_LIMIT,
    DEFAULT_MAX_BAD_ATTEMPTS,
};
use super::tracker::{RunContext, TokenUsage, DEFAULT_TOKEN_BUDGET};
use crate::analyzer::FailureAnalyzer;
use crate::artifacts::ArtifactStore;
use crate::dedup::QueryDeduplicator;
use crate::error::{ResearchError, Result};
use crate::evaluator::AnswerEvaluator;
use crate::oracle::DecisionOracle;
use crate::tokenizer::count_tokens;
use crate::tools::{ContentFetcher, QueryRewriter, SearchProvider};

/// Usage bucket for fetched page content
pub const READ_TOOL: &str = "read";

/// Collaborators the loop dispatches to
#[derive(Clone)]
pub struct AgentServices {
    pub oracle: Arc<dyn DecisionOracle>,
    pub evaluator: Arc<dyn AnswerEvaluator>,
    pub dedup: Arc<dyn QueryDeduplicator>,
    pub analyzer: Arc<dyn FailureAnalyzer>,
    pub rewriter: Arc<dyn QueryRewriter>,
    pub search: Arc<dyn SearchProvider>,
    pub fetcher: Arc<dyn ContentFetcher>,
}

/// Loop tuning that does not change per run
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Pause between steps, to stay under upstream rate limits
    pub step_delay: Duration,
    /// Frontier size at which search is switched off
    pub frontier_limit: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_secs(1),
            frontier_limit: DEFAULT_FRONTIER_LIMIT,
        }
    }
}

impl LoopConfig {
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn with_frontier_limit(mut self, limit: usize) -> Self {
        self.frontier_limit = limit;
        self
    }
}

/// Per-run options
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub token_budget: u64,
    pub max_bad_attempts: usize,
    /// Budget usage and action history from an earlier run
    pub context: Option<RunContext>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            token_budget: DEFAULT_TOKEN_BUDGET,
            max_bad_attempts: DEFAULT_MAX_BAD_ATTEMPTS,
            context: None,
        }
    }
}

impl RunOptions {
    pub fn with_token_budget(mut self, budget: u64) -> Self {
        self.token_budget = budget;
        self
    }

    pub fn with_max_bad_attempts(mut self, max: usize) -> Self {
        self.max_bad_attempts = max;
        self
    }

    pub fn with_context(mut self, context: RunContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// Result of a finished run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// The final answer decision
    pub decision: Decision,
    /// How the run ended: answered, exhausted or beast mode
    pub status: AgentStatus,
    pub usage: TokenUsage,
    /// Budget and action history, reusable to resume
    pub run: RunContext,
    /// Final loop state
    pub research: ResearchContext,
}

impl RunOutcome {
    pub fn answer(&self) -> &str {
        self.decision.answer().unwrap_or_default()
    }

    /// Whether the answer passed evaluation
    pub fn is_definitive(&self) -> bool {
        self.status == AgentStatus::Answered
    }
}

/// What a single step left behind
#[derive(Debug)]
pub(crate) enum StepOutcome {
    Continue,
    /// The pre-flight budget check refused the oracle call
    OutOfBudget,
    /// An answer was accepted; the run is over
    Finished(Decision),
}

/// The research loop orchestrator
pub struct AgentLoop {
    services: AgentServices,
    config: LoopConfig,
    artifacts: Option<ArtifactStore>,
}

impl AgentLoop {
    pub fn new(services: AgentServices, config: LoopConfig) -> Self {
        Self {
            services,
            config,
            artifacts: None,
        }
    }

    /// Write prompts and state snapshots after every step
    pub fn with_artifacts(mut self, store: ArtifactStore) -> Self {
        self.artifacts = Some(store);
        self
    }

    /// Research `question` until it is answered or the run gives up
    #[instrument(skip(self, options), fields(budget = options.token_budget, max_bad_attempts = options.max_bad_attempts))]
    pub async fn run(&self, question: &str, options: RunOptions) -> Result<RunOutcome> {
        let question = question.trim();
        if question.is_empty() {
            return Err(ResearchError::EmptyQuestion);
        }
        if options.token_budget == 0 {
            return Err(ResearchError::Config(
                "token budget must be greater than zero".to_string(),
            ));
        }

        let mut run = match options.context {
            Some(context) => context.with_budget(options.token_budget),
            None => RunContext::new(options.token_budget),
        };
        let mut ctx =
            ResearchContext::new(question).with_frontier_limit(self.config.frontier_limit);

        info!(
            used = run.tokens.total_usage(),
            resumed_steps = run.actions.len(),
            "Starting research"
        );

        let mut accepted = None;
        while !run.tokens.is_exhausted() && ctx.bad_attempt_count() <= options.max_bad_attempts {
            match self
                .step(&mut ctx, &mut run, options.max_bad_attempts)
                .await?
            {
                StepOutcome::Continue => {}
                StepOutcome::OutOfBudget => break,
                StepOutcome::Finished(decision) => {
                    accepted = Some(decision);
                    break;
                }
            }

            if !self.config.step_delay.is_zero() {
                tokio::time::sleep(self.config.step_delay).await;
            }
        }

        if accepted.is_none() && ctx.bad_attempt_count() > options.max_bad_attempts {
            ctx.set_status(AgentStatus::Exhausted);
        }
        let (decision, status) = match accepted {
            Some(decision) => (decision, ctx.status()),
            None => (self.beast_mode(&mut ctx, &mut run).await?, AgentStatus::BeastMode),
        };
        ctx.set_status(AgentStatus::Done);

        let usage = run.tokens.snapshot();
        info!(
            status = %status,
            steps = ctx.total_step(),
            bad_attempts = ctx.bad_attempt_count(),
            tokens = usage.total,
            "Research finished"
        );

        Ok(RunOutcome {
            decision,
            status,
            usage,
            run,
            research: ctx,
        })
    }

    /// One iteration: pick the question, ask the oracle, apply the decision
    pub(crate) async fn step(
        &self,
        ctx: &mut ResearchContext,
        run: &mut RunContext,
        max_bad_attempts: usize,
    ) -> Result<StepOutcome> {
        let (current, permitted) = ctx.begin_step();
        let prompt = build_prompt(ctx, &current, &permitted, false);
        debug!(
            step = ctx.step(),
            total_step = ctx.total_step(),
            question = %current,
            gaps = ctx.gaps().len(),
            frontier = ctx.frontier().len(),
            permitted = ?permitted.permitted(),
            "Starting step"
        );

        if let Err(err) = run.tokens.reserve(count_tokens(&prompt)) {
            warn!(error = %err, "Stopping before the next decision");
            return Ok(StepOutcome::OutOfBudget);
        }

        let decision = self
            .services
            .oracle
            .decide(&prompt, &permitted, &run.tokens)
            .await?;
        run.actions.record(ctx.total_step(), &current, &decision);

        let outcome = self
            .dispatch(ctx, run, &current, decision, max_bad_attempts)
            .await?;
        self.write_artifacts(ctx, run, &prompt);
        Ok(outcome)
    }

    async fn dispatch(
        &self,
        ctx: &mut ResearchContext,
        run: &RunContext,
        current: &str,
        decision: Decision,
        max_bad_attempts: usize,
    ) -> Result<StepOutcome> {
        debug!(action = %decision.kind(), thoughts = %decision.thoughts(), "Dispatching decision");
        match decision {
            Decision::Answer { .. } => {
                return self
                    .handle_answer(ctx, run, current, decision, max_bad_attempts)
                    .await;
            }
            Decision::Reflect {
                thoughts,
                questions_to_answer,
            } => {
                self.handle_reflect(ctx, run, &thoughts, &questions_to_answer)
                    .await?
            }
            Decision::Search {
                thoughts,
                search_query,
            } => self.handle_search(ctx, run, &thoughts, &search_query).await?,
            Decision::Visit {
                thoughts,
                url_targets,
            } => self.handle_visit(ctx, run, &thoughts, &url_targets).await?,
        }
        Ok(StepOutcome::Continue)
    }

    async fn handle_answer(
        &self,
        ctx: &mut ResearchContext,
        run: &RunContext,
        current: &str,
        decision: Decision,
        max_bad_attempts: usize,
    ) -> Result<StepOutcome> {
        let step = ctx.step();
        let answer = decision.answer().unwrap_or_default().to_string();
        let answer = answer.as_str();

        if !ctx.is_original(current) {
            let evaluation = self
                .services
                .evaluator
                .evaluate(current, answer, &run.tokens)
                .await?;
            if evaluation.is_definitive {
                ctx.add_knowledge(KnowledgeItem::qa(current, answer));
                ctx.note(format!(
                    "At step {}, you took the **answer** action. You found a good answer to the sub-question:\n\nSub-question: {}\n\nAnswer: {}\n\nThe evaluator accepted it, so it was saved to your knowledge.",
                    step, current, answer
                ));
                info!(question = %current, "Sub-question resolved");
            } else {
                ctx.note(format!(
                    "At step {}, you took the **answer** action on the sub-question \"{}\" but the answer was not definitive, so it was discarded.",
                    step, current
                ));
                debug!(question = %current, reason = %evaluation.reasoning, "Discarded sub-answer");
            }
            return Ok(StepOutcome::Continue);
        }

        if ctx.bad_attempt_count() > max_bad_attempts {
            warn!(
                bad_attempts = ctx.bad_attempt_count(),
                "Bad-attempt ceiling exceeded, accepting answer as last resort"
            );
            ctx.note(format!(
                "At step {}, you took the **answer** action. Retries are exhausted, so this answer was accepted as the best available.",
                step
            ));
            ctx.set_status(AgentStatus::Exhausted);
            return Ok(StepOutcome::Finished(decision));
        }

        let evaluation = self
            .services
            .evaluator
            .evaluate(current, answer, &run.tokens)
            .await?;

        if evaluation.is_definitive {
            if decision.references().is_empty() && ctx.has_seen_urls() {
                warn!("Accepted answer carries no references");
                ctx.note(format!(
                    "At step {}, you took the **answer** action and the evaluator accepted it, but it cites no references.",
                    step
                ));
            } else {
                ctx.note(format!(
                    "At step {}, you took the **answer** action and the evaluator accepted it.",
                    step
                ));
            }
            info!(total_step = ctx.total_step(), "Original question answered");
            ctx.set_status(AgentStatus::Answered);
            return Ok(StepOutcome::Finished(decision));
        }

        ctx.note(format!(
            "At step {}, you took the **answer** action but the evaluator thinks it is not a good answer:\n\nOriginal question: {}\n\nYour answer: {}\n\nThe evaluator rejected it because: {}",
            step, current, answer, evaluation.reasoning
        ));
        let analysis = self
            .services
            .analyzer
            .analyze(ctx.diary(), &run.tokens)
            .await?;
        ctx.record_bad_attempt(BadAttempt {
            question: current.to_string(),
            answer: answer.to_string(),
            evaluation: evaluation.reasoning,
            recap: analysis.recap,
            blame: analysis.blame,
            improvement: analysis.improvement,
        });
        warn!(
            bad_attempts = ctx.bad_attempt_count(),
            max_bad_attempts, "Answer rejected"
        );
        Ok(StepOutcome::Continue)
    }

    async fn handle_reflect(
        &self,
        ctx: &mut ResearchContext,
        run: &RunContext,
        thoughts: &str,
        proposed: &[String],
    ) -> Result<()> {
        let step = ctx.step();
        let novel = self
            .services
            .dedup
            .dedup(proposed, ctx.all_questions(), &run.tokens)
            .await?;

        if novel.is_empty() {
            ctx.note(format!(
                "At step {}, you took the **reflect** action and thought about the knowledge gaps, but every sub-question you came up with had already been asked. No new angle was found, so reflecting is off for the next step.",
                step
            ));
            ctx.suppress_next(ActionKind::Reflect);
            debug!(proposed = proposed.len(), "Reflect produced no new questions");
            return Ok(());
        }

        ctx.note(format!(
            "At step {}, you took the **reflect** action. You reasoned: {}\n\nThese sub-questions need answers first:\n{}",
            step,
            thoughts,
            bullet_list(&novel)
        ));
        info!(questions = ?novel, "Queued sub-questions");
        ctx.push_gaps(novel);
        Ok(())
    }

    async fn handle_search(
        &self,
        ctx: &mut ResearchContext,
        run: &RunContext,
        thoughts: &str,
        search_query: &str,
    ) -> Result<()> {
        let step = ctx.step();
        let candidates = self
            .services
            .rewriter
            .rewrite(search_query, thoughts, &run.tokens)
            .await?;
        let keywords = self
            .services
            .dedup
            .dedup(&candidates, ctx.keywords(), &run.tokens)
            .await?;

        if keywords.is_empty() {
            ctx.note(format!(
                "At step {}, you took the **search** action for \"{}\", but every keyword had been searched before. Searching is off for the next step.",
                step, search_query
            ));
            ctx.suppress_next(ActionKind::Search);
            debug!(query = %search_query, "All keywords already used");
            return Ok(());
        }

        let mut found = 0;
        for keyword in &keywords {
            let results = self.services.search.search(keyword).await.map_err(|error| {
                ResearchError::Search {
                    keyword: keyword.clone(),
                    error,
                }
            })?;
            found += ctx.merge_search_results(&results);
            ctx.record_keyword(keyword.clone());
            debug!(keyword = %keyword, hits = results.len(), "Search returned");
        }

        ctx.note(format!(
            "At step {}, you took the **search** action with these keywords:\n{}\n\nYou found {} new URLs and added them to your URL list for later visits.",
            step,
            bullet_list(&keywords),
            found
        ));
        info!(keywords = keywords.len(), new_urls = found, frontier = ctx.frontier().len(), "Search step done");
        Ok(())
    }

    async fn handle_visit(
        &self,
        ctx: &mut ResearchContext,
        run: &RunContext,
        thoughts: &str,
        requested: &[String],
    ) -> Result<()> {
        let step = ctx.step();
        let mut targets: Vec<String> = Vec::new();
        for url in requested {
            let url = url.trim();
            if !ctx.is_visited(url) && !targets.iter().any(|t| t == url) {
                targets.push(url.to_string());
            }
        }

        if targets.is_empty() {
            ctx.note(format!(
                "At step {}, you took the **visit** action, but every requested URL had already been read. Visiting is off for the next step.",
                step
            ));
            ctx.suppress_next(ActionKind::Visit);
            debug!(requested = requested.len(), "All URLs already visited");
            return Ok(());
        }

        let fetcher = &self.services.fetcher;
        let pages = try_join_all(targets.iter().map(|url| async move {
            fetcher
                .fetch(url)
                .await
                .map_err(|error| ResearchError::Fetch {
                    url: url.clone(),
                    error,
                })
        }))
        .await?;

        for (url, page) in targets.iter().zip(pages) {
            run.tokens.record(READ_TOOL, page.tokens);
            ctx.add_knowledge(KnowledgeItem::url(url, page.content));
            ctx.mark_visited(url);
        }

        ctx.note(format!(
            "At step {}, you took the **visit** action because: {}\n\nYou read these URLs and saved their content to your knowledge:\n{}",
            step,
            thoughts,
            bullet_list(&targets)
        ));
        info!(urls = targets.len(), knowledge = ctx.knowledge().len(), "Visit step done");
        Ok(())
    }

    /// The forced final step: answer only, no budget guard, no evaluation
    async fn beast_mode(&self, ctx: &mut ResearchContext, run: &mut RunContext) -> Result<Decision> {
        ctx.begin_final_step();
        warn!(
            used = run.tokens.total_usage(),
            budget = run.tokens.budget(),
            bad_attempts = ctx.bad_attempt_count(),
            "No accepted answer, entering beast mode"
        );

        let permitted = ActionSet::answer_only();
        let question = ctx.question().to_string();
        let prompt = build_prompt(ctx, &question, &permitted, true);
        let decision = self
            .services
            .oracle
            .decide(&prompt, &permitted, &run.tokens)
            .await?;
        run.actions.record(ctx.total_step(), &question, &decision);
        self.write_artifacts(ctx, run, &prompt);
        Ok(decision)
    }

    fn write_artifacts(&self, ctx: &ResearchContext, run: &RunContext, prompt: &str) {
        if let Some(store) = &self.artifacts {
            if let Err(e) = store.write_step(ctx.total_step(), prompt, run, ctx) {
                warn!(error = %e, dir = %store.dir().display(), "Failed to write research artifacts");
            }
        }
    }
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::agent::{Reference, TokenTracker};
    use crate::analyzer::FailureAnalysis;
    use crate::dedup::ExactDeduplicator;
    use crate::evaluator::Evaluation;
    use crate::tools::{FetchedPage, PassthroughRewriter, SearchResult};

    /// Plays back decisions in order, then keeps answering
    struct ScriptedOracle {
        script: Mutex<VecDeque<Decision>>,
        permitted: Mutex<Vec<ActionSet>>,
        cost: u64,
    }

    impl ScriptedOracle {
        fn new(script: Vec<Decision>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                permitted: Mutex::new(Vec::new()),
                cost: 10,
            }
        }

        fn with_cost(mut self, cost: u64) -> Self {
            self.cost = cost;
            self
        }

        fn calls(&self) -> usize {
            self.permitted.lock().len()
        }

        fn permitted(&self, call: usize) -> ActionSet {
            self.permitted.lock()[call]
        }
    }

    #[async_trait]
    impl DecisionOracle for ScriptedOracle {
        async fn decide(
            &self,
            _prompt: &str,
            permitted: &ActionSet,
            tracker: &TokenTracker,
        ) -> Result<Decision> {
            self.permitted.lock().push(*permitted);
            tracker.record("agent", self.cost);
            let decision = self
                .script
                .lock()
                .pop_front()
                .unwrap_or_else(|| answer("best guess"));
            decision.validate(permitted)
        }
    }

    /// Verdicts in order, then `fallback`
    struct ScriptedEvaluator {
        verdicts: Mutex<VecDeque<bool>>,
        fallback: bool,
        calls: AtomicUsize,
    }

    impl ScriptedEvaluator {
        fn new(verdicts: Vec<bool>, fallback: bool) -> Self {
            Self {
                verdicts: Mutex::new(verdicts.into()),
                fallback,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AnswerEvaluator for ScriptedEvaluator {
        async fn evaluate(
            &self,
            _question: &str,
            _answer: &str,
            _tracker: &TokenTracker,
        ) -> Result<Evaluation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let is_definitive = self.verdicts.lock().pop_front().unwrap_or(self.fallback);
            Ok(Evaluation {
                is_definitive,
                reasoning: (if is_definitive { "clear" } else { "too vague" }).to_string(),
            })
        }
    }

    struct FixedAnalyzer;

    #[async_trait]
    impl FailureAnalyzer for FixedAnalyzer {
        async fn analyze(&self, diary: &[String], _tracker: &TokenTracker) -> Result<FailureAnalysis> {
            Ok(FailureAnalysis {
                recap: format!("{} actions", diary.len()),
                blame: "answered too early".to_string(),
                improvement: "read a primary source first".to_string(),
            })
        }
    }

    struct FixedRewriter(Vec<String>);

    #[async_trait]
    impl QueryRewriter for FixedRewriter {
        async fn rewrite(
            &self,
            _search_query: &str,
            _thoughts: &str,
            _tracker: &TokenTracker,
        ) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct MapSearch {
        results: HashMap<String, Vec<SearchResult>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SearchProvider for MapSearch {
        async fn search(&self, keyword: &str) -> anyhow::Result<Vec<SearchResult>> {
            self.calls.lock().push(keyword.to_string());
            Ok(self.results.get(keyword).cloned().unwrap_or_default())
        }
    }

    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl ContentFetcher for CountingFetcher {
        async fn fetch(&self, url: &str) -> anyhow::Result<FetchedPage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.as_deref() == Some(url) {
                return Err(anyhow!("connection reset"));
            }
            Ok(FetchedPage {
                url: url.to_string(),
                title: String::new(),
                content: format!("content of {}", url),
                tokens: 7,
            })
        }
    }

    fn answer(text: &str) -> Decision {
        Decision::Answer {
            thoughts: "done".to_string(),
            answer: text.to_string(),
            references: Vec::new(),
        }
    }

    fn search(query: &str) -> Decision {
        Decision::Search {
            thoughts: "need sources".to_string(),
            search_query: query.to_string(),
        }
    }

    fn reflect(questions: &[&str]) -> Decision {
        Decision::Reflect {
            thoughts: "gaps".to_string(),
            questions_to_answer: questions.iter().map(|q| q.to_string()).collect(),
        }
    }

    fn visit(urls: &[&str]) -> Decision {
        Decision::Visit {
            thoughts: "read".to_string(),
            url_targets: urls.iter().map(|u| u.to_string()).collect(),
        }
    }

    fn hit(url: &str) -> SearchResult {
        SearchResult {
            title: format!("title {}", url),
            url: url.to_string(),
            description: String::new(),
        }
    }

    struct Harness {
        oracle: Arc<ScriptedOracle>,
        evaluator: Arc<ScriptedEvaluator>,
        search: Arc<MapSearch>,
        fetcher: Arc<CountingFetcher>,
        rewriter: Arc<dyn QueryRewriter>,
    }

    impl Harness {
        fn new(script: Vec<Decision>, verdicts: Vec<bool>, fallback: bool) -> Self {
            Self {
                oracle: Arc::new(ScriptedOracle::new(script)),
                evaluator: Arc::new(ScriptedEvaluator::new(verdicts, fallback)),
                search: Arc::new(MapSearch::default()),
                fetcher: Arc::new(CountingFetcher::default()),
                rewriter: Arc::new(PassthroughRewriter),
            }
        }

        fn agent(&self) -> AgentLoop {
            let services = AgentServices {
                oracle: self.oracle.clone(),
                evaluator: self.evaluator.clone(),
                dedup: Arc::new(ExactDeduplicator),
                analyzer: Arc::new(FixedAnalyzer),
                rewriter: self.rewriter.clone(),
                search: self.search.clone(),
                fetcher: self.fetcher.clone(),
            };
            AgentLoop::new(
                services,
                LoopConfig::default().with_step_delay(Duration::ZERO),
            )
        }
    }

    #[tokio::test]
    async fn test_definitive_answer_stops_the_loop() {
        let harness = Harness::new(vec![answer("Frank Herbert")], vec![true], true);
        let outcome = harness
            .agent()
            .run("Who wrote Dune?", RunOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.status, AgentStatus::Answered);
        assert!(outcome.is_definitive());
        assert_eq!(outcome.answer(), "Frank Herbert");
        assert_eq!(harness.oracle.calls(), 1, "no oracle calls after answered");
        assert_eq!(outcome.run.actions.len(), 1);
        assert_eq!(outcome.research.status(), AgentStatus::Done);
    }

    #[tokio::test]
    async fn test_empty_question_rejected() {
        let harness = Harness::new(vec![], vec![], true);
        let err = harness
            .agent()
            .run("   ", RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ResearchError::EmptyQuestion));
        assert_eq!(harness.oracle.calls(), 0);
    }

    #[tokio::test]
    async fn test_zero_budget_rejected() {
        let harness = Harness::new(vec![], vec![], true);
        let err = harness
            .agent()
            .run("Q?", RunOptions::default().with_token_budget(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ResearchError::Config(_)));
    }

    #[tokio::test]
    async fn test_first_bad_answer_starts_a_new_attempt() {
        let harness = Harness::new(
            vec![answer("meh"), search("dune author"), answer("Frank Herbert")],
            vec![false, true],
            true,
        );
        let outcome = harness
            .agent()
            .run("Who wrote Dune?", RunOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.status, AgentStatus::Answered);
        assert_eq!(outcome.research.bad_attempt_count(), 1);
        let attempt = &outcome.research.bad_attempts()[0];
        assert_eq!(attempt.answer, "meh");
        assert_eq!(attempt.blame, "answered too early");

        assert!(!harness.oracle.permitted(1).answer, "answer off right after a bad attempt");
        assert!(harness.oracle.permitted(2).answer, "answer back on the step after");

        assert!(outcome.research.diary().iter().all(|e| !e.contains("meh")));
        assert_eq!(outcome.research.step(), 2);
        assert_eq!(outcome.research.total_step(), 3);
    }

    #[tokio::test]
    async fn test_answer_after_last_allowed_rejection_is_evaluated() {
        let harness = Harness::new(
            vec![answer("first"), search("more"), answer("second")],
            vec![false, true],
            false,
        );
        let outcome = harness
            .agent()
            .run("Q?", RunOptions::default().with_max_bad_attempts(1))
            .await
            .unwrap();

        assert_eq!(outcome.status, AgentStatus::Answered);
        assert!(outcome.is_definitive());
        assert_eq!(outcome.answer(), "second");
        assert_eq!(outcome.research.bad_attempt_count(), 1);
        assert_eq!(harness.evaluator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_ceiling_still_evaluates_first_answer() {
        let harness = Harness::new(vec![answer("Frank Herbert")], vec![true], false);
        let outcome = harness
            .agent()
            .run("Who wrote Dune?", RunOptions::default().with_max_bad_attempts(0))
            .await
            .unwrap();

        assert_eq!(outcome.status, AgentStatus::Answered);
        assert!(outcome.is_definitive());
        assert_eq!(harness.evaluator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_step_past_ceiling_accepts_last_resort() {
        let harness = Harness::new(
            vec![answer("first"), search("more"), answer("second")],
            vec![],
            false,
        );
        let agent = harness.agent();
        let mut run = RunContext::new(DEFAULT_TOKEN_BUDGET);
        let mut ctx = ResearchContext::new("Q?");

        // With a ceiling of 0 the first rejection already exceeds it
        agent.step(&mut ctx, &mut run, 0).await.unwrap();
        agent.step(&mut ctx, &mut run, 0).await.unwrap();
        assert_eq!(ctx.bad_attempt_count(), 1);

        let outcome = agent.step(&mut ctx, &mut run, 0).await.unwrap();
        match outcome {
            StepOutcome::Finished(decision) => assert_eq!(decision.answer(), Some("second")),
            other => panic!("expected last-resort answer, got {:?}", other),
        }
        assert_eq!(ctx.status(), AgentStatus::Exhausted);
        assert_eq!(harness.evaluator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bad_attempts_stop_at_ceiling_plus_one() {
        let mut script: Vec<Decision> = (0..4)
            .flat_map(|i| vec![answer(&format!("guess {}", i)), search(&format!("kw {}", i))])
            .collect();
        script.pop();
        let harness = Harness::new(script, vec![], false);
        let outcome = harness
            .agent()
            .run("Q?", RunOptions::default().with_max_bad_attempts(3))
            .await
            .unwrap();

        assert_eq!(outcome.research.bad_attempt_count(), 4);
        assert_eq!(harness.evaluator.calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.status, AgentStatus::BeastMode);
        assert_eq!(outcome.answer(), "best guess");
        assert!(
            harness.oracle.permitted(harness.oracle.calls() - 1) == ActionSet::answer_only(),
            "ceiling exit hands over to the answer-only final step"
        );
    }

    #[tokio::test]
    async fn test_accepted_answer_without_references_is_noted() {
        let harness = Harness::new(vec![answer("Frank Herbert")], vec![true], true);
        let agent = harness.agent();
        let mut run = RunContext::new(DEFAULT_TOKEN_BUDGET);
        let mut ctx = ResearchContext::new("Who wrote Dune?");
        ctx.merge_search_results(&[hit("https://dune.example/author")]);

        let outcome = agent.step(&mut ctx, &mut run, 3).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Finished(_)));
        assert_eq!(ctx.status(), AgentStatus::Answered);
        assert!(ctx
            .diary()
            .last()
            .unwrap()
            .contains("cites no references"));
    }

    #[tokio::test]
    async fn test_failed_artifact_write_does_not_stop_the_run() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = temp.path().join("run");
        let store = ArtifactStore::new(&dir).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
        std::fs::write(&dir, "not a directory").unwrap();

        let harness = Harness::new(
            vec![search("dune author"), answer("Frank Herbert")],
            vec![true],
            true,
        );
        let outcome = harness
            .agent()
            .with_artifacts(store)
            .run("Who wrote Dune?", RunOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.status, AgentStatus::Answered);
        assert_eq!(harness.oracle.calls(), 2);
        assert!(dir.is_file());
    }

    #[tokio::test]
    async fn test_sub_question_answers() {
        let harness = Harness::new(vec![answer("1965"), answer("nope")], vec![true, false], true);
        let agent = harness.agent();
        let mut run = RunContext::new(DEFAULT_TOKEN_BUDGET);
        let mut ctx = ResearchContext::new("Who wrote Dune?");
        ctx.push_gaps(vec!["When was Dune published?".to_string(), "Who edited it?".to_string()]);

        let outcome = agent.step(&mut ctx, &mut run, 3).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Continue));
        assert_eq!(ctx.knowledge().len(), 1);
        assert_eq!(ctx.knowledge()[0].question, "When was Dune published?");

        let outcome = agent.step(&mut ctx, &mut run, 3).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Continue));
        assert_eq!(ctx.knowledge().len(), 1, "non-definitive sub-answer is discarded");
        assert_eq!(ctx.bad_attempt_count(), 0);
        assert!(ctx.next_step_actions().answer);
    }

    #[tokio::test]
    async fn test_reflect_queues_new_questions_and_original() {
        let harness = Harness::new(vec![reflect(&["When?", "Where?"])], vec![], true);
        let agent = harness.agent();
        let mut run = RunContext::new(DEFAULT_TOKEN_BUDGET);
        let mut ctx = ResearchContext::new("Q?");

        agent.step(&mut ctx, &mut run, 3).await.unwrap();
        assert_eq!(
            ctx.gaps().iter().collect::<Vec<_>>(),
            vec!["When?", "Where?", "Q?"]
        );
        assert_eq!(ctx.all_questions(), &["Q?", "When?", "Where?"]);
    }

    #[tokio::test]
    async fn test_reflect_with_only_duplicates() {
        let harness = Harness::new(
            vec![
                answer("soon"),
                reflect(&["When?", "where?"]),
                search("anything"),
                search("something else"),
            ],
            vec![true],
            true,
        );
        let agent = harness.agent();
        let mut run = RunContext::new(DEFAULT_TOKEN_BUDGET);
        let mut ctx = ResearchContext::new("Q?");
        ctx.push_gaps(vec!["When?".to_string(), "Where?".to_string()]);

        // Resolve "When?", then reflect on "Where?" with one gap left
        agent.step(&mut ctx, &mut run, 3).await.unwrap();
        agent.step(&mut ctx, &mut run, 3).await.unwrap();
        assert_eq!(ctx.gaps().iter().collect::<Vec<_>>(), vec!["Q?"]);
        assert_eq!(ctx.all_questions().len(), 3);

        agent.step(&mut ctx, &mut run, 3).await.unwrap();
        agent.step(&mut ctx, &mut run, 3).await.unwrap();
        assert!(harness.oracle.permitted(1).reflect);
        assert!(!harness.oracle.permitted(2).reflect, "reflect off for one step");
        assert!(harness.oracle.permitted(3).reflect);
    }

    #[tokio::test]
    async fn test_search_skips_used_keywords() {
        let mut harness = Harness::new(vec![search("rust async runtimes")], vec![], true);
        harness.rewriter = Arc::new(FixedRewriter(vec![
            "rust async".to_string(),
            "tokio runtime".to_string(),
            "async-std".to_string(),
        ]));
        harness.search = Arc::new(MapSearch {
            results: HashMap::from([
                (
                    "tokio runtime".to_string(),
                    vec![hit("https://tokio.rs"), hit("https://docs.rs/tokio")],
                ),
                (
                    "async-std".to_string(),
                    vec![hit("https://docs.rs/tokio"), hit("https://async.rs")],
                ),
            ]),
            calls: Mutex::new(Vec::new()),
        });
        let agent = harness.agent();
        let mut run = RunContext::new(DEFAULT_TOKEN_BUDGET);
        let mut ctx = ResearchContext::new("Q?");
        ctx.record_keyword("Rust async");

        agent.step(&mut ctx, &mut run, 3).await.unwrap();

        assert_eq!(
            *harness.search.calls.lock(),
            vec!["tokio runtime".to_string(), "async-std".to_string()]
        );
        assert_eq!(ctx.frontier().len(), 3);
        assert_eq!(ctx.keywords().len(), 3);
        assert!(ctx.next_step_actions().search);
    }

    #[tokio::test]
    async fn test_search_with_no_new_keywords_disables_search() {
        let harness = Harness::new(vec![search("tokio")], vec![], true);
        let agent = harness.agent();
        let mut run = RunContext::new(DEFAULT_TOKEN_BUDGET);
        let mut ctx = ResearchContext::new("Q?");
        ctx.record_keyword("tokio");

        agent.step(&mut ctx, &mut run, 3).await.unwrap();

        assert!(harness.search.calls.lock().is_empty());
        assert!(!ctx.next_step_actions().search);
    }

    #[tokio::test]
    async fn test_visit_reads_pages_concurrently() {
        let harness = Harness::new(vec![visit(&["https://a", "https://b"])], vec![], true);
        let agent = harness.agent();
        let mut run = RunContext::new(DEFAULT_TOKEN_BUDGET);
        let mut ctx = ResearchContext::new("Q?");
        ctx.merge_search_results(&[hit("https://a"), hit("https://b"), hit("https://c")]);

        agent.step(&mut ctx, &mut run, 3).await.unwrap();

        assert_eq!(harness.fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.knowledge().len(), 2);
        assert_eq!(ctx.knowledge()[0].question, "What is in https://a?");
        assert_eq!(ctx.frontier().keys().collect::<Vec<_>>(), vec!["https://c"]);
        assert!(ctx.frontier().keys().all(|u| !ctx.visited().contains(u)));
        assert_eq!(run.tokens.snapshot().by_tool[READ_TOOL], 14);
    }

    #[tokio::test]
    async fn test_visit_of_visited_urls_is_a_no_op() {
        let harness = Harness::new(vec![visit(&["https://a", "https://b"])], vec![], true);
        let agent = harness.agent();
        let mut run = RunContext::new(DEFAULT_TOKEN_BUDGET);
        let mut ctx = ResearchContext::new("Q?");
        ctx.merge_search_results(&[hit("https://a"), hit("https://b"), hit("https://c")]);
        ctx.mark_visited("https://a");
        ctx.mark_visited("https://b");

        agent.step(&mut ctx, &mut run, 3).await.unwrap();

        assert_eq!(harness.fetcher.calls.load(Ordering::SeqCst), 0);
        assert!(ctx.knowledge().is_empty());
        assert!(!ctx.next_step_actions().visit);
    }

    #[tokio::test]
    async fn test_failed_fetch_fails_the_step() {
        let mut harness = Harness::new(vec![visit(&["https://a", "https://b"])], vec![], true);
        harness.fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            fail_on: Some("https://b".to_string()),
        });
        let agent = harness.agent();
        let mut run = RunContext::new(DEFAULT_TOKEN_BUDGET);
        let mut ctx = ResearchContext::new("Q?");
        ctx.merge_search_results(&[hit("https://a"), hit("https://b")]);

        let err = agent.step(&mut ctx, &mut run, 3).await.unwrap_err();
        assert!(matches!(err, ResearchError::Fetch { ref url, .. } if url == "https://b"));
        assert!(ctx.knowledge().is_empty());
        assert!(ctx.visited().is_empty());
    }

    #[tokio::test]
    async fn test_budget_exhaustion_enters_beast_mode() {
        let harness = Harness::new(vec![], vec![], true);
        let outcome = harness
            .agent()
            .run("Q?", RunOptions::default().with_token_budget(50))
            .await
            .unwrap();

        assert_eq!(outcome.status, AgentStatus::BeastMode);
        assert!(!outcome.answer().is_empty());
        assert_eq!(harness.oracle.calls(), 1, "only the forced final call");
        assert_eq!(harness.oracle.permitted(0), ActionSet::answer_only());
        assert!(outcome.usage.total <= 50);
    }

    #[tokio::test]
    async fn test_spent_budget_ends_loop_after_step() {
        let mut harness = Harness::new(vec![], vec![], true);
        harness.oracle = Arc::new(ScriptedOracle::new(vec![search("x")]).with_cost(5_000));
        let outcome = harness
            .agent()
            .run("Q?", RunOptions::default().with_token_budget(5_000))
            .await
            .unwrap();

        assert_eq!(outcome.status, AgentStatus::BeastMode);
        assert_eq!(harness.oracle.calls(), 2, "one search step, then the forced answer");
        assert_eq!(outcome.answer(), "best guess");
        assert_eq!(outcome.research.total_step(), 2);
    }

    #[tokio::test]
    async fn test_resume_keeps_prior_usage() {
        let harness = Harness::new(vec![answer("42")], vec![true], true);
        let prior = RunContext::new(1_000);
        prior.tokens.record("agent", 300);

        let outcome = harness
            .agent()
            .run("Q?", RunOptions::default().with_token_budget(10_000).with_context(prior))
            .await
            .unwrap();

        assert_eq!(outcome.run.tokens.budget(), 10_000);
        assert_eq!(outcome.usage.total, 310);
    }

    #[tokio::test]
    async fn test_artifacts_written_per_step() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = ArtifactStore::new(temp.path()).unwrap();
        let harness = Harness::new(vec![search("x"), answer("done")], vec![true], true);
        let agent = harness.agent().with_artifacts(store.clone());

        agent.run("Q?", RunOptions::default()).await.unwrap();

        assert!(store.prompt_path(1).exists());
        assert!(store.prompt_path(2).exists());
        assert!(store.dir().join("queries.json").exists());
    }

    #[tokio::test]
    async fn test_answer_with_references() {
        let decision = Decision::Answer {
            thoughts: "cite".to_string(),
            answer: "Frank Herbert".to_string(),
            references: vec![Reference {
                exact_quote: "Dune is a 1965 novel by Frank Herbert".to_string(),
                url: "https://a".to_string(),
            }],
        };
        let harness = Harness::new(vec![decision], vec![true], true);
        let agent = harness.agent();
        let mut run = RunContext::new(DEFAULT_TOKEN_BUDGET);
        let mut ctx = ResearchContext::new("Who wrote Dune?");
        ctx.merge_search_results(&[hit("https://a")]);

        let outcome = agent.step(&mut ctx, &mut run, 3).await.unwrap();
        let StepOutcome::Finished(decision) = outcome else {
            panic!("expected the answer to be accepted");
        };
        assert_eq!(decision.references().len(), 1);
        assert_eq!(ctx.status(), AgentStatus::Answered);
        assert!(ctx.diary().last().unwrap().ends_with("accepted it."));
    }
}
