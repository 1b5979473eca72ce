//! Command implementations for the research CLI

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use llm_core::{Config, OllamaClient, OllamaStatus};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use deep_research::agent::{AgentLoop, AgentServices, RunOptions, RunOutcome};
use deep_research::analyzer::LlmFailureAnalyzer;
use deep_research::artifacts::{load_snapshot, save_snapshot, ArtifactStore};
use deep_research::dedup::{ExactDeduplicator, LlmDeduplicator, QueryDeduplicator};
use deep_research::evaluator::LlmEvaluator;
use deep_research::llm::{OllamaLlm, StructuredLlm};
use deep_research::oracle::LlmDecisionOracle;
use deep_research::tools::{
    DuckDuckGoSearch, LlmQueryRewriter, PassthroughRewriter, QueryRewriter, WebFetcher,
};
use deep_research::ResearchConfig;

// ANSI color codes
const GREEN: &str = "\x1b[92m";
const RED: &str = "\x1b[91m";
const YELLOW: &str = "\x1b[93m";
const BLUE: &str = "\x1b[94m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

fn print_status(ok: bool, msg: &str) {
    let icon = if ok {
        format!("{}✓{}", GREEN, RESET)
    } else {
        format!("{}✗{}", RED, RESET)
    };
    println!("  {} {}", icon, msg);
}

/// Options for `research ask`
#[derive(Debug, Default)]
pub struct AskArgs {
    pub budget: Option<u64>,
    pub max_bad_attempts: Option<usize>,
    pub model: Option<String>,
    pub json: bool,
    pub artifacts: Option<PathBuf>,
    pub resume: Option<PathBuf>,
}

/// Research a question end to end
pub async fn ask(question: &str, args: AskArgs) -> Result<()> {
    if question.trim().is_empty() {
        anyhow::bail!("No question provided. Usage: research ask <question>");
    }

    let llm_config = Config::load_or_default();
    let config = ResearchConfig::load().context("Failed to load research config")?;

    let client = OllamaClient::new(llm_config.ollama_url())?;
    if !client.health_check().await.unwrap_or(false) {
        anyhow::bail!(
            "Ollama is not running at {}. Start it with: ollama serve",
            llm_config.ollama_url()
        );
    }

    let llm: Arc<dyn StructuredLlm> = Arc::new(OllamaLlm::from_config(&llm_config, args.model)?);
    let web = config.web_context();

    let dedup: Arc<dyn QueryDeduplicator> = if config.agent.semantic_dedup {
        Arc::new(LlmDeduplicator::new(llm.clone()))
    } else {
        Arc::new(ExactDeduplicator)
    };
    let rewriter: Arc<dyn QueryRewriter> = if config.search.rewrite_queries {
        Arc::new(LlmQueryRewriter::new(llm.clone()))
    } else {
        Arc::new(PassthroughRewriter)
    };

    let services = AgentServices {
        oracle: Arc::new(LlmDecisionOracle::new(llm.clone())),
        evaluator: Arc::new(LlmEvaluator::new(llm.clone())),
        dedup,
        analyzer: Arc::new(LlmFailureAnalyzer::new(llm.clone())),
        rewriter,
        search: Arc::new(DuckDuckGoSearch::new(web.clone())?),
        fetcher: Arc::new(WebFetcher::new(web)?),
    };

    let mut agent = AgentLoop::new(services, config.loop_config());
    let artifact_dir = args.artifacts.or_else(|| {
        config
            .artifact_dir()
            .map(|dir| dir.join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string()))
    });
    let store = match artifact_dir {
        Some(dir) => Some(ArtifactStore::new(dir)?),
        None => None,
    };
    if let Some(store) = &store {
        agent = agent.with_artifacts(store.clone());
    }

    let mut options = RunOptions::default()
        .with_token_budget(args.budget.unwrap_or(config.agent.token_budget))
        .with_max_bad_attempts(args.max_bad_attempts.unwrap_or(config.agent.max_bad_attempts));
    if let Some(path) = &args.resume {
        options = options.with_context(load_snapshot(path)?);
    }

    let spinner = if args.json {
        None
    } else {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg} {elapsed}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.set_message("Researching...");
        spinner.enable_steady_tick(Duration::from_millis(100));
        Some(spinner)
    };

    let result = agent.run(question, options).await;
    if let Some(spinner) = &spinner {
        spinner.finish_and_clear();
    }
    let outcome = result?;

    if let Some(store) = &store {
        if let Err(e) = store.save_snapshot(&outcome.run) {
            warn!(error = %e, "Failed to save run snapshot");
        }
    }
    if let Some(path) = &args.resume {
        save_snapshot(path, &outcome.run)?;
    }

    if args.json {
        print_json(&outcome)
    } else {
        print_outcome(&outcome, store.as_ref());
        Ok(())
    }
}

fn print_json(outcome: &RunOutcome) -> Result<()> {
    let output = json!({
        "answer": outcome.answer(),
        "references": outcome.decision.references(),
        "status": outcome.status,
        "definitive": outcome.is_definitive(),
        "steps": outcome.research.total_step(),
        "bad_attempts": outcome.research.bad_attempt_count(),
        "usage": outcome.usage,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn print_outcome(outcome: &RunOutcome, store: Option<&ArtifactStore>) {
    println!("{}", outcome.answer());

    let references = outcome.decision.references();
    if !references.is_empty() {
        println!("\n{}References{}", BOLD, RESET);
        for (i, reference) in references.iter().enumerate() {
            println!("  [{}] {}", i + 1, reference.url);
            println!("      {}\"{}\"{}", DIM, reference.exact_quote, RESET);
        }
    }

    let color = if outcome.is_definitive() { GREEN } else { YELLOW };
    println!(
        "\n{}[{}{}{} after {} steps, {} rejected answers]{}",
        DIM,
        color,
        outcome.status,
        DIM,
        outcome.research.total_step(),
        outcome.research.bad_attempt_count(),
        RESET
    );
    println!("{}[{}]{}", DIM, outcome.usage.summary(), RESET);
    if let Some(store) = store {
        println!("{}[artifacts: {}]{}", DIM, store.dir().display(), RESET);
    }
}

/// Show endpoint, models and research settings
pub async fn status() -> Result<()> {
    let llm_config = Config::load_or_default();
    let client = OllamaClient::new(llm_config.ollama_url())?;

    println!("{}Ollama{}", BOLD, RESET);
    println!("  Endpoint: {}", llm_config.ollama_url());
    match Config::find_config_path() {
        Ok(path) => println!("  Config: {}", path.display()),
        Err(_) => println!("  Config: {}llm.toml not found, using defaults{}", YELLOW, RESET),
    }

    match client.status().await {
        OllamaStatus::Running => print_status(true, "Ollama is running"),
        OllamaStatus::Stopped => {
            print_status(false, "Ollama is not running");
            println!("\n  Start with: {}ollama serve{}", BLUE, RESET);
        }
    }

    println!("\n{}Models{}", BOLD, RESET);
    println!("  Default: {}", llm_config.models.default);
    if let Some(fallback) = &llm_config.models.fallback {
        println!("  Fallback: {}", fallback);
    }
    if let Ok(models) = client.list_models().await {
        let names: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
        print_status(
            names.contains(&llm_config.models.default.as_str()),
            &format!("{} models available", models.len()),
        );
    }
    if let Ok(running) = client.list_running().await {
        for m in running {
            let vram_gb = m.size_vram as f64 / (1024.0 * 1024.0 * 1024.0);
            println!("  - {} loaded (VRAM: {:.1} GB)", m.name, vram_gb);
        }
    }

    let config = ResearchConfig::load().context("Failed to load research config")?;
    println!("\n{}Research{}", BOLD, RESET);
    match ResearchConfig::config_path() {
        Ok(path) if path.exists() => println!("  Config: {}", path.display()),
        _ => println!("  Config: {}defaults (run `research config init`){}", DIM, RESET),
    }
    println!("  Token budget: {}", config.agent.token_budget);
    println!("  Max bad attempts: {}", config.agent.max_bad_attempts);
    println!("  Step delay: {}ms", config.agent.step_delay_ms);
    println!(
        "  Deduplication: {}",
        if config.agent.semantic_dedup { "model" } else { "exact" }
    );
    match config.artifact_dir() {
        Some(dir) => println!("  Artifacts: {}", dir.display()),
        None => println!("  Artifacts: off"),
    }

    Ok(())
}

/// Wait for Ollama to become ready
pub async fn health(timeout_secs: u64) -> Result<()> {
    let config = Config::load_or_default();
    let client = OllamaClient::new(config.ollama_url())?;

    let pb = ProgressBar::new(timeout_secs);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.cyan} Waiting for Ollama [{bar:30.cyan/dim}] {pos}/{len}s")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);
    let interval = Duration::from_secs(1);

    while start.elapsed() < timeout {
        pb.set_position(start.elapsed().as_secs());

        if client.health_check().await.unwrap_or(false) {
            pb.finish_and_clear();
            println!("{}✓{} Ollama is ready", GREEN, RESET);
            return Ok(());
        }
        tokio::time::sleep(interval).await;
    }

    pb.finish_and_clear();
    println!("{}✗{} Ollama did not become ready within {}s", RED, RESET, timeout_secs);
    anyhow::bail!("Ollama did not become ready within timeout")
}

/// Write a commented default config file
pub fn config_init() -> Result<()> {
    let path = ResearchConfig::create_default()?;
    println!("{}✓{} Created {}", GREEN, RESET, path.display());
    Ok(())
}
