//! research: iterative web research with a local LLM
//!
//! Searches, reads and reflects until an answer passes evaluation.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "research")]
#[command(about = "Iterative research agent for local LLMs", version)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Research a question
    Ask {
        /// The question to research
        question: Vec<String>,

        /// Token budget for the whole run
        #[arg(short, long)]
        budget: Option<u64>,

        /// Rejected final answers tolerated before giving up
        #[arg(long)]
        max_bad_attempts: Option<usize>,

        /// Model to use (overrides llm.toml)
        #[arg(short, long, env = "RESEARCH_MODEL")]
        model: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Write per-step prompts and state snapshots to this directory
        #[arg(long)]
        artifacts: Option<PathBuf>,

        /// Resume budget and history from a run snapshot (updated in place)
        #[arg(long)]
        resume: Option<PathBuf>,
    },

    /// Show Ollama status and research settings
    Status,

    /// Health check with retries
    Health {
        /// Timeout in seconds
        #[arg(short, long, default_value = "60")]
        timeout: u64,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Create a default config file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Ask {
            question,
            budget,
            max_bad_attempts,
            model,
            json,
            artifacts,
            resume,
        } => {
            let question = question.join(" ");
            commands::ask(
                &question,
                commands::AskArgs {
                    budget,
                    max_bad_attempts,
                    model,
                    json,
                    artifacts,
                    resume,
                },
            )
            .await
        }
        Commands::Status => commands::status().await,
        Commands::Health { timeout } => commands::health(timeout).await,
        Commands::Config { action } => match action {
            ConfigAction::Init => commands::config_init(),
        },
    }
}
