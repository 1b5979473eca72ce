//! Per-step debug artifacts and run snapshots
//!
//! Artifacts are written after every step for inspection only; the loop never
//! reads them back. A [`RunSnapshot`] saved here can seed a later run.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::agent::{ResearchContext, RunContext, RunSnapshot};

/// File names inside the artifact directory
const CONTEXT_FILE: &str = "context.json";
const QUERIES_FILE: &str = "queries.json";
const QUESTIONS_FILE: &str = "questions.json";
const KNOWLEDGE_FILE: &str = "knowledge.json";
const SNAPSHOT_FILE: &str = "run.json";

/// Directory of research artifacts for one run
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    /// Open (and create if needed) an artifact directory
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create artifact directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prompt_path(&self, total_step: usize) -> PathBuf {
        self.dir.join(format!("prompt-{}.txt", total_step))
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    /// Write the prompt of `total_step` and cumulative snapshots of the run
    pub fn write_step(
        &self,
        total_step: usize,
        prompt: &str,
        run: &RunContext,
        research: &ResearchContext,
    ) -> Result<()> {
        fs::write(self.prompt_path(total_step), prompt).context("Failed to write prompt")?;
        self.write_json(CONTEXT_FILE, run.actions.steps())?;
        self.write_json(QUERIES_FILE, research.keywords())?;
        self.write_json(QUESTIONS_FILE, research.all_questions())?;
        self.write_json(KNOWLEDGE_FILE, research.knowledge())?;
        debug!(total_step, dir = %self.dir.display(), "Wrote step artifacts");
        Ok(())
    }

    /// Persist budget usage and the action transcript for a later resume
    pub fn save_snapshot(&self, run: &RunContext) -> Result<PathBuf> {
        let path = self.snapshot_path();
        save_snapshot(&path, run)?;
        Ok(path)
    }

    fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)
            .with_context(|| format!("Failed to serialize {}", name))?;
        fs::write(self.dir.join(name), json).with_context(|| format!("Failed to write {}", name))
    }
}

pub fn save_snapshot(path: &Path, run: &RunContext) -> Result<()> {
    let json =
        serde_json::to_string_pretty(&run.to_snapshot()).context("Failed to serialize run")?;
    fs::write(path, json).context("Failed to write run snapshot")?;
    info!(path = %path.display(), "Saved run snapshot");
    Ok(())
}

pub fn load_snapshot(path: &Path) -> Result<RunContext> {
    if !path.exists() {
        anyhow::bail!("Run snapshot not found: {}", path.display());
    }
    let json = fs::read_to_string(path).context("Failed to read run snapshot")?;
    let snapshot: RunSnapshot = serde_json::from_str(&json).context("Failed to parse run snapshot")?;
    debug!(
        path = %path.display(),
        used = snapshot.usage.total,
        steps = snapshot.actions.len(),
        "Loaded run snapshot"
    );
    Ok(snapshot.into())
}
