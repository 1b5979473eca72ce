//! Query deduplication against everything asked or searched before

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::agent::TokenTracker;
use crate::error::{ResearchError, Result};
use crate::llm::StructuredLlm;

pub const DEDUP_TOOL: &str = "dedup";

#[async_trait]
pub trait QueryDeduplicator: Send + Sync {
    /// Candidates that are novel w.r.t. `existing` (and each other), in input order
    async fn dedup(
        &self,
        candidates: &[String],
        existing: &[String],
        tracker: &TokenTracker,
    ) -> Result<Vec<String>>;
}

/// Case- and whitespace-insensitive exact matching; no model calls
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactDeduplicator;

pub(crate) fn normalize(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| c.is_ascii_punctuation())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

impl ExactDeduplicator {
    pub fn filter(candidates: &[String], existing: &[String]) -> Vec<String> {
        let mut seen: HashSet<String> = existing.iter().map(|q| normalize(q)).collect();
        candidates
            .iter()
            .filter(|q| {
                let key = normalize(q);
                !key.is_empty() && seen.insert(key)
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl QueryDeduplicator for ExactDeduplicator {
    async fn dedup(
        &self,
        candidates: &[String],
        existing: &[String],
        _tracker: &TokenTracker,
    ) -> Result<Vec<String>> {
        Ok(Self::filter(candidates, existing))
    }
}

/// Semantic deduplication by the model
///
/// Exact duplicates are removed locally first; the model only sees what
/// survives, and its output is restricted to strings that were actually
/// among the candidates.
pub struct LlmDeduplicator {
    llm: Arc<dyn StructuredLlm>,
}

impl LlmDeduplicator {
    pub fn new(llm: Arc<dyn StructuredLlm>) -> Self {
        Self { llm }
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "think": {
                    "type": "string",
                    "description": "Strategic reasoning about the overall deduplication approach"
                },
                "unique_queries": {
                    "type": "array",
                    "items": {
                        "type": "string",
                        "description": "Unique query that passed the deduplication process, copied verbatim"
                    },
                    "description": "Array of semantically unique queries"
                }
            },
            "required": ["think", "unique_queries"]
        })
    }
}

#[derive(Debug, Deserialize)]
struct DedupOutput {
    #[serde(default)]
    think: String,
    unique_queries: Vec<String>,
}

fn dedup_prompt(candidates: &[String], existing: &[String]) -> String {
    format!(
        r#"You are an expert in search query semantic deduplication. Identify which of the new queries are semantically unique.

Rules:
1. Consider semantic meaning and query intent, not only lexical similarity.
2. Account for different phrasings of the same information need.
3. Queries with the same base keywords but different operators (site:, quotes) are NOT duplicates.
4. Remove duplicates within the new set.
5. Remove new queries that are semantically equivalent to any existing query.
6. Return the surviving queries exactly as written in the new set.

New queries:
{new}

Existing queries:
{existing}"#,
        new = serde_json::to_string_pretty(candidates).unwrap_or_default(),
        existing = serde_json::to_string_pretty(existing).unwrap_or_default(),
    )
}

#[async_trait]
impl QueryDeduplicator for LlmDeduplicator {
    #[instrument(skip_all, fields(candidates = candidates.len(), existing = existing.len()))]
    async fn dedup(
        &self,
        candidates: &[String],
        existing: &[String],
        tracker: &TokenTracker,
    ) -> Result<Vec<String>> {
        let survivors = ExactDeduplicator::filter(candidates, existing);
        if survivors.is_empty() {
            return Ok(survivors);
        }

        let raw = self
            .llm
            .generate(
                DEDUP_TOOL,
                &dedup_prompt(&survivors, existing),
                &Self::schema(),
                tracker,
            )
            .await?;
        let output: DedupOutput =
            serde_json::from_value(raw).map_err(|e| ResearchError::MalformedOutput {
                tool: DEDUP_TOOL,
                message: e.to_string(),
            })?;

        let kept: HashSet<String> = output.unique_queries.iter().map(|q| normalize(q)).collect();
        let unique: Vec<String> = survivors
            .into_iter()
            .filter(|q| kept.contains(&normalize(q)))
            .collect();

        debug!(kept = unique.len(), reasoning = %output.think, "Deduplicated queries");
        Ok(unique)
    }
}
