//! Turns the oracle's free-text search intent into keyword queries

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::agent::TokenTracker;
use crate::error::{ResearchError, Result};
use crate::llm::StructuredLlm;

pub const REWRITER_TOOL: &str = "rewriter";

/// Upper bound on keyword queries produced per search decision
pub const MAX_REWRITTEN_QUERIES: usize = 3;

#[async_trait]
pub trait QueryRewriter: Send + Sync {
    async fn rewrite(
        &self,
        search_query: &str,
        thoughts: &str,
        tracker: &TokenTracker,
    ) -> Result<Vec<String>>;
}

/// Uses the oracle's query as the only keyword
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughRewriter;

#[async_trait]
impl QueryRewriter for PassthroughRewriter {
    async fn rewrite(
        &self,
        search_query: &str,
        _thoughts: &str,
        _tracker: &TokenTracker,
    ) -> Result<Vec<String>> {
        Ok(vec![search_query.trim().to_string()])
    }
}

pub struct LlmQueryRewriter {
    llm: Arc<dyn StructuredLlm>,
}

impl LlmQueryRewriter {
    pub fn new(llm: Arc<dyn StructuredLlm>) -> Self {
        Self { llm }
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "think": {
                    "type": "string",
                    "description": "Strategic reasoning about query complexity and search approach"
                },
                "queries": {
                    "type": "array",
                    "items": {
                        "type": "string",
                        "description": "Search query, must be less than 30 characters"
                    },
                    "minItems": 1,
                    "maxItems": MAX_REWRITTEN_QUERIES,
                    "description": "Array of search queries, orthogonal to each other"
                }
            },
            "required": ["think", "queries"]
        })
    }
}

#[derive(Debug, Deserialize)]
struct RewriteOutput {
    #[serde(default)]
    think: String,
    queries: Vec<String>,
}

fn rewrite_prompt(search_query: &str, thoughts: &str) -> String {
    format!(
        r#"You are an expert information retrieval assistant. Transform the search intent below into precise keyword queries for a BM25-style web search engine.

Guidelines:
1. Keep each query short: two to five keywords, no filler words.
2. Split a compound intent into separate, orthogonal queries.
3. Keep proper nouns, version numbers and quoted phrases intact.
4. Use site: or filetype: operators only when they clearly help.
5. Return at most {max} queries.

Search intent: {query}
Motivation: {thoughts}"#,
        max = MAX_REWRITTEN_QUERIES,
        query = search_query,
        thoughts = thoughts
    )
}

#[async_trait]
impl QueryRewriter for LlmQueryRewriter {
    #[instrument(skip(self, thoughts, tracker))]
    async fn rewrite(
        &self,
        search_query: &str,
        thoughts: &str,
        tracker: &TokenTracker,
    ) -> Result<Vec<String>> {
        let raw = self
            .llm
            .generate(
                REWRITER_TOOL,
                &rewrite_prompt(search_query, thoughts),
                &Self::schema(),
                tracker,
            )
            .await?;
        let output: RewriteOutput =
            serde_json::from_value(raw).map_err(|e| ResearchError::MalformedOutput {
                tool: REWRITER_TOOL,
                message: e.to_string(),
            })?;

        let mut queries: Vec<String> = output
            .queries
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .take(MAX_REWRITTEN_QUERIES)
            .collect();
        if queries.is_empty() {
            queries.push(search_query.trim().to_string());
        }

        debug!(queries = ?queries, reasoning = %output.think, "Rewrote search query");
        Ok(queries)
    }
}
