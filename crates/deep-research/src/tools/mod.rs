//! Search and fetch adapters used by the research loop
//!
//! The loop only sees the [`SearchProvider`], [`ContentFetcher`] and
//! [`QueryRewriter`] traits; retry policy belongs to the implementations.

pub mod query_rewriter;
pub mod web_fetch;
pub mod web_search;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use query_rewriter::{LlmQueryRewriter, PassthroughRewriter, QueryRewriter};
pub use web_fetch::WebFetcher;
pub use web_search::DuckDuckGoSearch;

/// One search hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub description: String,
}

/// Extracted content of a fetched URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    #[serde(default)]
    pub title: String,
    pub content: String,
    /// Resource cost of producing this page, in tokens
    pub tokens: u64,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, keyword: &str) -> Result<Vec<SearchResult>>;
}

#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
}

/// Shared HTTP settings for the web adapters
#[derive(Debug, Clone)]
pub struct WebContext {
    /// Per-request timeout
    pub http_timeout_secs: u64,
    /// Search hits kept per keyword
    pub max_results: usize,
    /// Extracted page text is cut at this many characters
    pub max_content_chars: usize,
}

impl Default for WebContext {
    fn default() -> Self {
        Self {
            http_timeout_secs: 30,
            max_results: 10,
            max_content_chars: 50_000,
        }
    }
}

impl WebContext {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn with_http_timeout(mut self, secs: u64) -> Self {
        self.http_timeout_secs = secs;
        self
    }

    pub fn with_max_results(mut self, max: usize) -> Self {
        self.max_results = max;
        self
    }

    pub fn with_max_content_chars(mut self, max: usize) -> Self {
        self.max_content_chars = max;
        self
    }
}
