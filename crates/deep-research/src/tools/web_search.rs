//! Keyword search via the DuckDuckGo HTML endpoint

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{SearchProvider, SearchResult, WebContext};

const SEARCH_ENDPOINT: &str = "https://html.duckduckgo.com/html/";

/// Search adapter that scrapes DuckDuckGo's no-JS result page
#[derive(Debug, Clone)]
pub struct DuckDuckGoSearch {
    client: reqwest::Client,
    ctx: WebContext,
}

impl DuckDuckGoSearch {
    pub fn new(ctx: WebContext) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(ctx.timeout())
            .user_agent("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36")
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, ctx })
    }
}

#[async_trait]
impl SearchProvider for DuckDuckGoSearch {
    #[instrument(skip(self), fields(limit = self.ctx.max_results))]
    async fn search(&self, keyword: &str) -> Result<Vec<SearchResult>> {
        let search_url = format!("{}?q={}", SEARCH_ENDPOINT, urlencoding::encode(keyword));

        debug!("Sending search request to DuckDuckGo");
        let response = self
            .client
            .get(&search_url)
            .send()
            .await
            .context("Search request failed")?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, "Search returned error status");
            return Err(anyhow!("Search failed with status: {}", status));
        }

        let html = response
            .text()
            .await
            .context("Failed to read search response")?;

        let results = parse_duckduckgo_results(&html, self.ctx.max_results)?;
        debug!(count = results.len(), "Parsed search results");
        Ok(results)
    }
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("Invalid CSS selector {}: {:?}", css, e))
}

fn element_text(el: &ElementRef) -> String {
    el.text().collect::<Vec<_>>().join(" ").trim().to_string()
}

/// DuckDuckGo wraps result links as `/l/?uddg=<encoded target>&...`
fn unwrap_redirect(href: &str) -> String {
    href.split("uddg=")
        .nth(1)
        .and_then(|s| urlencoding::decode(s.split('&').next().unwrap_or(s)).ok())
        .map(|s| s.into_owned())
        .unwrap_or_else(|| href.to_string())
}

fn parse_duckduckgo_results(html: &str, limit: usize) -> Result<Vec<SearchResult>> {
    let document = Html::parse_document(html);
    let result_selector = selector(".result")?;
    let title_selector = selector(".result__a")?;
    let snippet_selector = selector(".result__snippet")?;

    let mut results = Vec::new();
    for result_el in document.select(&result_selector) {
        if results.len() >= limit {
            break;
        }

        let Some(link) = result_el.select(&title_selector).next() else {
            continue;
        };
        let title = element_text(&link);
        let url = link
            .value()
            .attr("href")
            .map(unwrap_redirect)
            .unwrap_or_default();
        let description = result_el
            .select(&snippet_selector)
            .next()
            .map(|el| element_text(&el))
            .unwrap_or_default();

        if !title.is_empty() && !url.is_empty() {
            results.push(SearchResult {
                title,
                url,
                description,
            });
        }
    }

    Ok(results)
}
