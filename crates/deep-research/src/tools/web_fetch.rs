//! URL content retrieval with HTML-to-text extraction

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{ContentFetcher, FetchedPage, WebContext};
use crate::tokenizer::count_tokens;

/// Check if an IP address is in a private/reserved range (SSRF protection)
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_loopback()
                || ipv4.is_private()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_unspecified()
                // 100.64.0.0/10 (CGNAT)
                || ipv4.octets()[0] == 100 && (ipv4.octets()[1] & 0xC0) == 64
        }
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback()
                || ipv6.is_unspecified()
                || ipv6
                    .to_ipv4_mapped()
                    .map(|v4| v4.is_loopback() || v4.is_private() || v4.is_link_local())
                    .unwrap_or(false)
        }
    }
}

/// Fetch adapter that downloads a page and reduces it to readable text
#[derive(Debug, Clone)]
pub struct WebFetcher {
    client: reqwest::Client,
    ctx: WebContext,
    allow_private: bool,
}

impl WebFetcher {
    pub fn new(ctx: WebContext) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(ctx.timeout())
            .user_agent("Mozilla/5.0 (compatible; DeepResearch/0.1)")
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            ctx,
            allow_private: false,
        })
    }

    /// Permit loopback/private hosts (local test servers)
    pub fn allow_private_hosts(mut self, allow: bool) -> Self {
        self.allow_private = allow;
        self
    }

    async fn guard_host(&self, parsed: &url::Url) -> Result<()> {
        if self.allow_private {
            return Ok(());
        }
        let Some(host) = parsed.host_str() else {
            bail!("URL has no host");
        };
        let port = parsed.port_or_known_default().unwrap_or(80);

        // Unresolvable hosts fall through; the request itself reports the error
        if let Ok(addrs) = tokio::net::lookup_host((host, port)).await {
            for addr in addrs {
                if is_private_ip(&addr.ip()) {
                    warn!(host, ip = %addr.ip(), "SSRF protection blocked private IP");
                    bail!(
                        "Access to private/reserved IP address {} is blocked",
                        addr.ip()
                    );
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ContentFetcher for WebFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let parsed = url::Url::parse(url).with_context(|| format!("Invalid URL: {}", url))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            bail!("Only HTTP and HTTPS URLs are supported");
        }
        self.guard_host(&parsed).await?;

        debug!("Sending HTTP request");
        let response = self
            .client
            .get(parsed.as_str())
            .send()
            .await
            .context("Failed to fetch URL")?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, "HTTP error response");
            return Err(anyhow!("HTTP error: {}", status));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();

        let body = response.text().await.context("Failed to read response")?;

        let (title, text) = if content_type.contains("text/html") || looks_like_html(&body) {
            let document = Html::parse_document(&body);
            (page_title(&document), html_to_text(&document))
        } else if content_type.contains("application/json") {
            let pretty = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|json| serde_json::to_string_pretty(&json).ok())
                .unwrap_or(body);
            (String::new(), pretty)
        } else {
            (String::new(), body)
        };

        let content = truncate_chars(&text, self.ctx.max_content_chars);
        let tokens = count_tokens(&content);
        debug!(chars = content.len(), tokens, "Fetched content");

        Ok(FetchedPage {
            url: url.to_string(),
            title,
            content,
            tokens,
        })
    }
}

fn looks_like_html(body: &str) -> bool {
    let head: String = body.trim_start().chars().take(64).collect();
    let head = head.to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

fn page_title(document: &Html) -> String {
    Selector::parse("title")
        .ok()
        .and_then(|sel| document.select(&sel).next().map(|el| el.text().collect::<String>()))
        .map(|t| t.trim().to_string())
        .unwrap_or_default()
}

/// Cut at a char boundary, marking the truncation
fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!(
            "{}\n\n[Content truncated at {} characters]",
            &text[..idx],
            max_chars
        ),
        None => text.to_string(),
    }
}

/// Convert an HTML document to plain text, preferring the main content area
fn html_to_text(document: &Html) -> String {
    let candidates = [
        "article",
        "main",
        "[role='main']",
        ".content",
        "#content",
        ".post",
        ".article",
        "body",
    ];

    for css in candidates {
        if let Ok(selector) = Selector::parse(css) {
            if let Some(element) = document.select(&selector).next() {
                let text = extract_text_from_element(&element);
                if !text.trim().is_empty() {
                    return text;
                }
            }
        }
    }

    document.root_element().text().collect::<Vec<_>>().join(" ")
}

/// Extract text from an element, one line per block-level element
fn extract_text_from_element(element: &ElementRef) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut current_line = String::new();
    let mut skip_depth = 0;

    for edge in element.traverse() {
        match edge {
            ego_tree::iter::Edge::Open(node) => {
                if skip_depth > 0 {
                    if node.value().is_element() {
                        skip_depth += 1;
                    }
                    continue;
                }

                match node.value() {
                    scraper::Node::Text(text) => {
                        let trimmed = text.trim();
                        if !trimmed.is_empty() {
                            if !current_line.is_empty() {
                                current_line.push(' ');
                            }
                            current_line.push_str(trimmed);
                        }
                    }
                    scraper::Node::Element(el) => {
                        let tag = el.name();
                        if matches!(tag, "script" | "style" | "noscript" | "nav" | "footer") {
                            skip_depth = 1;
                            continue;
                        }
                        if matches!(
                            tag,
                            "p" | "div" | "br" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "li" | "tr"
                        ) && !current_line.is_empty()
                        {
                            lines.push(std::mem::take(&mut current_line));
                        }
                    }
                    _ => {}
                }
            }
            ego_tree::iter::Edge::Close(node) => {
                if skip_depth > 0 && node.value().is_element() {
                    skip_depth -= 1;
                }
            }
        }
    }

    if !current_line.is_empty() {
        lines.push(current_line);
    }

    lines
        .into_iter()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
