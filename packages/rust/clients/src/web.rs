//! Search-page content retriever.
//!
//! Issues one GET per query against a search URL template, converts the
//! returned HTML to Markdown, and aggregates the sections in query order.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use tracing::{debug, info, instrument, warn};

use knowcrawl_shared::{KnowCrawlError, Result, RetrievalConfig};

use crate::{ContentRetriever, USER_AGENT};

/// Placeholder substituted with the URL-encoded query.
const QUERY_PLACEHOLDER: &str = "{query}";

/// Tags never worth converting.
const SKIP_TAGS: [&str; 9] = [
    "script", "style", "nav", "iframe", "noscript", "svg", "header", "footer", "form",
];

static EXCESS_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid newline regex"));

/// Retriever backed by an HTML search endpoint.
pub struct WebRetriever {
    client: Client,
    search_url: String,
    selector: Option<Selector>,
    max_chars: usize,
}

impl WebRetriever {
    /// Build a retriever from `[retrieval]` config.
    pub fn new(config: &RetrievalConfig) -> Result<Self> {
        if !config.search_url.contains(QUERY_PLACEHOLDER) {
            return Err(KnowCrawlError::config(format!(
                "retrieval.search_url must contain {QUERY_PLACEHOLDER}: {}",
                config.search_url
            )));
        }

        let selector = match config.result_selector.trim() {
            "" => None,
            css => Some(Selector::parse(css).map_err(|e| {
                KnowCrawlError::config(format!("invalid result_selector `{css}`: {e}"))
            })?),
        };

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| KnowCrawlError::config(format!("client build: {e}")))?;

        Ok(Self {
            client,
            search_url: config.search_url.clone(),
            selector,
            max_chars: config.max_chars,
        })
    }

    fn query_url(&self, query: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
        self.search_url.replace(QUERY_PLACEHOLDER, &encoded)
    }

    async fn fetch_one(&self, query: &str) -> Result<String> {
        let url = self.query_url(query);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| KnowCrawlError::service(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(KnowCrawlError::service(format!("{url}: HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| KnowCrawlError::service(format!("{url}: {e}")))?;

        extract_text(&body, self.selector.as_ref())
    }
}

impl ContentRetriever for WebRetriever {
    #[instrument(skip_all, fields(queries = queries.len()))]
    async fn fetch(&self, queries: &[String]) -> Result<String> {
        let mut sections = Vec::new();
        let mut last_error = None;
        let mut successes = 0usize;

        for query in queries {
            match self.fetch_one(query).await {
                Ok(text) => {
                    successes += 1;
                    if text.trim().is_empty() {
                        debug!(%query, "query returned no text");
                        continue;
                    }
                    sections.push(format!("## {query}\n\n{}", text.trim()));
                }
                Err(e) => {
                    warn!(%query, error = %e, "query failed, skipping");
                    last_error = Some(e);
                }
            }
        }

        if successes == 0 {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        let aggregated = truncate_chars(&sections.join("\n\n"), self.max_chars);
        info!(
            sections = sections.len(),
            chars = aggregated.chars().count(),
            "retrieval complete"
        );
        Ok(aggregated)
    }
}

/// Convert a search page to Markdown, keeping only `selector` matches when any exist.
fn extract_text(html: &str, selector: Option<&Selector>) -> Result<String> {
    let fragment = selector.and_then(|sel| {
        let doc = Html::parse_document(html);
        let parts: Vec<String> = doc.select(sel).map(|el| el.html()).collect();
        (!parts.is_empty()).then(|| parts.join("\n<hr>\n"))
    });

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(SKIP_TAGS.to_vec())
        .build();

    let markdown = converter
        .convert(fragment.as_deref().unwrap_or(html))
        .map_err(|e| KnowCrawlError::service(format!("html conversion failed: {e}")))?;

    Ok(EXCESS_NEWLINES.replace_all(markdown.trim(), "\n\n").into_owned())
}

/// Truncate to at most `max_chars` characters, on a char boundary.
pub fn truncate_chars(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        None => content.to_string(),
        Some((cut, _)) => {
            format!("{}\n\n[... content truncated for LLM context window ...]", &content[..cut])
        }
    }
}
