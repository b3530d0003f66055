//! Web search provider used by `search_web` steps and retry context.

use crate::config::Config;
use crate::util::truncate;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const SEARCH_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_RESULT_COUNT: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
}

pub trait SearchProvider: Send + Sync {
    fn search<'a>(&'a self, query: &'a str, count: usize) -> BoxFuture<'a, anyhow::Result<Vec<SearchResult>>>;
}

#[derive(Deserialize)]
struct WebSearchResponse {
    #[serde(default)]
    web: Option<WebResults>,
}

#[derive(Deserialize)]
struct WebResults {
    #[serde(default)]
    results: Vec<SearchResult>,
}

/// Brave-compatible search endpoint: `GET ?q=..&count=..` with a
/// subscription token header.
pub struct WebSearchClient {
    http: reqwest::Client,
    api_key: String,
    url: String,
}

impl WebSearchClient {
    pub fn new(api_key: impl Into<String>, url: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(SEARCH_TIMEOUT_SECS))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            url: url.into(),
        })
    }

    /// `None` when no search key is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        let key = config.search_api_key.as_deref()?.trim();
        if key.is_empty() {
            return None;
        }
        Self::new(key, config.search_base_url.clone()).ok()
    }

    async fn fetch(&self, query: &str, count: usize) -> anyhow::Result<Vec<SearchResult>> {
        let count = count.clamp(1, 20).to_string();
        let response = self
            .http
            .get(&self.url)
            .query(&[("q", query), ("count", count.as_str())])
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Search request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "Search API error {}: {}",
                status,
                truncate(&body, 200)
            ));
        }

        let parsed: WebSearchResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse search response: {}", e))?;
        let results = parsed.web.map(|w| w.results).unwrap_or_default();
        debug!(query, hits = results.len(), "web search");
        Ok(results)
    }
}

impl SearchProvider for WebSearchClient {
    fn search<'a>(&'a self, query: &'a str, count: usize) -> BoxFuture<'a, anyhow::Result<Vec<SearchResult>>> {
        Box::pin(self.fetch(query, count))
    }
}

/// Format results as a context block for later prompts.
pub fn render_results(query: &str, results: &[SearchResult]) -> String {
    if results.is_empty() {
        return format!("No web results for \"{}\".", query);
    }
    let mut out = format!("Web results for \"{}\":\n", query);
    for (i, r) in results.iter().enumerate() {
        out.push_str(&format!(
            "{}. {} ({})\n   {}\n",
            i + 1,
            r.title,
            r.url,
            truncate(&r.description, 300)
        ));
    }
    out
}
