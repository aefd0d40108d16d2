use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::debug;

use redraft_core::config::SearchConfig;
use redraft_core::error::{RedraftError, Result};
use redraft_core::traits::SearchService;
use redraft_core::types::SearchHit;

const TAVILY_API_URL: &str = "https://api.tavily.com/search";

/// Tavily web search client.
pub struct TavilyClient {
    api_key: String,
    url: String,
    http: reqwest::Client,
}

impl TavilyClient {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            url: TAVILY_API_URL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("TAVILY_API_KEY").ok())
            .ok_or_else(|| {
                RedraftError::Config("search.api_key is not set and TAVILY_API_KEY is empty".into())
            })?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RedraftError::Search(e.to_string()))?;
        Ok(Self {
            api_key,
            url: config
                .base_url
                .clone()
                .unwrap_or_else(|| TAVILY_API_URL.to_string()),
            http,
        })
    }
}

/// Build the search backend named by `config.provider`.
pub fn create_search(config: &SearchConfig) -> Result<Box<dyn SearchService>> {
    match config.provider.as_str() {
        "tavily" => Ok(Box::new(TavilyClient::from_config(config)?)),
        other => Err(RedraftError::Config(format!(
            "unsupported search provider: {}",
            other
        ))),
    }
}

/// Map a Tavily response body to hits, keeping at most `max_results`.
fn parse_results(body: &serde_json::Value, max_results: usize) -> Result<Vec<SearchHit>> {
    let results = body["results"]
        .as_array()
        .ok_or_else(|| RedraftError::Search("response has no 'results' array".into()))?;

    Ok(results
        .iter()
        .filter_map(|r| {
            let content = r["content"].as_str()?;
            Some(SearchHit {
                title: r["title"].as_str().unwrap_or("").to_string(),
                url: r["url"].as_str().unwrap_or("").to_string(),
                content: content.to_string(),
                score: r["score"].as_f64(),
            })
        })
        .take(max_results)
        .collect())
}

impl SearchService for TavilyClient {
    fn search<'a>(
        &'a self,
        query: &'a str,
        max_results: usize,
    ) -> BoxFuture<'a, Result<Vec<SearchHit>>> {
        Box::pin(async move {
            let resp = self
                .http
                .post(&self.url)
                .json(&json!({
                    "api_key": self.api_key,
                    "query": query,
                    "max_results": max_results,
                }))
                .send()
                .await
                .map_err(|e| RedraftError::Search(e.to_string()))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(RedraftError::Search(format!("HTTP {}: {}", status, body)));
            }

            let body: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| RedraftError::Search(e.to_string()))?;

            let hits = parse_results(&body, max_results)?;
            debug!(query, hits = hits.len(), "Search complete");
            Ok(hits)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_results() {
        let body = json!({
            "query": "rust",
            "results": [
                {"title": "A", "url": "https://a", "content": "alpha", "score": 0.9},
                {"title": "B", "url": "https://b", "content": "beta"},
                {"title": "C", "url": "https://c", "content": "gamma"}
            ]
        });
        let hits = parse_results(&body, 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "alpha");
        assert_eq!(hits[0].score, Some(0.9));
        assert_eq!(hits[1].url, "https://b");
        assert!(hits[1].score.is_none());
    }

    #[test]
    fn test_parse_results_skips_entries_without_content() {
        let body = json!({"results": [{"title": "no body"}, {"content": "kept"}]});
        let hits = parse_results(&body, 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "kept");
    }

    #[test]
    fn test_parse_results_empty_and_malformed() {
        assert!(parse_results(&json!({"results": []}), 2).unwrap().is_empty());
        assert!(matches!(
            parse_results(&json!({"detail": "bad key"}), 2),
            Err(RedraftError::Search(_))
        ));
    }

    #[test]
    fn test_create_search_rejects_unknown_provider() {
        let config = SearchConfig {
            provider: "altavista".into(),
            api_key: Some("k".into()),
            ..SearchConfig::default()
        };
        assert!(matches!(
            create_search(&config),
            Err(RedraftError::Config(_))
        ));
    }

    #[test]
    fn test_from_config_uses_base_url() {
        let config = SearchConfig {
            api_key: Some("k".into()),
            base_url: Some("http://localhost:9999/search".into()),
            ..SearchConfig::default()
        };
        let client = TavilyClient::from_config(&config).unwrap();
        assert_eq!(client.url, "http://localhost:9999/search");
    }
}
