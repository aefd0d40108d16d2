//! Test doubles for the generation and search services, plus config fixtures.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use redraft_core::config::AppConfig;
use redraft_core::error::{RedraftError, Result};
use redraft_core::traits::{GenerationService, SearchService};
use redraft_core::types::SearchHit;

/// Which generation method a recorded call went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Invoke,
    Structured,
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// 1-based, counted across both methods.
    pub number: usize,
    pub kind: CallKind,
    pub system: String,
    pub user: String,
}

/// Scripted generation service.
///
/// `invoke` answers `"reply {n}"` (or a fixed reply), `invoke_structured`
/// answers `{"queries": [...]}`. Failures and delays are keyed by call number.
pub struct MockGeneration {
    reply: Option<String>,
    queries: Vec<String>,
    structured: Option<serde_json::Value>,
    fail_on: HashSet<usize>,
    fail_from: Option<usize>,
    delays: HashMap<usize, Duration>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl Default for MockGeneration {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGeneration {
    pub fn new() -> Self {
        Self {
            reply: None,
            queries: vec!["query one".to_string(), "query two".to_string()],
            structured: None,
            fail_on: HashSet::new(),
            fail_from: None,
            delays: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answer every `invoke` with the same text.
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Queries returned by `invoke_structured`.
    pub fn with_queries(mut self, queries: &[&str]) -> Self {
        self.queries = queries.iter().map(|q| q.to_string()).collect();
        self
    }

    /// Raw JSON returned by `invoke_structured`, bypassing `with_queries`.
    pub fn with_structured(mut self, value: serde_json::Value) -> Self {
        self.structured = Some(value);
        self
    }

    /// Fail only call number `n`.
    pub fn fail_on_call(mut self, n: usize) -> Self {
        self.fail_on.insert(n);
        self
    }

    /// Fail call number `n` and every call after it.
    pub fn fail_from_call(mut self, n: usize) -> Self {
        self.fail_from = Some(n);
        self
    }

    /// Sleep before answering call number `n`.
    pub fn delay_call(mut self, n: usize, delay: Duration) -> Self {
        self.delays.insert(n, delay);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().clone()
    }

    pub fn total_calls(&self) -> usize {
        self.lock().len()
    }

    pub fn invoke_calls(&self) -> usize {
        self.count(|c| c.kind == CallKind::Invoke)
    }

    pub fn structured_calls(&self) -> usize {
        self.count(|c| c.kind == CallKind::Structured)
    }

    /// Calls whose system instruction contains `needle`.
    pub fn calls_with_system(&self, needle: &str) -> usize {
        self.count(|c| c.system.contains(needle))
    }

    fn count(&self, pred: impl Fn(&RecordedCall) -> bool) -> usize {
        self.lock().iter().filter(|c| pred(c)).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<RecordedCall>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a call; returns its number.
    fn begin(&self, kind: CallKind, system: &str, user: &str) -> usize {
        let mut calls = self.lock();
        let number = calls.len() + 1;
        calls.push(RecordedCall {
            number,
            kind,
            system: system.to_string(),
            user: user.to_string(),
        });
        number
    }

    async fn settle(&self, number: usize) -> Result<()> {
        if let Some(delay) = self.delays.get(&number) {
            tokio::time::sleep(*delay).await;
        }
        let failing = self.fail_on.contains(&number) || self.fail_from.is_some_and(|n| number >= n);
        if failing {
            return Err(RedraftError::LlmRequest(format!(
                "HTTP 503 Service Unavailable: scripted failure on call {}",
                number
            )));
        }
        Ok(())
    }
}

impl GenerationService for MockGeneration {
    fn invoke<'a>(&'a self, system: &'a str, user: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let number = self.begin(CallKind::Invoke, system, user);
            self.settle(number).await?;
            Ok(self
                .reply
                .clone()
                .unwrap_or_else(|| format!("reply {}", number)))
        })
    }

    fn invoke_structured<'a>(
        &'a self,
        system: &'a str,
        user: &'a str,
        _schema: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            let number = self.begin(CallKind::Structured, system, user);
            self.settle(number).await?;
            Ok(self
                .structured
                .clone()
                .unwrap_or_else(|| serde_json::json!({ "queries": self.queries })))
        })
    }
}

/// Scripted search service. Each query yields `hits_per_query` hits whose
/// content is `"{query} #{i}"`, capped at the requested `max_results`.
pub struct MockSearch {
    hits_per_query: usize,
    per_query: HashMap<String, usize>,
    ignore_cap: bool,
    fail_on: HashSet<usize>,
    delays: HashMap<String, Duration>,
    queries: Mutex<Vec<(String, usize)>>,
    completed: Mutex<Vec<String>>,
}

impl Default for MockSearch {
    fn default() -> Self {
        Self::new(2)
    }
}

impl MockSearch {
    pub fn new(hits_per_query: usize) -> Self {
        Self {
            hits_per_query,
            per_query: HashMap::new(),
            ignore_cap: false,
            fail_on: HashSet::new(),
            delays: HashMap::new(),
            queries: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
        }
    }

    /// Override the hit count for one query.
    pub fn with_hits_for(mut self, query: &str, hits: usize) -> Self {
        self.per_query.insert(query.to_string(), hits);
        self
    }

    /// Return `hits_per_query` hits even when more than `max_results`.
    pub fn ignoring_cap(mut self) -> Self {
        self.ignore_cap = true;
        self
    }

    /// Fail only search call number `n` (1-based).
    pub fn fail_on_call(mut self, n: usize) -> Self {
        self.fail_on.insert(n);
        self
    }

    pub fn total_calls(&self) -> usize {
        self.lock().len()
    }

    /// Sleep `delay` before answering `query`.
    pub fn delay_query(mut self, query: &str, delay: Duration) -> Self {
        self.delays.insert(query.to_string(), delay);
        self
    }

    /// Queries in the order their answers came back.
    pub fn completions(&self) -> Vec<String> {
        self.completed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Queries in call order, with the `max_results` each was issued with.
    pub fn queries(&self) -> Vec<(String, usize)> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, usize)>> {
        self.queries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SearchService for MockSearch {
    fn search<'a>(
        &'a self,
        query: &'a str,
        max_results: usize,
    ) -> BoxFuture<'a, Result<Vec<SearchHit>>> {
        Box::pin(async move {
            let number = {
                let mut queries = self.lock();
                queries.push((query.to_string(), max_results));
                queries.len()
            };
            if self.fail_on.contains(&number) {
                return Err(RedraftError::Search(format!(
                    "connection reset on search call {}",
                    number
                )));
            }
            if let Some(delay) = self.delays.get(query) {
                tokio::time::sleep(*delay).await;
            }
            let mut hits = *self.per_query.get(query).unwrap_or(&self.hits_per_query);
            if !self.ignore_cap {
                hits = hits.min(max_results);
            }
            self.completed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(query.to_string());
            Ok((0..hits)
                .map(|i| SearchHit::new(format!("{} #{}", query, i)))
                .collect())
        })
    }
}

/// Config with millisecond durable backoffs, parsed the way a user file is.
pub fn test_config() -> AppConfig {
    toml::from_str(
        r#"
[model]
model_id = "test-model"

[durable.default_policy]
max_attempts = 3
initial_backoff_ms = 1
backoff_coefficient = 2.0
max_backoff_ms = 4
start_to_close_timeout_secs = 5
"#,
    )
    .unwrap_or_else(|e| panic!("test config must parse: {}", e))
}

/// Temporary directory removed on drop.
pub fn temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().unwrap_or_else(|e| panic!("failed to create temp dir: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_generation_counts_and_fails() {
        let mock = MockGeneration::new().fail_on_call(2);
        assert_eq!(mock.invoke("sys", "a").await.unwrap(), "reply 1");
        assert!(mock.invoke("sys", "b").await.is_err());
        let value = mock
            .invoke_structured("other", "c", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(value["queries"][0], "query one");
        assert_eq!(mock.invoke_calls(), 2);
        assert_eq!(mock.structured_calls(), 1);
        assert_eq!(mock.calls_with_system("sys"), 2);
    }

    #[tokio::test]
    async fn test_mock_search_caps_and_overrides() {
        let search = MockSearch::new(3).with_hits_for("empty", 0);
        assert_eq!(search.search("q", 2).await.unwrap().len(), 2);
        assert!(search.search("empty", 2).await.unwrap().is_empty());
        assert_eq!(search.total_calls(), 2);

        let uncapped = MockSearch::new(3).ignoring_cap();
        assert_eq!(uncapped.search("q", 2).await.unwrap().len(), 3);
    }
}
