use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RedraftError, Result};

/// Top-level redraft configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Base directory for the durable store and run logs.
    #[serde(default = "default_workspace")]
    pub workspace: String,
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub durable: DurableConfig,
    /// Runtime logging configuration.
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub prompts: PromptsConfig,
}

fn default_workspace() -> String { "~/.redraft".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Extra HTTP headers sent with every request (merged over preset headers).
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Web search provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_provider")]
    pub provider: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Results requested per query.
    #[serde(default = "default_search_max_results")]
    pub max_results: usize,
    /// Queries kept from each structured extraction.
    #[serde(default = "default_max_queries")]
    pub max_queries: usize,
    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            provider: default_search_provider(),
            api_key: None,
            base_url: None,
            max_results: default_search_max_results(),
            max_queries: default_max_queries(),
            timeout_secs: default_search_timeout(),
        }
    }
}

fn default_search_provider() -> String { "tavily".to_string() }
fn default_search_max_results() -> usize { 2 }
fn default_max_queries() -> usize { 3 }
fn default_search_timeout() -> u64 { 30 }

/// Defaults for plain (in-memory) graph runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_max_revisions")]
    pub max_revisions: u32,
    #[serde(default = "default_start_revision")]
    pub revision_number: u32,
    /// Optional ceiling on node executions per run. Unset, the limit follows
    /// each run's revision budget.
    #[serde(default)]
    pub max_steps: Option<usize>,
    /// Include the reflect / research_critique loop.
    #[serde(default = "default_critique_loop")]
    pub critique_loop: bool,
    /// Issue the per-query searches of a research node concurrently.
    #[serde(default)]
    pub concurrent_search: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_revisions: default_max_revisions(),
            revision_number: default_start_revision(),
            max_steps: None,
            critique_loop: default_critique_loop(),
            concurrent_search: false,
        }
    }
}

fn default_max_revisions() -> u32 { 2 }
fn default_start_revision() -> u32 { 1 }
fn default_critique_loop() -> bool { true }

/// Durable execution configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DurableConfig {
    /// SQLite file for recorded units. Default: <workspace>/durable.db
    #[serde(default)]
    pub store_path: Option<String>,
    /// Include the reflect / research_critique loop (default: false).
    #[serde(default)]
    pub critique_loop: bool,
    /// Policy applied to every unit without an override.
    #[serde(default)]
    pub default_policy: UnitPolicyConfig,
    /// Per-node overrides keyed by node id (e.g. "generate").
    #[serde(default)]
    pub units: HashMap<String, UnitPolicyOverride>,
}

impl DurableConfig {
    /// Effective policy for a node: the default policy with any override applied.
    pub fn policy_for(&self, node_id: &str) -> UnitPolicyConfig {
        let mut policy = self.default_policy.clone();
        if let Some(o) = self.units.get(node_id) {
            if let Some(v) = o.max_attempts {
                policy.max_attempts = v;
            }
            if let Some(v) = o.initial_backoff_ms {
                policy.initial_backoff_ms = v;
            }
            if let Some(v) = o.backoff_coefficient {
                policy.backoff_coefficient = v;
            }
            if let Some(v) = o.max_backoff_ms {
                policy.max_backoff_ms = v;
            }
            if let Some(v) = o.start_to_close_timeout_secs {
                policy.start_to_close_timeout_secs = v;
            }
        }
        policy
    }
}

/// Retry and timeout policy for a durable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitPolicyConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_unit_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: f64,
    #[serde(default = "default_unit_max_backoff")]
    pub max_backoff_ms: u64,
    /// Upper bound for a single attempt.
    #[serde(default = "default_start_to_close")]
    pub start_to_close_timeout_secs: u64,
}

impl Default for UnitPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_unit_initial_backoff(),
            backoff_coefficient: default_backoff_coefficient(),
            max_backoff_ms: default_unit_max_backoff(),
            start_to_close_timeout_secs: default_start_to_close(),
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_unit_initial_backoff() -> u64 { 1000 }
fn default_backoff_coefficient() -> f64 { 2.0 }
fn default_unit_max_backoff() -> u64 { 60_000 }
fn default_start_to_close() -> u64 { 120 }

/// Partial policy; unset fields fall back to `default_policy`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitPolicyOverride {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub initial_backoff_ms: Option<u64>,
    #[serde(default)]
    pub backoff_coefficient: Option<f64>,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
    #[serde(default)]
    pub start_to_close_timeout_secs: Option<u64>,
}

/// JSONL runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable runtime logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run summary only, 2 = per node, 3 = per retry attempt (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

/// Instruction overrides. Unset entries use the built-in prompts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptsConfig {
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub research_plan: Option<String>,
    /// Must contain a `{content}` placeholder.
    #[serde(default)]
    pub writer: Option<String>,
    #[serde(default)]
    pub reflection: Option<String>,
    #[serde(default)]
    pub research_critique: Option<String>,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| RedraftError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| RedraftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workflow.max_revisions == 0 {
            return Err(RedraftError::Config(
                "workflow.max_revisions must be at least 1".into(),
            ));
        }
        if self.workflow.max_steps == Some(0) {
            return Err(RedraftError::Config("workflow.max_steps must be at least 1".into()));
        }
        if self.search.max_results == 0 || self.search.max_queries == 0 {
            return Err(RedraftError::Config(
                "search.max_results and search.max_queries must be at least 1".into(),
            ));
        }
        if let Some(ref writer) = self.prompts.writer {
            if !writer.contains("{content}") {
                return Err(RedraftError::Config(
                    "prompts.writer must contain a {content} placeholder".into(),
                ));
            }
        }
        let default_policy = ("default_policy".to_string(), self.durable.default_policy.clone());
        let policies = std::iter::once(default_policy).chain(
            self.durable
                .units
                .keys()
                .map(|k| (k.clone(), self.durable.policy_for(k))),
        );
        for (name, policy) in policies {
            if policy.max_attempts == 0 {
                return Err(RedraftError::Config(format!(
                    "durable policy '{}': max_attempts must be at least 1",
                    name
                )));
            }
            if policy.start_to_close_timeout_secs == 0 {
                return Err(RedraftError::Config(format!(
                    "durable policy '{}': start_to_close_timeout_secs must be at least 1",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.workspace)
    }

    /// Path of the durable store database.
    pub fn durable_store_path(&self) -> PathBuf {
        match self.durable.store_path {
            Some(ref p) => expand_home(p),
            None => self.workspace_dir().join("durable.db"),
        }
    }

    /// Directory for JSONL run logs, if logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref()?;
        if !log.enabled {
            return None;
        }
        Some(match log.log_dir {
            Some(ref d) => expand_home(d),
            None => self.workspace_dir().join("logs"),
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
