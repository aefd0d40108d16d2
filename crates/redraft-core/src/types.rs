use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RedraftError, Result};

/// Unique run identifier. Durable runs are keyed by it.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One result from the search service. Only `content` feeds the state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    pub content: String,
    #[serde(default)]
    pub score: Option<f64>,
}

impl SearchHit {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Search queries extracted through the structured-output mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Queries {
    pub queries: Vec<String>,
}

impl Queries {
    /// JSON Schema sent to the generation service.
    pub fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "queries": {
                    "type": "array",
                    "items": { "type": "string" }
                }
            },
            "required": ["queries"],
            "additionalProperties": false
        })
    }

    /// Parse a structured response, failing on any shape mismatch.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| RedraftError::SchemaViolation("expected a JSON object".into()))?;
        let items = obj
            .get("queries")
            .ok_or_else(|| RedraftError::SchemaViolation("missing 'queries'".into()))?
            .as_array()
            .ok_or_else(|| RedraftError::SchemaViolation("'queries' must be an array".into()))?;

        let mut queries = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let q = item.as_str().ok_or_else(|| {
                RedraftError::SchemaViolation(format!("queries[{}] is not a string", i))
            })?;
            queries.push(q.to_string());
        }
        Ok(Self { queries })
    }
}

/// Event broadcast while a run executes.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// Run started.
    RunStarted { run_id: RunId, durable: bool },
    /// A node is about to execute.
    NodeStarted {
        run_id: RunId,
        step: usize,
        node_id: String,
    },
    /// A node's update was merged.
    NodeCompleted {
        run_id: RunId,
        step: usize,
        node_id: String,
        elapsed_ms: u64,
        revision_number: u32,
    },
    /// A durable unit was satisfied from the store instead of executing.
    UnitReplayed { run_id: RunId, unit_id: String },
    /// A durable unit attempt failed and will be retried.
    UnitRetrying {
        run_id: RunId,
        unit_id: String,
        attempt: u32,
        backoff_ms: u64,
        error: String,
    },
    /// Run reached the terminal edge.
    RunComplete {
        run_id: RunId,
        steps: usize,
        revision_number: u32,
    },
    /// Run failed or was cancelled.
    RunError { run_id: RunId, error: String },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeCompleted { run_id, .. }
            | Self::UnitReplayed { run_id, .. }
            | Self::UnitRetrying { run_id, .. }
            | Self::RunComplete { run_id, .. }
            | Self::RunError { run_id, .. } => run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_queries_from_valid_value() {
        let q = Queries::from_value(&json!({"queries": ["a", "b"]})).unwrap();
        assert_eq!(q.queries, vec!["a", "b"]);
    }

    #[test]
    fn test_queries_rejects_bad_shapes() {
        for bad in [
            json!(["a"]),
            json!({}),
            json!({"queries": "a"}),
            json!({"queries": ["a", 3]}),
        ] {
            let err = Queries::from_value(&bad).unwrap_err();
            assert!(matches!(err, RedraftError::SchemaViolation(_)), "{bad}");
        }
    }

    #[test]
    fn test_search_hit_defaults() {
        let hit: SearchHit = serde_json::from_value(json!({"content": "snippet"})).unwrap();
        assert_eq!(hit.content, "snippet");
        assert!(hit.url.is_empty());
        assert!(hit.score.is_none());
    }
}
