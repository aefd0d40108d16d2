use futures::future::{try_join_all, BoxFuture};
use tracing::{debug, warn};

use redraft_core::error::Result;
use redraft_core::state::{ResearchState, StateField, StateUpdate};
use redraft_core::traits::request_queries;
use redraft_core::types::SearchHit;

use super::{RESEARCH_CRITIQUE, RESEARCH_PLAN};
use crate::graph::{Node, Services};

/// Limits for one research pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResearchSettings {
    pub max_queries: usize,
    pub max_results: usize,
    /// Issue the per-query searches concurrently. Append order is unchanged.
    pub concurrent: bool,
}

impl Default for ResearchSettings {
    fn default() -> Self {
        Self {
            max_queries: 3,
            max_results: 2,
            concurrent: false,
        }
    }
}

/// Asks for search queries, runs them, and appends every hit's content.
///
/// The same body serves both research nodes; they differ in which field
/// conditions the queries (`task` or `critique`).
pub struct ResearchNode {
    id: &'static str,
    name: &'static str,
    source: StateField,
    instruction: String,
    settings: ResearchSettings,
}

impl ResearchNode {
    /// Research conditioned on the task (`research_plan`).
    pub fn for_plan(instruction: impl Into<String>, settings: ResearchSettings) -> Self {
        Self {
            id: RESEARCH_PLAN,
            name: "Research for plan",
            source: StateField::Task,
            instruction: instruction.into(),
            settings,
        }
    }

    /// Research conditioned on the critique (`research_critique`).
    pub fn for_critique(instruction: impl Into<String>, settings: ResearchSettings) -> Self {
        Self {
            id: RESEARCH_CRITIQUE,
            name: "Research for critique",
            source: StateField::Critique,
            instruction: instruction.into(),
            settings,
        }
    }

    fn conditioning<'s>(&self, state: &'s ResearchState) -> &'s str {
        match self.source {
            StateField::Critique => &state.critique,
            _ => &state.task,
        }
    }

    async fn search_all(&self, queries: &[String], services: &Services) -> Result<Vec<Vec<SearchHit>>> {
        let max_results = self.settings.max_results;
        if self.settings.concurrent {
            return try_join_all(queries.iter().map(|q| services.search.search(q, max_results))).await;
        }
        let mut batches = Vec::with_capacity(queries.len());
        for q in queries {
            batches.push(services.search.search(q, max_results).await?);
        }
        Ok(batches)
    }
}

impl Node for ResearchNode {
    fn id(&self) -> &'static str {
        self.id
    }

    fn name(&self) -> &str {
        self.name
    }

    fn reads(&self) -> &'static [StateField] {
        match self.source {
            StateField::Critique => &[StateField::Critique, StateField::Content],
            _ => &[StateField::Task, StateField::Content],
        }
    }

    fn writes(&self) -> &'static [StateField] {
        &[StateField::Content]
    }

    fn execute<'a>(
        &'a self,
        state: &'a ResearchState,
        services: &'a Services,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move {
            let extracted = request_queries(
                services.generation.as_ref(),
                &self.instruction,
                self.conditioning(state),
            )
            .await?;

            let mut queries: Vec<String> = extracted
                .queries
                .into_iter()
                .filter(|q| !q.trim().is_empty())
                .collect();
            if queries.len() > self.settings.max_queries {
                warn!(
                    node_id = self.id,
                    returned = queries.len(),
                    kept = self.settings.max_queries,
                    "Too many search queries, dropping the rest"
                );
                queries.truncate(self.settings.max_queries);
            }

            let batches = self.search_all(&queries, services).await?;

            let mut content = state.content.clone();
            for (query, hits) in queries.iter().zip(batches) {
                debug!(node_id = self.id, query = %query, hits = hits.len(), "Search results");
                content.extend(
                    hits.into_iter()
                        .take(self.settings.max_results)
                        .map(|hit| hit.content),
                );
            }
            Ok(StateUpdate::new().with_content(content))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use redraft_core::error::RedraftError;
    use redraft_test_utils::{MockGeneration, MockSearch};

    fn state() -> ResearchState {
        ResearchState {
            task: "rust async".into(),
            critique: "needs benchmarks".into(),
            content: vec!["existing".into()],
            revision_number: 2,
            max_revisions: 2,
            ..Default::default()
        }
    }

    async fn run(
        node: &ResearchNode,
        generation: Arc<MockGeneration>,
        search: Arc<MockSearch>,
    ) -> Result<StateUpdate> {
        let services = Services::new(generation, search);
        node.execute(&state(), &services).await
    }

    #[tokio::test]
    async fn test_appends_hits_in_query_order() {
        let generation = Arc::new(MockGeneration::new().with_queries(&["a", "b"]));
        let search = Arc::new(MockSearch::new(2));
        let node = ResearchNode::for_plan("find things", ResearchSettings::default());

        let update = run(&node, generation.clone(), search.clone()).await.unwrap();
        assert_eq!(
            update.content.unwrap(),
            vec!["existing", "a #0", "a #1", "b #0", "b #1"]
        );
        assert_eq!(generation.calls()[0].user, "rust async");
        assert_eq!(search.queries(), vec![("a".to_string(), 2), ("b".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_critique_conditions_queries() {
        let generation = Arc::new(MockGeneration::new());
        let node = ResearchNode::for_critique("revise", ResearchSettings::default());
        run(&node, generation.clone(), Arc::new(MockSearch::default()))
            .await
            .unwrap();
        assert_eq!(generation.calls()[0].user, "needs benchmarks");
        assert_eq!(node.id(), RESEARCH_CRITIQUE);
    }

    #[tokio::test]
    async fn test_caps_queries_and_results() {
        let generation = Arc::new(MockGeneration::new().with_queries(&["1", "", "2", "3", "4"]));
        let search = Arc::new(MockSearch::new(5).ignoring_cap());
        let node = ResearchNode::for_plan("find", ResearchSettings::default());

        let content = run(&node, generation, search.clone())
            .await
            .unwrap()
            .content
            .unwrap();
        // Blank query skipped, fourth query dropped, two hits per query
        assert_eq!(search.total_calls(), 3);
        assert_eq!(content.len(), 1 + 3 * 2);
    }

    #[tokio::test]
    async fn test_zero_results_contribute_nothing() {
        let generation = Arc::new(MockGeneration::new().with_queries(&["empty", "full"]));
        let search = Arc::new(MockSearch::new(2).with_hits_for("empty", 0));
        let node = ResearchNode::for_plan("find", ResearchSettings::default());

        let content = run(&node, generation, search).await.unwrap().content.unwrap();
        assert_eq!(content, vec!["existing", "full #0", "full #1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_keeps_query_order() {
        let settings = ResearchSettings {
            concurrent: true,
            ..Default::default()
        };
        let generation = Arc::new(MockGeneration::new().with_queries(&["x", "y", "z"]));
        // x answers last, z first
        let search = Arc::new(
            MockSearch::new(1)
                .delay_query("x", Duration::from_secs(3))
                .delay_query("y", Duration::from_secs(2))
                .delay_query("z", Duration::from_secs(1)),
        );
        let node = ResearchNode::for_plan("find", settings);
        let content = run(&node, generation, search.clone())
            .await
            .unwrap()
            .content
            .unwrap();
        assert_eq!(search.completions(), vec!["z", "y", "x"]);
        assert_eq!(content, vec!["existing", "x #0", "y #0", "z #0"]);
    }

    #[tokio::test]
    async fn test_schema_violation_surfaces() {
        let generation =
            Arc::new(MockGeneration::new().with_structured(serde_json::json!({"items": []})));
        let search = Arc::new(MockSearch::default());
        let node = ResearchNode::for_plan("find", ResearchSettings::default());

        let err = run(&node, generation, search.clone()).await.unwrap_err();
        assert!(matches!(err, RedraftError::SchemaViolation(_)));
        assert_eq!(search.total_calls(), 0);
    }
}
