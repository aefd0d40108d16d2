//! The five writer nodes and the graph that wires them together.

pub mod generate;
pub mod plan;
pub mod reflect;
pub mod research;

use redraft_core::config::AppConfig;
use redraft_core::error::Result;

use crate::graph::{GraphBuilder, GraphRuntime, RevisionRouter, Target};
use crate::prompts::Prompts;

pub use generate::GenerateNode;
pub use plan::PlanNode;
pub use reflect::ReflectNode;
pub use research::{ResearchNode, ResearchSettings};

pub const PLANNER: &str = "planner";
pub const RESEARCH_PLAN: &str = "research_plan";
pub const GENERATE: &str = "generate";
pub const REFLECT: &str = "reflect";
pub const RESEARCH_CRITIQUE: &str = "research_critique";

/// Shape and settings of the writer graph.
#[derive(Debug, Clone)]
pub struct GraphOptions {
    /// Loop generate -> reflect -> research_critique -> generate until the
    /// revision budget is used up. When false the graph ends after generate.
    pub critique_loop: bool,
    /// Optional ceiling on node executions per run.
    pub max_steps: Option<usize>,
    pub research: ResearchSettings,
    pub prompts: Prompts,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            critique_loop: true,
            max_steps: None,
            research: ResearchSettings::default(),
            prompts: Prompts::default(),
        }
    }
}

impl GraphOptions {
    /// Options from the `[workflow]`, `[search]` and `[prompts]` sections.
    pub fn from_config(config: &AppConfig, critique_loop: bool) -> Self {
        Self {
            critique_loop,
            max_steps: config.workflow.max_steps,
            research: ResearchSettings {
                max_queries: config.search.max_queries,
                max_results: config.search.max_results,
                concurrent: config.workflow.concurrent_search,
            },
            prompts: Prompts::from_config(&config.prompts),
        }
    }
}

/// Build the writer graph:
///
/// ```text
/// planner -> research_plan -> generate
/// generate => Terminate | reflect
/// reflect -> research_critique -> generate
/// ```
///
/// With the critique loop each remaining draft costs three steps (generate,
/// reflect, research_critique; the two research-side prefix steps stand in
/// for the last draft's unused reflect pair), so a run is bounded by
/// `3 * (max_revisions - revision_number + 1)` steps.
pub fn build_writer_graph(options: GraphOptions) -> Result<GraphRuntime> {
    let GraphOptions {
        critique_loop,
        max_steps,
        research,
        prompts,
    } = options;

    let builder = GraphBuilder::new()
        .entry(PLANNER)
        .node(PlanNode::new(prompts.plan))
        .node(ResearchNode::for_plan(prompts.research_plan, research))
        .node(GenerateNode::new(prompts.writer))
        .edge(PLANNER, RESEARCH_PLAN)
        .edge(RESEARCH_PLAN, GENERATE);
    let builder = match max_steps {
        Some(n) => builder.max_steps(n),
        None => builder,
    };

    let builder = if critique_loop {
        builder
            .node(ReflectNode::new(prompts.reflection))
            .node(ResearchNode::for_critique(prompts.research_critique, research))
            .conditional_edge(GENERATE, RevisionRouter::new(REFLECT))
            .edge(REFLECT, RESEARCH_CRITIQUE)
            .edge(RESEARCH_CRITIQUE, GENERATE)
            .step_budget(0, 3)
    } else {
        builder.edge(GENERATE, Target::End)
    };

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use redraft_core::error::RedraftError;
    use redraft_core::state::RunInput;
    use redraft_test_utils::{MockGeneration, MockSearch};

    use crate::graph::{GraphExecutor, Services};

    fn executor(critique_loop: bool) -> GraphExecutor {
        let runtime = build_writer_graph(GraphOptions {
            critique_loop,
            ..Default::default()
        })
        .unwrap();
        GraphExecutor::new(Arc::new(runtime))
    }

    #[test]
    fn test_graph_shapes() {
        let full = build_writer_graph(GraphOptions::default()).unwrap();
        assert_eq!(
            full.node_ids(),
            vec![GENERATE, PLANNER, REFLECT, RESEARCH_CRITIQUE, RESEARCH_PLAN]
        );
        assert!(full.has_cycle());
        assert_eq!(full.step_budget(), Some(crate::graph::StepBudget { fixed: 0, per_revision: 3 }));

        let linear = build_writer_graph(GraphOptions {
            critique_loop: false,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(linear.node_ids(), vec![GENERATE, PLANNER, RESEARCH_PLAN]);
        assert!(!linear.has_cycle());
    }

    #[tokio::test]
    async fn test_generate_receives_task_plan_and_content() {
        let generation = Arc::new(MockGeneration::new().with_queries(&["q"]));
        let services = Services::new(generation.clone(), Arc::new(MockSearch::new(2)));

        let result = executor(false)
            .execute(RunInput::new("Write about tides", 1), &services)
            .await
            .unwrap();

        let calls = generation.calls();
        // planner, research_plan, generate
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].user, "Write about tides\n\nHere is my plan:\n\nreply 1");
        assert!(calls[2].system.contains("q #0\n\nq #1"));
        assert_eq!(result.state.draft, "reply 3");
        assert_eq!(result.state.revision_number, 2);
    }

    #[tokio::test]
    async fn test_reflect_reads_latest_draft() {
        let generation = Arc::new(MockGeneration::new());
        let services = Services::new(generation.clone(), Arc::new(MockSearch::new(1)));

        let result = executor(true)
            .execute(RunInput::new("t", 2), &services)
            .await
            .unwrap();

        // planner=1, research_plan=2, generate=3, reflect=4, research_critique=5, generate=6
        let calls = generation.calls();
        assert_eq!(calls[3].user, "reply 3");
        assert_eq!(calls[4].user, "reply 4");
        assert_eq!(result.state.critique, "reply 4");
        assert_eq!(result.state.draft, "reply 6");
    }

    #[tokio::test]
    async fn test_large_revision_budget_runs_to_completion() {
        let generation = Arc::new(MockGeneration::new());
        let services = Services::new(generation.clone(), Arc::new(MockSearch::new(1)));

        let result = executor(true)
            .execute(RunInput::new("t", 40), &services)
            .await
            .unwrap();
        assert_eq!(result.executions_of(GENERATE), 40);
        assert_eq!(result.executions_of(REFLECT), 39);
        assert_eq!(result.steps.len(), 3 * 40);
        assert_eq!(result.state.revision_number, 41);
    }

    #[tokio::test]
    async fn test_budget_over_ceiling_is_rejected_before_any_call() {
        let runtime = build_writer_graph(GraphOptions {
            max_steps: Some(64),
            ..Default::default()
        })
        .unwrap();
        let generation = Arc::new(MockGeneration::new());
        let services = Services::new(generation.clone(), Arc::new(MockSearch::new(1)));

        let failure = GraphExecutor::new(Arc::new(runtime))
            .execute(RunInput::new("t", 25), &services)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, RedraftError::InvalidInput(_)));
        assert!(failure.node_id.is_none());
        assert_eq!(generation.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_plan_failure_stops_the_run() {
        let generation = Arc::new(MockGeneration::new().fail_on_call(1));
        let search = Arc::new(MockSearch::default());
        let services = Services::new(generation.clone(), search.clone());

        let failure = executor(true)
            .execute(RunInput::new("t", 2), &services)
            .await
            .unwrap_err();
        assert_eq!(failure.node_id.as_deref(), Some(PLANNER));
        assert!(matches!(failure.error, RedraftError::LlmRequest(_)));
        assert_eq!(generation.total_calls(), 1);
        assert_eq!(search.total_calls(), 0);
    }
}
