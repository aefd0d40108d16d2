use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use redraft_core::error::RedraftError;
use redraft_core::event::EventBus;
use redraft_core::state::{ResearchState, RunInput, StateField};
use redraft_core::types::{RunId, WorkflowEvent};

use super::node::Services;
use super::router::Target;
use super::runtime::GraphRuntime;

/// One entry of the step trace.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step: usize,
    pub node_id: String,
    pub fields_written: Vec<StateField>,
    pub elapsed_ms: u64,
    /// `revision_number` after the merge.
    pub revision_number: u32,
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub run_id: RunId,
    pub state: ResearchState,
    pub steps: Vec<StepRecord>,
    pub total_elapsed_ms: u64,
}

impl ExecutionResult {
    /// How many times `node_id` executed.
    pub fn executions_of(&self, node_id: &str) -> usize {
        self.steps.iter().filter(|s| s.node_id == node_id).count()
    }
}

/// A run that stopped before reaching the terminal edge.
#[derive(Debug)]
pub struct RunFailure {
    /// Failing node; `None` when the run never started (invalid input).
    pub node_id: Option<String>,
    pub error: RedraftError,
    /// State as of the last merged node.
    pub state: ResearchState,
    /// Node ids in execution order, including the failing one.
    pub trace: Vec<String>,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node_id {
            Some(ref node) => write!(f, "node '{}' failed: {}", node, self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Walks a [`GraphRuntime`] from its entry node until a terminal edge.
///
/// Nodes run strictly one at a time; each update is merged before the next
/// edge is resolved.
pub struct GraphExecutor {
    runtime: Arc<GraphRuntime>,
    event_bus: Option<Arc<EventBus>>,
}

impl GraphExecutor {
    pub fn new(runtime: Arc<GraphRuntime>) -> Self {
        Self {
            runtime,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn runtime(&self) -> &GraphRuntime {
        &self.runtime
    }

    /// Execute a run under a fresh run id.
    pub async fn execute(
        &self,
        input: RunInput,
        services: &Services,
    ) -> Result<ExecutionResult, RunFailure> {
        self.run(RunId::new(), input, services, None).await
    }

    pub async fn run(
        &self,
        run_id: RunId,
        input: RunInput,
        services: &Services,
        cancel: Option<&CancellationToken>,
    ) -> Result<ExecutionResult, RunFailure> {
        let start = Instant::now();
        let mut state = match input.into_state() {
            Ok(s) => s,
            Err(e) => {
                return Err(self.fail(&run_id, None, e, ResearchState::default(), vec![]));
            }
        };
        let max_steps = match self.runtime.step_limit(&state) {
            Ok(n) => n,
            Err(e) => return Err(self.fail(&run_id, None, e, state, vec![])),
        };

        self.publish(WorkflowEvent::RunStarted {
            run_id: run_id.clone(),
            durable: false,
        });
        info!(run_id = %run_id, entry = %self.runtime.entry(), "Graph run started");

        let mut steps: Vec<StepRecord> = Vec::new();
        let mut trace: Vec<String> = Vec::new();
        let mut current = self.runtime.entry().to_string();

        loop {
            let step = steps.len();
            if cancel.is_some_and(|c| c.is_cancelled()) {
                return Err(self.fail(&run_id, None, RedraftError::Cancelled, state, trace));
            }
            if step >= max_steps {
                let e = RedraftError::BoundViolation(format!(
                    "step limit {} reached before the graph terminated",
                    max_steps
                ));
                return Err(self.fail(&run_id, Some(current), e, state, trace));
            }

            trace.push(current.clone());
            self.publish(WorkflowEvent::NodeStarted {
                run_id: run_id.clone(),
                step,
                node_id: current.clone(),
            });
            debug!(run_id = %run_id, node_id = %current, step, "Executing node");

            let node_start = Instant::now();
            let fields_written = match self.runtime.run_node(&current, &state, services).await {
                Ok(update) => match state.apply(&current, update) {
                    Ok(fields) => fields,
                    Err(e) => return Err(self.fail(&run_id, Some(current), e, state, trace)),
                },
                Err(e) => return Err(self.fail(&run_id, Some(current), e, state, trace)),
            };
            let elapsed_ms = node_start.elapsed().as_millis() as u64;

            info!(
                run_id = %run_id,
                node_id = %current,
                step,
                elapsed_ms,
                revision_number = state.revision_number,
                "Node complete"
            );
            self.publish(WorkflowEvent::NodeCompleted {
                run_id: run_id.clone(),
                step,
                node_id: current.clone(),
                elapsed_ms,
                revision_number: state.revision_number,
            });
            steps.push(StepRecord {
                step,
                node_id: current.clone(),
                fields_written,
                elapsed_ms,
                revision_number: state.revision_number,
            });

            match self.runtime.next(&current, &state) {
                Ok(Target::End) => break,
                Ok(Target::Node(next)) => current = next,
                Err(e) => return Err(self.fail(&run_id, Some(current), e, state, trace)),
            }
        }

        let total_elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            run_id = %run_id,
            steps = steps.len(),
            revision_number = state.revision_number,
            total_elapsed_ms,
            "Graph run complete"
        );
        self.publish(WorkflowEvent::RunComplete {
            run_id: run_id.clone(),
            steps: steps.len(),
            revision_number: state.revision_number,
        });

        Ok(ExecutionResult {
            run_id,
            state,
            steps,
            total_elapsed_ms,
        })
    }

    fn fail(
        &self,
        run_id: &RunId,
        node_id: Option<String>,
        error: RedraftError,
        state: ResearchState,
        trace: Vec<String>,
    ) -> RunFailure {
        error!(run_id = %run_id, node_id = ?node_id, error = %error, "Graph run failed");
        self.publish(WorkflowEvent::RunError {
            run_id: run_id.clone(),
            error: error.to_string(),
        });
        RunFailure {
            node_id,
            error,
            state,
            trace,
        }
    }

    fn publish(&self, event: WorkflowEvent) {
        if let Some(ref bus) = self.event_bus {
            bus.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use futures::future::BoxFuture;
    use redraft_core::error::Result;
    use redraft_core::state::StateUpdate;
    use redraft_test_utils::{MockGeneration, MockSearch};

    use crate::graph::node::Node;
    use crate::graph::router::{RevisionRouter, Route, Router};
    use crate::graph::runtime::GraphBuilder;

    /// Writes a draft and bumps the revision, like a writer would.
    struct Bump;

    impl Node for Bump {
        fn id(&self) -> &'static str {
            "bump"
        }
        fn reads(&self) -> &'static [StateField] {
            &[StateField::RevisionNumber]
        }
        fn writes(&self) -> &'static [StateField] {
            &[StateField::Draft, StateField::RevisionNumber]
        }
        fn execute<'a>(
            &'a self,
            state: &'a ResearchState,
            _services: &'a Services,
        ) -> BoxFuture<'a, Result<StateUpdate>> {
            Box::pin(async move {
                Ok(StateUpdate::new()
                    .with_draft(format!("draft {}", state.revision_number))
                    .with_revision_number(state.revision_number + 1))
            })
        }
    }

    /// Writes three fields but declares one.
    struct Sneaky;

    impl Node for Sneaky {
        fn id(&self) -> &'static str {
            "sneaky"
        }
        fn reads(&self) -> &'static [StateField] {
            &[]
        }
        fn writes(&self) -> &'static [StateField] {
            &[StateField::Critique]
        }
        fn execute<'a>(
            &'a self,
            _state: &'a ResearchState,
            _services: &'a Services,
        ) -> BoxFuture<'a, Result<StateUpdate>> {
            Box::pin(async move { Ok(StateUpdate::new().with_critique("c").with_plan("p")) })
        }
    }

    /// Records the revision number it is asked about.
    struct Observing {
        inner: RevisionRouter,
        seen: Arc<Mutex<Vec<u32>>>,
    }

    impl Router for Observing {
        fn route(&self, state: &ResearchState) -> Result<Route> {
            self.seen.lock().unwrap().push(state.revision_number);
            self.inner.route(state)
        }
        fn targets(&self) -> Vec<String> {
            self.inner.targets()
        }
    }

    fn services() -> Services {
        Services::new(Arc::new(MockGeneration::new()), Arc::new(MockSearch::default()))
    }

    #[tokio::test]
    async fn test_router_sees_merged_increment() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let runtime = GraphBuilder::new()
            .entry("bump")
            .node(Bump)
            .conditional_edge(
                "bump",
                Observing {
                    inner: RevisionRouter::new("bump"),
                    seen: seen.clone(),
                },
            )
            .max_steps(16)
            .build()
            .unwrap();
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let executor = GraphExecutor::new(Arc::new(runtime)).with_event_bus(bus);

        let result = executor
            .execute(RunInput::new("t", 3), &services())
            .await
            .unwrap();

        let written: Vec<u32> = result.steps.iter().map(|s| s.revision_number).collect();
        assert_eq!(written, vec![2, 3, 4]);
        assert_eq!(*seen.lock().unwrap(), written);
        assert_eq!(result.state.draft, "draft 3");
        assert_eq!(result.executions_of("bump"), 3);

        assert!(matches!(rx.recv().await.unwrap(), WorkflowEvent::RunStarted { durable: false, .. }));
    }

    #[tokio::test]
    async fn test_undeclared_write_is_rejected() {
        let runtime = GraphBuilder::new()
            .entry("sneaky")
            .node(Sneaky)
            .edge("sneaky", Target::End)
            .build()
            .unwrap();
        let failure = GraphExecutor::new(Arc::new(runtime))
            .execute(RunInput::new("t", 1), &services())
            .await
            .unwrap_err();
        assert_eq!(failure.node_id.as_deref(), Some("sneaky"));
        assert!(matches!(failure.error, RedraftError::InvariantViolation { .. }));
        assert!(failure.state.plan.is_empty());
    }

    #[tokio::test]
    async fn test_step_limit_is_bound_violation() {
        // Self-loop with a static edge: only the step limit stops it
        let runtime = GraphBuilder::new()
            .entry("bump")
            .node(Bump)
            .edge("bump", "bump")
            .max_steps(3)
            .build()
            .unwrap();
        assert!(runtime.has_cycle());

        let failure = GraphExecutor::new(Arc::new(runtime))
            .execute(RunInput::new("t", 1), &services())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, RedraftError::BoundViolation(_)));
        assert_eq!(failure.trace, vec!["bump", "bump", "bump"]);
        assert_eq!(failure.state.revision_number, 4);
    }

    #[tokio::test]
    async fn test_invalid_input_runs_nothing() {
        let runtime = GraphBuilder::new()
            .entry("bump")
            .node(Bump)
            .edge("bump", Target::End)
            .build()
            .unwrap();
        let failure = GraphExecutor::new(Arc::new(runtime))
            .execute(RunInput::new("  ", 1), &services())
            .await
            .unwrap_err();
        assert!(failure.node_id.is_none());
        assert!(failure.trace.is_empty());
        assert!(matches!(failure.error, RedraftError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_node() {
        let runtime = GraphBuilder::new()
            .entry("bump")
            .node(Bump)
            .edge("bump", Target::End)
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let failure = GraphExecutor::new(Arc::new(runtime))
            .run(RunId::new(), RunInput::new("t", 1), &services(), Some(&cancel))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, RedraftError::Cancelled));
        assert_eq!(failure.state.revision_number, 1);
    }
}
