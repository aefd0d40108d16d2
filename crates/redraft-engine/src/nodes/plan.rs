use futures::future::BoxFuture;
use tracing::debug;

use redraft_core::error::Result;
use redraft_core::state::{ResearchState, StateField, StateUpdate};

use super::PLANNER;
use crate::graph::{Node, Services};

/// Outlines the task with one generation call.
pub struct PlanNode {
    instruction: String,
}

impl PlanNode {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
        }
    }
}

impl Node for PlanNode {
    fn id(&self) -> &'static str {
        PLANNER
    }

    fn name(&self) -> &str {
        "Plan"
    }

    fn reads(&self) -> &'static [StateField] {
        &[StateField::Task]
    }

    fn writes(&self) -> &'static [StateField] {
        &[StateField::Plan]
    }

    fn execute<'a>(
        &'a self,
        state: &'a ResearchState,
        services: &'a Services,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move {
            let plan = services.generation.invoke(&self.instruction, &state.task).await?;
            debug!(chars = plan.len(), "Plan written");
            Ok(StateUpdate::new().with_plan(plan))
        })
    }
}
