use futures::future::BoxFuture;

use redraft_core::error::Result;
use redraft_core::state::{ResearchState, StateField, StateUpdate};

use super::REFLECT;
use crate::graph::{Node, Services};

/// Critiques the current draft.
pub struct ReflectNode {
    instruction: String,
}

impl ReflectNode {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
        }
    }
}

impl Node for ReflectNode {
    fn id(&self) -> &'static str {
        REFLECT
    }

    fn name(&self) -> &str {
        "Reflect"
    }

    fn reads(&self) -> &'static [StateField] {
        &[StateField::Draft]
    }

    fn writes(&self) -> &'static [StateField] {
        &[StateField::Critique]
    }

    fn execute<'a>(
        &'a self,
        state: &'a ResearchState,
        services: &'a Services,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move {
            let critique = services.generation.invoke(&self.instruction, &state.draft).await?;
            Ok(StateUpdate::new().with_critique(critique))
        })
    }
}
