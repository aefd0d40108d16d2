use futures::future::BoxFuture;
use tracing::debug;

use redraft_core::error::{RedraftError, Result};
use redraft_core::state::{ResearchState, StateField, StateUpdate};

use super::GENERATE;
use crate::graph::{Node, Services};
use crate::prompts::fill_content;

/// Writes (or rewrites) the draft from the plan and gathered content.
///
/// Always advances `revision_number` by one, including on the first pass.
pub struct GenerateNode {
    instruction: String,
}

impl GenerateNode {
    /// `instruction` should contain `{content}`.
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
        }
    }

    fn user_message(state: &ResearchState) -> String {
        format!("{}\n\nHere is my plan:\n\n{}", state.task, state.plan)
    }
}

impl Node for GenerateNode {
    fn id(&self) -> &'static str {
        GENERATE
    }

    fn name(&self) -> &str {
        "Generate"
    }

    fn reads(&self) -> &'static [StateField] {
        &[
            StateField::Task,
            StateField::Plan,
            StateField::Content,
            StateField::RevisionNumber,
        ]
    }

    fn writes(&self) -> &'static [StateField] {
        &[StateField::Draft, StateField::RevisionNumber]
    }

    fn execute<'a>(
        &'a self,
        state: &'a ResearchState,
        services: &'a Services,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move {
            let next = state.revision_number.checked_add(1).ok_or_else(|| {
                RedraftError::BoundViolation(format!(
                    "revision_number {} cannot advance",
                    state.revision_number
                ))
            })?;
            let context = state.content.join("\n\n");
            let system = fill_content(&self.instruction, &context);
            let draft = services
                .generation
                .invoke(&system, &Self::user_message(state))
                .await?;
            debug!(
                revision_number = state.revision_number,
                snippets = state.content.len(),
                "Draft written"
            );
            Ok(StateUpdate::new()
                .with_draft(draft)
                .with_revision_number(next))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use redraft_test_utils::{MockGeneration, MockSearch};

    fn state(revision_number: u32, max_revisions: u32) -> ResearchState {
        ResearchState {
            task: "rust async".into(),
            plan: "outline".into(),
            content: vec!["note a".into(), "note b".into()],
            revision_number,
            max_revisions,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_draft_advances_revision() {
        let generation = Arc::new(MockGeneration::new());
        let services = Services::new(generation.clone(), Arc::new(MockSearch::new(1)));
        let node = GenerateNode::new("Notes:\n{content}");

        let update = node.execute(&state(1, 2), &services).await.unwrap();
        assert_eq!(update.draft.as_deref(), Some("reply 1"));
        assert_eq!(update.revision_number, Some(2));
        let call = &generation.calls()[0];
        assert_eq!(call.system, "Notes:\nnote a\n\nnote b");
        assert_eq!(call.user, "rust async\n\nHere is my plan:\n\noutline");
    }

    #[tokio::test]
    async fn test_revision_at_u32_max_is_a_bound_violation() {
        let generation = Arc::new(MockGeneration::new());
        let services = Services::new(generation.clone(), Arc::new(MockSearch::new(1)));
        let node = GenerateNode::new("{content}");

        let err = node
            .execute(&state(u32::MAX, u32::MAX), &services)
            .await
            .unwrap_err();
        assert!(matches!(err, RedraftError::BoundViolation(_)));
        assert_eq!(generation.total_calls(), 0);
    }
}
