use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RedraftError, Result};

/// A field of the shared run state. Nodes declare which fields they read and
/// which they write so the builder and the step trace can refer to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateField {
    Task,
    Plan,
    Content,
    Draft,
    Critique,
    RevisionNumber,
    MaxRevisions,
}

impl StateField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Plan => "plan",
            Self::Content => "content",
            Self::Draft => "draft",
            Self::Critique => "critique",
            Self::RevisionNumber => "revision_number",
            Self::MaxRevisions => "max_revisions",
        }
    }
}

impl fmt::Display for StateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The document threaded through every node of a run.
///
/// `task` and `max_revisions` have no counterpart in [`StateUpdate`], so no
/// node can change them once the run has started.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchState {
    pub task: String,
    pub plan: String,
    /// Reference snippets, in insertion order. Append-only.
    pub content: Vec<String>,
    pub draft: String,
    pub critique: String,
    pub revision_number: u32,
    pub max_revisions: u32,
}

/// Partial update returned by a node. Every `Some` field replaces the
/// corresponding state field when the engine merges it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critique: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_number: Option<u32>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = Some(plan.into());
        self
    }

    pub fn with_content(mut self, content: Vec<String>) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_draft(mut self, draft: impl Into<String>) -> Self {
        self.draft = Some(draft.into());
        self
    }

    pub fn with_critique(mut self, critique: impl Into<String>) -> Self {
        self.critique = Some(critique.into());
        self
    }

    pub fn with_revision_number(mut self, revision_number: u32) -> Self {
        self.revision_number = Some(revision_number);
        self
    }

    /// Fields this update would write, in declaration order.
    pub fn fields(&self) -> Vec<StateField> {
        let mut fields = Vec::new();
        if self.plan.is_some() {
            fields.push(StateField::Plan);
        }
        if self.content.is_some() {
            fields.push(StateField::Content);
        }
        if self.draft.is_some() {
            fields.push(StateField::Draft);
        }
        if self.critique.is_some() {
            fields.push(StateField::Critique);
        }
        if self.revision_number.is_some() {
            fields.push(StateField::RevisionNumber);
        }
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }
}

impl ResearchState {
    /// Merge a node's update into the state.
    ///
    /// Rejects updates that would shrink or rewrite `content`, or move
    /// `revision_number` by anything other than +1. Nothing is written when
    /// the update is rejected.
    pub fn apply(&mut self, node: &str, update: StateUpdate) -> Result<Vec<StateField>> {
        let fields = update.fields();

        if let Some(ref content) = update.content {
            if content.len() < self.content.len() {
                return Err(RedraftError::InvariantViolation {
                    node: node.to_string(),
                    message: format!(
                        "content shrank from {} to {} entries",
                        self.content.len(),
                        content.len()
                    ),
                });
            }
            if content[..self.content.len()] != self.content[..] {
                return Err(RedraftError::InvariantViolation {
                    node: node.to_string(),
                    message: "existing content entries were modified".to_string(),
                });
            }
        }

        if let Some(next) = update.revision_number {
            if next != self.revision_number + 1 {
                return Err(RedraftError::InvariantViolation {
                    node: node.to_string(),
                    message: format!(
                        "revision_number must advance by one ({} -> {})",
                        self.revision_number, next
                    ),
                });
            }
        }

        if let Some(plan) = update.plan {
            self.plan = plan;
        }
        if let Some(content) = update.content {
            self.content = content;
        }
        if let Some(draft) = update.draft {
            self.draft = draft;
        }
        if let Some(critique) = update.critique {
            self.critique = critique;
        }
        if let Some(revision_number) = update.revision_number {
            self.revision_number = revision_number;
        }

        Ok(fields)
    }

    /// Whether the revision budget is used up.
    pub fn budget_exhausted(&self) -> bool {
        self.revision_number > self.max_revisions
    }
}

/// Caller-supplied starting values for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInput {
    pub task: String,
    pub max_revisions: u32,
    #[serde(default = "default_revision_number")]
    pub revision_number: u32,
    #[serde(default)]
    pub content: Vec<String>,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub draft: String,
    #[serde(default)]
    pub critique: String,
}

fn default_revision_number() -> u32 {
    1
}

impl RunInput {
    pub fn new(task: impl Into<String>, max_revisions: u32) -> Self {
        Self {
            task: task.into(),
            max_revisions,
            revision_number: default_revision_number(),
            content: vec![],
            plan: String::new(),
            draft: String::new(),
            critique: String::new(),
        }
    }

    pub fn with_revision_number(mut self, revision_number: u32) -> Self {
        self.revision_number = revision_number;
        self
    }

    pub fn with_content(mut self, content: Vec<String>) -> Self {
        self.content = content;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.task.trim().is_empty() {
            return Err(RedraftError::InvalidInput("task must not be empty".into()));
        }
        if self.max_revisions == 0 {
            return Err(RedraftError::InvalidInput(
                "max_revisions must be at least 1".into(),
            ));
        }
        if self.revision_number == 0 || self.revision_number > self.max_revisions {
            return Err(RedraftError::InvalidInput(format!(
                "revision_number must be within 1..={} (got {})",
                self.max_revisions, self.revision_number
            )));
        }
        Ok(())
    }

    /// Validate and build the initial state.
    pub fn into_state(self) -> Result<ResearchState> {
        self.validate()?;
        Ok(ResearchState {
            task: self.task,
            plan: self.plan,
            content: self.content,
            draft: self.draft,
            critique: self.critique,
            revision_number: self.revision_number,
            max_revisions: self.max_revisions,
        })
    }
}
