use redraft_core::error::{RedraftError, Result};
use redraft_core::state::ResearchState;

/// Successor of a static edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Node(String),
    End,
}

impl From<&str> for Target {
    fn from(id: &str) -> Self {
        Self::Node(id.to_string())
    }
}

/// Outcome of a conditional edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Continue(String),
    Terminate,
}

/// Chooses the successor of a node from the merged state.
pub trait Router: Send + Sync {
    fn route(&self, state: &ResearchState) -> Result<Route>;

    /// Every node id `route` may return in `Route::Continue`.
    fn targets(&self) -> Vec<String>;
}

/// Ends the run once the revision budget is used up, otherwise loops back.
///
/// Evaluated after `generate` has merged its increment, so it sees the new
/// `revision_number`.
pub struct RevisionRouter {
    loop_target: String,
}

impl RevisionRouter {
    pub fn new(loop_target: impl Into<String>) -> Self {
        Self {
            loop_target: loop_target.into(),
        }
    }
}

impl Router for RevisionRouter {
    fn route(&self, state: &ResearchState) -> Result<Route> {
        if state.max_revisions == 0 || state.revision_number == 0 {
            return Err(RedraftError::BoundViolation(format!(
                "router needs revision_number and max_revisions (got {} and {})",
                state.revision_number, state.max_revisions
            )));
        }
        // One past the budget is the normal exit; further means a missed check
        if state.revision_number > state.max_revisions.saturating_add(1) {
            return Err(RedraftError::BoundViolation(format!(
                "revision_number {} overshot max_revisions {}",
                state.revision_number, state.max_revisions
            )));
        }
        if state.budget_exhausted() {
            Ok(Route::Terminate)
        } else {
            Ok(Route::Continue(self.loop_target.clone()))
        }
    }

    fn targets(&self) -> Vec<String> {
        vec![self.loop_target.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(revision_number: u32, max_revisions: u32) -> ResearchState {
        ResearchState {
            task: "t".into(),
            revision_number,
            max_revisions,
            ..Default::default()
        }
    }

    #[test]
    fn test_continues_within_budget() {
        let router = RevisionRouter::new("reflect");
        assert_eq!(
            router.route(&state(2, 2)).unwrap(),
            Route::Continue("reflect".into())
        );
    }

    #[test]
    fn test_terminates_past_budget() {
        let router = RevisionRouter::new("reflect");
        assert_eq!(router.route(&state(2, 1)).unwrap(), Route::Terminate);
        assert_eq!(router.route(&state(3, 2)).unwrap(), Route::Terminate);
    }

    #[test]
    fn test_same_state_same_decision() {
        let router = RevisionRouter::new("reflect");
        for s in [state(1, 3), state(3, 3), state(4, 3)] {
            let first = router.route(&s).unwrap();
            for _ in 0..5 {
                assert_eq!(router.route(&s).unwrap(), first);
            }
        }
    }

    #[test]
    fn test_overshoot_is_bound_violation() {
        let router = RevisionRouter::new("reflect");
        assert!(matches!(
            router.route(&state(4, 2)),
            Err(RedraftError::BoundViolation(_))
        ));
        assert!(matches!(
            router.route(&state(1, 0)),
            Err(RedraftError::BoundViolation(_))
        ));
    }

    #[test]
    fn test_target_from_str() {
        assert_eq!(Target::from("generate"), Target::Node("generate".into()));
        assert_eq!(RevisionRouter::new("reflect").targets(), vec!["reflect"]);
    }
}
