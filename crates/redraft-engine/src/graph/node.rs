use std::sync::Arc;

use futures::future::BoxFuture;

use redraft_core::error::Result;
use redraft_core::state::{ResearchState, StateField, StateUpdate};
use redraft_core::traits::{GenerationService, SearchService};

/// External service handles passed to every node call.
#[derive(Clone)]
pub struct Services {
    pub generation: Arc<dyn GenerationService>,
    pub search: Arc<dyn SearchService>,
}

impl Services {
    pub fn new(generation: Arc<dyn GenerationService>, search: Arc<dyn SearchService>) -> Self {
        Self { generation, search }
    }
}

/// A unit of work in the graph.
///
/// A node receives a read-only snapshot of the state and returns a partial
/// update. Only the engine merges updates into the state, and it rejects
/// updates touching fields outside `writes()`.
pub trait Node: Send + Sync {
    /// Unique id, used for edges, the step trace and durable unit ids.
    fn id(&self) -> &'static str;

    /// Human-readable name.
    fn name(&self) -> &str {
        self.id()
    }

    /// Fields this node reads.
    fn reads(&self) -> &'static [StateField];

    /// Fields this node may write.
    fn writes(&self) -> &'static [StateField];

    fn execute<'a>(
        &'a self,
        state: &'a ResearchState,
        services: &'a Services,
    ) -> BoxFuture<'a, Result<StateUpdate>>;
}
