use std::collections::HashMap;
use std::sync::Arc;

use petgraph::graph::{DiGraph, NodeIndex};

use redraft_core::error::{RedraftError, Result};
use redraft_core::state::{ResearchState, StateUpdate};

use super::node::{Node, Services};
use super::router::{Route, Router, Target};

/// Steps a run may take, as a function of its remaining revision budget:
/// `fixed + per_revision * (max_revisions - revision_number + 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepBudget {
    pub fixed: usize,
    pub per_revision: usize,
}

impl StepBudget {
    pub fn steps_for(&self, state: &ResearchState) -> usize {
        let remaining = state.max_revisions.saturating_sub(state.revision_number) as usize + 1;
        self.fixed
            .saturating_add(self.per_revision.saturating_mul(remaining))
    }
}

/// Fluent builder for a [`GraphRuntime`]. All validation happens in `build`.
#[derive(Default)]
pub struct GraphBuilder {
    entry: Option<String>,
    nodes: Vec<Arc<dyn Node>>,
    edges: Vec<(String, Target)>,
    conditional: Vec<(String, Arc<dyn Router>)>,
    max_steps: Option<usize>,
    budget: Option<StepBudget>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(mut self, node_id: impl Into<String>) -> Self {
        self.entry = Some(node_id.into());
        self
    }

    pub fn node(mut self, node: impl Node + 'static) -> Self {
        self.nodes.push(Arc::new(node));
        self
    }

    /// Static edge. `to` is a node id or [`Target::End`].
    pub fn edge(mut self, from: impl Into<String>, to: impl Into<Target>) -> Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    /// Conditional edge: `router` picks the successor of `from` at runtime.
    pub fn conditional_edge(mut self, from: impl Into<String>, router: impl Router + 'static) -> Self {
        self.conditional.push((from.into(), Arc::new(router)));
        self
    }

    /// Hard cap on node executions per run. With a step budget it is a
    /// ceiling checked before the run starts.
    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    /// Loop guard derived from each run's revision budget.
    pub fn step_budget(mut self, fixed: usize, per_revision: usize) -> Self {
        self.budget = Some(StepBudget { fixed, per_revision });
        self
    }

    pub fn build(self) -> Result<GraphRuntime> {
        let entry = self
            .entry
            .ok_or_else(|| RedraftError::GraphConfig("no entry node set".into()))?;

        let mut nodes: HashMap<String, Arc<dyn Node>> = HashMap::new();
        for node in self.nodes {
            let id = node.id().to_string();
            if nodes.insert(id.clone(), node).is_some() {
                return Err(RedraftError::GraphConfig(format!(
                    "node '{}' registered twice",
                    id
                )));
            }
        }

        if !nodes.contains_key(&entry) {
            return Err(RedraftError::GraphConfig(format!(
                "entry node '{}' is not registered",
                entry
            )));
        }

        let mut edges: HashMap<String, Target> = HashMap::new();
        for (from, to) in self.edges {
            if !nodes.contains_key(&from) {
                return Err(RedraftError::GraphConfig(format!(
                    "edge from undeclared node '{}'",
                    from
                )));
            }
            if let Target::Node(ref id) = to {
                if !nodes.contains_key(id) {
                    return Err(RedraftError::GraphConfig(format!(
                        "edge '{}' -> '{}' targets an undeclared node",
                        from, id
                    )));
                }
            }
            if edges.insert(from.clone(), to).is_some() {
                return Err(RedraftError::GraphConfig(format!(
                    "node '{}' has more than one static edge",
                    from
                )));
            }
        }

        let mut routers: HashMap<String, Arc<dyn Router>> = HashMap::new();
        for (from, router) in self.conditional {
            if !nodes.contains_key(&from) {
                return Err(RedraftError::GraphConfig(format!(
                    "conditional edge from undeclared node '{}'",
                    from
                )));
            }
            if edges.contains_key(&from) || routers.contains_key(&from) {
                return Err(RedraftError::GraphConfig(format!(
                    "node '{}' has more than one outgoing edge",
                    from
                )));
            }
            for target in router.targets() {
                if !nodes.contains_key(&target) {
                    return Err(RedraftError::GraphConfig(format!(
                        "router on '{}' may route to undeclared node '{}'",
                        from, target
                    )));
                }
            }
            routers.insert(from, router);
        }

        let mut dangling: Vec<&str> = nodes
            .keys()
            .filter(|id| !edges.contains_key(*id) && !routers.contains_key(*id))
            .map(|id| id.as_str())
            .collect();
        if !dangling.is_empty() {
            dangling.sort_unstable();
            return Err(RedraftError::GraphConfig(format!(
                "nodes without an outgoing edge: {}",
                dangling.join(", ")
            )));
        }

        let cyclic = is_cyclic(&nodes, &edges, &routers);
        if self.max_steps == Some(0) {
            return Err(RedraftError::GraphConfig("max_steps must be at least 1".into()));
        }
        if let Some(budget) = self.budget {
            if budget.fixed == 0 && budget.per_revision == 0 {
                return Err(RedraftError::GraphConfig("step budget allows no steps".into()));
            }
        }
        if cyclic && self.max_steps.is_none() && self.budget.is_none() {
            return Err(RedraftError::GraphConfig(
                "graph contains a cycle but no loop guard (max_steps or step_budget)".into(),
            ));
        }

        Ok(GraphRuntime {
            nodes,
            edges,
            routers,
            entry,
            max_steps: self.max_steps,
            budget: self.budget,
            cyclic,
        })
    }
}

fn is_cyclic(
    nodes: &HashMap<String, Arc<dyn Node>>,
    edges: &HashMap<String, Target>,
    routers: &HashMap<String, Arc<dyn Router>>,
) -> bool {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let indices: HashMap<&str, NodeIndex> = nodes
        .keys()
        .map(|id| (id.as_str(), graph.add_node(id.as_str())))
        .collect();

    for (from, to) in edges {
        if let (Target::Node(to), Some(a)) = (to, indices.get(from.as_str())) {
            if let Some(b) = indices.get(to.as_str()) {
                graph.add_edge(*a, *b, ());
            }
        }
    }
    for (from, router) in routers {
        if let Some(a) = indices.get(from.as_str()) {
            for target in router.targets() {
                if let Some(b) = indices.get(target.as_str()) {
                    graph.add_edge(*a, *b, ());
                }
            }
        }
    }

    petgraph::algo::is_cyclic_directed(&graph)
}

/// Validated, immutable graph: node registry, static edges, conditional edges.
///
/// Holds no per-run state, so one runtime can serve concurrent runs.
pub struct GraphRuntime {
    nodes: HashMap<String, Arc<dyn Node>>,
    edges: HashMap<String, Target>,
    routers: HashMap<String, Arc<dyn Router>>,
    entry: String,
    max_steps: Option<usize>,
    budget: Option<StepBudget>,
    cyclic: bool,
}

impl GraphRuntime {
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn max_steps(&self) -> Option<usize> {
        self.max_steps
    }

    pub fn step_budget(&self) -> Option<StepBudget> {
        self.budget
    }

    /// Step limit for a run starting from `state`.
    ///
    /// Fails with `InvalidInput` when the run's budget needs more steps than
    /// the `max_steps` ceiling, so nothing executes for a run that could not
    /// finish.
    pub fn step_limit(&self, state: &ResearchState) -> Result<usize> {
        match (self.budget, self.max_steps) {
            (Some(budget), ceiling) => {
                let needed = budget.steps_for(state);
                match ceiling {
                    Some(cap) if needed > cap => Err(RedraftError::InvalidInput(format!(
                        "max_revisions {} needs up to {} steps but max_steps is {}",
                        state.max_revisions, needed, cap
                    ))),
                    _ => Ok(needed),
                }
            }
            (None, Some(cap)) => Ok(cap),
            // An acyclic walk visits each node at most once
            (None, None) => Ok(self.nodes.len()),
        }
    }

    /// Stable description of the entry, nodes and edges. Two runtimes with the
    /// same fingerprint walk the same unit ids for the same input.
    pub fn fingerprint(&self) -> String {
        let mut parts = vec![format!("entry={}", self.entry)];
        for id in self.node_ids() {
            let out = match (self.edges.get(id), self.routers.get(id)) {
                (Some(Target::Node(to)), _) => format!("{}->{}", id, to),
                (Some(Target::End), _) => format!("{}->END", id),
                (None, Some(router)) => {
                    let mut targets = router.targets();
                    targets.sort_unstable();
                    format!("{}=>{}|END", id, targets.join("|"))
                }
                (None, None) => id.to_string(),
            };
            parts.push(out);
        }
        if let Some(budget) = self.budget {
            parts.push(format!("budget={}+{}r", budget.fixed, budget.per_revision));
        }
        parts.join(";")
    }

    pub fn has_cycle(&self) -> bool {
        self.cyclic
    }

    /// Registered node ids, sorted.
    pub fn node_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.nodes.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn node(&self, node_id: &str) -> Result<&Arc<dyn Node>> {
        self.nodes.get(node_id).ok_or_else(|| {
            RedraftError::GraphConfig(format!("node '{}' not found in graph", node_id))
        })
    }

    /// Execute one node against a snapshot and check its update stays within
    /// the node's declared writes.
    pub async fn run_node(
        &self,
        node_id: &str,
        state: &ResearchState,
        services: &Services,
    ) -> Result<StateUpdate> {
        let node = self.node(node_id)?;
        let update = node.execute(state, services).await?;

        let allowed = node.writes();
        if let Some(field) = update.fields().into_iter().find(|f| !allowed.contains(f)) {
            return Err(RedraftError::InvariantViolation {
                node: node_id.to_string(),
                message: format!("wrote undeclared field '{}'", field),
            });
        }
        Ok(update)
    }

    /// Resolve the successor of `from` against the merged state.
    pub fn next(&self, from: &str, state: &ResearchState) -> Result<Target> {
        if let Some(target) = self.edges.get(from) {
            return Ok(target.clone());
        }
        let router = self.routers.get(from).ok_or_else(|| {
            RedraftError::GraphConfig(format!("node '{}' has no outgoing edge", from))
        })?;
        match router.route(state)? {
            Route::Terminate => Ok(Target::End),
            Route::Continue(next) => {
                if !self.nodes.contains_key(&next) {
                    return Err(RedraftError::GraphConfig(format!(
                        "router on '{}' returned unknown node '{}'",
                        from, next
                    )));
                }
                Ok(Target::Node(next))
            }
        }
    }
}
