//! Graph engine: nodes over a shared state record, static and conditional
//! edges, and a sequential executor.
//!
//! `GraphBuilder` validates the node registry and edge table up front and
//! produces an immutable `GraphRuntime`. `GraphExecutor` walks the runtime
//! from its entry node, merging each node's partial update before resolving
//! the next edge. The durable runner drives the same runtime.

pub mod executor;
pub mod node;
pub mod router;
pub mod runtime;

pub use executor::{ExecutionResult, GraphExecutor, RunFailure, StepRecord};
pub use node::{Node, Services};
pub use router::{RevisionRouter, Route, Router, Target};
pub use runtime::{GraphBuilder, GraphRuntime, StepBudget};
