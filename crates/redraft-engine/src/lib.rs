pub mod durable;
pub mod graph;
pub mod nodes;
pub mod prompts;
pub mod run_log;

pub use durable::{DurableOutcome, DurableRunner, SqliteUnitStore, UnitPolicies, UnitStore};
pub use graph::{ExecutionResult, GraphBuilder, GraphExecutor, GraphRuntime, Node, RunFailure, Services};
pub use nodes::{build_writer_graph, GraphOptions};
pub use prompts::Prompts;
pub use run_log::RunLogger;
