//! Durable execution: every node execution is a unit of work whose result is
//! recorded in a [`UnitStore`]. Re-dispatching a run id replays recorded
//! units and executes only the missing ones.

pub mod policy;
pub mod runner;
pub mod store;

pub use policy::{UnitPolicies, UnitPolicy};
pub use runner::{unit_id, DurableOutcome, DurableRunner};
pub use store::{MemoryUnitStore, RunInfo, RunStatus, SqliteUnitStore, UnitRecord, UnitStore};
