//! Pipeline orchestration: the run loop, step dispatch, run records and the
//! per-project active run registry.

mod active;
mod dispatch;
mod engine;
mod store;

pub use active::{ActiveRunGuard, ActiveRuns};
pub use dispatch::{StepDispatcher, StepExecutor};
pub use engine::{Orchestrator, OrchestratorBuilder, RunHandle};
pub use store::{InMemoryRunStore, JsonFileRunStore, RunStore};
