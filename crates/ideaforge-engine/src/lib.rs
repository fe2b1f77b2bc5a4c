//! Stateful workflow-orchestration engine.
//!
//! Drives a multi-stage analysis pipeline as a directed graph with
//! conditional branching and bounded loops. Stages are opaque, contract-bound
//! units behind the [`ideaforge_core::traits::Stage`] trait; the engine only
//! decides whether to advance, loop, retry, or abort given their outcomes.

pub mod budget;
pub mod executor;
pub mod graph;
pub mod guardrail;
pub mod retry;
pub mod router;
pub mod state;
pub mod store;
pub mod supervisor;

pub use budget::{BudgetDecision, BudgetLedger};
pub use executor::StageExecutor;
pub use graph::GraphDefinition;
pub use guardrail::{GuardrailMonitor, GuardrailVerdict};
pub use retry::{RetryAction, RetryController};
pub use router::{EdgeRouter, RoutingDecision};
pub use state::StateStore;
pub use store::MemoryRunStore;
pub use supervisor::{RunReport, RunSupervisor};
