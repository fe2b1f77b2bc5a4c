use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Input handed to a stage for one invocation.
///
/// The state snapshot is read-only; a stage communicates results exclusively
/// through its returned `StageOutcome`, which the engine merges back via the
/// state store. Stages must be safe to invoke repeatedly for the same
/// run/node pair: externally visible side effects are keyed by
/// `(run, node, attempt)`.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub run_id: RunId,
    pub node: NodeId,
    /// Private working copy of the current run state.
    pub state: RunState,
    /// Remaining budget units for this node (None = unlimited).
    pub budget_remaining: Option<u64>,
    /// 1-based attempt number for this invocation.
    pub attempt: u32,
}

/// One processing stage of the pipeline.
///
/// Stages are polymorphic over a single capability: given a run-state view
/// and a budget hint, produce an outcome. The engine never inspects stage
/// internals and never branches on stage identity except to look up
/// configuration.
pub trait Stage: Send + Sync + 'static {
    fn invoke(&self, ctx: StageContext) -> BoxFuture<'_, Result<StageOutcome>>;
}

/// Persistence backend for run state and graph definitions.
///
/// The engine treats this as durable and does not implement its own
/// durability; a run is archived only by the backend after reaching a
/// terminal status — the engine never deletes one.
pub trait RunStore: Send + Sync + 'static {
    /// Load the latest persisted state for a run.
    fn load_run_state(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunState>>>;

    /// Persist the given state version for a run.
    fn save_run_state(&self, run_id: &RunId, state: &RunState) -> BoxFuture<'_, Result<()>>;

    /// Load the configured graph as an edge list.
    fn load_graph(&self) -> BoxFuture<'_, Result<Vec<GraphEdge>>>;
}
