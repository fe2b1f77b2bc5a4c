use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use ideaforge_core::error::{ForgeError, Result};
use ideaforge_core::traits::{Stage, StageContext};
use ideaforge_core::types::{NodeId, RunId, RunState, StageOutcome};

/// Invokes one stage with a read-only state view and a hard wall-clock bound.
///
/// Stages are opaque, contract-bound units; the executor never inspects
/// their internals. A stage that exceeds the timeout or returns an error is
/// reported as a transient failure and handed to the retry controller.
pub struct StageExecutor {
    stages: HashMap<NodeId, Arc<dyn Stage>>,
    timeout: Duration,
}

impl StageExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            stages: HashMap::new(),
            timeout,
        }
    }

    /// Register the stage implementation for a node.
    pub fn register(&mut self, node: NodeId, stage: Arc<dyn Stage>) -> &mut Self {
        self.stages.insert(node, stage);
        self
    }

    pub fn has_stage(&self, node: NodeId) -> bool {
        self.stages.contains_key(&node)
    }

    /// Invoke one stage against a private snapshot of the run state.
    ///
    /// Facts-first: generation-oriented stages (ideation, business, tech,
    /// validation) may not run unless the state holds at least one evidence
    /// item attributed to research. Violating this is a programming error,
    /// fatal and not retryable.
    pub async fn invoke(
        &self,
        run_id: &RunId,
        node: NodeId,
        state: RunState,
        budget_remaining: Option<u64>,
        attempt: u32,
    ) -> Result<StageOutcome> {
        if node.requires_evidence() && !state.has_evidence_from(NodeId::Research) {
            return Err(ForgeError::FactsFirstViolation { node });
        }

        let stage = self
            .stages
            .get(&node)
            .ok_or(ForgeError::StageNotRegistered(node))?;

        let ctx = StageContext {
            run_id: run_id.clone(),
            node,
            state,
            budget_remaining,
            attempt,
        };

        match tokio::time::timeout(self.timeout, stage.invoke(ctx)).await {
            Ok(Ok(outcome)) => {
                debug!(run_id = %run_id, node = %node, class = %outcome.class(), "stage returned");
                Ok(outcome)
            }
            Ok(Err(e)) => {
                warn!(run_id = %run_id, node = %node, error = %e, "stage errored");
                Ok(StageOutcome::TransientFailure { cause: e.to_string() })
            }
            Err(_) => {
                warn!(
                    run_id = %run_id,
                    node = %node,
                    timeout_secs = self.timeout.as_secs(),
                    "stage timed out"
                );
                Ok(StageOutcome::TransientFailure { cause: "timeout".into() })
            }
        }
    }
}
