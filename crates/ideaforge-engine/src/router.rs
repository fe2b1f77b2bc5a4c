use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use ideaforge_core::error::Result;
use ideaforge_core::types::{NodeId, OutcomeClass, RunId, RunStatus, StageOutcome};

use crate::graph::GraphDefinition;

/// Where the run goes after a stage outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingDecision {
    /// Move forward along a success edge.
    Advance(NodeId),
    /// Follow a loop edge backward (more evidence, or regeneration).
    LoopBack(NodeId),
    /// Hand off to the retry/backoff controller; not a graph transition.
    Retry,
    /// The run reached a terminal state.
    Finished {
        status: RunStatus,
        reason: Option<String>,
    },
}

/// Evaluates stage outcomes against the graph's routing rules.
///
/// Loop counters are plain per-`(run, node)` counters, independent of the
/// retry controller's attempt counters. Combined with backward-only loop
/// edges this bounds every loop in the graph.
pub struct EdgeRouter {
    graph: Arc<GraphDefinition>,
    max_loop_iterations: u32,
    loops: Mutex<HashMap<(RunId, NodeId), u32>>,
}

impl EdgeRouter {
    pub fn new(graph: Arc<GraphDefinition>, max_loop_iterations: u32) -> Self {
        Self {
            graph,
            max_loop_iterations,
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// Route an outcome. Policy, in priority order: transient failures go to
    /// the retry controller; evidence gaps loop via the
    /// `insufficient_evidence` edge; low confidence loops via the
    /// `low_confidence` edge; success advances. Exhausted loops escalate to
    /// the node's `guardrail_breach` edge.
    pub fn route(&self, run_id: &RunId, node: NodeId, outcome: &StageOutcome) -> Result<RoutingDecision> {
        match outcome {
            StageOutcome::TransientFailure { .. } => Ok(RoutingDecision::Retry),
            StageOutcome::InsufficientEvidence { .. } => {
                self.route_loop(run_id, node, OutcomeClass::InsufficientEvidence)
            }
            StageOutcome::LowConfidence { .. } => {
                self.route_loop(run_id, node, OutcomeClass::LowConfidence)
            }
            StageOutcome::Success { .. } => {
                let next = self.graph.resolve(node, OutcomeClass::Success)?;
                if next == NodeId::Completed {
                    Ok(RoutingDecision::Finished {
                        status: RunStatus::Completed,
                        reason: None,
                    })
                } else {
                    Ok(RoutingDecision::Advance(next))
                }
            }
        }
    }

    fn route_loop(&self, run_id: &RunId, node: NodeId, class: OutcomeClass) -> Result<RoutingDecision> {
        let count = {
            let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
            let count = loops.entry((run_id.clone(), node)).or_insert(0);
            *count += 1;
            *count
        };

        if count > self.max_loop_iterations {
            // Exhausted loops are fatal: escalate along the breach edge.
            self.graph.resolve(node, OutcomeClass::GuardrailBreach)?;
            warn!(
                run_id = %run_id,
                node = %node,
                iterations = count,
                max = self.max_loop_iterations,
                "loop budget exhausted, escalating to abort"
            );
            return Ok(RoutingDecision::Finished {
                status: RunStatus::Aborted,
                reason: Some(format!("loop_exhausted:{:?}", node)),
            });
        }

        let target = self.graph.resolve(node, class)?;
        debug!(run_id = %run_id, node = %node, target = %target, iteration = count, "looping");
        Ok(RoutingDecision::LoopBack(target))
    }

    /// Loop iterations recorded so far for a node.
    pub fn loop_count(&self, run_id: &RunId, node: NodeId) -> u32 {
        let loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        loops.get(&(run_id.clone(), node)).copied().unwrap_or(0)
    }
}
